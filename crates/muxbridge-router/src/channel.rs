//! Local channels: a handler driven by a per-channel task.
//!
//! The task receives everything the router delivers for the channel in wire
//! order and calls into the [`ChannelHandler`]. Handlers are synchronous;
//! anything that has to wait runs as a sub-task spawned through
//! [`ChannelContext::spawn`]. A channel only finishes (and sends its final
//! `close`) once closing has been requested and every sub-task has settled.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use muxbridge_frame::{
    json, ControlMessage, JsonObject, COMMAND_CLOSE, COMMAND_DONE, COMMAND_OPEN, COMMAND_OPTIONS,
    COMMAND_PING, COMMAND_PONG, COMMAND_READY,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::config::FlowControlConfig;
use crate::endpoint::{next_endpoint_id, Endpoint, EndpointId, RouterHandle};
use crate::error::{ChannelError, Problem};
use crate::flow::FlowControl;

/// Lifecycle of a local channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    OpenRequested,
    Ready,
    Closing,
    Closed,
}

/// Payload-specific behaviour of a channel.
///
/// Any error returned from a callback closes the channel with that problem.
pub trait ChannelHandler: Send + 'static {
    fn on_open(&mut self, ctx: &mut ChannelContext, options: &JsonObject) -> Result<(), ChannelError>;

    fn on_data(&mut self, _ctx: &mut ChannelContext, _data: Bytes) -> Result<(), ChannelError> {
        Ok(())
    }

    /// The far side sent `ready`.
    fn on_ready(&mut self, _ctx: &mut ChannelContext) -> Result<(), ChannelError> {
        Ok(())
    }

    /// The far side sent `done`: no more data will arrive.
    fn on_done(&mut self, _ctx: &mut ChannelContext) -> Result<(), ChannelError> {
        Ok(())
    }

    fn on_options(
        &mut self,
        _ctx: &mut ChannelContext,
        _options: &JsonObject,
    ) -> Result<(), ChannelError> {
        Err(Problem::not_supported().with_message("this channel does not accept options"))
    }

    /// A `pong` reopened the flow-control window.
    fn on_resume_send(&mut self, _ctx: &mut ChannelContext) {}

    /// Closing has begun. Called exactly once; no more input follows.
    fn on_close(&mut self, _ctx: &mut ChannelContext, _problem: Option<&Problem>) {}
}

#[derive(Debug)]
struct SenderState {
    state: ChannelState,
    flow: Option<FlowControl>,
    /// Data sent before `ready`, flushed once the channel is ready.
    pending: Vec<Bytes>,
    done_sent: bool,
}

#[derive(Debug)]
enum LocalEvent {
    Close(Option<Problem>),
    DoneSent,
}

/// Cloneable outbound side of a channel, usable from sub-tasks.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    channel: Arc<str>,
    endpoint: EndpointId,
    router: RouterHandle,
    shared: Arc<Mutex<SenderState>>,
    room: Arc<Notify>,
    local: mpsc::UnboundedSender<LocalEvent>,
}

impl ChannelSender {
    fn lock(&self) -> MutexGuard<'_, SenderState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    fn control(&self, command: &str) -> ControlMessage {
        ControlMessage::for_channel(command, &self.channel)
    }

    /// Announce readiness and flush anything queued before it.
    pub fn ready(&self) {
        let pending = {
            let mut shared = self.lock();
            if !matches!(shared.state, ChannelState::Created | ChannelState::OpenRequested) {
                return;
            }
            shared.state = ChannelState::Ready;
            std::mem::take(&mut shared.pending)
        };
        self.router
            .send_control(self.endpoint, self.control(COMMAND_READY));
        for data in pending {
            self.send_data(data);
        }
    }

    /// Send data to the far side.
    ///
    /// Returns false once the flow-control window is used up. This is
    /// advisory; more data may still be sent.
    pub fn send_data(&self, data: Bytes) -> bool {
        let mut shared = self.lock();
        match shared.state {
            ChannelState::Created | ChannelState::OpenRequested => {
                shared.pending.push(data);
                return true;
            }
            ChannelState::Closing | ChannelState::Closed => {
                trace!(channel = %self.channel, "dropping data on closing channel");
                return false;
            }
            ChannelState::Ready => {}
        }
        if shared.done_sent {
            warn!(channel = %self.channel, "data sent after done; dropping");
            return false;
        }

        let len = data.len() as u64;
        let (room, ping) = match shared.flow.as_mut() {
            Some(flow) => flow.record_send(len),
            None => (true, None),
        };
        // Sent while holding the lock so concurrent senders keep their order.
        self.router.send_data(self.endpoint, self.channel.as_ref(), data);
        if let Some(sequence) = ping {
            self.router.send_control(
                self.endpoint,
                self.control(COMMAND_PING).with("sequence", sequence),
            );
        }
        room
    }

    /// Half-close: no more data from this side.
    pub fn done(&self) {
        {
            let mut shared = self.lock();
            if shared.done_sent
                || matches!(shared.state, ChannelState::Closing | ChannelState::Closed)
            {
                return;
            }
            shared.done_sent = true;
        }
        self.router
            .send_control(self.endpoint, self.control(COMMAND_DONE));
        let _ = self.local.send(LocalEvent::DoneSent);
    }

    /// Ask the channel to close.
    pub fn close(&self, problem: Option<Problem>) {
        let _ = self.local.send(LocalEvent::Close(problem));
    }

    pub fn has_room(&self) -> bool {
        self.lock().flow.as_ref().map_or(true, FlowControl::has_room)
    }

    /// Wait until the flow-control window has room (or the channel closes).
    pub async fn wait_for_room(&self) {
        loop {
            let notified = self.room.notified();
            {
                let shared = self.lock();
                let open = !matches!(shared.state, ChannelState::Closing | ChannelState::Closed);
                if !open || shared.flow.as_ref().map_or(true, FlowControl::has_room) {
                    return;
                }
            }
            notified.await;
        }
    }
}

/// What a handler can do from inside a callback.
pub struct ChannelContext {
    sender: ChannelSender,
    tasks: JoinSet<Result<(), ChannelError>>,
    close_reason: Option<Option<Problem>>,
    close_notified: bool,
    flow_config: FlowControlConfig,
    far_done: bool,
}

impl ChannelContext {
    pub fn channel(&self) -> &str {
        self.sender.channel()
    }

    pub fn state(&self) -> ChannelState {
        self.sender.state()
    }

    pub fn ready(&mut self) {
        self.sender.ready();
    }

    pub fn send_data(&mut self, data: Bytes) -> bool {
        self.sender.send_data(data)
    }

    pub fn done(&mut self) {
        self.sender.done();
    }

    /// Begin closing. Only the first call has an effect.
    pub fn close(&mut self, problem: Option<Problem>) {
        if self.close_reason.is_some() {
            return;
        }
        debug!(channel = %self.channel(), problem = ?problem.as_ref().map(|p| p.code.as_str()), "closing channel");
        self.sender.lock().state = ChannelState::Closing;
        self.sender.room.notify_waiters();
        self.close_reason = Some(problem);
    }

    pub fn is_closing(&self) -> bool {
        self.close_reason.is_some()
    }

    /// Run `task` as part of this channel. Its error, if any, closes the channel.
    ///
    /// Fails once closing has begun.
    pub fn spawn<F>(&mut self, task: F) -> Result<(), ChannelError>
    where
        F: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        if self.is_closing() {
            return Err(Problem::internal("channel is closing"));
        }
        self.tasks.spawn(task);
        Ok(())
    }

    /// Cancel every outstanding sub-task.
    pub fn abort_tasks(&mut self) {
        self.tasks.abort_all();
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn flow_control_enabled(&self) -> bool {
        self.sender.lock().flow.is_some()
    }
}

#[derive(Debug)]
enum Inbound {
    Control(ControlMessage),
    Data(Bytes),
    Shutdown,
}

/// Endpoint side of a local channel, bound in the router table.
#[derive(Debug)]
pub struct LocalChannel {
    id: EndpointId,
    channel: String,
    payload: String,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl LocalChannel {
    /// Start the channel task for `handler`.
    ///
    /// The task waits for the `open` the router delivers after binding.
    pub fn spawn(
        channel: &str,
        payload: &str,
        handler: Box<dyn ChannelHandler>,
        router: RouterHandle,
        flow_config: FlowControlConfig,
    ) -> Arc<Self> {
        let id = next_endpoint_id();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (local, local_rx) = mpsc::unbounded_channel();

        let sender = ChannelSender {
            channel: Arc::from(channel),
            endpoint: id,
            router,
            shared: Arc::new(Mutex::new(SenderState {
                state: ChannelState::Created,
                flow: None,
                pending: Vec::new(),
                done_sent: false,
            })),
            room: Arc::new(Notify::new()),
            local,
        };
        let ctx = ChannelContext {
            sender,
            tasks: JoinSet::new(),
            close_reason: None,
            close_notified: false,
            flow_config,
            far_done: false,
        };

        tokio::spawn(run_channel(handler, ctx, inbox_rx, local_rx));

        Arc::new(Self {
            id,
            channel: channel.to_string(),
            payload: payload.to_string(),
            inbox,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Endpoint for LocalChannel {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn label(&self) -> String {
        format!("channel {} ({})", self.channel, self.payload)
    }

    fn deliver_control(&self, message: ControlMessage) {
        let _ = self.inbox.send(Inbound::Control(message));
    }

    fn deliver_data(&self, _channel: &str, data: Bytes) {
        let _ = self.inbox.send(Inbound::Data(data));
    }

    fn shutdown(&self) {
        let _ = self.inbox.send(Inbound::Shutdown);
    }
}

async fn run_channel(
    mut handler: Box<dyn ChannelHandler>,
    mut ctx: ChannelContext,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    mut local: mpsc::UnboundedReceiver<LocalEvent>,
) {
    loop {
        if ctx.is_closing() {
            if !ctx.close_notified {
                ctx.close_notified = true;
                let reason = ctx.close_reason.clone().flatten();
                handler.on_close(&mut ctx, reason.as_ref());
            }
            if ctx.tasks.is_empty() {
                break;
            }
        }

        tokio::select! {
            inbound = inbox.recv(), if !ctx.is_closing() => match inbound {
                Some(Inbound::Control(message)) => {
                    let result = handle_control(handler.as_mut(), &mut ctx, message);
                    settle(&mut ctx, result);
                }
                Some(Inbound::Data(data)) => {
                    trace!(channel = %ctx.channel(), len = data.len(), "channel data");
                    let result = handler.on_data(&mut ctx, data);
                    settle(&mut ctx, result);
                }
                Some(Inbound::Shutdown) | None => {
                    ctx.abort_tasks();
                    ctx.close(Some(Problem::terminated()));
                }
            },
            Some(event) = local.recv() => match event {
                LocalEvent::Close(problem) => ctx.close(problem),
                LocalEvent::DoneSent => check_both_done(&mut ctx),
            },
            Some(joined) = ctx.tasks.join_next(), if !ctx.tasks.is_empty() => match joined {
                Ok(Ok(())) => {}
                Ok(Err(problem)) => ctx.close(Some(problem)),
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    warn!(channel = %ctx.channel(), error = %err, "channel task panicked");
                    ctx.close(Some(Problem::internal("channel task failed")));
                }
            },
        }
    }

    ctx.sender.lock().state = ChannelState::Closed;
    ctx.sender.room.notify_waiters();
    let close = match ctx.close_reason.take().flatten() {
        Some(problem) => problem.to_close(Some(ctx.channel())),
        None => ControlMessage::for_channel(COMMAND_CLOSE, ctx.channel()),
    };
    debug!(channel = %ctx.channel(), "channel closed");
    ctx.sender.router.send_control(ctx.sender.endpoint, close);
}

fn settle(ctx: &mut ChannelContext, result: Result<(), ChannelError>) {
    if let Err(problem) = result {
        debug!(channel = %ctx.channel(), problem = %problem, "handler failed");
        ctx.close(Some(problem));
    }
}

fn check_both_done(ctx: &mut ChannelContext) {
    if ctx.far_done && ctx.sender.lock().done_sent {
        ctx.close(None);
    }
}

fn handle_control(
    handler: &mut dyn ChannelHandler,
    ctx: &mut ChannelContext,
    message: ControlMessage,
) -> Result<(), ChannelError> {
    match message.command() {
        COMMAND_OPEN => {
            if ctx.state() != ChannelState::Created {
                return Err(Problem::protocol_error("channel was already opened"));
            }
            {
                let mut shared = ctx.sender.lock();
                shared.state = ChannelState::OpenRequested;
                if json::get_bool(message.as_object(), "flow-control", false) {
                    shared.flow = Some(FlowControl::new(ctx.flow_config));
                }
            }
            handler.on_open(ctx, message.as_object())
        }
        COMMAND_READY => handler.on_ready(ctx),
        COMMAND_DONE => {
            if ctx.far_done {
                return Err(Problem::protocol_error("channel received second done"));
            }
            ctx.far_done = true;
            handler.on_done(ctx)?;
            check_both_done(ctx);
            Ok(())
        }
        COMMAND_OPTIONS => handler.on_options(ctx, message.as_object()),
        COMMAND_CLOSE => {
            let problem = Problem::from_close(&message);
            if let Some(problem) = &problem {
                debug!(channel = %ctx.channel(), problem = %problem, "far side closed channel");
            }
            ctx.close(None);
            Ok(())
        }
        COMMAND_PING => {
            // Everything before the ping has been through the handler by now.
            let mut pong = message;
            pong.set_command(COMMAND_PONG);
            ctx.sender.router.send_control(ctx.sender.endpoint, pong);
            Ok(())
        }
        COMMAND_PONG => {
            let sequence = message.get("sequence").and_then(serde_json::Value::as_u64);
            let reopened = {
                let mut shared = ctx.sender.lock();
                match (shared.flow.as_mut(), sequence) {
                    (Some(flow), Some(sequence)) => flow.pong(sequence),
                    _ => false,
                }
            };
            if reopened {
                ctx.sender.room.notify_waiters();
                handler.on_resume_send(ctx);
            }
            Ok(())
        }
        other => {
            debug!(channel = %ctx.channel(), command = other, "unhandled channel command");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::oneshot;

    use super::*;
    use crate::endpoint::RouterEvent;

    enum Seen {
        Control(ControlMessage),
        Data(String, Bytes),
    }

    async fn next(events: &mut UnboundedReceiver<RouterEvent>) -> Seen {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for channel output")
            .expect("router handle dropped");
        match event {
            RouterEvent::Control { message, .. } => Seen::Control(message),
            RouterEvent::Data { channel, data, .. } => Seen::Data(channel, data),
            other => panic!("unexpected event {other:?}"),
        }
    }

    async fn next_control(events: &mut UnboundedReceiver<RouterEvent>) -> ControlMessage {
        match next(events).await {
            Seen::Control(message) => message,
            Seen::Data(channel, data) => panic!("expected control, got data on {channel}: {data:?}"),
        }
    }

    fn open(channel: &str, extra: &[(&str, serde_json::Value)]) -> ControlMessage {
        let mut message = ControlMessage::for_channel(COMMAND_OPEN, channel).with("payload", "test");
        for (key, value) in extra {
            message.insert(key, value.clone());
        }
        message
    }

    /// Echoes data and closes on `done`.
    struct Echo;

    impl ChannelHandler for Echo {
        fn on_open(&mut self, ctx: &mut ChannelContext, _: &JsonObject) -> Result<(), ChannelError> {
            ctx.ready();
            Ok(())
        }

        fn on_data(&mut self, ctx: &mut ChannelContext, data: Bytes) -> Result<(), ChannelError> {
            ctx.send_data(data);
            Ok(())
        }

        fn on_done(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError> {
            ctx.done();
            Ok(())
        }
    }

    /// Holds the channel open with a sub-task until released.
    struct Blocker {
        release: Option<oneshot::Receiver<()>>,
    }

    impl ChannelHandler for Blocker {
        fn on_open(&mut self, ctx: &mut ChannelContext, _: &JsonObject) -> Result<(), ChannelError> {
            let release = self.release.take().ok_or_else(|| Problem::internal("reopened"))?;
            ctx.spawn(async move {
                let _ = release.await;
                Ok(())
            })?;
            ctx.ready();
            Ok(())
        }
    }

    struct FailOnData;

    impl ChannelHandler for FailOnData {
        fn on_open(&mut self, ctx: &mut ChannelContext, _: &JsonObject) -> Result<(), ChannelError> {
            ctx.ready();
            Ok(())
        }

        fn on_data(&mut self, _: &mut ChannelContext, _: Bytes) -> Result<(), ChannelError> {
            Err(Problem::new("internal-error").with_message("cannot handle data"))
        }
    }

    /// Sends before ready, then becomes ready from a sub-task.
    struct LateReady;

    impl ChannelHandler for LateReady {
        fn on_open(&mut self, ctx: &mut ChannelContext, _: &JsonObject) -> Result<(), ChannelError> {
            ctx.send_data(Bytes::from_static(b"early"));
            let sender = ctx.sender();
            ctx.spawn(async move {
                sender.ready();
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn echo_lifecycle() {
        let (router, mut events) = RouterHandle::new();
        let channel = LocalChannel::spawn("c1", "echo", Box::new(Echo), router, FlowControlConfig::default());

        channel.deliver_control(open("c1", &[]));
        let ready = next_control(&mut events).await;
        assert!(ready.is(COMMAND_READY));
        assert_eq!(ready.channel(), Some("c1"));

        channel.deliver_data("c1", Bytes::from_static(b"hi"));
        match next(&mut events).await {
            Seen::Data(ch, data) => {
                assert_eq!(ch, "c1");
                assert_eq!(data.as_ref(), b"hi");
            }
            Seen::Control(message) => panic!("unexpected {message:?}"),
        }

        channel.deliver_control(ControlMessage::for_channel(COMMAND_DONE, "c1"));
        assert!(next_control(&mut events).await.is(COMMAND_DONE));
        let close = next_control(&mut events).await;
        assert!(close.is(COMMAND_CLOSE));
        assert_eq!(close.get_str("problem"), None);
    }

    #[tokio::test]
    async fn ping_is_answered_in_order() {
        let (router, mut events) = RouterHandle::new();
        let channel = LocalChannel::spawn("c1", "echo", Box::new(Echo), router, FlowControlConfig::default());
        channel.deliver_control(open("c1", &[]));
        next_control(&mut events).await;

        channel.deliver_data("c1", Bytes::from_static(b"abc"));
        channel.deliver_control(ControlMessage::for_channel(COMMAND_PING, "c1").with("sequence", 3));

        assert!(matches!(next(&mut events).await, Seen::Data(..)));
        let pong = next_control(&mut events).await;
        assert!(pong.is(COMMAND_PONG));
        assert_eq!(pong.get("sequence"), Some(&serde_json::json!(3)));
    }

    #[tokio::test]
    async fn handler_error_becomes_close() {
        let (router, mut events) = RouterHandle::new();
        let channel = LocalChannel::spawn("c2", "fail", Box::new(FailOnData), router, FlowControlConfig::default());
        channel.deliver_control(open("c2", &[]));
        next_control(&mut events).await;

        channel.deliver_data("c2", Bytes::from_static(b"x"));
        let close = next_control(&mut events).await;
        assert!(close.is(COMMAND_CLOSE));
        assert_eq!(close.get_str("problem"), Some("internal-error"));
        assert_eq!(close.get_str("message"), Some("cannot handle data"));
    }

    #[tokio::test]
    async fn close_waits_for_sub_tasks() {
        let (router, mut events) = RouterHandle::new();
        let (release, release_rx) = oneshot::channel();
        let handler = Blocker {
            release: Some(release_rx),
        };
        let channel = LocalChannel::spawn("c3", "block", Box::new(handler), router, FlowControlConfig::default());
        channel.deliver_control(open("c3", &[]));
        assert!(next_control(&mut events).await.is(COMMAND_READY));

        channel.deliver_control(ControlMessage::for_channel(COMMAND_CLOSE, "c3"));
        // Input is no longer delivered, and no close while the task is pending.
        channel.deliver_data("c3", Bytes::from_static(b"ignored"));
        let early = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(early.is_err(), "channel closed with a sub-task outstanding");

        release.send(()).unwrap();
        let close = next_control(&mut events).await;
        assert!(close.is(COMMAND_CLOSE));
    }

    #[tokio::test]
    async fn data_before_ready_is_queued() {
        let (router, mut events) = RouterHandle::new();
        let channel = LocalChannel::spawn("c4", "late", Box::new(LateReady), router, FlowControlConfig::default());
        channel.deliver_control(open("c4", &[]));

        assert!(next_control(&mut events).await.is(COMMAND_READY));
        match next(&mut events).await {
            Seen::Data(_, data) => assert_eq!(data.as_ref(), b"early"),
            Seen::Control(message) => panic!("unexpected {message:?}"),
        }
    }

    #[tokio::test]
    async fn flow_control_pings_and_blocks() {
        let (router, mut events) = RouterHandle::new();
        let config = FlowControlConfig {
            window: 8,
            block_size: 4,
        };
        let channel = LocalChannel::spawn("c5", "echo", Box::new(Echo), router, config);
        channel.deliver_control(open("c5", &[("flow-control", serde_json::json!(true))]));
        next_control(&mut events).await;

        channel.deliver_data("c5", Bytes::from_static(b"12345678"));
        assert!(matches!(next(&mut events).await, Seen::Data(..)));
        let ping = next_control(&mut events).await;
        assert!(ping.is(COMMAND_PING));
        assert_eq!(ping.get("sequence"), Some(&serde_json::json!(8)));
    }

    #[tokio::test]
    async fn wait_for_room_resumes_on_pong() {
        let (router, mut events) = RouterHandle::new();
        let config = FlowControlConfig {
            window: 4,
            block_size: 4,
        };

        struct Producer;
        impl ChannelHandler for Producer {
            fn on_open(&mut self, ctx: &mut ChannelContext, _: &JsonObject) -> Result<(), ChannelError> {
                ctx.ready();
                let sender = ctx.sender();
                ctx.spawn(async move {
                    for chunk in [&b"aaaa"[..], &b"bbbb"[..]] {
                        sender.wait_for_room().await;
                        sender.send_data(Bytes::from_static(chunk));
                    }
                    sender.close(None);
                    Ok(())
                })
            }
        }

        let channel = LocalChannel::spawn("c6", "producer", Box::new(Producer), router, config);
        channel.deliver_control(open("c6", &[("flow-control", serde_json::json!(true))]));
        assert!(next_control(&mut events).await.is(COMMAND_READY));
        assert!(matches!(next(&mut events).await, Seen::Data(..)));
        assert!(next_control(&mut events).await.is(COMMAND_PING));

        // Window used up: the second chunk waits for the pong.
        let stalled = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(stalled.is_err());

        channel.deliver_control(ControlMessage::for_channel(COMMAND_PONG, "c6").with("sequence", 4));
        match next(&mut events).await {
            Seen::Data(_, data) => assert_eq!(data.as_ref(), b"bbbb"),
            Seen::Control(message) => panic!("unexpected {message:?}"),
        }
        assert!(next_control(&mut events).await.is(COMMAND_PING));
        assert!(next_control(&mut events).await.is(COMMAND_CLOSE));
    }

    #[tokio::test]
    async fn shutdown_terminates() {
        let (router, mut events) = RouterHandle::new();
        let (_release, release_rx) = oneshot::channel::<()>();
        let handler = Blocker {
            release: Some(release_rx),
        };
        let channel = LocalChannel::spawn("c7", "block", Box::new(handler), router, FlowControlConfig::default());
        channel.deliver_control(open("c7", &[]));
        next_control(&mut events).await;

        channel.shutdown();
        let close = next_control(&mut events).await;
        assert_eq!(close.get_str("problem"), Some("terminated"));
    }
}
