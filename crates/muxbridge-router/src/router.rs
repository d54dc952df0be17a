//! The per-connection router: owns the channel table and the rule list.
//!
//! One loop reads frames from the far side and events from endpoints and is
//! the only place the channel table is touched. Frames for one channel reach
//! its endpoint in wire order.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use muxbridge_frame::{
    json, ControlMessage, Frame, FrameReader, FrameWriter, JsonObject, COMMAND_AUTHORIZE,
    COMMAND_CLOSE, COMMAND_INIT, COMMAND_KILL, COMMAND_OPEN, COMMAND_PING, COMMAND_PONG,
    PROTOCOL_VERSION,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::BridgeSettings;
use crate::endpoint::{Endpoint, EndpointId, RouterEvent, RouterHandle};
use crate::error::{Problem, Result, RouterError};
use crate::rule::{RouteDecision, RoutingRule, RuleContext};
use crate::system;

/// Group a channel joins when `open` names none.
pub const DEFAULT_GROUP: &str = "default";

struct Binding {
    endpoint: Arc<dyn Endpoint>,
    group: String,
    host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct Router {
    settings: Arc<BridgeSettings>,
    rules: Vec<Box<dyn RoutingRule>>,
    table: HashMap<String, Binding>,
    handle: RouterHandle,
    events: mpsc::UnboundedReceiver<RouterEvent>,
    outbound: mpsc::UnboundedSender<Frame>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    /// Host the far side announced; `None` until its `init` arrived.
    init_host: Option<String>,
    authorizations: HashMap<String, oneshot::Sender<Option<String>>>,
    next_cookie: u64,
}

impl Router {
    pub fn new(settings: Arc<BridgeSettings>) -> Self {
        let (handle, events) = RouterHandle::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            rules: Vec::new(),
            table: HashMap::new(),
            handle,
            events,
            outbound,
            outbound_rx: Some(outbound_rx),
            init_host: None,
            authorizations: HashMap::new(),
            next_cookie: 0,
        }
    }

    /// Append a rule. Rules are tried in the order they were added.
    pub fn add_rule(&mut self, rule: Box<dyn RoutingRule>) {
        debug!(rule = rule.name(), position = self.rules.len(), "routing rule added");
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Serve one connection until the far side goes away or a protocol
    /// error occurs.
    ///
    /// Our `init` is written before anything is read. On a protocol error a
    /// connection-level `close` is sent before returning the error.
    pub async fn serve<R, W>(mut self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(outbound) = self.outbound_rx.take() else {
            return Err(RouterError::Protocol("router already served a connection".into()));
        };
        let writer = tokio::spawn(write_frames(FrameWriter::new(output), outbound));

        self.send_init();
        let result = self.run(FrameReader::new(input)).await;
        if let Err(err) = &result {
            warn!(error = %err, "connection failed");
            if let Some(close) = err.to_close() {
                self.emit_control(close);
            }
        }

        self.shutdown();
        drop(self);
        // Drains whatever is still queued, then ends with the sender gone.
        let _ = writer.await;
        result
    }

    async fn run<R: AsyncRead + Unpin>(&mut self, mut reader: FrameReader<R>) -> Result<()> {
        loop {
            tokio::select! {
                frame = reader.next_frame() => match frame? {
                    Some(frame) => {
                        if self.handle_frame(frame)? == Flow::Stop {
                            return Ok(());
                        }
                    }
                    None => {
                        debug!("far side closed the connection");
                        return Ok(());
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }
    }

    fn send_init(&mut self) {
        let packages: JsonObject = self
            .settings
            .packages
            .names
            .iter()
            .map(|name| (name.clone(), Value::Null))
            .collect();
        let os_release: JsonObject = system::os_release()
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        let mut capabilities = JsonObject::new();
        capabilities.insert("explicit-superuser".into(), Value::Bool(true));

        let mut init = ControlMessage::new(COMMAND_INIT)
            .with("version", PROTOCOL_VERSION)
            .with("host", system::hostname())
            .with("packages", packages)
            .with("os-release", os_release)
            .with("capabilities", capabilities);
        if let Some(checksum) = &self.settings.packages.checksum {
            init.insert("checksum", checksum.as_str());
        }
        self.emit_control(init);
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Flow> {
        if frame.is_control() {
            let message = ControlMessage::parse(&frame.payload)?;
            trace!(command = message.command(), channel = ?message.channel(), "control from far side");
            return self.handle_control(message);
        }
        if self.init_host.is_none() {
            return Err(RouterError::Protocol("received data before init".into()));
        }
        self.dispatch_data(&frame.channel, frame.payload);
        Ok(Flow::Continue)
    }

    fn handle_control(&mut self, message: ControlMessage) -> Result<Flow> {
        if self.init_host.is_none() {
            if !message.is(COMMAND_INIT) {
                return Err(RouterError::Protocol(format!(
                    "first message should be init, got {}",
                    message.command()
                )));
            }
            self.handle_init(&message)?;
            return Ok(Flow::Continue);
        }

        if let Some(channel) = message.channel() {
            let channel = channel.to_string();
            self.dispatch_control(channel, message);
            return Ok(Flow::Continue);
        }

        match message.command() {
            COMMAND_INIT => return Err(RouterError::Protocol("received a second init".into())),
            COMMAND_PING => {
                let mut pong = message;
                pong.set_command(COMMAND_PONG);
                self.emit_control(pong);
            }
            COMMAND_CLOSE => {
                match Problem::from_close(&message) {
                    Some(problem) => info!(problem = %problem, "far side closed the connection"),
                    None => info!("far side closed the connection"),
                }
                return Ok(Flow::Stop);
            }
            COMMAND_KILL => self.kill(&message),
            COMMAND_AUTHORIZE => self.authorize_response(&message),
            other => debug!(command = other, "ignoring connection-level command"),
        }
        Ok(Flow::Continue)
    }

    fn handle_init(&mut self, init: &ControlMessage) -> Result<()> {
        let options = init.as_object();
        match json::get_u64(options, "version") {
            Some(PROTOCOL_VERSION) => {}
            other => {
                return Err(RouterError::Protocol(format!(
                    "unsupported protocol version: {}",
                    other.map_or_else(|| "none".to_string(), |v| v.to_string())
                )))
            }
        }
        let host = json::typed_str(options, "host")
            .map_err(RouterError::Protocol)?
            .unwrap_or("localhost")
            .to_string();
        info!(host = %host, "received init");

        let ctx = RuleContext {
            router: &self.handle,
            init_host: &host,
            channel: "",
        };
        for rule in &mut self.rules {
            rule.init_received(init, &ctx);
        }
        self.init_host = Some(host);
        Ok(())
    }

    /// Route a channel-scoped control message from the far side.
    fn dispatch_control(&mut self, channel: String, message: ControlMessage) {
        if message.is(COMMAND_OPEN) {
            self.open_channel(channel, message);
            return;
        }
        match self.table.get(&channel) {
            Some(binding) => binding.endpoint.deliver_control(message),
            None => trace!(channel = %channel, command = message.command(), "control for unbound channel dropped"),
        }
    }

    fn dispatch_data(&mut self, channel: &str, data: Bytes) {
        match self.table.get(channel) {
            Some(binding) => binding.endpoint.deliver_data(channel, data),
            None => trace!(channel, len = data.len(), "data for unbound channel dropped"),
        }
    }

    /// Bind `channel` through the first rule that claims it.
    ///
    /// A channel that is already bound keeps its endpoint; the request is
    /// answered with a `close` and has no other effect.
    fn open_channel(&mut self, channel: String, message: ControlMessage) {
        if self.table.contains_key(&channel) {
            warn!(channel = %channel, "open for a channel that is already open");
            self.emit_control(
                Problem::protocol_error("channel is already open").to_close(Some(&channel)),
            );
            return;
        }

        let init_host = self.init_host.clone().unwrap_or_default();
        let options = message.as_object();
        let (host, group) = match open_labels(options, &init_host) {
            Ok(labels) => labels,
            Err(problem) => {
                debug!(channel = %channel, problem = %problem, "rejecting open");
                self.emit_control(problem.to_close(Some(&channel)));
                return;
            }
        };

        let ctx = RuleContext {
            router: &self.handle,
            init_host: &init_host,
            channel: &channel,
        };
        let decision = self
            .rules
            .iter_mut()
            .find_map(|rule| match rule.apply_rule(options, &ctx) {
                RouteDecision::NoMatch => None,
                decision => {
                    trace!(channel = %channel, rule = rule.name(), "rule matched");
                    Some(decision)
                }
            })
            .unwrap_or_else(|| RouteDecision::Reject(Problem::not_supported()));

        match decision {
            RouteDecision::Endpoint(endpoint) => {
                debug!(
                    channel = %channel,
                    payload = json::get_str(options, "payload"),
                    endpoint = %endpoint.label(),
                    "channel bound"
                );
                endpoint.deliver_control(message.clone());
                self.table.insert(
                    channel,
                    Binding {
                        endpoint,
                        group,
                        host,
                    },
                );
            }
            RouteDecision::Reject(problem) => {
                debug!(channel = %channel, problem = %problem, "open rejected");
                self.emit_control(problem.to_close(Some(&channel)));
            }
            RouteDecision::NoMatch => {
                self.emit_control(Problem::not_supported().to_close(Some(&channel)));
            }
        }
    }

    fn unbind(&mut self, channel: &str) -> Option<Binding> {
        let binding = self.table.remove(channel)?;
        let endpoint = binding.endpoint.id();
        let remaining = self
            .table
            .values()
            .filter(|other| other.endpoint.id() == endpoint)
            .count();
        debug!(channel, endpoint, remaining, "channel unbound");
        for rule in &mut self.rules {
            rule.channel_unbound(endpoint, remaining);
        }
        Some(binding)
    }

    fn kill(&mut self, message: &ControlMessage) {
        let host = message.get_str("host");
        let group = message.get_str("group");

        let mut targets: HashMap<EndpointId, (Arc<dyn Endpoint>, Vec<String>)> = HashMap::new();
        for (channel, binding) in &self.table {
            if host.is_some_and(|host| host != binding.host) {
                continue;
            }
            if group.is_some_and(|group| group != binding.group) {
                continue;
            }
            targets
                .entry(binding.endpoint.id())
                .or_insert_with(|| (Arc::clone(&binding.endpoint), Vec::new()))
                .1
                .push(channel.clone());
        }

        info!(?host, ?group, endpoints = targets.len(), "kill");
        for (endpoint, channels) in targets.into_values() {
            endpoint.kill(&channels, message);
        }
    }

    fn authorize_response(&mut self, message: &ControlMessage) {
        let Some(cookie) = message.get_str("cookie") else {
            debug!("authorize without cookie ignored");
            return;
        };
        match self.authorizations.remove(cookie) {
            Some(reply) => {
                let _ = reply.send(message.get_str("response").map(str::to_owned));
            }
            None => debug!(cookie, "authorize for unknown cookie ignored"),
        }
    }

    fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Control { from, message } => {
                let Some(channel) = message.channel().map(str::to_owned) else {
                    warn!(endpoint = from, command = message.command(), "endpoint sent control without channel");
                    return;
                };
                if !self.is_bound_to(&channel, from) {
                    trace!(channel = %channel, command = message.command(), "stale control from endpoint dropped");
                    return;
                }
                if message.is(COMMAND_CLOSE) {
                    self.unbind(&channel);
                }
                self.emit_control(message);
            }
            RouterEvent::Data {
                from,
                channel,
                data,
            } => {
                if self.is_bound_to(&channel, from) {
                    self.emit(Frame::new(channel, data));
                } else {
                    trace!(channel = %channel, "stale data from endpoint dropped");
                }
            }
            RouterEvent::EndpointClosed { endpoint, problem } => {
                let channels: Vec<String> = self
                    .table
                    .iter()
                    .filter(|(_, binding)| binding.endpoint.id() == endpoint)
                    .map(|(channel, _)| channel.clone())
                    .collect();
                debug!(endpoint, problem = %problem, channels = channels.len(), "endpoint closed");
                for channel in channels {
                    self.unbind(&channel);
                    self.emit_control(problem.to_close(Some(&channel)));
                }
                for rule in &mut self.rules {
                    rule.endpoint_closed(endpoint);
                }
            }
            RouterEvent::Authorize { challenge, reply } => {
                self.next_cookie += 1;
                let cookie = format!("muxbridge{}", self.next_cookie);
                self.authorizations.insert(cookie.clone(), reply);
                self.emit_control(
                    ControlMessage::new(COMMAND_AUTHORIZE)
                        .with("cookie", cookie)
                        .with("challenge", challenge),
                );
            }
            RouterEvent::SendControl(message) => self.emit_control(message),
        }
    }

    fn is_bound_to(&self, channel: &str, endpoint: EndpointId) -> bool {
        self.table
            .get(channel)
            .is_some_and(|binding| binding.endpoint.id() == endpoint)
    }

    fn emit_control(&self, message: ControlMessage) {
        self.emit(message.to_frame());
    }

    fn emit(&self, frame: Frame) {
        // Only fails once the writer task has died; the read side notices soon after.
        let _ = self.outbound.send(frame);
    }

    fn shutdown(&mut self) {
        let mut seen = Vec::new();
        for binding in self.table.values() {
            let id = binding.endpoint.id();
            if !seen.contains(&id) {
                seen.push(id);
                binding.endpoint.shutdown();
            }
        }
        self.table.clear();
        for rule in &mut self.rules {
            rule.shutdown();
        }
        self.authorizations.clear();
        debug!(endpoints = seen.len(), "router shut down");
    }
}

/// The `host` and `group` an open request is filed under.
fn open_labels(options: &JsonObject, init_host: &str) -> std::result::Result<(String, String), Problem> {
    match json::typed_str(options, "payload") {
        Ok(Some(_)) => {}
        Ok(None) => return Err(Problem::protocol_error("open: missing payload")),
        Err(message) => return Err(Problem::protocol_error(message)),
    }
    let host = json::typed_str(options, "host").map_err(Problem::protocol_error)?;
    let group = json::typed_str(options, "group").map_err(Problem::protocol_error)?;
    Ok((
        host.unwrap_or(init_host).to_string(),
        group.unwrap_or(DEFAULT_GROUP).to_string(),
    ))
}

async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = frames.recv().await {
        trace!(channel = %frame.channel, len = frame.payload.len(), "to far side");
        if let Err(err) = writer.write_frame(frame).await {
            debug!(error = %err, "output closed");
            break;
        }
    }
}
