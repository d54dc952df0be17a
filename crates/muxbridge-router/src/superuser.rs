//! Privilege escalation: a peer running a bridge through `sudo`-class helpers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use muxbridge_frame::{json, ControlMessage, JsonObject, COMMAND_SUPERUSER_INIT_DONE};
use muxbridge_transport::{InteractionRequest, SpawnSpec};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::{ChannelContext, ChannelHandler, ChannelSender};
use crate::config::BridgeSettings;
use crate::endpoint::{Endpoint, EndpointId, RouterHandle};
use crate::error::{ChannelError, PeerError, Problem, SuperuserError, ACCESS_DENIED};
use crate::peer::{Peer, PeerConfig, PromptHandler, PromptKind};
use crate::rule::{RouteDecision, RoutingRule, RuleContext};
use crate::system;

const EVENT_CAPACITY: usize = 16;

/// Payload of the channel that exposes [`SuperuserControl`] to the far side.
pub const SUPERUSER_PAYLOAD: &str = "superuser";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperuserState {
    None,
    Init,
    Running(String),
}

impl SuperuserState {
    pub fn as_str(&self) -> &str {
        match self {
            SuperuserState::None => "none",
            SuperuserState::Init => "init",
            SuperuserState::Running(name) => name,
        }
    }
}

/// Notifications for whoever drives the control surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SuperuserEvent {
    /// The helper asks for input; reply with [`SuperuserControl::answer`].
    Prompt {
        message: String,
        prompt: String,
        default: String,
        echo: bool,
        error: String,
    },
    /// `current()` changed.
    Current(String),
}

/// Where prompts from the helper go while a bridge starts.
#[derive(Debug, Clone)]
pub enum PromptResponder {
    /// Publish a [`SuperuserEvent::Prompt`] and wait for `answer()`.
    Interactive,
    /// Ask the far side with an `authorize` challenge for `user`.
    Authorize { user: String },
}

struct Inner {
    state: SuperuserState,
    peer: Option<Peer>,
    pending: Option<InteractionRequest>,
    init_host: String,
}

/// The superuser control surface, shared with [`SuperuserRoutingRule`].
#[derive(Clone)]
pub struct SuperuserControl {
    settings: Arc<BridgeSettings>,
    router: RouterHandle,
    privileged: bool,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<SuperuserEvent>,
}

impl SuperuserControl {
    /// `privileged` is set when this bridge already runs as root; it then
    /// never starts helpers of its own.
    pub fn new(settings: Arc<BridgeSettings>, router: RouterHandle, privileged: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            router,
            privileged,
            inner: Arc::new(Mutex::new(Inner {
                state: SuperuserState::None,
                peer: None,
                pending: None,
                init_host: "localhost".to_string(),
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured bridge names, in order.
    pub fn bridges(&self) -> Vec<String> {
        self.settings
            .superuser
            .iter()
            .map(|bridge| bridge.label.clone())
            .collect()
    }

    pub fn current(&self) -> String {
        if self.privileged {
            return "root".to_string();
        }
        self.lock().state.as_str().to_string()
    }

    pub fn state(&self) -> SuperuserState {
        self.lock().state.clone()
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SuperuserEvent> {
        self.events.subscribe()
    }

    fn set_init_host(&self, host: &str) {
        self.lock().init_host = host.to_string();
    }

    fn set_state(&self, inner: &mut Inner, state: SuperuserState) {
        if inner.state != state {
            debug!(from = inner.state.as_str(), to = state.as_str(), "superuser state");
            let _ = self
                .events
                .send(SuperuserEvent::Current(state.as_str().to_string()));
            inner.state = state;
        }
    }

    /// Start the named bridge; resolves once it is running.
    ///
    /// Fails without side effects when a bridge is already starting or
    /// running. Any other failure leaves the state at `none`.
    pub async fn start(&self, name: &str, responder: PromptResponder) -> Result<(), SuperuserError> {
        let peer = {
            let mut inner = self.lock();
            if inner.state != SuperuserState::None {
                return Err(SuperuserError::AlreadyRunning);
            }
            let bridge = self
                .settings
                .superuser_bridge(name)
                .ok_or_else(|| SuperuserError::UnknownBridge(name.to_string()))?;
            let spec = SpawnSpec::from_argv(bridge.label.as_str(), &bridge.spawn)
                .map_err(|err| SuperuserError::Failed(Problem::internal(err.to_string())))?
                .environ(&bridge.environ);
            let config = PeerConfig::new(spec, inner.init_host.clone())
                .with_init_timeout(self.settings.peer_init_timeout())
                .with_prompts(self.settings.askpass_path(), self.prompt_handler(responder));

            let peer = Peer::new(config, self.router.clone());
            inner.peer = Some(peer.clone());
            self.set_state(&mut inner, SuperuserState::Init);
            peer
        };

        info!(bridge = name, "starting superuser bridge");
        let result = peer.start().await;

        let mut inner = self.lock();
        let current = inner
            .peer
            .as_ref()
            .is_some_and(|active| active.id() == peer.id());
        match result {
            Ok(()) if current => {
                self.set_state(&mut inner, SuperuserState::Running(name.to_string()));
                info!(bridge = name, "superuser bridge running");
                Ok(())
            }
            // stop() got there first.
            Ok(()) | Err(PeerError::Closed) => Err(SuperuserError::Cancelled),
            Err(err) => {
                if current {
                    inner.peer = None;
                    inner.pending = None;
                    self.set_state(&mut inner, SuperuserState::None);
                }
                warn!(bridge = name, error = %err, "superuser bridge failed");
                Err(SuperuserError::Failed(err.problem()))
            }
        }
    }

    /// Close the running bridge, if any, and cancel a pending prompt.
    pub fn stop(&self) {
        let (peer, pending) = {
            let mut inner = self.lock();
            self.set_state(&mut inner, SuperuserState::None);
            (inner.peer.take(), inner.pending.take())
        };
        if let Some(pending) = pending {
            pending.cancel();
        }
        if let Some(peer) = peer {
            info!(peer = peer.label(), "stopping superuser bridge");
            peer.close();
        }
    }

    /// Reply to the pending prompt.
    pub fn answer(&self, reply: impl Into<String>) {
        match self.lock().pending.take() {
            Some(request) => request.answer(reply),
            None => debug!("answer without a pending prompt ignored"),
        }
    }

    fn prompt_handler(&self, responder: PromptResponder) -> PromptHandler {
        match responder {
            PromptResponder::Interactive => {
                let inner = Arc::clone(&self.inner);
                let events = self.events.clone();
                Arc::new(move |request: InteractionRequest| {
                    let prompt = request.prompt.clone();
                    let echo = PromptKind::classify(&prompt) == PromptKind::HostKey;
                    {
                        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Some(previous) = inner.pending.replace(request) {
                            previous.cancel();
                        }
                    }
                    let _ = events.send(SuperuserEvent::Prompt {
                        message: String::new(),
                        prompt,
                        default: String::new(),
                        echo,
                        error: String::new(),
                    });
                })
            }
            PromptResponder::Authorize { user } => {
                let router = self.router.clone();
                Arc::new(move |request: InteractionRequest| {
                    let router = router.clone();
                    let challenge = format!("plain1:{user}:");
                    tokio::spawn(async move {
                        let response = router.request_authorization(challenge).await;
                        request.respond(response);
                    });
                })
            }
        }
    }

    fn peer_closed(&self, endpoint: EndpointId) {
        let mut inner = self.lock();
        if inner.peer.as_ref().is_some_and(|peer| peer.id() == endpoint) {
            inner.peer = None;
            inner.pending = None;
            self.set_state(&mut inner, SuperuserState::None);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Request<'a> {
    /// Use the bridge if one runs, otherwise route normally.
    Try,
    /// Require a bridge, optionally a specific one.
    Require(Option<&'a str>),
}

fn superuser_request(options: &JsonObject) -> Result<Option<Request<'_>>, Problem> {
    match options.get("superuser") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(Value::Bool(true)) => Ok(Some(Request::Require(None))),
        Some(Value::String(mode)) => Ok(Some(match mode.as_str() {
            "try" => Request::Try,
            "require" | "any" => Request::Require(None),
            name => Request::Require(Some(name)),
        })),
        Some(_) => Err(Problem::protocol_error(
            "attribute 'superuser': must have type str or bool",
        )),
    }
}

/// Sends `superuser` channels to the running superuser bridge.
pub struct SuperuserRoutingRule {
    control: SuperuserControl,
}

impl SuperuserRoutingRule {
    pub fn new(control: SuperuserControl) -> Self {
        Self { control }
    }

    pub fn control(&self) -> &SuperuserControl {
        &self.control
    }
}

impl RoutingRule for SuperuserRoutingRule {
    fn name(&self) -> &'static str {
        "superuser"
    }

    fn apply_rule(&mut self, options: &JsonObject, ctx: &RuleContext<'_>) -> RouteDecision {
        if self.control.privileged {
            return RouteDecision::NoMatch;
        }
        let request = match superuser_request(options) {
            Ok(Some(request)) => request,
            Ok(None) => return RouteDecision::NoMatch,
            Err(problem) => return RouteDecision::Reject(problem),
        };

        let inner = self.control.lock();
        let Some(peer) = inner.peer.clone() else {
            return match request {
                Request::Try => RouteDecision::NoMatch,
                Request::Require(_) => {
                    debug!(channel = ctx.channel, "superuser requested but not running");
                    RouteDecision::Reject(Problem::new(ACCESS_DENIED))
                }
            };
        };
        if let (Request::Require(Some(name)), SuperuserState::Running(running)) =
            (&request, &inner.state)
        {
            if name != running {
                return RouteDecision::Reject(
                    Problem::new(ACCESS_DENIED)
                        .with_message(format!("superuser bridge {running} is running, not {name}")),
                );
            }
        }
        RouteDecision::Endpoint(Arc::new(peer))
    }

    fn init_received(&mut self, init: &ControlMessage, ctx: &RuleContext<'_>) {
        self.control.set_init_host(ctx.init_host);

        let Some(id) = json::get_object(init.as_object(), "superuser")
            .and_then(|superuser| json::get_str(superuser, "id"))
        else {
            return;
        };
        let name = match id {
            "any" => match self.control.bridges().into_iter().next() {
                Some(first) => first,
                None => {
                    warn!("superuser requested in init but no bridge is configured");
                    ctx.router
                        .send_connection_control(ControlMessage::new(COMMAND_SUPERUSER_INIT_DONE));
                    return;
                }
            },
            name => name.to_string(),
        };

        let control = self.control.clone();
        let router = ctx.router.clone();
        tokio::spawn(async move {
            let user = system::username().unwrap_or_default();
            if let Err(err) = control
                .start(&name, PromptResponder::Authorize { user })
                .await
            {
                warn!(bridge = %name, error = %err, "superuser bridge from init failed");
            }
            router.send_connection_control(ControlMessage::new(COMMAND_SUPERUSER_INIT_DONE));
        });
    }

    fn endpoint_closed(&mut self, endpoint: EndpointId) {
        self.control.peer_closed(endpoint);
    }

    fn shutdown(&mut self) {
        self.control.stop();
    }
}

/// The `superuser` channel: [`SuperuserControl`] over JSON data frames.
///
/// Events go out as `{"event": "bridges" | "current" | "prompt", ...}`.
/// Calls come in as `{"call": "start", "name": ...}`, `{"call": "stop"}`
/// and `{"call": "answer", "value": ...}`; start and stop are answered with
/// `{"reply": ...}`, carrying `problem` and `message` on failure.
pub struct SuperuserChannel {
    control: SuperuserControl,
}

impl SuperuserChannel {
    pub fn new(control: SuperuserControl) -> Self {
        Self { control }
    }

    fn start(&self, ctx: &ChannelContext, call: &JsonObject) -> Result<(), ChannelError> {
        let name = json::typed_str(call, "name")
            .map_err(Problem::protocol_error)?
            .ok_or_else(|| Problem::protocol_error("start: missing name"))?
            .to_string();
        let control = self.control.clone();
        let sender = ctx.sender();
        // Detached: closing the channel must not cancel a start half way.
        tokio::spawn(async move {
            let reply = match control.start(&name, PromptResponder::Interactive).await {
                Ok(()) => json!({"reply": "start"}),
                Err(err) => {
                    let problem = err.problem();
                    json!({"reply": "start", "problem": problem.code, "message": err.to_string()})
                }
            };
            send_json(&sender, &reply);
        });
        Ok(())
    }
}

fn send_json(sender: &ChannelSender, value: &Value) {
    sender.send_data(Bytes::from(value.to_string()));
}

fn event_json(event: &SuperuserEvent) -> Value {
    match event {
        SuperuserEvent::Prompt {
            message,
            prompt,
            default,
            echo,
            error,
        } => json!({
            "event": "prompt",
            "message": message,
            "prompt": prompt,
            "default": default,
            "echo": echo,
            "error": error,
        }),
        SuperuserEvent::Current(current) => json!({"event": "current", "current": current}),
    }
}

impl ChannelHandler for SuperuserChannel {
    fn on_open(&mut self, ctx: &mut ChannelContext, _options: &JsonObject) -> Result<(), ChannelError> {
        let mut events = self.control.subscribe();
        ctx.ready();
        let sender = ctx.sender();
        send_json(&sender, &json!({"event": "bridges", "bridges": self.control.bridges()}));
        send_json(&sender, &json!({"event": "current", "current": self.control.current()}));
        ctx.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => send_json(&sender, &event_json(&event)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "superuser events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        })
    }

    fn on_data(&mut self, ctx: &mut ChannelContext, data: Bytes) -> Result<(), ChannelError> {
        let call = match serde_json::from_slice::<Value>(&data) {
            Ok(Value::Object(call)) => call,
            Ok(_) => return Err(Problem::protocol_error("superuser call must be an object")),
            Err(err) => return Err(Problem::protocol_error(format!("invalid superuser call: {err}"))),
        };
        match json::get_str(&call, "call") {
            Some("start") => self.start(ctx, &call)?,
            Some("stop") => {
                self.control.stop();
                send_json(&ctx.sender(), &json!({"reply": "stop"}));
            }
            Some("answer") => {
                let value = json::typed_str(&call, "value")
                    .map_err(Problem::protocol_error)?
                    .unwrap_or_default();
                self.control.answer(value);
            }
            other => {
                return Err(Problem::not_supported()
                    .with_message(format!("unknown superuser call {}", other.unwrap_or("(none)"))));
            }
        }
        Ok(())
    }

    fn on_done(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError> {
        ctx.done();
        Ok(())
    }

    fn on_close(&mut self, ctx: &mut ChannelContext, _problem: Option<&Problem>) {
        ctx.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use muxbridge_transport::{ask, InteractionServer};
    use serde_json::json;

    use super::*;
    use crate::channel::LocalChannel;
    use crate::config::{FlowControlConfig, SuperuserBridgeConfig};
    use crate::endpoint::RouterEvent;
    use muxbridge_frame::{COMMAND_CLOSE, COMMAND_OPEN};

    const FAKE_BRIDGE: &str = r#"printf '31\n\n{"command":"init","version":1}'; exec cat"#;
    fn bridge(label: &str, script: &str) -> SuperuserBridgeConfig {
        SuperuserBridgeConfig {
            label: label.to_string(),
            spawn: vec!["/bin/sh".into(), "-c".into(), script.into()],
            environ: vec![],
            privileged: true,
        }
    }

    fn control(bridges: Vec<SuperuserBridgeConfig>) -> SuperuserControl {
        let settings = BridgeSettings {
            superuser: bridges,
            peer_init_timeout_secs: Some(10),
            ..BridgeSettings::default()
        };
        let (router, _) = RouterHandle::new();
        SuperuserControl::new(Arc::new(settings), router, false)
    }

    fn object(value: serde_json::Value) -> JsonObject {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn apply(rule: &mut SuperuserRoutingRule, options: serde_json::Value) -> RouteDecision {
        let router = rule.control.router.clone();
        let ctx = RuleContext {
            router: &router,
            init_host: "localhost",
            channel: "1",
        };
        rule.apply_rule(&object(options), &ctx)
    }

    #[test]
    fn request_modes() {
        assert_eq!(superuser_request(&object(json!({}))), Ok(None));
        assert_eq!(
            superuser_request(&object(json!({"superuser": "try"}))),
            Ok(Some(Request::Try))
        );
        assert_eq!(
            superuser_request(&object(json!({"superuser": true}))),
            Ok(Some(Request::Require(None)))
        );
        assert_eq!(
            superuser_request(&object(json!({"superuser": "sudo"}))),
            Ok(Some(Request::Require(Some("sudo"))))
        );
        assert!(superuser_request(&object(json!({"superuser": 1}))).is_err());
    }

    #[tokio::test]
    async fn bridges_and_current() {
        let control = control(vec![bridge("sudo", FAKE_BRIDGE), bridge("pkexec", FAKE_BRIDGE)]);
        assert_eq!(control.bridges(), vec!["sudo", "pkexec"]);
        assert_eq!(control.current(), "none");

        let (router, _events) = RouterHandle::new();
        let root = SuperuserControl::new(Arc::new(BridgeSettings::default()), router, true);
        assert_eq!(root.current(), "root");
    }

    #[tokio::test]
    async fn start_runs_and_stop_returns_to_none() {
        let control = control(vec![bridge("pseudo", FAKE_BRIDGE)]);
        let mut events = control.subscribe();

        control.start("pseudo", PromptResponder::Interactive).await.unwrap();
        assert_eq!(control.state(), SuperuserState::Running("pseudo".into()));
        assert_eq!(events.recv().await.unwrap(), SuperuserEvent::Current("init".into()));
        assert_eq!(events.recv().await.unwrap(), SuperuserEvent::Current("pseudo".into()));

        // A second start leaves the first alone.
        assert!(matches!(
            control.start("pseudo", PromptResponder::Interactive).await,
            Err(SuperuserError::AlreadyRunning)
        ));
        assert_eq!(control.current(), "pseudo");

        control.stop();
        assert_eq!(control.state(), SuperuserState::None);
        control.stop();
        assert_eq!(control.state(), SuperuserState::None);
        assert_eq!(events.recv().await.unwrap(), SuperuserEvent::Current("none".into()));
    }

    #[tokio::test]
    async fn unknown_bridge() {
        let control = control(vec![]);
        assert!(matches!(
            control.start("nope", PromptResponder::Interactive).await,
            Err(SuperuserError::UnknownBridge(_))
        ));
        assert_eq!(control.state(), SuperuserState::None);
    }

    #[tokio::test]
    async fn failed_start_unwinds() {
        let control = control(vec![bridge(
            "pseudo",
            "echo 'pseudo says: Bad password' >&2; exit 1",
        )]);
        match control.start("pseudo", PromptResponder::Interactive).await {
            Err(SuperuserError::Failed(problem)) => {
                assert_eq!(problem.message.as_deref(), Some("pseudo says: Bad password"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(control.state(), SuperuserState::None);
    }

    #[tokio::test]
    async fn rule_follows_request_mode() {
        let control = control(vec![bridge("pseudo", FAKE_BRIDGE)]);
        let mut rule = SuperuserRoutingRule::new(control.clone());

        assert!(matches!(apply(&mut rule, json!({"payload": "echo"})), RouteDecision::NoMatch));
        assert!(matches!(
            apply(&mut rule, json!({"payload": "echo", "superuser": "try"})),
            RouteDecision::NoMatch
        ));
        match apply(&mut rule, json!({"payload": "echo", "superuser": "require"})) {
            RouteDecision::Reject(problem) => assert_eq!(problem.code, ACCESS_DENIED),
            _ => panic!("expected access-denied"),
        }

        control.start("pseudo", PromptResponder::Interactive).await.unwrap();
        assert!(matches!(
            apply(&mut rule, json!({"payload": "echo", "superuser": "try"})),
            RouteDecision::Endpoint(_)
        ));
        assert!(matches!(
            apply(&mut rule, json!({"payload": "echo", "superuser": "pseudo"})),
            RouteDecision::Endpoint(_)
        ));
        assert!(matches!(
            apply(&mut rule, json!({"payload": "echo", "superuser": "pkexec"})),
            RouteDecision::Reject(_)
        ));

        rule.shutdown();
        assert_eq!(control.state(), SuperuserState::None);
    }

    #[tokio::test]
    async fn privileged_bridge_passes_through() {
        let (router, _events) = RouterHandle::new();
        let control = SuperuserControl::new(Arc::new(BridgeSettings::default()), router, true);
        let mut rule = SuperuserRoutingRule::new(control);
        assert!(matches!(
            apply(&mut rule, json!({"payload": "echo", "superuser": "require"})),
            RouteDecision::NoMatch
        ));
    }

    #[tokio::test]
    async fn interactive_prompt_is_answered() {
        let control = control(vec![]);
        let mut events = control.subscribe();
        let handler = control.prompt_handler(PromptResponder::Interactive);

        let path = std::env::temp_dir().join(format!("muxbridge-su-test-{}.sock", std::process::id()));
        let (server, mut requests) = InteractionServer::bind_at(&path).unwrap();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                handler(request);
            }
        });

        let socket = server.path().to_path_buf();
        let asked = tokio::task::spawn_blocking(move || ask(&socket, "can haz pw?"));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            SuperuserEvent::Prompt {
                message: String::new(),
                prompt: "can haz pw?".into(),
                default: String::new(),
                echo: false,
                error: String::new(),
            }
        );
        control.answer("p4ssw0rd");
        assert_eq!(asked.await.unwrap().unwrap().as_deref(), Some("p4ssw0rd"));
    }

    enum Output {
        Control(ControlMessage),
        Json(Value),
    }

    async fn next_output(events: &mut tokio::sync::mpsc::UnboundedReceiver<RouterEvent>) -> Output {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out")
            .expect("router gone");
        match event {
            RouterEvent::Control { message, .. } => Output::Control(message),
            RouterEvent::Data { data, .. } => Output::Json(serde_json::from_slice(&data).unwrap()),
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Next JSON message, skipping control traffic.
    async fn next_json(events: &mut tokio::sync::mpsc::UnboundedReceiver<RouterEvent>) -> Value {
        loop {
            if let Output::Json(value) = next_output(events).await {
                return value;
            }
        }
    }

    async fn reply(events: &mut tokio::sync::mpsc::UnboundedReceiver<RouterEvent>, call: &str) -> Value {
        loop {
            let value = next_json(events).await;
            if value["reply"] == call {
                return value;
            }
        }
    }

    fn open_control_channel(
        control: &SuperuserControl,
    ) -> (Arc<LocalChannel>, tokio::sync::mpsc::UnboundedReceiver<RouterEvent>) {
        let (router, events) = RouterHandle::new();
        let channel = LocalChannel::spawn(
            "su",
            SUPERUSER_PAYLOAD,
            Box::new(SuperuserChannel::new(control.clone())),
            router,
            FlowControlConfig::default(),
        );
        channel.deliver_control(
            ControlMessage::for_channel(COMMAND_OPEN, "su").with("payload", SUPERUSER_PAYLOAD),
        );
        (channel, events)
    }

    #[tokio::test]
    async fn control_channel_starts_and_stops() {
        let control = control(vec![bridge("pseudo", FAKE_BRIDGE)]);
        let (channel, mut events) = open_control_channel(&control);

        assert_eq!(next_json(&mut events).await, json!({"event": "bridges", "bridges": ["pseudo"]}));
        assert_eq!(next_json(&mut events).await, json!({"event": "current", "current": "none"}));

        channel.deliver_data("su", Bytes::from_static(br#"{"call": "start", "name": "pseudo"}"#));
        assert_eq!(reply(&mut events, "start").await, json!({"reply": "start"}));
        assert_eq!(control.current(), "pseudo");

        channel.deliver_data("su", Bytes::from_static(br#"{"call": "start", "name": "pseudo"}"#));
        let again = reply(&mut events, "start").await;
        assert_eq!(again["message"], "already running");

        channel.deliver_data("su", Bytes::from_static(br#"{"call": "stop"}"#));
        reply(&mut events, "stop").await;
        assert_eq!(control.state(), SuperuserState::None);
    }

    #[tokio::test]
    async fn control_channel_reports_unknown_bridge() {
        let control = control(vec![]);
        let (channel, mut events) = open_control_channel(&control);

        channel.deliver_data("su", Bytes::from_static(br#"{"call": "start", "name": "doas"}"#));
        let failed = reply(&mut events, "start").await;
        assert_eq!(failed["problem"], "not-supported");
    }

    #[tokio::test]
    async fn control_channel_rejects_garbage() {
        let control = control(vec![]);
        let (channel, mut events) = open_control_channel(&control);

        channel.deliver_data("su", Bytes::from_static(b"not json"));
        loop {
            if let Output::Control(message) = next_output(&mut events).await {
                if message.is(COMMAND_CLOSE) {
                    assert_eq!(message.get_str("problem"), Some("protocol-error"));
                    break;
                }
            }
        }
    }
}
