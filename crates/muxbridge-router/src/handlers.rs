use std::collections::BTreeMap;

use bytes::Bytes;
use muxbridge_frame::{json, JsonObject};
use tracing::debug;

use crate::channel::{ChannelContext, ChannelHandler, LocalChannel};
use crate::config::FlowControlConfig;
use crate::error::{ChannelError, Problem};
use crate::rule::{RouteDecision, RoutingRule, RuleContext};

/// Builds a handler for one `open` request.
pub type HandlerFactory = Box<dyn Fn(&JsonObject) -> Box<dyn ChannelHandler> + Send + Sync>;

/// Maps payload type strings to handler constructors.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `echo` and `null` payloads.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", |_| Box::new(EchoChannel));
        registry.register("null", |_| Box::new(NullChannel));
        registry
    }

    pub fn register<F>(&mut self, payload: &str, factory: F)
    where
        F: Fn(&JsonObject) -> Box<dyn ChannelHandler> + Send + Sync + 'static,
    {
        self.factories.insert(payload.to_string(), Box::new(factory));
    }

    pub fn create(&self, payload: &str, options: &JsonObject) -> Option<Box<dyn ChannelHandler>> {
        self.factories.get(payload).map(|factory| factory(options))
    }

    pub fn payloads(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Sends every byte straight back.
pub struct EchoChannel;

impl ChannelHandler for EchoChannel {
    fn on_open(&mut self, ctx: &mut ChannelContext, _options: &JsonObject) -> Result<(), ChannelError> {
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

    fn on_options(&mut self, _ctx: &mut ChannelContext, _options: &JsonObject) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Accepts and discards everything.
pub struct NullChannel;

impl ChannelHandler for NullChannel {
    fn on_open(&mut self, ctx: &mut ChannelContext, _options: &JsonObject) -> Result<(), ChannelError> {
        ctx.ready();
        Ok(())
    }

    fn on_done(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError> {
        ctx.done();
        Ok(())
    }
}

/// Last rule in the chain: serve the payload with a local handler.
pub struct ChannelRoutingRule {
    registry: HandlerRegistry,
    flow_control: FlowControlConfig,
}

impl ChannelRoutingRule {
    pub fn new(registry: HandlerRegistry, flow_control: FlowControlConfig) -> Self {
        Self {
            registry,
            flow_control,
        }
    }
}

impl RoutingRule for ChannelRoutingRule {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn apply_rule(&mut self, options: &JsonObject, ctx: &RuleContext<'_>) -> RouteDecision {
        let payload = match json::typed_str(options, "payload") {
            Ok(Some(payload)) => payload,
            Ok(None) => return RouteDecision::NoMatch,
            Err(message) => return RouteDecision::Reject(Problem::protocol_error(message)),
        };
        let Some(handler) = self.registry.create(payload, options) else {
            debug!(channel = %ctx.channel, payload, "no local handler");
            return RouteDecision::NoMatch;
        };
        RouteDecision::Endpoint(LocalChannel::spawn(
            ctx.channel,
            payload,
            handler,
            ctx.router.clone(),
            self.flow_control,
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::endpoint::RouterHandle;

    fn object(value: serde_json::Value) -> JsonObject {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.payloads().collect::<Vec<_>>(), vec!["echo", "null"]);
        assert!(registry.create("echo", &JsonObject::new()).is_some());
        assert!(registry.create("fsread1", &JsonObject::new()).is_none());
    }

    #[tokio::test]
    async fn rule_matches_known_payloads_only() {
        let (router, _events) = RouterHandle::new();
        let ctx = RuleContext {
            router: &router,
            init_host: "localhost",
            channel: "1",
        };
        let mut rule = ChannelRoutingRule::new(HandlerRegistry::with_builtins(), FlowControlConfig::default());

        let echo = object(json!({"command": "open", "channel": "1", "payload": "echo"}));
        assert!(matches!(rule.apply_rule(&echo, &ctx), RouteDecision::Endpoint(_)));

        let unknown = object(json!({"command": "open", "channel": "1", "payload": "fsread1"}));
        assert!(matches!(rule.apply_rule(&unknown, &ctx), RouteDecision::NoMatch));

        let bad = object(json!({"command": "open", "channel": "1", "payload": 5}));
        match rule.apply_rule(&bad, &ctx) {
            RouteDecision::Reject(problem) => assert_eq!(problem.code, "protocol-error"),
            _ => panic!("expected rejection"),
        }
    }
}
