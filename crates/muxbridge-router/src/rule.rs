use std::sync::Arc;

use muxbridge_frame::{ControlMessage, JsonObject};

use crate::endpoint::{Endpoint, EndpointId, RouterHandle};
use crate::error::Problem;

/// What a rule gets to see besides the `open` body.
pub struct RuleContext<'a> {
    pub router: &'a RouterHandle,
    /// Host announced by the far side in its `init`.
    pub init_host: &'a str,
    /// The channel being opened.
    pub channel: &'a str,
}

/// Outcome of evaluating one rule.
pub enum RouteDecision {
    /// Bind the channel to this endpoint.
    Endpoint(Arc<dyn Endpoint>),
    /// Try the next rule.
    NoMatch,
    /// Stop evaluating and close the channel with this problem.
    Reject(Problem),
}

/// One entry of the router's ordered rule list.
pub trait RoutingRule: Send {
    fn name(&self) -> &'static str;

    fn apply_rule(&mut self, options: &JsonObject, ctx: &RuleContext<'_>) -> RouteDecision;

    /// The far side's `init` has been accepted.
    fn init_received(&mut self, _init: &ControlMessage, _ctx: &RuleContext<'_>) {}

    /// An endpoint has closed; drop any reference the rule keeps to it.
    fn endpoint_closed(&mut self, _endpoint: EndpointId) {}

    /// A channel bound to `endpoint` has gone away; `remaining` channels
    /// are still bound to it.
    fn channel_unbound(&mut self, _endpoint: EndpointId, _remaining: usize) {}

    fn shutdown(&mut self) {}
}
