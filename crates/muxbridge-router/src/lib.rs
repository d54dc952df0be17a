//! Routing core of the muxbridge protocol.
//!
//! A [`Router`] serves one connection. Every `open` is offered to an ordered
//! list of [`RoutingRule`]s; the first rule that produces an [`Endpoint`]
//! owns the channel until that endpoint sends `close` or goes away.
//!
//! Endpoints come in two shapes:
//!
//! - [`LocalChannel`]: a [`ChannelHandler`] driven in this process.
//! - [`Peer`]: a child bridge (superuser helper, ssh to another host) that
//!   speaks the same protocol on its stdio.

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod flow;
pub mod handlers;
pub mod peer;
pub mod remote;
pub mod router;
pub mod rule;
pub mod ssh;
pub mod superuser;
pub mod system;

pub use channel::{ChannelContext, ChannelHandler, ChannelSender, ChannelState, LocalChannel};
pub use config::{BridgeSettings, ConfigError, FlowControlConfig, SuperuserBridgeConfig, CONFIG_ENV};
pub use endpoint::{Endpoint, EndpointId, RouterEvent, RouterHandle};
pub use error::{ChannelError, PeerError, Problem, Result, RouterError, SuperuserError};
pub use flow::FlowControl;
pub use handlers::{ChannelRoutingRule, EchoChannel, HandlerRegistry, NullChannel};
pub use peer::{Peer, PeerConfig, PeerFailure, PeerState, PromptKind};
pub use remote::{HostKey, HostRoutingRule};
pub use router::Router;
pub use rule::{RouteDecision, RoutingRule, RuleContext};
pub use superuser::{
    PromptResponder, SuperuserChannel, SuperuserControl, SuperuserEvent, SuperuserRoutingRule,
    SuperuserState, SUPERUSER_PAYLOAD,
};
