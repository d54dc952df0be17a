use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use muxbridge_frame::{ControlMessage, COMMAND_CLOSE};
use tokio::sync::{mpsc, oneshot};

use crate::error::Problem;

/// Process-unique identity of an endpoint.
pub type EndpointId = u64;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_endpoint_id() -> EndpointId {
    NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something a channel id can be bound to: a local channel or a peer.
///
/// Deliveries never block and never fail; an endpoint that has gone away
/// simply drops what it receives.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> EndpointId;

    /// Short description for logs.
    fn label(&self) -> String;

    /// A control message addressed to one of this endpoint's channels.
    fn deliver_control(&self, message: ControlMessage);

    fn deliver_data(&self, channel: &str, data: Bytes);

    /// Handle a connection-level `kill` covering `channels`.
    fn kill(&self, channels: &[String], _message: &ControlMessage) {
        for channel in channels {
            self.deliver_control(ControlMessage::for_channel(COMMAND_CLOSE, channel));
        }
    }

    /// Tear down without further traffic; the connection is going away.
    fn shutdown(&self);
}

/// Traffic flowing from endpoints and rules into the router loop.
#[derive(Debug)]
pub enum RouterEvent {
    /// Outbound control message from an endpoint.
    Control {
        from: EndpointId,
        message: ControlMessage,
    },
    /// Outbound data from an endpoint.
    Data {
        from: EndpointId,
        channel: String,
        data: Bytes,
    },
    /// The endpoint is gone; its channels close with `problem`.
    EndpointClosed {
        endpoint: EndpointId,
        problem: Problem,
    },
    /// Ask the far side an `authorize` challenge.
    Authorize {
        challenge: String,
        reply: oneshot::Sender<Option<String>>,
    },
    /// Connection-level control message (no channel).
    SendControl(ControlMessage),
}

/// Cheap, cloneable way into the router loop.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    events: mpsc::UnboundedSender<RouterEvent>,
}

impl RouterHandle {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<RouterEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    fn post(&self, event: RouterEvent) {
        // The router has gone away; nothing left to deliver to.
        let _ = self.events.send(event);
    }

    pub fn send_control(&self, from: EndpointId, message: ControlMessage) {
        self.post(RouterEvent::Control { from, message });
    }

    pub fn send_data(&self, from: EndpointId, channel: impl Into<String>, data: Bytes) {
        self.post(RouterEvent::Data {
            from,
            channel: channel.into(),
            data,
        });
    }

    pub fn endpoint_closed(&self, endpoint: EndpointId, problem: Problem) {
        self.post(RouterEvent::EndpointClosed { endpoint, problem });
    }

    pub fn send_connection_control(&self, message: ControlMessage) {
        self.post(RouterEvent::SendControl(message));
    }

    /// Send `authorize {cookie, challenge}` and wait for the matching response.
    ///
    /// Resolves to `None` when the far side answers without a response or the
    /// connection goes away first.
    pub async fn request_authorization(&self, challenge: impl Into<String>) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(RouterEvent::Authorize {
                challenge: challenge.into(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}
