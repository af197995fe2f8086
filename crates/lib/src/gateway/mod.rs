//! Gateway: one persistent connection to a Kuzzle server.
//!
//! Callers submit requests concurrently; a single reader task owns the socket, writes the
//! queued frames, correlates responses by request id and fans real-time notifications out
//! to subscriptions. Liveness is checked with a ping after a quiet period and a lost
//! connection is reopened after a fixed delay until the caller disconnects.

mod client;
mod connection;
mod correlator;
mod error;
mod heartbeat;
mod protocol;
mod reader;
mod reconnect;
mod router;
mod server_info;

pub use client::{ConnectionState, Gateway};
pub use connection::{Connection, Connector, Frame, WsConnection, WsConnector};
pub use correlator::{new_request_id, Correlator, Resolution, Waiter};
pub use error::GatewayError;
pub use heartbeat::{Heartbeat, HeartbeatAction};
pub use protocol::{
    equals_filter, Envelope, Notification, Request, RequestKind, Response, ServiceErrorBody,
    CONTROLLER_DOCUMENT, CONTROLLER_REALTIME, STATUS_OK,
};
pub use router::{
    Arrival, Claim, Dispatch, Readiness, Removal, Subscription, SubscriptionId, SubscriptionRouter,
    Topic, TopicKey,
};
pub use server_info::server_info;
