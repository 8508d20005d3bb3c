//! Host/UI bridge.
//!
//! The only surface that crosses the process boundary: a closed set of
//! JSON-RPC methods over loopback TCP, plus pushed events.

mod client;
mod events;
mod protocol;
mod server;

pub use client::{BridgeClient, BridgeEventStream};
pub use events::{BridgeEvent, EventBus, EventSubscription, EventTopic};
pub use protocol::{
    read_frame, write_frame, BridgeError, BridgeMethod, BridgeRequest, BridgeResponse,
    EVENT_NOTIFICATION, SUBSCRIBE_EVENTS,
};
pub use server::{BridgeDispatch, BridgeServer, BridgeServerHandle};
