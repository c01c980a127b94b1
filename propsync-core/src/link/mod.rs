//! Bindings between a registry and the transport.

mod master;
mod slave;

pub(crate) use master::MasterLink;
pub(crate) use slave::SlaveLink;

use crate::flags::PropertyFlags;
use propsync_protocol::{EncodedRequest, PropertyId, Request};
use propsync_transport::{ConnectionId, FramedConnection};

/// Outbound side of a registry.
pub(crate) trait Link: Send + Sync {
    /// Sends a request: to every client from the master, to the master from
    /// a slave.
    fn send_request(&self, id: PropertyId, request: &Request) -> bool;

    /// Notifies subscribed clients that a property's slot changed.
    fn send_change_notification(&self, id: PropertyId, flags: PropertyFlags) -> bool;

    /// Connected clients on the master, 0 or 1 on a slave.
    fn peer_count(&self) -> usize;

    fn is_connected(&self) -> bool;

    /// Connects again if disconnected.
    fn reconnect(&self) -> bool {
        false
    }

    fn shutdown(&self);
}

/// The client request currently being applied on the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Origin {
    pub conn: ConnectionId,
    pub property: PropertyId,
}

tokio::task_local! {
    /// Set for the duration of one inbound request's dispatch.
    pub(crate) static ORIGIN: Origin;
}

fn send_encoded(conn: &FramedConnection, encoded: &EncodedRequest) -> bool {
    conn.send(&encoded.primary, encoded.secondary.as_deref())
}
