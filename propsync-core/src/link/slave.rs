//! Slave side: one reconnecting connection to the master.

use super::Link;
use crate::config::Config;
use crate::flags::PropertyFlags;
use crate::registry::Shared;
use bytes::Bytes;
use propsync_protocol::{Envelope, Framing, PropertyId, Request};
use propsync_transport::{ConnectionHandler, Endpoint, FramedConnection, ReconnectingClient};
use std::sync::{Arc, Weak};

pub(crate) struct SlaveLink {
    shared: Weak<Shared>,
    client: ReconnectingClient,
}

impl SlaveLink {
    pub(crate) fn new(shared: &Arc<Shared>, config: &Config) -> Arc<Self> {
        let backoff = config.backoff_config();
        let shared = Arc::downgrade(shared);
        Arc::new_cyclic(|weak: &Weak<SlaveLink>| {
            let handler: Weak<dyn ConnectionHandler> = weak.clone();
            Self {
                shared,
                client: ReconnectingClient::new(handler, backoff),
            }
        })
    }

    /// Connects to the master. The segment is attached as soon as the
    /// connection is up.
    pub(crate) fn connect(&self, endpoint: Endpoint, auto_connect: bool, framing: Framing) -> bool {
        self.client.connect(endpoint, auto_connect, framing)
    }

    fn dispatch(&self, shared: &Shared, conn: &Arc<FramedConnection>, envelope: Envelope) {
        let result = match envelope {
            Envelope::ChangeNotification(id) => shared.change_notification_received(id),
            Envelope::Request { id, request } => shared.request_received(id, request),
        };

        if let Err(e) = result {
            if e.is_protocol_violation() {
                tracing::warn!("Protocol violation from master on {}: {}", conn, e);
                conn.shutdown();
            } else {
                tracing::error!("Message from master on {} dropped: {}", conn, e);
            }
        }
    }
}

impl ConnectionHandler for SlaveLink {
    fn connection_established(&self, conn: &Arc<FramedConnection>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Err(e) = shared.attach_shared_memory() {
            tracing::warn!("Dropping {}: {}", conn, e);
            conn.shutdown();
        }
    }

    fn data_received(&self, conn: &Arc<FramedConnection>, data: Bytes) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match Envelope::decode(data) {
            Ok(envelope) => self.dispatch(&shared, conn, envelope),
            Err(e) => tracing::warn!("Dropping malformed message from {}: {}", conn, e),
        }
    }

    fn closed(&self, conn: &Arc<FramedConnection>) {
        tracing::info!("Disconnected from master on {}", conn.peer());
        if let Some(shared) = self.shared.upgrade() {
            shared.detach_shared_memory();
        }
    }
}

impl Link for SlaveLink {
    fn send_request(&self, id: PropertyId, request: &Request) -> bool {
        let encoded = request.encode(id);
        self.client
            .send(&encoded.primary, encoded.secondary.as_deref())
    }

    fn send_change_notification(&self, id: PropertyId, _flags: PropertyFlags) -> bool {
        tracing::debug!("Slave cannot notify changes (property {})", id);
        false
    }

    fn peer_count(&self) -> usize {
        usize::from(self.client.is_connected())
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    fn reconnect(&self) -> bool {
        self.client.try_and_retry_to_connect()
    }

    fn shutdown(&self) {
        self.client.close();
    }
}
