//! Master side: one acceptor, many slave connections.

use super::{send_encoded, Link, Origin, ORIGIN};
use crate::config::Config;
use crate::flags::PropertyFlags;
use crate::registry::Shared;
use bytes::Bytes;
use parking_lot::Mutex;
use propsync_protocol::{encode_change_notification, Envelope, PropertyId, Request};
use propsync_transport::{
    AcceptorConfig, ConnectionAcceptor, ConnectionHandler, ConnectionId, FramedConnection,
    TransportError,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

/// One connected slave and the properties it listens to.
struct ClientEntry {
    conn: Arc<FramedConnection>,
    subscriptions: Vec<u64>,
}

impl ClientEntry {
    fn new(conn: Arc<FramedConnection>, property_count: usize) -> Self {
        Self {
            conn,
            subscriptions: vec![0; property_count.div_ceil(64)],
        }
    }

    fn subscribe(&mut self, id: PropertyId) {
        let index = usize::from(id);
        if let Some(word) = self.subscriptions.get_mut(index / 64) {
            *word |= 1u64 << (index % 64);
        }
    }

    fn is_subscribed(&self, id: PropertyId) -> bool {
        let index = usize::from(id);
        self.subscriptions
            .get(index / 64)
            .map_or(false, |word| word & (1u64 << (index % 64)) != 0)
    }
}

pub(crate) struct MasterLink {
    shared: Weak<Shared>,
    acceptor: Arc<ConnectionAcceptor>,
    clients: Mutex<HashMap<ConnectionId, ClientEntry>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MasterLink {
    /// Binds the registry's endpoint. Slaves queue in the backlog until
    /// [`start`](Self::start) is called.
    ///
    /// Binding fails while another master holds the endpoint, so a successful
    /// bind also claims the segment name.
    pub(crate) fn bind(shared: &Arc<Shared>, config: &Config) -> Result<Arc<Self>, TransportError> {
        let acceptor_config = AcceptorConfig::default()
            .with_framing(config.framing())
            .with_max_connections(config.transport.max_connections);
        let acceptor = Arc::new(ConnectionAcceptor::bind(config.endpoint(), acceptor_config)?);

        Ok(Arc::new(Self {
            shared: Arc::downgrade(shared),
            acceptor,
            clients: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        }))
    }

    /// Starts accepting slaves.
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn start(self: &Arc<Self>) {
        let acceptor = self.acceptor.clone();
        let handler: Arc<dyn ConnectionHandler> = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = acceptor.run(handler).await {
                tracing::error!("Master link stopped: {}", e);
            }
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    fn subscribe(&self, shared: &Shared, conn: &Arc<FramedConnection>, id: PropertyId) {
        let property = match shared.property(id) {
            Ok(property) => property,
            Err(e) => {
                tracing::error!("Subscription from {} dropped: {}", conn, e);
                return;
            }
        };

        match self.clients.lock().get_mut(&conn.id()) {
            Some(entry) => entry.subscribe(id),
            None => return,
        }
        tracing::debug!("{} subscribed to property {}", conn, id);

        let flags = property.flags();
        if flags.contains(PropertyFlags::SUPPRESS_INITIAL_NOTIFY_ON_CONNECT) {
            return;
        }
        if flags.contains(PropertyFlags::USE_LOCAL_COPY) {
            let encoded = Request::Set(property.encoded_value()).encode(id);
            send_encoded(conn, &encoded);
        } else {
            conn.send(&encode_change_notification(id), None);
        }
    }

    fn dispatch(&self, shared: &Shared, conn: &Arc<FramedConnection>, envelope: Envelope) {
        let result = match envelope {
            Envelope::ChangeNotification(id) => shared.change_notification_received(id),
            Envelope::Request {
                id,
                request: Request::SubscribeChanges,
            } => {
                self.subscribe(shared, conn, id);
                Ok(())
            }
            Envelope::Request {
                id,
                request: Request::ReportIncompatible,
            } => {
                tracing::error!(
                    "{} reported an incompatible shared segment (property {}), disconnecting",
                    conn,
                    id
                );
                conn.shutdown();
                Ok(())
            }
            Envelope::Request { id, request } => {
                let origin = Origin {
                    conn: conn.id(),
                    property: id,
                };
                ORIGIN.sync_scope(origin, || shared.request_received(id, request))
            }
        };

        if let Err(e) = result {
            if e.is_protocol_violation() {
                tracing::warn!("Protocol violation from {}: {}", conn, e);
                conn.shutdown();
            } else {
                tracing::error!("Request from {} dropped: {}", conn, e);
            }
        }
    }
}

impl ConnectionHandler for MasterLink {
    fn connection_established(&self, conn: &Arc<FramedConnection>) {
        let property_count = self
            .shared
            .upgrade()
            .map_or(0, |shared| shared.property_count());
        self.clients
            .lock()
            .insert(conn.id(), ClientEntry::new(conn.clone(), property_count));
        tracing::info!("Client {} connected", conn);
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
        if self.clients.lock().remove(&conn.id()).is_some() {
            tracing::info!("Client {} disconnected", conn);
        }
    }
}

impl Link for MasterLink {
    fn send_request(&self, id: PropertyId, request: &Request) -> bool {
        let encoded = request.encode(id);
        let targets: Vec<_> = self.clients.lock().values().map(|c| c.conn.clone()).collect();
        targets
            .iter()
            .fold(true, |ok, conn| send_encoded(conn, &encoded) && ok)
    }

    fn send_change_notification(&self, id: PropertyId, flags: PropertyFlags) -> bool {
        let skip = if flags.contains(PropertyFlags::SUPPRESS_NOTIFY_ORIGINATING_CLIENT) {
            ORIGIN
                .try_with(|origin| *origin)
                .ok()
                .filter(|origin| origin.property == id)
                .map(|origin| origin.conn)
        } else {
            None
        };

        let targets: Vec<_> = self
            .clients
            .lock()
            .values()
            .filter(|c| c.is_subscribed(id) && Some(c.conn.id()) != skip)
            .map(|c| c.conn.clone())
            .collect();

        let message = encode_change_notification(id);
        targets
            .iter()
            .fold(true, |ok, conn| conn.send(&message, None) && ok)
    }

    fn peer_count(&self) -> usize {
        self.clients.lock().len()
    }

    fn is_connected(&self) -> bool {
        self.acceptor.is_running()
    }

    fn shutdown(&self) {
        self.acceptor.shutdown();
        self.acceptor.close_all();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.clients.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink;

    impl ConnectionHandler for Sink {
        fn data_received(&self, _conn: &Arc<FramedConnection>, _data: Bytes) {}
    }

    #[tokio::test]
    async fn test_subscription_bitset() {
        let (stream, _peer) = tokio::net::UnixStream::pair().unwrap();
        let conn = FramedConnection::new(
            stream,
            propsync_protocol::Framing::default(),
            "test",
            Arc::new(Sink),
        )
        .unwrap();
        let mut entry = ClientEntry::new(conn, 130);
        assert_eq!(entry.subscriptions.len(), 3);

        entry.subscribe(0);
        entry.subscribe(64);
        entry.subscribe(129);
        entry.subscribe(500);
        assert!(entry.is_subscribed(0));
        assert!(entry.is_subscribed(64));
        assert!(entry.is_subscribed(129));
        assert!(!entry.is_subscribed(1));
        assert!(!entry.is_subscribed(500));
    }
}
