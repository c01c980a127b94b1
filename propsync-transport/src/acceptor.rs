//! Connection acceptor.

use crate::connection::{ConnectionHandler, ConnectionId, FramedConnection};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use bytes::Bytes;
use parking_lot::Mutex;
use propsync_protocol::Framing;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::broadcast;

/// Default cap on concurrently accepted connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Acceptor configuration.
#[derive(Debug, Clone, Copy)]
pub struct AcceptorConfig {
    /// Framing applied to every accepted connection.
    pub framing: Framing,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl AcceptorConfig {
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

type ConnectionMap = Arc<Mutex<HashMap<ConnectionId, Arc<FramedConnection>>>>;

/// Listens on an endpoint and accepts framed connections.
pub struct ConnectionAcceptor {
    endpoint: Endpoint,
    config: AcceptorConfig,
    listener: UnixListener,
    connections: ConnectionMap,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl ConnectionAcceptor {
    /// Binds the endpoint. Connections are accepted once [`run`](Self::run) is polled.
    pub fn bind(endpoint: Endpoint, config: AcceptorConfig) -> Result<Self, TransportError> {
        let listener = endpoint.bind()?;
        let (shutdown, _) = broadcast::channel(1);
        tracing::info!("Listening on {}", endpoint);
        Ok(Self {
            endpoint,
            config,
            listener,
            connections: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            running: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Accepts connections until shutdown or a listener error.
    ///
    /// Either way every accepted connection is closed before returning.
    pub async fn run(&self, handler: Arc<dyn ConnectionHandler>) -> Result<(), TransportError> {
        self.running.store(true, Ordering::SeqCst);
        let mut shutdown_rx = self.shutdown.subscribe();

        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => self.accept(stream, &handler),
                        Err(e) => {
                            tracing::error!("Listener on {} failed: {}", self.endpoint, e);
                            break Err(TransportError::Io(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Acceptor on {} shutting down", self.endpoint);
                    break Ok(());
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        self.close_all();
        result
    }

    fn accept(&self, stream: tokio::net::UnixStream, handler: &Arc<dyn ConnectionHandler>) {
        if self.connection_count() >= self.config.max_connections {
            tracing::warn!(
                "Connection limit reached on {}, rejecting connection",
                self.endpoint
            );
            return;
        }

        let tracked: Arc<dyn ConnectionHandler> = Arc::new(Tracked {
            inner: handler.clone(),
            connections: self.connections.clone(),
        });
        let conn = match FramedConnection::new(
            stream,
            self.config.framing,
            self.endpoint.to_string(),
            tracked,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Failed to set up connection on {}: {}", self.endpoint, e);
                return;
            }
        };

        tracing::debug!("Accepted {}", conn);
        self.connections.lock().insert(conn.id(), conn.clone());
        conn.start();
    }

    /// Closes every accepted connection.
    pub fn close_all(&self) {
        let connections: Vec<_> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.close(true);
        }
    }

    /// Stops the accept loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Removes a connection from the acceptor's map when it closes.
struct Tracked {
    inner: Arc<dyn ConnectionHandler>,
    connections: ConnectionMap,
}

impl ConnectionHandler for Tracked {
    fn connection_established(&self, conn: &Arc<FramedConnection>) {
        self.inner.connection_established(conn);
    }

    fn data_received(&self, conn: &Arc<FramedConnection>, data: Bytes) {
        self.inner.data_received(conn, data);
    }

    fn closed(&self, conn: &Arc<FramedConnection>) {
        self.connections.lock().remove(&conn.id());
        self.inner.closed(conn);
    }
}
