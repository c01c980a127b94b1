//! Reconnecting client.
//!
//! Owns at most one outbound [`FramedConnection`]. Failed attempts are retried
//! on a tokio timer governed by [`Backoff`] when auto-connect is enabled, and a
//! peer hang-up re-arms the same retry loop. A peer that accepts and then
//! immediately hangs up is therefore retried at the initial backoff rate.

use crate::backoff::{Backoff, BackoffConfig};
use crate::connection::{ConnectionHandler, FramedConnection};
use crate::endpoint::Endpoint;
use bytes::Bytes;
use parking_lot::Mutex;
use propsync_protocol::Framing;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

/// Client side of one endpoint.
pub struct ReconnectingClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    handler: Weak<dyn ConnectionHandler>,
    state: Mutex<ClientState>,
    backoff: Mutex<Backoff>,
}

#[derive(Default)]
struct ClientState {
    endpoint: Option<Endpoint>,
    auto_connect: bool,
    framing: Framing,
    connection: Option<Arc<FramedConnection>>,
    retry: Option<JoinHandle<()>>,
    /// Bumped by `close` so stale retries and connections are ignored.
    generation: u64,
}

impl ReconnectingClient {
    /// Creates a disconnected client.
    ///
    /// The handler is held weakly so it may own the client.
    pub fn new(handler: Weak<dyn ConnectionHandler>, backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                handler,
                state: Mutex::new(ClientState::default()),
                backoff: Mutex::new(Backoff::new(backoff)),
            }),
        }
    }

    /// Attempts one connection to `endpoint`.
    ///
    /// With `auto_connect` set a failed attempt schedules a retry, and a later
    /// hang-up reconnects automatically.
    pub fn connect(&self, endpoint: Endpoint, auto_connect: bool, framing: Framing) -> bool {
        {
            let mut state = self.inner.state.lock();
            state.endpoint = Some(endpoint);
            state.auto_connect = auto_connect;
            state.framing = framing;
        }
        self.inner.attempt(auto_connect)
    }

    /// Connects now if disconnected, retrying with backoff until it succeeds
    /// or the client is closed.
    pub fn try_and_retry_to_connect(&self) -> bool {
        if self.inner.state.lock().endpoint.is_none() {
            tracing::warn!("Reconnect requested before any endpoint was given");
            return false;
        }
        self.inner.attempt(true)
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .connection
            .as_ref()
            .map_or(false, |c| c.is_connected())
    }

    /// The current connection, if any.
    pub fn connection(&self) -> Option<Arc<FramedConnection>> {
        self.inner.state.lock().connection.clone()
    }

    /// Endpoint name, for logging.
    pub fn name(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .endpoint
            .as_ref()
            .map(|e| e.to_string())
    }

    /// Retries scheduled since the last successful connect.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.backoff.lock().attempts()
    }

    /// Whether a retry timer is armed.
    pub fn retry_pending(&self) -> bool {
        self.inner
            .state
            .lock()
            .retry
            .as_ref()
            .map_or(false, |r| !r.is_finished())
    }

    pub fn send(&self, primary: &[u8], secondary: Option<&[u8]>) -> bool {
        match self.connection() {
            Some(conn) => conn.send(primary, secondary),
            None => {
                tracing::debug!(
                    "Send dropped, not connected to {}",
                    self.name().unwrap_or_default()
                );
                false
            }
        }
    }

    /// Cancels any pending retry and closes the connection.
    ///
    /// The client can be connected again afterwards.
    pub fn close(&self) {
        let (connection, retry) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            (state.connection.take(), state.retry.take())
        };
        if let Some(retry) = retry {
            retry.abort();
        }
        self.inner.backoff.lock().reset();
        if let Some(connection) = connection {
            connection.close(true);
        }
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientInner {
    fn attempt(self: &Arc<Self>, retry_on_failure: bool) -> bool {
        let (endpoint, framing, generation) = {
            let state = self.state.lock();
            if state.connection.as_ref().map_or(false, |c| c.is_connected()) {
                return true;
            }
            match &state.endpoint {
                Some(endpoint) => (endpoint.clone(), state.framing, state.generation),
                None => return false,
            }
        };

        let stream = match endpoint.connect() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("Connection to {} failed: {}", endpoint, e);
                if retry_on_failure {
                    self.schedule_retry(generation);
                }
                return false;
            }
        };

        let hook = Arc::new(ClientHook {
            client: Arc::downgrade(self),
            generation,
        });
        let conn = match FramedConnection::new(stream, framing, endpoint.to_string(), hook) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Failed to set up connection to {}: {}", endpoint, e);
                if retry_on_failure {
                    self.schedule_retry(generation);
                }
                return false;
            }
        };

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            state.connection = Some(conn.clone());
            state.retry = None;
        }
        self.backoff.lock().reset();

        tracing::info!("Connected to {}", endpoint);
        conn.start();
        true
    }

    fn schedule_retry(self: &Arc<Self>, generation: u64) {
        let delay = self.backoff.lock().next_delay();
        let weak = Arc::downgrade(self);

        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        tracing::debug!("Retrying connection in {:?}", delay);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.state.lock();
                if state.generation != generation {
                    return;
                }
                state.retry = None;
            }
            inner.attempt(true);
        });
        if let Some(previous) = state.retry.replace(task) {
            previous.abort();
        }
    }

    fn on_closed(self: &Arc<Self>, conn: &Arc<FramedConnection>, generation: u64) {
        let rearm = {
            let mut state = self.state.lock();
            let current = state
                .connection
                .as_ref()
                .map_or(false, |c| Arc::ptr_eq(c, conn));
            if state.generation != generation || !current {
                false
            } else {
                state.connection = None;
                state.auto_connect
            }
        };

        if rearm {
            tracing::info!("Connection to {} lost, reconnecting", conn.peer());
            self.schedule_retry(generation);
        }
    }
}

/// Forwards connection events to the client's handler.
struct ClientHook {
    client: Weak<ClientInner>,
    generation: u64,
}

impl ClientHook {
    fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.client.upgrade().and_then(|c| c.handler.upgrade())
    }
}

impl ConnectionHandler for ClientHook {
    fn connection_established(&self, conn: &Arc<FramedConnection>) {
        if let Some(handler) = self.handler() {
            handler.connection_established(conn);
        }
    }

    fn data_received(&self, conn: &Arc<FramedConnection>, data: Bytes) {
        if let Some(handler) = self.handler() {
            handler.data_received(conn, data);
        }
    }

    fn closed(&self, conn: &Arc<FramedConnection>) {
        if let Some(handler) = self.handler() {
            handler.closed(conn);
        }
        if let Some(client) = self.client.upgrade() {
            client.on_closed(conn, self.generation);
        }
    }
}
