//! Framed connection over a Unix stream socket.
//!
//! A connection owns one socket and one [`FrameDecoder`]. A reader task
//! reassembles messages and hands them to the [`ConnectionHandler`]; sends are
//! single non-blocking attempts that never wait on the peer.

use crate::error::TransportError;
use bytes::Bytes;
use parking_lot::Mutex;
use propsync_protocol::{FrameDecoder, Framing};
use std::fmt;
use std::io::{self, IoSlice, Write};
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UnixStream;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Upper bound on a single socket read.
const MAX_READ_CHUNK: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Callbacks from a connection to the protocol layer above it.
///
/// Callbacks never run while the connection holds one of its own locks, so a
/// handler may call back into the connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once, before the reader task starts.
    fn connection_established(&self, _conn: &Arc<FramedConnection>) {}

    /// Called for every reassembled message, in arrival order.
    fn data_received(&self, conn: &Arc<FramedConnection>, data: Bytes);

    /// Called once when the connection closes.
    fn closed(&self, _conn: &Arc<FramedConnection>) {}
}

/// A message-oriented connection.
pub struct FramedConnection {
    id: ConnectionId,
    peer: String,
    stream: UnixStream,
    /// Duplicate of the socket for direct writes and synchronous shutdown.
    socket: StdUnixStream,
    decoder: Mutex<FrameDecoder>,
    write_lock: Mutex<()>,
    handler: Mutex<Option<Arc<dyn ConnectionHandler>>>,
    connected: AtomicBool,
}

impl FramedConnection {
    /// Wraps a connected socket. Call [`start`](Self::start) to begin reading.
    pub fn new(
        stream: UnixStream,
        framing: Framing,
        peer: impl Into<String>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> io::Result<Arc<Self>> {
        let socket = StdUnixStream::from(stream.as_fd().try_clone_to_owned()?);
        Ok(Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            stream,
            socket,
            decoder: Mutex::new(FrameDecoder::new(framing)),
            write_lock: Mutex::new(()),
            handler: Mutex::new(Some(handler)),
            connected: AtomicBool::new(true),
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn framing(&self) -> Framing {
        self.decoder.lock().framing()
    }

    /// Changes framing. Any partially received message is dropped.
    pub fn set_framing(&self, framing: Framing) {
        self.decoder.lock().set_framing(framing);
    }

    /// Notifies the handler and spawns the reader task.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        if let Some(handler) = self.current_handler() {
            handler.connection_established(self);
        }
        let conn = self.clone();
        tokio::spawn(async move { conn.read_loop().await })
    }

    /// Sends one message made of `primary` followed by `secondary`.
    ///
    /// Returns false without retrying if the connection is down, the framing
    /// rejects the size, or the socket does not take the whole message at once.
    /// The cause is logged.
    pub fn send(&self, primary: &[u8], secondary: Option<&[u8]>) -> bool {
        match self.try_send(primary, secondary) {
            Ok(()) => true,
            Err(TransportError::NotConnected) => {
                tracing::debug!("Send on closed {}", self);
                false
            }
            Err(e) => {
                tracing::warn!("Send failed on {}: {}", self, e);
                false
            }
        }
    }

    /// Like [`send`](Self::send), returning why the message was not sent.
    ///
    /// The write goes straight to the socket, so a message sent right after
    /// the connection is set up is not held back by reactor readiness.
    pub fn try_send(&self, primary: &[u8], secondary: Option<&[u8]>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let secondary = secondary.unwrap_or(&[]);
        let total = primary.len() + secondary.len();
        let header = self.framing().prepare_send(total)?;

        let header = header.as_ref().map_or(&[][..], |h| &h[..]);
        let slices = [
            IoSlice::new(header),
            IoSlice::new(primary),
            IoSlice::new(secondary),
        ];
        let expected = header.len() + total;

        let guard = self.write_lock.lock();
        let written = loop {
            match (&self.socket).write_vectored(&slices) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match written {
            Ok(n) if n == expected => Ok(()),
            Ok(0) => Err(TransportError::ShortWrite {
                written: 0,
                expected,
            }),
            Ok(n) => {
                // The peer now holds a truncated frame it cannot resynchronize from.
                drop(guard);
                self.shutdown();
                Err(TransportError::ShortWrite {
                    written: n,
                    expected,
                })
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Shuts the socket down without draining output. Idempotent.
    pub fn shutdown(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::debug!("Shutting down {}", self);
            if let Err(e) = self.socket.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    tracing::debug!("Shutdown of {} failed: {}", self, e);
                }
            }
        }
    }

    /// Closes the connection: notifies the handler, shuts the socket down and
    /// releases buffers. Idempotent.
    ///
    /// With `flush` set, a send in progress on another thread completes first.
    pub fn close(self: &Arc<Self>, flush: bool) {
        let Some(handler) = self.handler.lock().take() else {
            return;
        };

        if flush {
            drop(self.write_lock.lock());
        }

        tracing::debug!("Closing {}", self);
        handler.closed(self);
        self.shutdown();
        self.decoder.lock().clear();
    }

    fn current_handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.handler.lock().clone()
    }

    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; self.framing().packet_size.min(MAX_READ_CHUNK)];

        loop {
            if let Err(e) = self.stream.readable().await {
                tracing::debug!("Readiness error on {}: {}", self, e);
                break;
            }

            let wanted = self.decoder.lock().wanted().min(MAX_READ_CHUNK);
            if buf.len() < wanted {
                buf.resize(wanted, 0);
            }

            match self.stream.try_read(&mut buf[..wanted]) {
                Ok(0) => {
                    tracing::debug!("Peer closed {}", self);
                    break;
                }
                Ok(n) => {
                    let result = self.decoder.lock().on_received(&buf[..n]);
                    match result {
                        Ok(Some(message)) => match self.current_handler() {
                            Some(handler) => handler.data_received(&self, message),
                            None => break,
                        },
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("Protocol violation on {}: {}", self, e);
                            self.shutdown();
                            break;
                        }
                    }
                }
                Err(e) => {
                    if !self.read_failed(&e) {
                        break;
                    }
                }
            }
        }

        self.close(false);
    }

    /// Handles a failed read. Returns whether to keep reading.
    ///
    /// A reset drops the partial message; the socket then reports end of
    /// stream if the peer is really gone.
    fn read_failed(&self, e: &io::Error) -> bool {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => true,
            io::ErrorKind::ConnectionReset => {
                tracing::debug!("Connection reset on {}, dropping partial message", self);
                self.decoder.lock().discard_partial();
                true
            }
            _ => {
                tracing::warn!("Receive failed on {}: {}", self, e);
                self.shutdown();
                false
            }
        }
    }
}

impl fmt::Display for FramedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection #{} ({})", self.id, self.peer)
    }
}

impl fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .field("framing", &self.framing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propsync_protocol::{encode_header, HEADER_SIZE};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    enum Event {
        Established,
        Data(Bytes),
        Closed,
    }

    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
    }

    impl ConnectionHandler for Recorder {
        fn connection_established(&self, _conn: &Arc<FramedConnection>) {
            let _ = self.events.send(Event::Established);
        }

        fn data_received(&self, _conn: &Arc<FramedConnection>, data: Bytes) {
            let _ = self.events.send(Event::Data(data));
        }

        fn closed(&self, _conn: &Arc<FramedConnection>) {
            let _ = self.events.send(Event::Closed);
        }
    }

    fn framed(
        stream: UnixStream,
        framing: Framing,
    ) -> (Arc<FramedConnection>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = FramedConnection::new(stream, framing, "test", Arc::new(Recorder { events: tx }))
            .unwrap();
        (conn, rx)
    }

    async fn next_data(rx: &mut mpsc::UnboundedReceiver<Event>) -> Option<Bytes> {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(Event::Data(data))) => return Some(data),
                Ok(Some(Event::Established)) => continue,
                _ => return None,
            }
        }
    }

    async fn wait_closed(rx: &mut mpsc::UnboundedReceiver<Event>) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(Event::Closed)) => return true,
                Ok(Some(_)) => continue,
                _ => return false,
            }
        }
    }

    #[tokio::test]
    async fn test_controlled_send_receive() {
        let (a, b) = UnixStream::pair().unwrap();
        let (sender, _) = framed(a, Framing::default());
        let (receiver, mut rx) = framed(b, Framing::default());
        receiver.start();

        for n in [1usize, 16, 17, 1000] {
            let payload = vec![n as u8; n];
            assert!(sender.send(&payload, None));
            assert_eq!(next_data(&mut rx).await.unwrap().as_ref(), payload.as_slice());
        }
    }

    #[tokio::test]
    async fn test_two_segment_send_is_one_message() {
        let (a, b) = UnixStream::pair().unwrap();
        let (sender, _) = framed(a, Framing::default());
        let (receiver, mut rx) = framed(b, Framing::default());
        receiver.start();

        assert!(sender.send(b"head", Some(b"-and-tail")));
        assert_eq!(next_data(&mut rx).await.unwrap().as_ref(), b"head-and-tail");
    }

    #[tokio::test]
    async fn test_fixed_mismatch_writes_nothing() {
        let (a, b) = UnixStream::pair().unwrap();
        let (sender, _) = framed(a, Framing::fixed(8));
        let (receiver, mut rx) = framed(b, Framing::fixed(8));
        receiver.start();

        assert!(!sender.send(b"short", None));
        assert!(sender.send(b"exactly8", None));
        // The first message received is the valid one, so nothing leaked.
        assert_eq!(next_data(&mut rx).await.unwrap().as_ref(), b"exactly8");
    }

    #[tokio::test]
    async fn test_bad_magic_shuts_connection_down() {
        let (mut raw, b) = UnixStream::pair().unwrap();
        let (receiver, mut rx) = framed(b, Framing::default());
        receiver.start();

        let mut header = encode_header(4);
        header[0] ^= 0xFF;
        raw.write_all(&header).await.unwrap();

        assert!(wait_closed(&mut rx).await);
        assert!(!receiver.is_connected());
    }

    #[tokio::test]
    async fn test_header_split_across_writes() {
        let (mut raw, b) = UnixStream::pair().unwrap();
        let (receiver, mut rx) = framed(b, Framing::default());
        receiver.start();

        let header = encode_header(3);
        raw.write_all(&header[..HEADER_SIZE / 2]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        raw.write_all(&header[HEADER_SIZE / 2..]).await.unwrap();
        raw.write_all(b"abc").await.unwrap();

        assert_eq!(next_data(&mut rx).await.unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn test_peer_close_fires_closed_once() {
        let (a, b) = UnixStream::pair().unwrap();
        let (receiver, mut rx) = framed(b, Framing::default());
        receiver.start();
        drop(a);

        assert!(wait_closed(&mut rx).await);
        receiver.close(true);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .map_or(true, |e| e.is_none())
        );
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (a, _b) = UnixStream::pair().unwrap();
        let (conn, _) = framed(a, Framing::default());
        assert!(conn.send(b"x", None));
        conn.shutdown();
        conn.shutdown();
        assert!(!conn.is_connected());
        assert!(!conn.send(b"x", None));
    }

    fn frame(payload: &[u8], declared: usize) -> Vec<u8> {
        let mut frame = encode_header(declared).to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn test_reset_drops_partial_message() {
        let (mut raw, b) = UnixStream::pair().unwrap();
        let (receiver, mut rx) = framed(b, Framing::default());
        receiver.start();

        raw.write_all(&frame(b"half", 8)).await.unwrap();
        let mut partial = false;
        for _ in 0..100 {
            partial = receiver.decoder.lock().has_partial();
            if partial {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(partial);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(receiver.read_failed(&reset));
        assert!(!receiver.decoder.lock().has_partial());
        assert!(receiver.is_connected());

        // The next header starts a fresh message.
        raw.write_all(&frame(b"new", 3)).await.unwrap();
        assert_eq!(next_data(&mut rx).await.unwrap().as_ref(), b"new");
    }

    #[tokio::test]
    async fn test_other_read_errors_shut_down() {
        let (a, _b) = UnixStream::pair().unwrap();
        let (conn, _) = framed(a, Framing::default());

        assert!(conn.read_failed(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(conn.is_connected());
        assert!(!conn.read_failed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_peer_reset_never_delivers_truncated_frame() {
        let (mut raw, b) = UnixStream::pair().unwrap();
        let (receiver, mut rx) = framed(b, Framing::default());
        receiver.start();

        // Left unread, so closing the peer resets the connection.
        assert!(receiver.send(b"unread", None));
        raw.write_all(&frame(b"half", 8)).await.unwrap();
        drop(raw);

        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(Event::Established)) => continue,
                Ok(Some(Event::Closed)) => break,
                Ok(Some(Event::Data(data))) => panic!("unexpected message {:?}", data),
                _ => panic!("connection did not close"),
            }
        }
        assert!(!receiver.is_connected());
    }

    #[tokio::test]
    async fn test_try_send_reports_cause() {
        let (a, _b) = UnixStream::pair().unwrap();
        let (conn, _) = framed(a, Framing::fixed(8));

        assert!(matches!(
            conn.try_send(b"short", None),
            Err(TransportError::Protocol(_))
        ));
        assert!(conn.try_send(b"exa", Some(b"ctly8")).is_ok());
        conn.shutdown();
        assert!(matches!(
            conn.try_send(b"exactly8", None),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_short_write_shuts_connection_down() {
        let (a, _idle) = UnixStream::pair().unwrap();
        let (conn, _) = framed(a, Framing::default());

        // Far beyond the socket buffer of a peer that never reads.
        let payload = vec![7u8; 8 * 1024 * 1024];
        match conn.try_send(&payload, None) {
            Err(TransportError::ShortWrite { written, expected }) => {
                assert!(written > 0);
                assert_eq!(expected, HEADER_SIZE + payload.len());
            }
            other => panic!("expected a short write, got {:?}", other),
        }
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_send_right_after_connect() {
        let path = tempfile::tempdir().unwrap();
        let socket = path.path().join("fresh.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let stream = UnixStream::connect(&socket).await.unwrap();
        let (sender, _) = framed(stream, Framing::default());
        assert!(sender.send(b"first", None));

        let (accepted, _) = listener.accept().await.unwrap();
        let (receiver, mut rx) = framed(accepted, Framing::default());
        receiver.start();
        assert_eq!(next_data(&mut rx).await.unwrap().as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_unframed_delivers_available_bytes() {
        let (a, b) = UnixStream::pair().unwrap();
        let (sender, _) = framed(a, Framing::unframed(64));
        let (receiver, mut rx) = framed(b, Framing::unframed(64));
        receiver.start();

        assert!(sender.send(b"raw bytes", None));
        assert_eq!(next_data(&mut rx).await.unwrap().as_ref(), b"raw bytes");
    }
}
