//! Local socket endpoint naming.
//!
//! One endpoint exists per shared segment name. On Linux the endpoint lives in
//! the abstract socket namespace, so no filesystem entry is created.

use crate::error::TransportError;
use std::fmt;
use std::io;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::PathBuf;
use tokio::net::{UnixListener, UnixStream};

/// Longest abstract name (`sun_path` minus the leading NUL).
pub const MAX_ABSTRACT_NAME_LEN: usize = 107;

/// A named local endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Linux abstract namespace name.
    Abstract(String),
    /// Filesystem socket path.
    Path(PathBuf),
}

impl Endpoint {
    /// Endpoint for a logical segment name on this platform.
    pub fn named(name: &str) -> Self {
        if cfg!(target_os = "linux") {
            Endpoint::Abstract(name.to_string())
        } else {
            Endpoint::Path(std::env::temp_dir().join(format!("{}.sock", name)))
        }
    }

    /// Binds a listener on this endpoint.
    ///
    /// A stale socket file left by a previous process is removed first; a
    /// socket file that still accepts connections is left alone and the bind
    /// fails with `AddrInUse`.
    pub fn bind(&self) -> Result<UnixListener, TransportError> {
        let listener = match self {
            Endpoint::Abstract(name) => StdUnixListener::bind_addr(&abstract_addr(name)?)?,
            Endpoint::Path(path) => {
                if path.exists() {
                    if StdUnixStream::connect(path).is_ok() {
                        return Err(io::Error::from(io::ErrorKind::AddrInUse).into());
                    }
                    std::fs::remove_file(path)?;
                }
                StdUnixListener::bind(path)?
            }
        };
        listener.set_nonblocking(true)?;
        Ok(UnixListener::from_std(listener)?)
    }

    /// Connects to this endpoint.
    ///
    /// Local socket connects complete or fail immediately, so this does not
    /// wait on the peer.
    pub fn connect(&self) -> Result<UnixStream, TransportError> {
        let stream = match self {
            Endpoint::Abstract(name) => StdUnixStream::connect_addr(&abstract_addr(name)?)?,
            Endpoint::Path(path) => StdUnixStream::connect(path)?,
        };
        stream.set_nonblocking(true)?;
        Ok(UnixStream::from_std(stream)?)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Abstract(name) => write!(f, "@{}", name),
            Endpoint::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &str) -> Result<std::os::unix::net::SocketAddr, TransportError> {
    use std::os::linux::net::SocketAddrExt;

    if name.len() > MAX_ABSTRACT_NAME_LEN {
        return Err(TransportError::NameTooLong {
            len: name.len(),
            max: MAX_ABSTRACT_NAME_LEN,
        });
    }
    Ok(std::os::unix::net::SocketAddr::from_abstract_name(
        name.as_bytes(),
    )?)
}

#[cfg(not(target_os = "linux"))]
fn abstract_addr(_name: &str) -> Result<std::os::unix::net::SocketAddr, TransportError> {
    Err(TransportError::AbstractUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        format!("propsync-test-{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn test_display() {
        assert_eq!(Endpoint::Abstract("seg".into()).to_string(), "@seg");
        assert_eq!(
            Endpoint::Path(PathBuf::from("/tmp/seg.sock")).to_string(),
            "/tmp/seg.sock"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_name_too_long() {
        let name = "x".repeat(MAX_ABSTRACT_NAME_LEN + 1);
        assert!(matches!(
            abstract_addr(&name),
            Err(TransportError::NameTooLong { .. })
        ));
        assert!(abstract_addr(&"x".repeat(MAX_ABSTRACT_NAME_LEN)).is_ok());
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let endpoint = Endpoint::named(&unique_name());
        assert!(endpoint.connect().is_err());
    }

    #[tokio::test]
    async fn test_bind_and_connect() {
        let endpoint = Endpoint::named(&unique_name());
        let listener = endpoint.bind().unwrap();
        let _client = endpoint.connect().unwrap();
        let (_server, _) = listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_endpoint_is_not_taken_over() {
        let endpoint = Endpoint::named(&unique_name());
        let _first = endpoint.bind().unwrap();
        assert!(endpoint.bind().is_err());

        let path = std::env::temp_dir().join(format!("{}.sock", unique_name()));
        let endpoint = Endpoint::Path(path.clone());
        let _first = endpoint.bind().unwrap();
        match endpoint.bind() {
            Err(TransportError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::AddrInUse),
            other => panic!("unexpected bind result: {:?}", other.map(|_| ())),
        }
        assert!(endpoint.connect().is_ok());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_path_endpoint_replaces_stale_socket() {
        let path = std::env::temp_dir().join(format!("{}.sock", unique_name()));
        let endpoint = Endpoint::Path(path.clone());

        let first = endpoint.bind().unwrap();
        drop(first);
        assert!(path.exists());

        let _second = endpoint.bind().unwrap();
        let _client = endpoint.connect().unwrap();
        std::fs::remove_file(&path).ok();
    }
}
