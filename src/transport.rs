//! Transport establishment: the external collaborator that supplies the
//! connection's byte stream.
// (c) 2024 Ross Younger
//!
//! This crate does not perform authentication or encryption: security is
//! delegated entirely to filesystem permissions on the socket, exactly as the
//! underlying protocol's security model intends.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;

use crate::error::Result;

/// The default path charon listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/charon.vici";

/// Marker trait for the stream type a [`crate::connection::Connection`] is built
/// over. Anything satisfying `AsyncRead + AsyncWrite + Send + Unpin` qualifies;
/// this indirection lets tests and non-UNIX transports substitute an in-memory
/// pipe for a real socket.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

/// How to reach the charon daemon.
#[derive(Debug, Clone)]
pub enum Address {
    /// Connect to a UNIX domain socket at the given path.
    Unix(PathBuf),
}

impl Default for Address {
    fn default() -> Self {
        Address::Unix(PathBuf::from(DEFAULT_SOCKET_PATH))
    }
}

impl Address {
    /// A UNIX socket at the default path.
    pub fn default_unix() -> Self {
        Self::default()
    }

    /// A UNIX socket at an explicit path.
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Address::Unix(path.as_ref().to_path_buf())
    }
}

/// Opens the transport described by `address`.
///
/// Dialing is the one piece of I/O this crate performs outside of
/// [`crate::connection::Connection`] itself; everything past this point is
/// generic over [`Stream`].
pub async fn dial(address: &Address) -> Result<UnixStream> {
    match address {
        Address::Unix(path) => Ok(UnixStream::connect(path).await?),
    }
}
