//! Byte-stream transports carrying framed JSON-RPC messages.
//!
//! A connection is a pair of boxed halves ([`TransportStreams`]) obtained from
//! one of:
//!
//! - the stdio pipes of a spawned agent process (see [`crate::process`]),
//! - a TCP socket ([`connect_tcp`]),
//! - a local socket: Unix domain socket or Windows named pipe
//!   ([`connect_local_socket`]), via the `interprocess` crate,
//! - any caller-supplied `AsyncRead`/`AsyncWrite` pair.
//!
//! Submodules:
//! - `codec`: NDJSON and `Content-Length` framing.
//! - `writer`: the single outbound writer task.

pub mod codec;
pub mod writer;

use interprocess::local_socket::tokio::{prelude::*, Stream as LocalStream};
use interprocess::local_socket::{GenericFilePath, GenericNamespaced};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{Result, RpcError};

pub use codec::{Frame, FrameCodec, Framing, MAX_FRAME_BYTES};
pub use writer::FrameWriter;

/// Boxed inbound half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed outbound half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read and write halves of one connection.
pub struct TransportStreams {
    /// Inbound half (agent → client).
    pub reader: BoxedReader,
    /// Outbound half (client → agent).
    pub writer: BoxedWriter,
}

impl TransportStreams {
    /// Box an arbitrary reader/writer pair.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl std::fmt::Debug for TransportStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStreams").finish_non_exhaustive()
    }
}

/// Connect to a TCP JSON-RPC server.
///
/// # Errors
///
/// Returns [`RpcError::Transport`] if the connection is refused or fails.
pub async fn connect_tcp(host: &str, port: u16) -> Result<TransportStreams> {
    let stream = TcpStream::connect((host, port)).await.map_err(|err| {
        RpcError::Transport(format!("failed to connect to {host}:{port}: {err}"))
    })?;
    stream.set_nodelay(true).ok();
    debug!(host, port, "tcp transport connected");

    let (reader, writer) = stream.into_split();
    Ok(TransportStreams::new(reader, writer))
}

/// Connect to a local socket server.
///
/// Names containing a path separator are treated as file-system paths (Unix
/// domain socket); anything else is a namespaced name (abstract socket on
/// Linux, named pipe on Windows).
///
/// # Errors
///
/// Returns [`RpcError::Transport`] if the name is invalid or the connection
/// fails.
pub async fn connect_local_socket(name: &str) -> Result<TransportStreams> {
    let socket_name = if name.contains('/') || name.contains('\\') {
        name.to_fs_name::<GenericFilePath>()
    } else {
        name.to_ns_name::<GenericNamespaced>()
    }
    .map_err(|err| RpcError::Transport(format!("invalid local socket name '{name}': {err}")))?;

    let stream = LocalStream::connect(socket_name).await.map_err(|err| {
        RpcError::Transport(format!("failed to connect to local socket '{name}': {err}"))
    })?;
    debug!(name, "local socket transport connected");

    let (reader, writer) = stream.split();
    Ok(TransportStreams::new(reader, writer))
}
