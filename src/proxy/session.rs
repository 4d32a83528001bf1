//! Sessions: a checked-out application worker plus the per-request
//! handshake password, and the framing of the header dispatch to it.

use std::path::PathBuf;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;

/// Object-safe alias for anything the worker side can stream over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type WorkerIo = Box<dyn AsyncStream>;

/// Address of an application worker's request socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl WorkerAddr {
    /// Parses `tcp://host:port`, `unix:/path`, or a bare `host:port`.
    pub fn parse(address: &str) -> anyhow::Result<Self> {
        match url::Url::parse(address) {
            Ok(url) if url.scheme() == "unix" => Ok(WorkerAddr::Unix(PathBuf::from(url.path()))),
            Ok(url) if url.scheme() == "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| anyhow::anyhow!("worker address missing host: {address}"))?;
                let port = url
                    .port()
                    .ok_or_else(|| anyhow::anyhow!("worker address missing port: {address}"))?;
                Ok(WorkerAddr::Tcp(format!("{host}:{port}")))
            }
            Ok(url) => anyhow::bail!("unsupported worker address scheme: {}", url.scheme()),
            // No scheme at all; treat as host:port.
            Err(_) => Ok(WorkerAddr::Tcp(address.to_string())),
        }
    }
}

enum Transport {
    Unconnected {
        addr: WorkerAddr,
        connect_timeout: Duration,
    },
    Ready(WorkerIo),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Unconnected { addr, connect_timeout } => f
                .debug_struct("Unconnected")
                .field("addr", addr)
                .field("connect_timeout", connect_timeout)
                .finish(),
            Transport::Ready(_) => f.debug_tuple("Ready").field(&"<worker io>").finish(),
        }
    }
}

/// A session checked out of the worker pool. `initiate` performs the actual
/// connect; a failure there is retryable by checking out again.
#[derive(Debug)]
pub struct Session {
    pub worker_name: String,
    pub connect_password: String,
    transport: Transport,
}

impl Session {
    pub fn new(
        worker_name: String,
        addr: WorkerAddr,
        connect_password: String,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            worker_name,
            connect_password,
            transport: Transport::Unconnected {
                addr,
                connect_timeout,
            },
        }
    }

    /// Builds a session around an already-connected stream.
    pub fn from_stream(
        worker_name: String,
        stream: WorkerIo,
        connect_password: String,
    ) -> Self {
        Self {
            worker_name,
            connect_password,
            transport: Transport::Ready(stream),
        }
    }

    /// Connects to the worker and yields the stream.
    pub async fn initiate(self) -> std::io::Result<WorkerIo> {
        match self.transport {
            Transport::Ready(stream) => Ok(stream),
            Transport::Unconnected {
                addr,
                connect_timeout,
            } => {
                let connect = async {
                    match &addr {
                        WorkerAddr::Tcp(addr) => TcpStream::connect(addr.as_str())
                            .await
                            .map(|s| Box::new(s) as WorkerIo),
                        WorkerAddr::Unix(path) => UnixStream::connect(path)
                            .await
                            .map(|s| Box::new(s) as WorkerIo),
                    }
                };
                timeout(connect_timeout, connect).await.map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timed out connecting to application worker",
                    )
                })?
            }
        }
    }
}

/// Builds the header frame dispatched to the worker: a 32-bit big-endian
/// length covering the payload only, the null-separated header block, then
/// the connect-password pair as two more null-terminated strings.
pub fn build_dispatch_frame(header_block: &[u8], connect_password: &str) -> Bytes {
    const PASSWORD_KEY: &[u8] = b"PASSENGER_CONNECT_PASSWORD\0";

    let payload_len = header_block.len() + PASSWORD_KEY.len() + connect_password.len() + 1;
    let mut frame = BytesMut::with_capacity(4 + payload_len);
    frame.put_u32(payload_len as u32);
    frame.put_slice(header_block);
    frame.put_slice(PASSWORD_KEY);
    frame.put_slice(connect_password.as_bytes());
    frame.put_u8(0);
    frame.freeze()
}
