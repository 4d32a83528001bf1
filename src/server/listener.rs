//! The request socket: TCP or Unix, plus the accepted-connection stream
//! type the rest of the server is generic over.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// Address the request socket listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddr {
    /// Parses `host:port`, `tcp://host:port`, or `unix:/path`.
    pub fn parse(address: &str) -> anyhow::Result<Self> {
        match url::Url::parse(address) {
            Ok(url) if url.scheme() == "unix" => Ok(ListenAddr::Unix(PathBuf::from(url.path()))),
            Ok(url) if url.scheme() == "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| anyhow::anyhow!("listen address missing host: {address}"))?;
                let port = url
                    .port()
                    .ok_or_else(|| anyhow::anyhow!("listen address missing port: {address}"))?;
                Ok(ListenAddr::Tcp(format!("{host}:{port}")))
            }
            Ok(url) => anyhow::bail!("unsupported listen address scheme: {}", url.scheme()),
            Err(_) => Ok(ListenAddr::Tcp(address.to_string())),
        }
    }
}

/// Pre-bound listening socket for client connections.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub async fn bind(addr: &ListenAddr) -> anyhow::Result<Self> {
        match addr {
            ListenAddr::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str()).await?)),
            ListenAddr::Unix(path) => {
                // A previous run may have left the socket file behind.
                let _ = std::fs::remove_file(path);
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
        }
    }

    /// Accepts one connection, returning the stream and its fd number, the
    /// stable identity used for logging and the client table.
    pub async fn accept(&self) -> std::io::Result<(Socket, i32)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                let fd = stream.as_raw_fd();
                Ok((Socket::Tcp(stream), fd))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let fd = stream.as_raw_fd();
                Ok((Socket::Unix(stream), fd))
            }
        }
    }

    /// Non-awaiting accept used to drain a readiness burst; `Pending`
    /// means the backlog is empty for now.
    pub fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<std::io::Result<(Socket, i32)>> {
        match self {
            Listener::Tcp(listener) => listener.poll_accept(cx).map_ok(|(stream, _)| {
                let fd = stream.as_raw_fd();
                (Socket::Tcp(stream), fd)
            }),
            Listener::Unix(listener) => listener.poll_accept(cx).map_ok(|(stream, _)| {
                let fd = stream.as_raw_fd();
                (Socket::Unix(stream), fd)
            }),
        }
    }
}

/// An accepted client connection.
pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Socket::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Socket::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Socket::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Socket::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
