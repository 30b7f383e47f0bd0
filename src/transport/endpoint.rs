//! Endpoint naming, binding and accepted connections

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp, TcpListener};

use super::memory::{MemoryListener, MemoryReader, MemoryWriter};
use crate::error::{BroadcastError, Result};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Where a server listens
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Unix domain socket path
    Local(PathBuf),
    /// TCP `host:port`
    Tcp(String),
    /// In-process memory endpoint name
    Memory(String),
}

impl FromStr for Endpoint {
    type Err = BroadcastError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || BroadcastError::InvalidEndpoint {
            endpoint: s.to_string(),
        };

        if let Some(addr) = s.strip_prefix("tcp://").or_else(|| s.strip_prefix("tcp:")) {
            // host:port with a numeric port
            let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(invalid());
            }
            return Ok(Self::Tcp(addr.to_string()));
        }
        if let Some(name) = s.strip_prefix("memory:") {
            if name.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Memory(name.to_string()));
        }
        if s.is_empty() {
            return Err(invalid());
        }
        Ok(Self::Local(PathBuf::from(s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Memory(name) => write!(f, "memory:{}", name),
        }
    }
}

/// A bound endpoint accepting clients
#[derive(Debug)]
pub enum Listener {
    #[cfg(unix)]
    Local(LocalListener),
    Tcp(TcpListener),
    Memory(MemoryListener),
}

impl Listener {
    /// Bind `endpoint`
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let bind_err = |source: io::Error| BroadcastError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        match endpoint {
            #[cfg(unix)]
            Endpoint::Local(path) => LocalListener::bind(path.clone())
                .map(Listener::Local)
                .map_err(bind_err),
            #[cfg(not(unix))]
            Endpoint::Local(_) => Err(bind_err(io::Error::new(
                io::ErrorKind::Unsupported,
                "local socket endpoints need a unix platform",
            ))),
            Endpoint::Tcp(addr) => TcpListener::bind(addr.as_str())
                .await
                .map(Listener::Tcp)
                .map_err(bind_err),
            Endpoint::Memory(name) => MemoryListener::bind(name)
                .map(Listener::Memory)
                .map_err(bind_err),
        }
    }

    /// The endpoint actually bound (resolves TCP port 0)
    pub fn local_endpoint(&self) -> Endpoint {
        match self {
            #[cfg(unix)]
            Listener::Local(l) => Endpoint::Local(l.path.clone()),
            Listener::Tcp(l) => match l.local_addr() {
                Ok(addr) => Endpoint::Tcp(addr.to_string()),
                Err(_) => Endpoint::Tcp("unknown:0".to_string()),
            },
            Listener::Memory(l) => Endpoint::Memory(l.name().to_string()),
        }
    }

    /// Wait for the next client and split its connection
    pub async fn accept(&self) -> io::Result<Connection> {
        let id = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        match self {
            #[cfg(unix)]
            Listener::Local(l) => {
                let (stream, _) = l.inner.accept().await?;
                let (read, write) = stream.into_split();
                Ok(Connection {
                    reader: PeerReader::Local(read),
                    writer: PeerWriter::Local(write),
                    peer: format!("local#{}", id),
                })
            }
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                let _ = stream.set_nodelay(true);
                let (read, write) = stream.into_split();
                Ok(Connection {
                    reader: PeerReader::Tcp(read),
                    writer: PeerWriter::Tcp(write),
                    peer: format!("tcp#{}@{}", id, addr),
                })
            }
            Listener::Memory(l) => {
                let (read, write) = l.accept().await?;
                Ok(Connection {
                    reader: PeerReader::Memory(read),
                    writer: PeerWriter::Memory(write),
                    peer: format!("memory#{}", id),
                })
            }
        }
    }
}

/// Unix socket listener that removes its socket file when dropped
#[cfg(unix)]
#[derive(Debug)]
pub struct LocalListener {
    inner: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl LocalListener {
    fn bind(path: PathBuf) -> io::Result<Self> {
        use std::os::unix::fs::FileTypeExt;

        // A socket file left behind by a previous run blocks the bind
        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if meta.file_type().is_socket() {
                std::fs::remove_file(&path)?;
            }
        }
        let inner = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { inner, path })
    }
}

#[cfg(unix)]
impl Drop for LocalListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

/// An accepted client, split into halves
#[derive(Debug)]
pub struct Connection {
    pub reader: PeerReader,
    pub writer: PeerWriter,
    /// Label used in logs and status snapshots
    pub peer: String,
}

/// Read half of a client connection
#[derive(Debug)]
pub enum PeerReader {
    #[cfg(unix)]
    Local(tokio::net::unix::OwnedReadHalf),
    Tcp(tcp::OwnedReadHalf),
    Memory(MemoryReader),
}

impl PeerReader {
    /// Read one message; `Ok(0)` means the peer is gone
    pub async fn read_message(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PeerReader::Local(r) => r.read(buf).await,
            PeerReader::Tcp(r) => r.read(buf).await,
            PeerReader::Memory(r) => r.read_message(buf).await,
        }
    }
}

/// Write half of a client connection
#[derive(Debug)]
pub enum PeerWriter {
    #[cfg(unix)]
    Local(tokio::net::unix::OwnedWriteHalf),
    Tcp(tcp::OwnedWriteHalf),
    Memory(MemoryWriter),
}

impl PeerWriter {
    /// Write one message
    ///
    /// Empty messages reach memory clients as empty messages; on sockets they
    /// write nothing.
    pub async fn write_message(&mut self, msg: Bytes) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PeerWriter::Local(w) => w.write_all(&msg).await,
            PeerWriter::Tcp(w) => w.write_all(&msg).await,
            PeerWriter::Memory(w) => w.write_message(msg).await,
        }
    }

    /// Shut down the write direction
    pub async fn close(self) {
        match self {
            #[cfg(unix)]
            PeerWriter::Local(mut w) => {
                let _ = w.shutdown().await;
            }
            PeerWriter::Tcp(mut w) => {
                let _ = w.shutdown().await;
            }
            PeerWriter::Memory(w) => drop(w),
        }
    }
}
