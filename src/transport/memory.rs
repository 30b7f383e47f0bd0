//! In-process message endpoints
//!
//! A memory endpoint behaves like a message-mode pipe: every `send` is
//! delivered as one message, including empty ones. That makes keepalive
//! writes observable, which byte-stream sockets cannot do.
//!
//! Listeners register under a name in a process-wide registry; clients look
//! the name up in [`MemoryClient::connect`]. Connection requests queue in the
//! listener's backlog until some slot accepts them.

use std::collections::HashMap;
use std::io;
use std::sync::OnceLock;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Messages buffered per direction of a memory connection
pub const MEMORY_CHANNEL_DEPTH: usize = 256;

/// A connection request travelling from client to listener
#[derive(Debug)]
pub(crate) struct MemoryConnection {
    from_client: mpsc::Receiver<Bytes>,
    to_client: mpsc::Sender<Bytes>,
}

type Backlog = mpsc::UnboundedSender<MemoryConnection>;

static REGISTRY: OnceLock<Mutex<HashMap<String, Backlog>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Backlog>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Listening side of a memory endpoint
#[derive(Debug)]
pub struct MemoryListener {
    name: String,
    backlog: Backlog,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
}

impl MemoryListener {
    /// Register a listener under `name`
    ///
    /// Fails with `AddrInUse` while another listener holds the name.
    pub fn bind(name: &str) -> io::Result<Self> {
        let mut endpoints = registry().lock();
        if let Some(existing) = endpoints.get(name) {
            if !existing.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("memory endpoint '{}' is already bound", name),
                ));
            }
        }

        let (backlog, incoming) = mpsc::unbounded_channel();
        endpoints.insert(name.to_string(), backlog.clone());

        Ok(Self {
            name: name.to_string(),
            backlog,
            incoming: tokio::sync::Mutex::new(incoming),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next client
    ///
    /// Several slots may wait concurrently; each request goes to one of them.
    pub(crate) async fn accept(&self) -> io::Result<(MemoryReader, MemoryWriter)> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(conn) => Ok((
                MemoryReader {
                    rx: conn.from_client,
                    rest: Bytes::new(),
                },
                MemoryWriter { tx: conn.to_client },
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory endpoint closed",
            )),
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut endpoints = registry().lock();
        if endpoints
            .get(&self.name)
            .is_some_and(|tx| tx.same_channel(&self.backlog))
        {
            endpoints.remove(&self.name);
        }
    }
}

/// Server-side read half of a memory connection
#[derive(Debug)]
pub struct MemoryReader {
    rx: mpsc::Receiver<Bytes>,
    /// Tail of a message larger than the last read buffer
    rest: Bytes,
}

impl MemoryReader {
    /// Read one message into `buf`; 0 means the client closed or sent an empty message
    pub(crate) async fn read_message(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rest.is_empty() {
            match self.rx.recv().await {
                Some(msg) => self.rest = msg,
                None => return Ok(0),
            }
        }
        let n = self.rest.len().min(buf.len());
        buf[..n].copy_from_slice(&self.rest[..n]);
        self.rest.advance(n);
        Ok(n)
    }
}

/// Server-side write half of a memory connection
#[derive(Debug)]
pub struct MemoryWriter {
    tx: mpsc::Sender<Bytes>,
}

impl MemoryWriter {
    pub(crate) async fn write_message(&mut self, msg: Bytes) -> io::Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory client closed"))
    }
}

/// Client side of a memory endpoint
#[derive(Debug)]
pub struct MemoryClient {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl MemoryClient {
    /// Connect to the listener registered under `name`
    ///
    /// Returns as soon as the request is queued; the server picks it up when
    /// a slot is free.
    pub fn connect(name: &str) -> io::Result<Self> {
        let backlog = registry().lock().get(name).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no memory endpoint named '{}'", name),
            )
        })?;

        let (tx, from_client) = mpsc::channel(MEMORY_CHANNEL_DEPTH);
        let (to_client, rx) = mpsc::channel(MEMORY_CHANNEL_DEPTH);
        backlog
            .send(MemoryConnection {
                from_client,
                to_client,
            })
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("memory endpoint '{}' is closed", name),
                )
            })?;

        Ok(Self { tx, rx })
    }

    /// Send one message to the server
    pub async fn send(&self, msg: impl Into<Bytes>) -> io::Result<()> {
        self.tx
            .send(msg.into())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server side closed"))
    }

    /// Receive the next message; `None` once the server dropped the connection
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Receive a message if one is already queued
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}
