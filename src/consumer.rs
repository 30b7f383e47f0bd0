//! Downstream consumers
//!
//! Every message a server reads is forwarded to the consumers linked to it,
//! tagged with the server's identity. Delivery is fire-and-forget: a consumer
//! must return after at most a bounded local append, and nothing flows back.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

/// Identity of a broadcast server, used as the origin of forwarded messages
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId {
    name: Arc<str>,
    uid: uuid::Uuid,
}

impl ServerId {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            uid: uuid::Uuid::new_v4(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> uuid::Uuid {
        self.uid
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A downstream fan-out target
pub trait Consumer: Send + Sync {
    /// Accept one message; must not block
    fn forward(&self, payload: &Bytes, origin: &ServerId);
}

impl<F> Consumer for F
where
    F: Fn(&Bytes, &ServerId) + Send + Sync,
{
    fn forward(&self, payload: &Bytes, origin: &ServerId) {
        self(payload, origin)
    }
}

/// The consumers linked to one server
///
/// Cloning shares the same set, so consumers linked after the server started
/// are seen by its loop.
#[derive(Clone, Default)]
pub struct ConsumerSet {
    consumers: Arc<RwLock<Vec<Arc<dyn Consumer>>>>,
}

impl ConsumerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer
    pub fn link(&self, consumer: Arc<dyn Consumer>) {
        self.consumers.write().push(consumer);
    }

    pub fn len(&self) -> usize {
        self.consumers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.read().is_empty()
    }

    /// Deliver to every consumer in link order
    pub fn forward(&self, payload: &Bytes, origin: &ServerId) {
        for consumer in self.consumers.read().iter() {
            consumer.forward(payload, origin);
        }
    }
}

impl fmt::Debug for ConsumerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSet")
            .field("len", &self.len())
            .finish()
    }
}

/// A message as delivered to a [`ChannelConsumer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarded {
    pub payload: Bytes,
    pub origin: ServerId,
}

/// Consumer that appends to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<Forwarded>,
}

impl ChannelConsumer {
    /// Create the consumer and the receiver it feeds
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Forwarded>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Consumer for ChannelConsumer {
    fn forward(&self, payload: &Bytes, origin: &ServerId) {
        // Receiver gone means nobody is listening anymore
        let _ = self.tx.send(Forwarded {
            payload: payload.clone(),
            origin: origin.clone(),
        });
    }
}

/// Consumer that writes each message as one line to a writer (e.g. stdout)
pub struct WriterConsumer<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> WriterConsumer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl WriterConsumer<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> Consumer for WriterConsumer<W> {
    fn forward(&self, payload: &Bytes, origin: &ServerId) {
        let mut out = self.out.lock();
        // Ignore write errors (reader may have closed)
        let _ = writeln!(out, "{}: {}", origin, String::from_utf8_lossy(payload));
        let _ = out.flush();
    }
}
