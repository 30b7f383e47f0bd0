//! Connection slots
//!
//! A slot is one unit of client capacity. Slots are created once when the
//! loop starts and recycled across disconnect/reconnect; the read buffer is
//! allocated once and lent to each pending read.
//!
//! # States
//!
//! ```text
//!              accept ok                 read n > 0
//! Connecting ────────────► Reading ─────────────────► Writing
//!     ▲                      │  ▲                        │
//!     │   read err / n == 0  │  └──── arm next read ─────┘
//!     └──────────────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;

use super::multiplexer::{Completion, Ready};
use crate::transport::{Connection, PeerReader, PeerWriter};

/// Index of a slot in the server's slot arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SlotId(pub usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Where a slot is in its connection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Waiting for a client
    Connecting,
    /// Attached to a client, read armed
    Reading,
    /// Holding a message that is being delivered
    Writing,
}

/// Point-in-time view of a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub slot: SlotId,
    pub state: SlotState,
    pub pending: bool,
    pub peer: Option<String>,
    pub messages_read: u64,
}

impl SlotStatus {
    pub fn is_connected(&self) -> bool {
        self.state != SlotState::Connecting
    }
}

/// Limits applied to the outbound side of each attached client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriterLimits {
    pub queue_depth: usize,
    pub stall_timeout: Duration,
}

/// Outbound side of an attached slot
///
/// Writes are appended to a bounded queue drained by a task that owns the
/// peer's write half, so the loop never waits on a slow client. While a queue
/// is full the loop takes no new work (see [`WriterRoom`]); a peer that leaves
/// one write unfinished for `stall_timeout` is cut off instead.
///
/// Dropping the writer closes the queue. The task then has `stall_timeout` to
/// flush what is queued before the connection is dropped regardless.
#[derive(Debug)]
pub(crate) struct SlotWriter {
    tx: mpsc::Sender<Bytes>,
    _detached: oneshot::Sender<()>,
}

impl SlotWriter {
    fn spawn(writer: PeerWriter, limits: WriterLimits, peer: String) -> Self {
        let (tx, rx) = mpsc::channel(limits.queue_depth);
        let (detached, on_detach) = oneshot::channel();
        tokio::spawn(run_writer(writer, rx, on_detach, limits.stall_timeout, peer));
        Self {
            tx,
            _detached: detached,
        }
    }

    /// Queue a message; false if it was dropped
    fn offer(&self, msg: Bytes) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("[SLOT] Write queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue full while the peer is still being written to
    fn is_congested(&self) -> bool {
        !self.tx.is_closed() && self.tx.capacity() == 0
    }
}

/// Wakes the loop once a congested writer has room again or its peer is gone
#[derive(Debug)]
pub(crate) struct WriterRoom(mpsc::Sender<Bytes>);

impl WriterRoom {
    pub async fn available(self) {
        // Only the wakeup matters; the permit is released immediately
        let _ = self.0.reserve_owned().await;
    }
}

async fn run_writer(
    writer: PeerWriter,
    rx: mpsc::Receiver<Bytes>,
    on_detach: oneshot::Receiver<()>,
    stall_timeout: Duration,
    peer: String,
) {
    let drain = drain_writes(writer, rx, stall_timeout, peer.clone());
    tokio::pin!(drain);

    tokio::select! {
        _ = &mut drain => {}
        _ = on_detach => {
            if tokio::time::timeout(stall_timeout, &mut drain).await.is_err() {
                tracing::debug!("[SLOT] Flush to {} timed out, dropping connection", peer);
            }
        }
    }
}

async fn drain_writes(
    mut writer: PeerWriter,
    mut rx: mpsc::Receiver<Bytes>,
    stall_timeout: Duration,
    peer: String,
) {
    while let Some(msg) = rx.recv().await {
        match tokio::time::timeout(stall_timeout, writer.write_message(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // The read side notices the broken peer and recycles the slot
                tracing::debug!("[SLOT] Write to {} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                tracing::warn!(
                    "[SLOT] {} took no data for {:?}, closing its output",
                    peer,
                    stall_timeout
                );
                return;
            }
        }
    }
    writer.close().await;
}

/// One client connection's state and buffers
#[derive(Debug)]
pub struct ConnectionSlot {
    id: SlotId,
    state: SlotState,
    /// True while a connect or read for this slot is registered with the multiplexer
    pending: bool,
    read_buf: Vec<u8>,
    bytes_read: usize,
    /// Read half of the attached peer, absent while lent to a pending read
    reader: Option<PeerReader>,
    writer: Option<SlotWriter>,
    peer: Option<String>,
    messages_read: u64,
}

impl ConnectionSlot {
    pub fn new(id: SlotId, buffer_size: usize) -> Self {
        Self {
            id,
            state: SlotState::Connecting,
            pending: false,
            read_buf: vec![0; buffer_size],
            bytes_read: 0,
            reader: None,
            writer: None,
            peer: None,
            messages_read: 0,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Attached to a live peer
    pub fn is_connected(&self) -> bool {
        self.state != SlotState::Connecting
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// The message held in the Writing state
    pub fn message(&self) -> &[u8] {
        &self.read_buf[..self.bytes_read]
    }

    pub fn buffer_capacity(&self) -> usize {
        self.read_buf.len().max(self.read_buf.capacity())
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus {
            slot: self.id,
            state: self.state,
            pending: self.pending,
            peer: self.peer.clone(),
            messages_read: self.messages_read,
        }
    }

    pub(crate) fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    pub(crate) fn mark_connecting(&mut self) {
        self.state = SlotState::Connecting;
    }

    /// Take ownership of a freshly accepted client
    pub(crate) fn attach(&mut self, conn: Connection, limits: WriterLimits) {
        tracing::info!("[SLOT] {} attached to {}", self.id, conn.peer);
        self.writer = Some(SlotWriter::spawn(conn.writer, limits, conn.peer.clone()));
        self.reader = Some(conn.reader);
        self.peer = Some(conn.peer);
        self.bytes_read = 0;
        self.state = SlotState::Reading;
    }

    /// Drop the peer, keeping the buffer for the next client
    ///
    /// Dropping the writer closes its queue; the writer task flushes what is
    /// queued, bounded by the stall timeout, and then shuts the connection down.
    pub(crate) fn detach(&mut self) {
        if let Some(peer) = self.peer.take() {
            tracing::info!("[SLOT] {} detached from {}", self.id, peer);
        }
        self.reader = None;
        self.writer = None;
        self.bytes_read = 0;
        self.state = SlotState::Connecting;
    }

    /// Record a completed read; the slot now holds a message to deliver
    pub(crate) fn hold_message(&mut self, n: usize) {
        self.bytes_read = n.min(self.read_buf.len());
        self.messages_read += 1;
        self.state = SlotState::Writing;
    }

    pub(crate) fn clear_message(&mut self) {
        self.bytes_read = 0;
    }

    /// Lend the read half and buffer to a read operation
    ///
    /// Returns `None` if the slot has no attached reader. On success the slot
    /// is Reading with `pending` set.
    pub(crate) fn begin_read(&mut self) -> Option<impl Future<Output = Ready> + Send + 'static> {
        let mut reader = self.reader.take()?;
        let mut buf = std::mem::take(&mut self.read_buf);
        let slot = self.id;
        self.state = SlotState::Reading;
        self.pending = true;

        Some(async move {
            let result = reader.read_message(&mut buf).await;
            Ready {
                slot,
                completion: Completion::Read {
                    reader,
                    buf,
                    result,
                },
            }
        })
    }

    /// Take back what a finished read borrowed
    pub(crate) fn restore(&mut self, reader: PeerReader, buf: Vec<u8>) {
        self.reader = Some(reader);
        self.read_buf = buf;
    }

    /// Something to wait on while this slot's outbound queue is full
    pub(crate) fn congestion(&self) -> Option<WriterRoom> {
        self.writer
            .as_ref()
            .filter(|writer| writer.is_congested())
            .map(|writer| WriterRoom(writer.tx.clone()))
    }

    /// Queue an outbound message if a peer is attached
    pub(crate) fn offer(&self, msg: Bytes) -> bool {
        match (&self.writer, self.is_connected()) {
            (Some(writer), true) => writer.offer(msg),
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::{Endpoint, Listener, MemoryClient};

    /// Bind a memory listener and accept `n` clients
    pub(crate) async fn accept_clients(
        name: &str,
        n: usize,
    ) -> (Listener, Vec<(MemoryClient, Connection)>) {
        let listener = Listener::bind(&Endpoint::Memory(name.to_string()))
            .await
            .unwrap();
        let mut pairs = Vec::new();
        for _ in 0..n {
            let client = MemoryClient::connect(name).unwrap();
            let conn = listener.accept().await.unwrap();
            pairs.push((client, conn));
        }
        (listener, pairs)
    }

    /// Writer limits with a short stall timeout
    pub(crate) fn limits(queue_depth: usize) -> WriterLimits {
        WriterLimits {
            queue_depth,
            stall_timeout: Duration::from_millis(200),
        }
    }

    /// Have `client` send `data` and complete one read on `slot`
    pub(crate) async fn receive(slot: &mut ConnectionSlot, client: &MemoryClient, data: &'static [u8]) {
        let read = slot.begin_read().unwrap();
        client.send(Bytes::from_static(data)).await.unwrap();
        match read.await.completion {
            Completion::Read {
                reader,
                buf,
                result,
            } => {
                slot.restore(reader, buf);
                slot.set_pending(false);
                slot.hold_message(result.unwrap());
            }
            _ => panic!("Expected read completion"),
        }
    }

    #[test]
    fn test_new_slot_is_connecting_with_preallocated_buffer() {
        let slot = ConnectionSlot::new(SlotId(3), 128);
        assert_eq!(slot.state(), SlotState::Connecting);
        assert!(!slot.is_pending());
        assert_eq!(slot.buffer_capacity(), 128);
        assert!(slot.message().is_empty());
    }

    #[tokio::test]
    async fn test_read_lends_and_returns_buffer() {
        let (_listener, mut pairs) = accept_clients("slot-test-lend", 1).await;
        let (client, conn) = pairs.pop().unwrap();

        let mut slot = ConnectionSlot::new(SlotId(0), 64);
        slot.attach(conn, limits(4));
        let read = slot.begin_read().unwrap();
        assert!(slot.is_pending());
        assert!(slot.begin_read().is_none());

        client.send("abc").await.unwrap();
        let ready = read.await;
        assert_eq!(ready.slot, SlotId(0));
        match ready.completion {
            Completion::Read {
                reader,
                buf,
                result,
            } => {
                slot.restore(reader, buf);
                slot.hold_message(result.unwrap());
            }
            _ => panic!("Expected read completion"),
        }
        assert_eq!(slot.state(), SlotState::Writing);
        assert_eq!(slot.message(), b"abc");
        assert_eq!(slot.buffer_capacity(), 64);
    }

    #[tokio::test]
    async fn test_detach_keeps_buffer_and_closes_peer() {
        let (_listener, mut pairs) = accept_clients("slot-test-detach", 1).await;
        let (mut client, conn) = pairs.pop().unwrap();

        let mut slot = ConnectionSlot::new(SlotId(1), 32);
        slot.attach(conn, limits(4));
        assert!(slot.is_connected());
        assert!(slot.offer(Bytes::from_static(b"bye")));

        slot.detach();
        assert_eq!(slot.state(), SlotState::Connecting);
        assert!(slot.peer().is_none());
        assert_eq!(slot.buffer_capacity(), 32);
        assert!(!slot.offer(Bytes::from_static(b"lost")));

        // Queued data is flushed before the connection closes
        assert_eq!(client.recv().await.unwrap(), Bytes::from_static(b"bye"));
        assert!(client.recv().await.is_none());
    }

    /// Offer until the slot reports a full queue
    /// Offer messages until the slot's queue is full; returns how many were offered
    pub(crate) async fn fill(slot: &ConnectionSlot) -> usize {
        for offered in 0..2000 {
            if slot.congestion().is_some() {
                return offered;
            }
            slot.offer(Bytes::from_static(b"x"));
            tokio::task::yield_now().await;
        }
        panic!("queue never filled");
    }

    #[tokio::test]
    async fn test_congestion_clears_when_client_reads() {
        let (_listener, mut pairs) = accept_clients("slot-test-congestion", 1).await;
        let (mut client, conn) = pairs.pop().unwrap();

        let mut slot = ConnectionSlot::new(SlotId(0), 16);
        slot.attach(
            conn,
            WriterLimits {
                queue_depth: 2,
                stall_timeout: Duration::from_secs(30),
            },
        );
        assert!(slot.congestion().is_none());

        // The client channel absorbs a burst before the queue backs up
        let offered = fill(&slot).await;
        assert!(offered > 2);
        let room = slot.congestion().unwrap();

        assert!(client.recv().await.is_some());
        tokio::time::timeout(Duration::from_secs(2), room.available())
            .await
            .unwrap();
        assert!(slot.offer(Bytes::from_static(b"y")));
    }

    #[tokio::test]
    async fn test_stalled_client_is_cut_off() {
        let (_listener, mut pairs) = accept_clients("slot-test-stall", 1).await;
        let (mut client, conn) = pairs.pop().unwrap();

        let mut slot = ConnectionSlot::new(SlotId(0), 16);
        slot.attach(conn, limits(4));
        fill(&slot).await;

        // The writer gives up on the blocked write and closes its output
        tokio::time::sleep(Duration::from_millis(400)).await;
        let mut received = 0;
        while tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .is_some()
        {
            received += 1;
        }
        assert!(received > 0);
        assert!(slot.congestion().is_none());
        assert!(!slot.offer(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_detach_with_unread_output_still_closes() {
        let (_listener, mut pairs) = accept_clients("slot-test-detach-stalled", 1).await;
        let (mut client, conn) = pairs.pop().unwrap();

        let mut slot = ConnectionSlot::new(SlotId(0), 16);
        slot.attach(conn, limits(4));
        fill(&slot).await;
        slot.detach();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while client.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "client never saw the connection close");
    }
}
