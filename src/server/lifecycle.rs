//! Slot connection lifecycle
//!
//! Starts passive accepts on slots and recycles slots whose client went away.
//! Everything here touches one slot and the shared listener only, so a slot
//! cycling through clients never holds up the others.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;

use super::multiplexer::{Completion, ReadinessMultiplexer, Ready};
use super::slot::{ConnectionSlot, SlotState, WriterLimits};
use crate::error::{BroadcastError, Result};
use crate::transport::Listener;

/// How a connect attempt left the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    /// A client was already waiting; the slot is attached and needs a read armed
    Connected,
    /// An accept is registered with the multiplexer
    Pending,
}

pub(crate) struct ConnectionLifecycle {
    listener: Arc<Listener>,
    writer_limits: WriterLimits,
    reconnect_backoff: Duration,
}

impl ConnectionLifecycle {
    pub fn new(listener: Arc<Listener>, writer_limits: WriterLimits, reconnect_backoff: Duration) -> Self {
        Self {
            listener,
            writer_limits,
            reconnect_backoff,
        }
    }

    pub fn writer_limits(&self) -> WriterLimits {
        self.writer_limits
    }

    /// Begin a passive accept on `slot`
    ///
    /// The accept is polled once in place; a client already queued on the
    /// listener is attached without a round trip through the multiplexer.
    pub fn start_connect(
        &self,
        slot: &mut ConnectionSlot,
        mux: &mut ReadinessMultiplexer,
    ) -> ConnectOutcome {
        let id = slot.id();
        slot.mark_connecting();

        let listener = Arc::clone(&self.listener);
        let mut accept = Box::pin(async move { listener.accept().await });

        match (&mut accept).now_or_never() {
            Some(Ok(conn)) => {
                slot.attach(conn, self.writer_limits);
                slot.set_pending(false);
                ConnectOutcome::Connected
            }
            Some(Err(e)) => {
                tracing::warn!("[SLOT] {} accept failed: {}", id, e);
                self.retry_connect(slot, mux);
                ConnectOutcome::Pending
            }
            None => {
                mux.register(async move {
                    Ready {
                        slot: id,
                        completion: Completion::Accepted(accept.await),
                    }
                });
                slot.set_pending(true);
                ConnectOutcome::Pending
            }
        }
    }

    /// Re-register an accept for `slot` after the backoff delay
    ///
    /// Used when an accept failed; the failure stays local to this slot.
    pub fn retry_connect(&self, slot: &mut ConnectionSlot, mux: &mut ReadinessMultiplexer) {
        let id = slot.id();
        let listener = Arc::clone(&self.listener);
        let backoff = self.reconnect_backoff;
        slot.mark_connecting();

        mux.register(async move {
            tokio::time::sleep(backoff).await;
            Ready {
                slot: id,
                completion: Completion::Accepted(listener.accept().await),
            }
        });
        slot.set_pending(true);
    }

    /// Drop the slot's client and start waiting for the next one
    ///
    /// A slot already waiting on an accept is left alone, so repeated calls
    /// never stack operations. A slot whose read is still outstanding cannot
    /// be recycled from here.
    pub fn disconnect_and_reconnect(
        &self,
        slot: &mut ConnectionSlot,
        mux: &mut ReadinessMultiplexer,
    ) -> Result<ConnectOutcome> {
        if slot.is_pending() {
            if slot.state() == SlotState::Connecting {
                return Ok(ConnectOutcome::Pending);
            }
            return Err(BroadcastError::InvariantViolation(format!(
                "{} recycled while its read is outstanding",
                slot.id()
            )));
        }

        slot.detach();
        Ok(self.start_connect(slot, mux))
    }
}
