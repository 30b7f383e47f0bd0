//! The server loop
//!
//! One task per server owns the slot arena and the multiplexer and is the
//! only code that changes slot state. Each turn waits for one wakeup and
//! handles it to completion without suspending:
//!
//! ```text
//!            ┌──────────────── wait ────────────────┐
//!            ▼                                      │
//!   ReadinessMultiplexer ── Ready(slot) ──► advance slot ── read done ──► route ──► arm read
//!            │                                      ▲
//!            ├── Timeout ──► keepalive to attached slots
//!            ├── Command ──► send / status
//!            └── Shutdown ──► detach every slot
//! ```
//!
//! A client whose outbound queue is full pauses the loop until it drains or
//! is cut off for stalling, so a burst of sends reaches every live client.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use super::lifecycle::{ConnectOutcome, ConnectionLifecycle};
use super::multiplexer::{Completion, Inbox, ReadinessMultiplexer, Ready, Wakeup};
use super::router::BroadcastRouter;
use super::slot::{ConnectionSlot, SlotId, SlotState, SlotStatus, WriterLimits};
use crate::config::{ServerConfig, SetupParams};
use crate::consumer::{ConsumerSet, ServerId};
use crate::error::{BroadcastError, Result};
use crate::transport::Listener;

/// Requests from server handles, executed by the loop
#[derive(Debug)]
pub enum Command {
    /// Write a payload to every attached client
    Send(Bytes),
    /// Report every slot's status
    Status(oneshot::Sender<Vec<SlotStatus>>),
}

pub(crate) struct ServerLoop {
    id: ServerId,
    slots: Vec<ConnectionSlot>,
    mux: ReadinessMultiplexer,
    lifecycle: ConnectionLifecycle,
    router: BroadcastRouter,
    inbox: Inbox,
}

impl ServerLoop {
    pub fn new(
        id: ServerId,
        config: &ServerConfig,
        params: &SetupParams,
        listener: Listener,
        consumers: ConsumerSet,
        inbox: Inbox,
    ) -> Self {
        let slots = (0..config.capacity)
            .map(|i| ConnectionSlot::new(SlotId(i), config.buffer_size))
            .collect();

        Self {
            router: BroadcastRouter::new(id.clone(), params.echo, consumers),
            id,
            slots,
            mux: ReadinessMultiplexer::new(params.idle_timeout),
            lifecycle: ConnectionLifecycle::new(
                Arc::new(listener),
                WriterLimits {
                    queue_depth: config.write_queue_depth,
                    stall_timeout: config.write_stall_timeout(),
                },
                config.reconnect_backoff(),
            ),
            inbox,
        }
    }

    /// Run until shutdown or an invariant violation
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            "[LOOP] {} serving {} slots",
            self.id,
            self.slots.len()
        );

        for i in 0..self.slots.len() {
            self.connect(SlotId(i))?;
        }

        loop {
            debug_assert!(self.all_pending(), "every slot must have one pending operation");

            let room = self.slots.iter().find_map(ConnectionSlot::congestion);
            match self.mux.wait(&mut self.inbox, room).await {
                Wakeup::Ready(ready) => self.on_ready(ready)?,
                Wakeup::Writable => {}
                Wakeup::Timeout => self.on_timeout(),
                Wakeup::Command(Command::Send(payload)) => {
                    let delivered = BroadcastRouter::fan_out(&self.slots, &payload);
                    tracing::debug!(
                        "[LOOP] {} sent {} bytes to {} clients",
                        self.id,
                        payload.len(),
                        delivered
                    );
                }
                Wakeup::Command(Command::Status(reply)) => {
                    let _ = reply.send(self.status());
                }
                Wakeup::Shutdown => {
                    tracing::info!("[LOOP] {} shutting down", self.id);
                    break;
                }
                Wakeup::Closed => {
                    tracing::info!("[LOOP] {} has no handles left, stopping", self.id);
                    break;
                }
            }
        }

        for slot in self.slots.iter_mut() {
            slot.detach();
        }
        Ok(())
    }

    fn status(&self) -> Vec<SlotStatus> {
        self.slots.iter().map(ConnectionSlot::status).collect()
    }

    fn all_pending(&self) -> bool {
        self.slots.iter().all(ConnectionSlot::is_pending)
    }

    fn slot_mut(&mut self, id: SlotId) -> Result<&mut ConnectionSlot> {
        let capacity = self.slots.len();
        self.slots.get_mut(id.index()).ok_or_else(|| {
            BroadcastError::InvariantViolation(format!(
                "{} is outside the {} slot arena",
                id, capacity
            ))
        })
    }

    /// Start waiting for a client on `id`, arming a read if one was already queued
    fn connect(&mut self, id: SlotId) -> Result<()> {
        let slot = self.slots.get_mut(id.index()).ok_or_else(|| {
            BroadcastError::InvariantViolation(format!("connect on unknown {}", id))
        })?;
        match self.lifecycle.start_connect(slot, &mut self.mux) {
            ConnectOutcome::Connected => self.arm_next_read(id),
            ConnectOutcome::Pending => Ok(()),
        }
    }

    fn reconnect(&mut self, id: SlotId) -> Result<()> {
        let slot = self.slots.get_mut(id.index()).ok_or_else(|| {
            BroadcastError::InvariantViolation(format!("reconnect on unknown {}", id))
        })?;
        match self.lifecycle.disconnect_and_reconnect(slot, &mut self.mux)? {
            ConnectOutcome::Connected => self.arm_next_read(id),
            ConnectOutcome::Pending => Ok(()),
        }
    }

    fn retry(&mut self, id: SlotId) -> Result<()> {
        let slot = self.slots.get_mut(id.index()).ok_or_else(|| {
            BroadcastError::InvariantViolation(format!("retry on unknown {}", id))
        })?;
        self.lifecycle.retry_connect(slot, &mut self.mux);
        Ok(())
    }

    fn arm_next_read(&mut self, id: SlotId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        let read = slot.begin_read().ok_or_else(|| {
            BroadcastError::InvariantViolation(format!("{} has no reader to arm", id))
        })?;
        self.mux.register(read);
        Ok(())
    }

    /// Deliver the message a slot holds
    fn on_message(&mut self, id: SlotId) -> Result<()> {
        let stats = self.router.route(&mut self.slots, id)?;
        tracing::debug!(
            "[ROUTER] {} {} bytes from {}, echoed to {}",
            self.id,
            stats.bytes,
            id,
            stats.echoed
        );
        Ok(())
    }

    fn on_ready(&mut self, ready: Ready) -> Result<()> {
        let id = ready.slot;
        let writer_limits = self.lifecycle.writer_limits();
        let slot = self.slot_mut(id)?;
        if !slot.is_pending() {
            return Err(BroadcastError::InvariantViolation(format!(
                "{} completed without a pending operation",
                id
            )));
        }
        slot.set_pending(false);

        match (slot.state(), ready.completion) {
            (SlotState::Connecting, Completion::Accepted(Ok(conn))) => {
                slot.attach(conn, writer_limits);
                self.arm_next_read(id)
            }
            (SlotState::Connecting, Completion::Accepted(Err(e))) => {
                tracing::warn!("[SLOT] {} accept failed, retrying: {}", id, e);
                self.retry(id)
            }
            (
                SlotState::Reading,
                Completion::Read {
                    reader,
                    buf,
                    result,
                },
            ) => {
                slot.restore(reader, buf);
                match result {
                    Ok(n) if n > 0 => {
                        slot.hold_message(n);
                        self.on_message(id)?;
                        self.arm_next_read(id)
                    }
                    Ok(_) => {
                        tracing::debug!("[SLOT] {} peer closed", id);
                        self.reconnect(id)
                    }
                    Err(e) => {
                        tracing::debug!("[SLOT] {} read failed: {}", id, e);
                        self.reconnect(id)
                    }
                }
            }
            (state, completion) => Err(BroadcastError::InvariantViolation(format!(
                "{} in state {:?} received {}",
                id,
                state,
                match completion {
                    Completion::Accepted(_) => "an accept",
                    Completion::Read { .. } => "a read",
                }
            ))),
        }
    }

    /// Nudge every attached client with an empty write
    fn on_timeout(&mut self) {
        let nudged = BroadcastRouter::fan_out(&self.slots, &Bytes::new());
        if nudged > 0 {
            tracing::debug!("[LOOP] {} idle, sent keepalive to {} clients", self.id, nudged);
        }
    }
}
