//! Message fan-out
//!
//! For every message a slot reads, the router echoes it to the other attached
//! slots (when echo is on) and then forwards it to the linked consumers. Echo
//! always happens before the forward of the same message.

use bytes::Bytes;

use super::slot::{ConnectionSlot, SlotId};
use crate::consumer::{ConsumerSet, ServerId};
use crate::error::{BroadcastError, Result};

/// Counts from routing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RouteStats {
    pub bytes: usize,
    pub echoed: usize,
}

pub(crate) struct BroadcastRouter {
    origin: ServerId,
    echo: bool,
    consumers: ConsumerSet,
}

impl BroadcastRouter {
    pub fn new(origin: ServerId, echo: bool, consumers: ConsumerSet) -> Self {
        Self {
            origin,
            echo,
            consumers,
        }
    }

    /// Deliver the message held by slot `from` and clear it
    pub fn route(&self, slots: &mut [ConnectionSlot], from: SlotId) -> Result<RouteStats> {
        let source = slots.get_mut(from.index()).ok_or_else(|| {
            BroadcastError::InvariantViolation(format!("routing from unknown {}", from))
        })?;
        let message = Bytes::copy_from_slice(source.message());
        source.clear_message();

        let echoed = if self.echo {
            slots
                .iter()
                .filter(|slot| slot.id() != from)
                .filter(|slot| slot.offer(message.clone()))
                .count()
        } else {
            0
        };

        self.consumers.forward(&message, &self.origin);

        Ok(RouteStats {
            bytes: message.len(),
            echoed,
        })
    }

    /// Write `payload` to every attached slot; returns how many accepted it
    pub fn fan_out(slots: &[ConnectionSlot], payload: &Bytes) -> usize {
        slots
            .iter()
            .filter(|slot| slot.offer(payload.clone()))
            .count()
    }
}
