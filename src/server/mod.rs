//! Broadcasting server
//!
//! A server owns a fixed arena of connection slots on one endpoint. A single
//! task runs the loop; it is the only code that touches slot state.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         ServerLoop (one task)                     │
//! │                                                                   │
//! │   ┌──────────────────────┐      ┌───────────────────────────┐     │
//! │   │ ReadinessMultiplexer │◄─────│ ConnectionLifecycle       │     │
//! │   │  accepts + reads     │      │  start_connect / recycle  │     │
//! │   └──────────┬───────────┘      └───────────────────────────┘     │
//! │              │ ready slot                                         │
//! │              ▼                                                    │
//! │   ┌──────────────────────┐      ┌───────────────────────────┐     │
//! │   │ [slot 0 .. slot N-1] │─────►│ BroadcastRouter           │     │
//! │   │  ConnectionSlot      │      │  echo, then forward       │     │
//! │   └──────────┬───────────┘      └─────────────┬─────────────┘     │
//! └──────────────┼────────────────────────────────┼───────────────────┘
//!                │ per-slot writer task           │ ConsumerSet
//!                ▼                                ▼
//!             clients                    downstream consumers
//! ```
//!
//! `ServerHandle`s talk to the loop only through commands (`send`, `status`);
//! the owning `Server` alone holds the stop signal used by `shutdown`.
//!
//! # Modules
//!
//! - `slot` - Per-client state and buffers
//! - `multiplexer` - Waiting on slot operations, commands, writer room and the idle deadline
//! - `lifecycle` - Accepting and recycling clients
//! - `router` - Echo and downstream forwarding
//! - `event_loop` - The loop itself
//! - `handle` - Public server surface

mod event_loop;
mod handle;
mod lifecycle;
mod multiplexer;
mod router;
mod slot;

pub use handle::{Server, ServerHandle, COMMAND_QUEUE_DEPTH};
pub use slot::{SlotId, SlotState, SlotStatus};
