//! Passive endpoints that broadcast servers listen on
//!
//! Three endpoint kinds share one accept/read/write surface:
//!
//! - `Local`  - Unix domain socket at a filesystem path (the named-pipe analogue)
//! - `Tcp`    - TCP listener on `host:port`
//! - `Memory` - in-process endpoint with message semantics (see [`memory`])
//!
//! # Endpoint names
//!
//! ```text
//! tcp://127.0.0.1:9000   -> Endpoint::Tcp("127.0.0.1:9000")
//! tcp:localhost:0        -> Endpoint::Tcp("localhost:0")
//! memory:telemetry       -> Endpoint::Memory("telemetry")
//! /run/pipecast.sock     -> Endpoint::Local("/run/pipecast.sock")
//! ```
//!
//! Every accepted connection is split into a [`PeerReader`] (lent to the
//! slot's pending read) and a [`PeerWriter`] (owned by the slot's writer task).

pub mod endpoint;
pub mod memory;

pub use endpoint::{Connection, Endpoint, Listener, PeerReader, PeerWriter};
pub use memory::{MemoryClient, MemoryListener};
