//! pipecast: multi-client broadcasting socket server
//!
//! A server listens on one endpoint (Unix socket, TCP or in-process memory)
//! with a fixed number of client slots. Every message a client sends is
//! echoed to the other connected clients when echo is on, then forwarded to
//! the server's downstream consumers tagged with the server's identity.
//! Idle servers write zero-length keepalives to their clients.
//!
//! # Example
//!
//! ```ignore
//! use pipecast::{ChannelConsumer, Endpoint, Server, SetupParams};
//! use std::sync::Arc;
//!
//! let mut server = Server::create("chat");
//! let (consumer, mut forwarded) = ChannelConsumer::new();
//! server.link(Arc::new(consumer));
//! server
//!     .configure(SetupParams::new("/tmp/chat.sock".parse()?).with_echo(true))
//!     .await?;
//!
//! while let Some(msg) = forwarded.recv().await {
//!     println!("{}: {:?}", msg.origin, msg.payload);
//! }
//! ```

pub mod cli;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use config::{IdleTimeout, ServerConfig, SetupParams};
pub use consumer::{ChannelConsumer, Consumer, ConsumerSet, Forwarded, ServerId, WriterConsumer};
pub use dispatch::{Dispatcher, Verb};
pub use error::{BroadcastError, Result};
pub use server::{Server, ServerHandle, SlotId, SlotState, SlotStatus};
pub use transport::{Endpoint, MemoryClient};
