//! Readiness multiplexer
//!
//! Holds the one outstanding operation (accept or read) of every slot and
//! waits until exactly one of them finishes, a command arrives from the
//! server handle, or the idle deadline passes.
//!
//! The idle deadline measures client silence: it is re-armed after each
//! accepted client, each read that produced data, and each timeout. Commands
//! and failed accepts do not move it, so a busy `send` caller or a failing
//! listener cannot suppress keepalives.
//!
//! While a client's outbound queue is full the wait stops taking slot
//! completions and commands and waits for that queue to drain instead. The
//! stop signal and the idle deadline stay live.

use std::future::Future;
use std::io;
use std::pin::Pin;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::event_loop::Command;
use super::slot::{SlotId, WriterRoom};
use crate::config::IdleTimeout;
use crate::transport::{Connection, PeerReader};

type SlotOperation = Pin<Box<dyn Future<Output = Ready> + Send>>;

/// Result of a slot operation
#[derive(Debug)]
pub(crate) enum Completion {
    /// A pending accept finished
    Accepted(io::Result<Connection>),
    /// A pending read finished; the lent reader and buffer come back with it
    Read {
        reader: PeerReader,
        buf: Vec<u8>,
        result: io::Result<usize>,
    },
}

impl Completion {
    /// A client connected or sent data
    pub fn is_activity(&self) -> bool {
        match self {
            Completion::Accepted(result) => result.is_ok(),
            Completion::Read { result, .. } => matches!(result, Ok(n) if *n > 0),
        }
    }
}

/// A slot whose operation finished
#[derive(Debug)]
pub(crate) struct Ready {
    pub slot: SlotId,
    pub completion: Completion,
}

/// What ended a wait
#[derive(Debug)]
pub(crate) enum Wakeup {
    Ready(Ready),
    Command(Command),
    /// A congested client queue has room again
    Writable,
    Timeout,
    /// The owning server asked the loop to stop
    Shutdown,
    /// Every server handle is gone
    Closed,
}

/// Everything the loop hears from outside: commands from any handle and the
/// owner's stop signal
#[derive(Debug)]
pub(crate) struct Inbox {
    commands: mpsc::Receiver<Command>,
    stop: Option<oneshot::Receiver<()>>,
}

impl Inbox {
    pub fn new(commands: mpsc::Receiver<Command>, stop: Option<oneshot::Receiver<()>>) -> Self {
        Self { commands, stop }
    }
}

pub(crate) struct ReadinessMultiplexer {
    operations: FuturesUnordered<SlotOperation>,
    idle_timeout: IdleTimeout,
    deadline: Option<Instant>,
}

impl ReadinessMultiplexer {
    pub fn new(idle_timeout: IdleTimeout) -> Self {
        let mut mux = Self {
            operations: FuturesUnordered::new(),
            idle_timeout,
            deadline: None,
        };
        mux.rearm_deadline();
        mux
    }

    /// Add a slot's outstanding operation
    pub fn register<F>(&mut self, operation: F)
    where
        F: Future<Output = Ready> + Send + 'static,
    {
        self.operations.push(Box::pin(operation));
    }

    /// Number of registered operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    fn rearm_deadline(&mut self) {
        self.deadline = self
            .idle_timeout
            .as_duration()
            .map(|timeout| Instant::now() + timeout);
    }

    /// Block until one slot is ready, a command arrives, or the idle deadline passes
    ///
    /// With `room` set, slots and commands are left alone until that queue
    /// drains.
    pub async fn wait(&mut self, inbox: &mut Inbox, room: Option<WriterRoom>) -> Wakeup {
        let deadline = self.deadline;
        let congested = room.is_some();

        tokio::select! {
            _ = stop_requested(&mut inbox.stop) => Wakeup::Shutdown,
            ready = next_ready(&mut self.operations), if !congested => {
                if ready.completion.is_activity() {
                    self.rearm_deadline();
                }
                Wakeup::Ready(ready)
            }
            command = inbox.commands.recv(), if !congested => match command {
                Some(command) => Wakeup::Command(command),
                None => Wakeup::Closed,
            },
            _ = writable(room), if congested => Wakeup::Writable,
            _ = sleep_until(deadline) => {
                self.rearm_deadline();
                Wakeup::Timeout
            }
        }
    }
}

/// Resolves once the stop signal fires; a dropped sender disarms it for good
async fn stop_requested(stop: &mut Option<oneshot::Receiver<()>>) {
    let requested = match stop.as_mut() {
        Some(rx) => rx.await.is_ok(),
        None => false,
    };
    *stop = None;
    if !requested {
        std::future::pending::<()>().await;
    }
}

/// Next finished operation; never resolves while nothing is registered
async fn next_ready(operations: &mut FuturesUnordered<SlotOperation>) -> Ready {
    match operations.next().await {
        Some(ready) => ready,
        None => std::future::pending().await,
    }
}

async fn writable(room: Option<WriterRoom>) {
    match room {
        Some(room) => room.available().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
