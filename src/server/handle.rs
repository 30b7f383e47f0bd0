//! Server surface
//!
//! `Server` owns a server's identity, limits and consumer list, and once
//! configured, the task running its loop. Work reaches the loop through a
//! `ServerHandle`, a cloneable command sender; only the `Server` can stop it.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::event_loop::{Command, ServerLoop};
use super::multiplexer::Inbox;
use super::slot::SlotStatus;
use crate::config::{ServerConfig, SetupParams};
use crate::consumer::{Consumer, ConsumerSet, ServerId};
use crate::error::{BroadcastError, Result};
use crate::transport::{Endpoint, Listener};

/// Commands buffered between handles and the loop
pub const COMMAND_QUEUE_DEPTH: usize = 1024;

enum Lifecycle {
    Created,
    Running {
        handle: ServerHandle,
        endpoint: Endpoint,
        stop: oneshot::Sender<()>,
        task: JoinHandle<Result<()>>,
    },
    Stopped,
}

/// A broadcasting server
pub struct Server {
    id: ServerId,
    config: ServerConfig,
    consumers: ConsumerSet,
    lifecycle: Lifecycle,
}

impl Server {
    /// Create a server with default limits; nothing is bound yet
    pub fn create(name: &str) -> Self {
        Self {
            id: ServerId::new(name),
            config: ServerConfig::default(),
            consumers: ConsumerSet::new(),
            lifecycle: Lifecycle::Created,
        }
    }

    /// Create a server with explicit limits
    pub fn with_config(name: &str, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::create(name)
        })
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Downstream consumers; linking through this works before and after `configure`
    pub fn consumers(&self) -> &ConsumerSet {
        &self.consumers
    }

    pub fn link(&self, consumer: std::sync::Arc<dyn Consumer>) {
        self.consumers.link(consumer);
    }

    pub fn is_running(&self) -> bool {
        match &self.lifecycle {
            Lifecycle::Running { task, .. } => !task.is_finished(),
            _ => false,
        }
    }

    /// The bound endpoint, with any port 0 resolved
    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        match &self.lifecycle {
            Lifecycle::Running { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    /// A command handle for the running loop
    pub fn handle(&self) -> Result<ServerHandle> {
        match &self.lifecycle {
            Lifecycle::Running { handle, .. } => Ok(handle.clone()),
            _ => Err(self.not_running()),
        }
    }

    /// Bind the endpoint and start serving
    ///
    /// A server is configured once; later calls return `AlreadyConfigured`.
    pub async fn configure(&mut self, params: SetupParams) -> Result<()> {
        if !matches!(self.lifecycle, Lifecycle::Created) {
            return Err(BroadcastError::AlreadyConfigured {
                name: self.name().to_string(),
            });
        }

        let listener = Listener::bind(&params.endpoint).await?;
        let endpoint = listener.local_endpoint();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (stop, on_stop) = oneshot::channel();

        tracing::info!(
            "[LOOP] {} ({}) listening on {} (echo: {}, idle timeout: {:?})",
            self.id,
            self.id.uid(),
            endpoint,
            params.echo,
            params.idle_timeout
        );

        let server_loop = ServerLoop::new(
            self.id.clone(),
            &self.config,
            &params,
            listener,
            self.consumers.clone(),
            Inbox::new(rx, Some(on_stop)),
        );
        let name = self.id.clone();
        let task = tokio::spawn(async move {
            let result = server_loop.run().await;
            match &result {
                Err(e) if e.is_fatal() => tracing::error!("[LOOP] {} aborted: {}", name, e),
                Err(e) => tracing::warn!("[LOOP] {} stopped: {}", name, e),
                Ok(()) => tracing::debug!("[LOOP] {} stopped", name),
            }
            result
        });

        self.lifecycle = Lifecycle::Running {
            handle: ServerHandle {
                id: self.id.clone(),
                commands: tx,
            },
            endpoint,
            stop,
            task,
        };
        Ok(())
    }

    /// Write `payload` to every connected client
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.handle()?.send(payload).await
    }

    /// Snapshot of every slot
    pub async fn status(&self) -> Result<Vec<SlotStatus>> {
        self.handle()?.status().await
    }

    /// Stop the loop, close every client and release the endpoint
    ///
    /// Returns the loop's own error if it had already failed. Stopping a
    /// server that never ran is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { stop, task, .. } => {
                // Err means the loop already ended
                let _ = stop.send(());
                task.await
                    .map_err(|e| BroadcastError::InvariantViolation(format!("loop task: {}", e)))?
            }
            Lifecycle::Created | Lifecycle::Stopped => Ok(()),
        }
    }

    fn not_running(&self) -> BroadcastError {
        BroadcastError::NotRunning {
            name: self.name().to_string(),
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("endpoint", &self.local_endpoint())
            .field("running", &self.is_running())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

/// Cloneable sender of commands to a running server loop
#[derive(Debug, Clone)]
pub struct ServerHandle {
    id: ServerId,
    commands: mpsc::Sender<Command>,
}

impl ServerHandle {
    pub fn id(&self) -> &ServerId {
        &self.id
    }

    fn not_running(&self) -> BroadcastError {
        BroadcastError::NotRunning {
            name: self.id.name().to_string(),
        }
    }

    /// Queue a payload for every connected client
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.commands
            .send(Command::Send(payload.into()))
            .await
            .map_err(|_| self.not_running())
    }

    /// Queue a payload without waiting for room in the command queue
    pub fn try_send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.commands
            .try_send(Command::Send(payload.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!("[LOOP] {} command queue full, dropping send", self.id);
                    BroadcastError::Io(std::io::Error::new(
                        std::io::ErrorKind::WouldBlock,
                        "command queue full",
                    ))
                }
                mpsc::error::TrySendError::Closed(_) => self.not_running(),
            })
    }

    /// Ask the loop for a snapshot of every slot
    pub async fn status(&self) -> Result<Vec<SlotStatus>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .await
            .map_err(|_| self.not_running())?;
        rx.await.map_err(|_| self.not_running())
    }
}

/// Messages forwarded to a handle are broadcast by that server
impl Consumer for ServerHandle {
    fn forward(&self, payload: &Bytes, _origin: &ServerId) {
        if let Err(e) = self.try_send(payload.clone()) {
            tracing::debug!("[ROUTER] Forward into {} failed: {}", self.id, e);
        }
    }
}
