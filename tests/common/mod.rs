//! Common test utilities for pipecast integration tests
//!
//! This module provides:
//! - Unique endpoint names so tests can run in parallel
//! - A started server with a channel consumer attached
//! - Polling helpers for slot state and client reads

#![allow(unused_imports)]
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use pipecast::{
    ChannelConsumer, Endpoint, Forwarded, IdleTimeout, MemoryClient, Server, ServerConfig,
    SetupParams, SlotStatus,
};

/// How long a test waits for something that should happen promptly
pub const PATIENCE: Duration = Duration::from_secs(2);

static NEXT_NAME: AtomicU64 = AtomicU64::new(0);

/// A memory endpoint name no other test uses
pub fn unique_name(prefix: &str) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        std::process::id(),
        NEXT_NAME.fetch_add(1, Ordering::Relaxed)
    )
}

/// A running server on a memory endpoint, with a consumer on its forwards
pub struct TestServer {
    pub server: Server,
    pub endpoint: String,
    pub forwarded: UnboundedReceiver<Forwarded>,
}

impl TestServer {
    pub async fn start(capacity: usize, echo: bool, idle_timeout: IdleTimeout) -> Self {
        Self::start_with(ServerConfig::default().with_capacity(capacity), echo, idle_timeout).await
    }

    pub async fn start_with(config: ServerConfig, echo: bool, idle_timeout: IdleTimeout) -> Self {
        let endpoint = unique_name("it");
        let mut server = Server::with_config(&endpoint, config).unwrap();
        let (consumer, forwarded) = ChannelConsumer::new();
        server.link(Arc::new(consumer));
        server
            .configure(
                SetupParams::new(Endpoint::Memory(endpoint.clone()))
                    .with_echo(echo)
                    .with_idle_timeout(idle_timeout),
            )
            .await
            .unwrap();
        Self {
            server,
            endpoint,
            forwarded,
        }
    }

    /// Connect a client and wait until a slot holds it
    pub async fn connect(&self) -> MemoryClient {
        let before = connected(&self.server).await;
        let client = MemoryClient::connect(&self.endpoint).unwrap();
        wait_for_connected(&self.server, before + 1).await;
        client
    }

    /// Next forwarded message, failing the test if none arrives
    pub async fn next_forwarded(&mut self) -> Forwarded {
        tokio::time::timeout(PATIENCE, self.forwarded.recv())
            .await
            .expect("timed out waiting for a forward")
            .expect("consumer channel closed")
    }
}

pub async fn connected(server: &Server) -> usize {
    server
        .status()
        .await
        .unwrap()
        .iter()
        .filter(|s| s.is_connected())
        .count()
}

/// Poll slot status until `n` slots hold a client
pub async fn wait_for_connected(server: &Server, n: usize) -> Vec<SlotStatus> {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    loop {
        let status = server.status().await.unwrap();
        if status.iter().filter(|s| s.is_connected()).count() == n {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {} connected slots, status: {:?}",
            n,
            status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next message for `client`, or `None` if nothing arrives within `wait`
pub async fn recv_within(client: &mut MemoryClient, wait: Duration) -> Option<Bytes> {
    tokio::time::timeout(wait, client.recv()).await.ok().flatten()
}

/// Messages already queued for `client`
pub fn drain(client: &mut MemoryClient) -> Vec<Bytes> {
    std::iter::from_fn(|| client.try_recv()).collect()
}

/// Next message for `client`, failing the test if none arrives
pub async fn recv(client: &mut MemoryClient) -> Bytes {
    recv_within(client, PATIENCE)
        .await
        .expect("timed out waiting for a message")
}
