//! CLI argument definitions using clap
//!
//! With `--endpoint` the binary creates and starts one server before reading
//! console commands from stdin; without it, stdin drives everything.

use clap::Parser;
use std::path::PathBuf;

use crate::config::{IdleTimeout, ServerConfig, SetupParams, DEFAULT_IDLE_TIMEOUT_SECS};
use crate::error::Result;
use crate::transport::Endpoint;

/// Multi-client broadcasting socket server
#[derive(Parser, Debug)]
#[command(name = "pipecast")]
#[command(about = "Broadcast messages between socket clients and downstream consumers")]
#[command(version)]
pub struct Args {
    /// Endpoint to serve at startup: a socket path, tcp://host:port or memory:name
    #[arg(short, long, env = "PIPECAST_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Name of the startup server
    #[arg(short, long, default_value = "pipeserver")]
    pub name: String,

    /// Echo each client's messages to the other clients
    #[arg(long)]
    pub echo: bool,

    /// Idle seconds before keepalive writes; negative disables them
    #[arg(short, long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, allow_negative_numbers = true)]
    pub timeout: f64,

    /// Number of client slots (overrides the config file)
    #[arg(short, long)]
    pub capacity: Option<usize>,

    /// TOML file with server limits
    #[arg(long, env = "PIPECAST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not print forwarded messages of the startup server
    #[arg(long)]
    pub quiet: bool,
}

impl Args {
    /// Limits for every server, from the config file plus overrides
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(capacity) = self.capacity {
            config = config.with_capacity(capacity);
        }
        config.validate()?;
        Ok(config)
    }

    /// Setup for the startup server, if an endpoint was given
    pub fn startup(&self) -> Result<Option<SetupParams>> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(None);
        };
        let endpoint: Endpoint = endpoint.parse()?;
        Ok(Some(
            SetupParams::new(endpoint)
                .with_echo(self.echo)
                .with_idle_timeout(IdleTimeout::from_secs_f64(self.timeout)),
        ))
    }
}
