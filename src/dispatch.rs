//! Line-oriented command console
//!
//! Each input line is one verb followed by whitespace separated arguments:
//!
//! ```text
//! create pipeserver chat
//! setup chat /tmp/chat.sock 1 0.5
//! link chat stdout
//! write chat hello everyone
//! status chat
//! close chat
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::config::{IdleTimeout, ServerConfig, SetupParams, DEFAULT_IDLE_TIMEOUT_SECS};
use crate::consumer::{Consumer, WriterConsumer};
use crate::error::{BroadcastError, Result};
use crate::server::Server;

/// The one object class the console can create
pub const SERVER_CLASS: &str = "pipeserver";

pub const HELP: &str = "\
Commands:
  help [name]                                 Show this text, or the verbs a server accepts
  create pipeserver <name>                    Create a server; nothing is bound yet
  setup <name> <endpoint> [echo] [timeout]    Bind and start serving
                                              endpoint: path | tcp://host:port | memory:name
                                              echo: 0 or 1 (default 0)
                                              timeout: idle seconds, negative for none (default 1.0)
  write <name> <data...>                      Send the rest of the line to every client
  link <name> <stdout|server>                 Forward received messages downstream
  status <name>                               Show slot states as JSON
  close <name>                                Stop the server and release its endpoint
";

const SERVER_HELP: &str = "\
pipeserver verbs:
  setup <endpoint> [echo] [timeout]
  write <data...>
  link <stdout|server>
  status
  close
";

/// Downstream target of a `link`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Stdout,
    Server(String),
}

/// A parsed console command
#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    Help(Option<String>),
    Create {
        class: String,
        name: String,
    },
    Setup {
        name: String,
        params: SetupParams,
    },
    Write {
        name: String,
        data: String,
    },
    Read {
        name: String,
    },
    Link {
        name: String,
        target: LinkTarget,
    },
    Status {
        name: String,
    },
    Close {
        name: String,
    },
}

fn invalid(message: impl Into<String>) -> BroadcastError {
    BroadcastError::InvalidCommand {
        message: message.into(),
    }
}

/// Split off the first whitespace separated token
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(end) => Some((&s[..end], &s[end..])),
        None => Some((s, "")),
    }
}

impl FromStr for Verb {
    type Err = BroadcastError;

    fn from_str(line: &str) -> Result<Self> {
        let (verb, rest) = next_token(line).ok_or_else(|| invalid("empty command"))?;

        // `write` keeps its payload verbatim, so it is split before tokenizing
        if verb == "write" {
            let (name, data) = next_token(rest).ok_or_else(|| invalid("usage: write <name> <data...>"))?;
            return Ok(Self::Write {
                name: name.to_string(),
                data: data.trim().to_string(),
            });
        }

        let args: Vec<&str> = rest.split_whitespace().collect();
        let name = |usage: &str| -> Result<String> {
            match args.as_slice() {
                [name] => Ok(name.to_string()),
                _ => Err(invalid(format!("usage: {}", usage))),
            }
        };

        match verb {
            "help" => match args.as_slice() {
                [] => Ok(Self::Help(None)),
                [name] => Ok(Self::Help(Some(name.to_string()))),
                _ => Err(invalid("usage: help [name]")),
            },
            "create" => match args.as_slice() {
                [class, name] => Ok(Self::Create {
                    class: class.to_string(),
                    name: name.to_string(),
                }),
                _ => Err(invalid("usage: create pipeserver <name>")),
            },
            "setup" => {
                let (name, endpoint, echo, timeout) = match args.as_slice() {
                    [name, endpoint] => (name, endpoint, None, None),
                    [name, endpoint, echo] => (name, endpoint, Some(echo), None),
                    [name, endpoint, echo, timeout] => (name, endpoint, Some(echo), Some(timeout)),
                    _ => return Err(invalid("usage: setup <name> <endpoint> [echo] [timeout]")),
                };
                let echo = match echo {
                    Some(echo) => {
                        echo.parse::<i64>()
                            .map_err(|_| invalid(format!("echo must be an integer, got '{}'", echo)))?
                            != 0
                    }
                    None => false,
                };
                let timeout = match timeout {
                    Some(timeout) => timeout
                        .parse::<f64>()
                        .map_err(|_| invalid(format!("timeout must be a number, got '{}'", timeout)))?,
                    None => DEFAULT_IDLE_TIMEOUT_SECS,
                };
                Ok(Self::Setup {
                    name: name.to_string(),
                    params: SetupParams::new(endpoint.parse()?)
                        .with_echo(echo)
                        .with_idle_timeout(IdleTimeout::from_secs_f64(timeout)),
                })
            }
            "read" => Ok(Self::Read {
                name: name("read <name>")?,
            }),
            "link" => match args.as_slice() {
                [name, "stdout"] => Ok(Self::Link {
                    name: name.to_string(),
                    target: LinkTarget::Stdout,
                }),
                [name, target] => Ok(Self::Link {
                    name: name.to_string(),
                    target: LinkTarget::Server(target.to_string()),
                }),
                _ => Err(invalid("usage: link <name> <stdout|server>")),
            },
            "status" => Ok(Self::Status {
                name: name("status <name>")?,
            }),
            "close" => Ok(Self::Close {
                name: name("close <name>")?,
            }),
            other => Err(invalid(format!("unknown verb '{}', try 'help'", other))),
        }
    }
}

/// Named servers driven by console commands
pub struct Dispatcher {
    servers: HashMap<String, Server>,
    config: ServerConfig,
    output: Arc<dyn Consumer>,
}

impl Dispatcher {
    /// Servers get `config`; `link <name> stdout` prints to standard output
    pub fn new(config: ServerConfig) -> Self {
        Self::with_output(config, Arc::new(WriterConsumer::stdout()))
    }

    /// Use `output` as the target of `link <name> stdout`
    pub fn with_output(config: ServerConfig, output: Arc<dyn Consumer>) -> Self {
        Self {
            servers: HashMap::new(),
            config,
            output,
        }
    }

    pub fn server(&self, name: &str) -> Option<&Server> {
        self.servers.get(name)
    }

    /// Names of all servers, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.servers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn lookup(&self, name: &str) -> Result<&Server> {
        self.servers
            .get(name)
            .ok_or_else(|| BroadcastError::UnknownServer {
                name: name.to_string(),
            })
    }

    fn lookup_mut(&mut self, name: &str) -> Result<&mut Server> {
        self.servers
            .get_mut(name)
            .ok_or_else(|| BroadcastError::UnknownServer {
                name: name.to_string(),
            })
    }

    /// Parse and run one console line; returns text to show, if any
    pub async fn execute(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let verb: Verb = line.parse()?;
        self.dispatch(verb).await
    }

    pub async fn dispatch(&mut self, verb: Verb) -> Result<Option<String>> {
        tracing::debug!("[DISPATCH] {:?}", verb);

        match verb {
            Verb::Help(None) => Ok(Some(HELP.to_string())),
            Verb::Help(Some(name)) => {
                self.lookup(&name)?;
                Ok(Some(SERVER_HELP.to_string()))
            }
            Verb::Create { class, name } => {
                if class != SERVER_CLASS {
                    return Err(invalid(format!("unknown class '{}'", class)));
                }
                if self.servers.contains_key(&name) {
                    return Err(BroadcastError::DuplicateServer { name });
                }
                let server = Server::with_config(&name, self.config.clone())?;
                tracing::info!("[DISPATCH] Created {} {}", SERVER_CLASS, name);
                self.servers.insert(name, server);
                Ok(None)
            }
            Verb::Setup { name, params } => {
                let server = self.lookup_mut(&name)?;
                server.configure(params).await?;
                Ok(server
                    .local_endpoint()
                    .map(|endpoint| format!("{} listening on {}", name, endpoint)))
            }
            Verb::Write { name, data } => {
                self.lookup(&name)?.send(data).await?;
                Ok(None)
            }
            Verb::Read { .. } => Err(BroadcastError::UnsupportedVerb {
                verb: "read".to_string(),
                class: SERVER_CLASS.to_string(),
            }),
            Verb::Link { name, target } => {
                let consumer: Arc<dyn Consumer> = match &target {
                    LinkTarget::Stdout => Arc::clone(&self.output),
                    LinkTarget::Server(target) => Arc::new(self.lookup(target)?.handle()?),
                };
                self.lookup(&name)?.link(consumer);
                tracing::info!("[DISPATCH] Linked {} to {:?}", name, target);
                Ok(None)
            }
            Verb::Status { name } => {
                let status = self.lookup(&name)?.status().await?;
                let json = serde_json::to_string_pretty(&status).map_err(std::io::Error::from)?;
                Ok(Some(json))
            }
            Verb::Close { name } => {
                let mut server = self
                    .servers
                    .remove(&name)
                    .ok_or(BroadcastError::UnknownServer { name })?;
                server.shutdown().await?;
                tracing::info!("[DISPATCH] Closed {}", server.name());
                Ok(None)
            }
        }
    }

    /// Execute lines from `input` until `interrupt` resolves
    ///
    /// Replies go to `replies`. When the input ends with no servers left the
    /// console returns; otherwise it keeps serving until interrupted.
    pub async fn run_console<R, F, W>(&mut self, input: R, interrupt: F, replies: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
        W: Write,
    {
        let mut lines = input.lines();
        let mut input_open = true;
        tokio::pin!(interrupt);

        loop {
            tokio::select! {
                line = lines.next_line(), if input_open => match line? {
                    Some(line) => match self.execute(&line).await {
                        Ok(Some(output)) => writeln!(replies, "{}", output.trim_end())?,
                        Ok(None) => {}
                        Err(e) => tracing::error!("[DISPATCH] {}", e),
                    },
                    None => {
                        input_open = false;
                        if self.servers.is_empty() {
                            return Ok(());
                        }
                        tracing::info!("[DISPATCH] Console closed, serving until interrupted");
                    }
                },
                _ = &mut interrupt => {
                    tracing::info!("[DISPATCH] Interrupted, shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Shut down every server, reporting the first failure
    pub async fn shutdown_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for (name, mut server) in self.servers.drain() {
            if let Err(e) = server.shutdown().await {
                tracing::warn!("[DISPATCH] {} did not stop cleanly: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
