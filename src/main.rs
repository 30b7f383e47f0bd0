//! pipecast entry point
//!
//! # Usage
//!
//! ```bash
//! pipecast --endpoint /tmp/chat.sock --echo
//! pipecast --endpoint tcp://127.0.0.1:7000 --timeout -1
//! echo "create pipeserver chat" | pipecast
//! ```

use std::process::ExitCode;

use clap::Parser;
use tokio::io::BufReader;

use pipecast::cli::Args;
use pipecast::dispatch::{Dispatcher, LinkTarget, Verb, SERVER_CLASS};
use pipecast::BroadcastError;

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries forwarded messages and console replies; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pipecast=info".parse().expect("static directive")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            match e.downcast_ref::<BroadcastError>() {
                Some(e) => e.exit_code(),
                None => ExitCode::FAILURE,
            }
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut dispatcher = Dispatcher::new(args.server_config()?);

    if let Some(params) = args.startup()? {
        dispatcher
            .dispatch(Verb::Create {
                class: SERVER_CLASS.to_string(),
                name: args.name.clone(),
            })
            .await?;
        if let Some(shown) = dispatcher
            .dispatch(Verb::Setup {
                name: args.name.clone(),
                params,
            })
            .await?
        {
            tracing::info!("[DISPATCH] {}", shown);
        }
        if !args.quiet {
            dispatcher
                .dispatch(Verb::Link {
                    name: args.name.clone(),
                    target: LinkTarget::Stdout,
                })
                .await?;
        }
    }

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("[DISPATCH] Cannot listen for interrupts: {}", e);
            std::future::pending::<()>().await;
        }
    };
    dispatcher
        .run_console(
            BufReader::new(tokio::io::stdin()),
            interrupt,
            &mut std::io::stdout(),
        )
        .await?;

    dispatcher.shutdown_all().await?;
    Ok(())
}
