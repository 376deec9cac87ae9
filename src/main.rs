//! # agentwire
//!
//! Binary entry point. `serve` runs the WebSocket server; `connect` runs the
//! client driver once and prints the reply to a single query.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use agentwire_client::{ClientDriver, ClientEvent, DriverConfig, TungsteniteConnector};
use agentwire_core::logging::init_subscriber;
use agentwire_server::{
    AcknowledgingReasoner, AgentServer, JwtVerifier, ServerConfig, ServerContext,
    TracingAuditSink,
};
use agentwire_settings::{AgentwireSettings, load_settings_from_path, settings_path};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

/// Real-time agent protocol server and client.
#[derive(Parser, Debug)]
#[command(name = "agentwire", version, about)]
struct Cli {
    /// Settings file (defaults to `~/.agentwire/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket server.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides settings; 0 picks a free port).
        #[arg(long)]
        port: Option<u16>,

        /// Do not expose `/metrics`.
        #[arg(long)]
        no_metrics: bool,
    },
    /// Connect, send one query, and print the reply.
    Connect {
        /// Query text.
        #[arg(long)]
        query: String,

        /// Server URL (overrides settings).
        #[arg(long)]
        url: Option<String>,

        /// Bearer token (overrides settings).
        #[arg(long, env = "AGENTWIRE_TOKEN")]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(settings_path);
    let settings = load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    match cli.command {
        Command::Serve {
            host,
            port,
            no_metrics,
        } => serve(&settings, host, port, !no_metrics).await,
        Command::Connect { query, url, token } => connect(&settings, query, url, token).await,
    }
}

async fn serve(
    settings: &AgentwireSettings,
    host: Option<String>,
    port: Option<u16>,
    with_metrics: bool,
) -> Result<()> {
    let mut config = ServerConfig::from(settings);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    let shutdown_timeout = config.shutdown_timeout;

    let verifier = JwtVerifier::from_settings(&settings.auth)
        .context("failed to build token verifier")?;
    let ctx = ServerContext::new(
        config,
        Arc::new(verifier),
        Arc::new(AcknowledgingReasoner::default()),
        Arc::new(TracingAuditSink),
    );

    let mut server = AgentServer::new(ctx);
    if with_metrics {
        let handle = agentwire_server::metrics::install_recorder()
            .context("failed to install metrics recorder")?;
        server = server.with_metrics(handle);
    }

    let handle = server.listen().await.context("failed to bind listener")?;
    info!(addr = %handle.local_addr(), "agentwire server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("shutting down");
    let report = handle.shutdown(shutdown_timeout).await;
    if report.lingering > 0 || !report.tasks_joined {
        warn!(?report, "shutdown finished past its deadline");
    }
    Ok(())
}

async fn connect(
    settings: &AgentwireSettings,
    query: String,
    url: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let mut client_settings = settings.client.clone();
    if let Some(url) = url {
        client_settings.url = url;
    }
    if token.is_some() {
        client_settings.token = token;
    }
    let config = DriverConfig::from_settings(&client_settings)?;
    let (client, mut events) = ClientDriver::spawn(config, Arc::new(TungsteniteConnector));
    let _ = client.query(query)?;

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Response(reply)) => break Ok(reply.content),
                Some(ClientEvent::StreamFailed { reason, .. }) => break Err(reason),
                Some(ClientEvent::ServerError(err)) => {
                    warn!(code = %err.code, message = %err.message, "server error");
                    if err.in_reply_to.is_some() {
                        break Err(err.message);
                    }
                }
                Some(ClientEvent::Connected { session_id, .. }) => {
                    info!(%session_id, "connected");
                }
                Some(ClientEvent::Disconnected { reason }) => warn!(%reason, "disconnected"),
                Some(ClientEvent::SessionUpdate(_)) => {}
                None => break Err(client.state().to_string()),
            },
            _ = tokio::signal::ctrl_c() => break Err("interrupted".to_owned()),
        }
    };

    let _ = client.shutdown().await;
    match outcome {
        Ok(content) => {
            println!("{content}");
            Ok(())
        }
        Err(reason) => bail!("query failed: {reason}"),
    }
}
