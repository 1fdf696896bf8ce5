use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use anywhere_mcp::config::load_descriptors_from_path;
use anywhere_mcp::gateway::GatewayRouter;
use anywhere_mcp::server::{
    DEFAULT_MOUNT_PATH, GatewayHttpServer, HttpServerOptions, resolve_bind_address, serve_stdio,
};
use clap::{Parser, Subcommand, ValueEnum};
use mcp_anywhere::{GatewayArgs, build_gateway, init_tracing, shutdown_signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Long-lived MCP gateway over sandboxed backend servers.
#[derive(Parser, Debug)]
#[command(name = "mcp-anywhere", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway
    Serve(ServeArgs),
    /// Validate the descriptor file and list its backends
    Check(CheckArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ClientTransport {
    Http,
    Stdio,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    gateway: GatewayArgs,

    /// How clients reach the gateway
    #[arg(long, value_enum, default_value = "http")]
    transport: ClientTransport,

    /// Listen address for the HTTP transport
    #[arg(long, env = "MCP_ANYWHERE_BIND")]
    bind: Option<String>,

    #[arg(long, env = "MCP_ANYWHERE_MOUNT_PATH", default_value = DEFAULT_MOUNT_PATH)]
    mount_path: String,

    /// Require this key as a bearer token or X-API-Key header
    #[arg(long, env = "MCP_ANYWHERE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Permit binding to non-loopback addresses
    #[arg(long)]
    allow_remote: bool,

    /// Seconds between descriptor reloads; 0 disables
    #[arg(long, env = "MCP_ANYWHERE_REFRESH_INTERVAL", default_value_t = 30)]
    refresh_interval: u64,
}

#[derive(clap::Args, Debug)]
struct CheckArgs {
    #[command(flatten)]
    gateway: GatewayArgs,

    /// Print the parsed descriptors as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Check(args) => check(args),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    init_tracing(args.gateway.log_level.as_deref(), "info");
    let router = build_gateway(&args.gateway).await?;

    let token = CancellationToken::new();
    let refresh_interval = (args.refresh_interval > 0).then(|| Duration::from_secs(args.refresh_interval));
    let maintenance = router.spawn_maintenance(refresh_interval, token.clone());
    let reload = spawn_reload_on_hangup(Arc::clone(&router), token.clone());

    let outcome = match args.transport {
        ClientTransport::Http => {
            let bind_address = resolve_bind_address(args.bind.as_deref(), args.allow_remote)?;
            let server = GatewayHttpServer::new(
                Arc::clone(&router),
                HttpServerOptions {
                    bind_address,
                    mount_path: args.mount_path.clone(),
                    api_key: args.api_key.clone().filter(|key| !key.is_empty()),
                },
            )
            .start()
            .await
            .with_context(|| format!("failed to bind {bind_address}"))?;
            shutdown_signal().await;
            server.stop().await
        }
        ClientTransport::Stdio => {
            let stop = token.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                stop.cancel();
            });
            serve_stdio(Arc::clone(&router), tokio::io::stdin(), tokio::io::stdout(), token.clone()).await
        }
    };

    token.cancel();
    let _ = maintenance.await;
    let _ = reload.await;
    router.shutdown().await;
    outcome?;

    if args.transport == ClientTransport::Stdio {
        // A pending blocking read on stdin would keep the runtime from exiting.
        std::process::exit(0);
    }
    Ok(())
}

#[cfg(unix)]
fn spawn_reload_on_hangup(router: Arc<GatewayRouter>, token: CancellationToken) -> JoinHandle<()> {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(error) => {
                warn!("SIGHUP reload unavailable: {}", error);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGHUP received; reloading backend descriptors");
                    if let Err(error) = router.refresh().await {
                        warn!("Reload failed: {}", error);
                    }
                }
            }
        }
    })
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_router: Arc<GatewayRouter>, _token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async {})
}

fn check(args: CheckArgs) -> Result<()> {
    init_tracing(args.gateway.log_level.as_deref(), "warn");
    let path = args.gateway.descriptor_path();
    let descriptors =
        load_descriptors_from_path(&path).with_context(|| format!("invalid descriptor file {}", path.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    println!("{} ({} backend(s))", path.display(), descriptors.len());
    if descriptors.is_empty() {
        return Ok(());
    }
    let id_width = descriptors.iter().map(|descriptor| descriptor.id.len()).max().unwrap_or(2).max(2);
    println!("{:<id_width$}  {:<10}  {:<9}  ACTIVE", "ID", "RUNTIME", "TRANSPORT");
    for descriptor in &descriptors {
        println!(
            "{:<id_width$}  {:<10}  {:<9}  {}",
            descriptor.id,
            descriptor.runtime.as_str(),
            descriptor.wire_transport().to_string(),
            if descriptor.active { "yes" } else { "no" }
        );
    }
    Ok(())
}
