//! Ephemeral gateway for one client over stdin/stdout.
//!
//! Meant to be launched by an MCP client as its server process. Stdout
//! carries only protocol envelopes; all logging goes to stderr.

use anyhow::Result;
use anywhere_mcp::server::serve_stdio;
use clap::Parser;
use mcp_anywhere::{GatewayArgs, build_gateway, init_tracing, shutdown_signal};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "mcp-anywhere-connect", version, about = "Serve the MCP Anywhere gateway over stdio")]
struct Args {
    #[command(flatten)]
    gateway: GatewayArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.gateway.log_level.as_deref(), "warn");

    let router = build_gateway(&args.gateway).await?;
    let token = CancellationToken::new();
    let maintenance = router.spawn_maintenance(None, token.clone());

    let stop = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.cancel();
    });

    let outcome = serve_stdio(router.clone(), tokio::io::stdin(), tokio::io::stdout(), token.clone()).await;
    token.cancel();
    let _ = maintenance.await;
    router.shutdown().await;
    outcome?;

    // A pending blocking read on stdin would keep the runtime from exiting.
    std::process::exit(0);
}
