//! Line-delimited JSON-RPC over a pair of byte streams.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::GatewayRouter;
use crate::server::{InFlight, handle_payload};

/// Serves `router` over `input`/`output` until EOF or `shutdown`.
///
/// Every line is answered on its own task; a single writer task owns
/// `output` so replies never interleave. EOF cancels everything still in
/// flight.
pub async fn serve_stdio<R, W>(router: Arc<GatewayRouter>, input: R, output: W, shutdown: CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = receiver.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let in_flight = InFlight::new();
    let requests = shutdown.child_token();
    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(input).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Client closed stdin");
                break;
            }
            Err(error) => {
                warn!("Failed to read from stdin: {}", error);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let router = Arc::clone(&router);
        let in_flight = Arc::clone(&in_flight);
        let requests = requests.clone();
        let sender = sender.clone();
        tasks.spawn(async move {
            if let Some(reply) = handle_payload(&router, &in_flight, &line, &requests).await {
                let _ = sender.send(reply.to_string());
            }
        });
        while tasks.try_join_next().is_some() {}
    }

    requests.cancel();
    if !in_flight.is_empty() {
        debug!("Cancelling {} in-flight request(s)", in_flight.len());
    }
    while tasks.join_next().await.is_some() {}
    drop(sender);

    writer
        .await
        .context("stdout writer task failed")?
        .context("failed to write to stdout")?;
    Ok(())
}
