//! Newline-delimited JSON-RPC over standard input/output.
//!
//! One line in, one message; one message out, one line. Lines that fail to
//! parse are logged and skipped so a garbled frame never takes the session
//! down.

use crate::server::McpServer;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use toolbus_protocol::JsonRpcMessage;
use tracing::debug;
use tracing::error;

/// Serve one session over stdin/stdout until EOF. Returns once the peer
/// closes its end and the writer has drained.
pub async fn run_stdio_server(server: Arc<McpServer>) -> std::io::Result<()> {
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    let session = server.connect(outgoing_tx);
    debug!(session = %session.id(), "stdio transport up");

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outgoing_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    error!("failed to serialize outgoing message: {err}");
                    continue;
                }
            };
            if stdout.write_all(json.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRpcMessage>(&line) {
            Ok(message) => session.handle_message(message).await,
            Err(err) => {
                // Framing errors never propagate; drop the line and move on.
                error!("skipping malformed frame: {err}");
            }
        }
    }

    session.close().await;
    drop(session);
    let _ = writer.await;
    Ok(())
}
