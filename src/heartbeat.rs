use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::session::Control;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const PING: &[u8; 4] = b"ping";
pub const PONG: &str = "pong";

/// Periodic ping/pong over a fresh stream for as long as the session lives.
///
/// Purely observational: failures are logged and never close the session.
/// Returns once the session has closed.
pub async fn run(control: Control, interval: Duration) {
    loop {
        if control.is_closed() {
            break;
        }

        tokio::select! {
            () = control.closed() => break,
            result = beat(&control) => match result {
                Ok(reply) if reply.contains(PONG) => debug!("Heartbeat ok"),
                Ok(reply) => warn!(reply = %reply, "Heartbeat: unexpected reply"),
                Err(e) => warn!(error = %e, "Heartbeat failed"),
            },
        }

        tokio::select! {
            () = control.closed() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Heartbeat stopped: session closed");
}

/// One exchange: write the ping, read until the relay closes the stream.
pub async fn beat(control: &Control) -> Result<String> {
    let mut stream = control
        .open_stream()
        .await
        .context("Failed to open heartbeat stream")?;

    let result = async {
        stream.write_all(PING).await.context("Failed to write ping")?;
        stream.flush().await.context("Failed to flush ping")?;

        let mut reply = Vec::new();
        stream
            .read_to_end(&mut reply)
            .await
            .context("Failed to read pong")?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
    .await;

    let _ = stream.shutdown().await;
    result
}
