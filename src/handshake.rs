//! Line-based greeting and key exchange that precedes multiplexing.
//!
//! ```text
//! relay -> agent   SUCCESS: <greeting>   | ERROR: <reason>
//! agent -> relay   <key>\n
//! relay -> agent   SUCCESS: <accepted>   | ERROR: <reason>
//! ```

use std::{io, time::Duration};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const LINE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_LINE_LEN: usize = 1024;

const SUCCESS_PREFIX: &str = "SUCCESS:";
const ERROR_PREFIX: &str = "ERROR:";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("server closed connection or sent no response (maybe TLS required?)")]
    NoGreeting,
    #[error("server rejected connection: {0}")]
    Rejected(String),
    #[error("server rejected connection after key: {0}")]
    KeyRejected(String),
    #[error("server closed connection or sent no response after key")]
    NoResponseAfterKey,
    #[error("handshake I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Whether the relay must greet before the key is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    /// Plaintext: silence means the relay expects TLS or is not a relay.
    Required,
    /// TLS: relays may wait for the key without greeting first.
    Optional,
}

impl Greeting {
    #[must_use]
    pub const fn for_transport(tls: bool) -> Self {
        if tls { Self::Optional } else { Self::Required }
    }
}

enum Reply {
    Accepted(String),
    Rejected(String),
    Other(String),
}

impl Reply {
    fn classify(line: &str) -> Self {
        let line = line.trim();
        if line.starts_with(ERROR_PREFIX) {
            Self::Rejected(line.to_string())
        } else if line.starts_with(SUCCESS_PREFIX) {
            Self::Accepted(line.to_string())
        } else {
            Self::Other(line.to_string())
        }
    }
}

/// Runs the greeting/key exchange on a fresh transport.
///
/// A missing greeting ends the handshake only under [`Greeting::Required`].
/// On error the caller drops the transport, which closes it.
pub async fn perform<S>(
    stream: &mut S,
    key: &str,
    greeting: Greeting,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_line_timeout(stream).await {
        Ok(line) => match Reply::classify(&line) {
            Reply::Rejected(reason) => {
                warn!(reason = %reason, "Server rejected connection");
                return Err(HandshakeError::Rejected(reason));
            }
            Reply::Accepted(line) => info!(reply = %line, "Server accepted connection"),
            Reply::Other(line) => debug!(reply = %line, "Server greeting"),
        },
        Err(e) if greeting == Greeting::Optional => {
            debug!(error = %e, "No greeting from server, sending key anyway");
        }
        Err(e) => {
            debug!(error = %e, "No greeting from server");
            return Err(HandshakeError::NoGreeting);
        }
    }

    stream.write_all(format!("{key}\n").as_bytes()).await?;
    stream.flush().await?;

    let response = read_line_timeout(stream).await.map_err(|e| {
        debug!(error = %e, "No response from server after key");
        HandshakeError::NoResponseAfterKey
    })?;
    match Reply::classify(&response) {
        Reply::Rejected(reason) => {
            warn!(reason = %reason, "Server rejected key");
            Err(HandshakeError::KeyRejected(reason))
        }
        Reply::Accepted(line) => {
            info!(reply = %line, "Server validated key");
            Ok(())
        }
        Reply::Other(line) => {
            debug!(reply = %line, "Server response after key");
            Ok(())
        }
    }
}

async fn read_line_timeout<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<String> {
    tokio::time::timeout(LINE_TIMEOUT, read_line(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for line"))?
}

/// Reads one `\n`-terminated line a byte at a time.
///
/// Unbuffered on purpose: whatever follows the line belongs to the
/// multiplexer and must stay in the transport.
async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = match stream.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && !line.is_empty() => break,
            Err(e) => return Err(e),
        };
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_LINE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake line too long",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
