//! Dialing the relay and local backends.
//!
//! No retries happen here; the supervisor owns reconnect policy.

use socket2::{SockRef, TcpKeepalive};
use std::{io, time::Duration};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, rustls::pki_types::ServerName};
use tracing::debug;
use url::Url;

use crate::stream::StreamType;
use crate::tls::backend_connector;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),
    #[error("TLS handshake with {address} failed: {source}")]
    Tls {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("target URL has no host: {0}")]
    MissingHost(String),
}

/// Opens the relay transport.
///
/// `tls` is `None` for plaintext. TCP keep-alive is enabled with the
/// given interval so a dead relay is noticed even while the tunnel is idle.
pub async fn connect(
    address: &str,
    tls: Option<&TlsConnector>,
    keepalive: Duration,
) -> Result<StreamType, ConnectError> {
    let tcp = TcpStream::connect(address)
        .await
        .map_err(|source| ConnectError::Connect {
            address: address.to_string(),
            source,
        })?;

    let keepalive = TcpKeepalive::new()
        .with_time(keepalive)
        .with_interval(keepalive);
    if let Err(e) = SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "Failed to enable TCP keep-alive");
    }
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "Failed to disable Nagle's algorithm");
    }

    match tls {
        Some(connector) => {
            let stream = handshake_tls(connector, tcp, host_of(address), address).await?;
            Ok(StreamType::Tls(Box::new(stream)))
        }
        None => Ok(StreamType::Plain(tcp)),
    }
}

/// Opens a connection to the local service behind `target`.
///
/// `https` and `wss` targets are dialed under verifying TLS.
pub async fn connect_backend(target: &Url) -> Result<StreamType, ConnectError> {
    let host = target
        .host_str()
        .ok_or_else(|| ConnectError::MissingHost(target.to_string()))?;
    let port = target
        .port_or_known_default()
        .ok_or_else(|| ConnectError::MissingHost(target.to_string()))?;
    let address = format!("{host}:{port}");

    let tcp = TcpStream::connect(&address)
        .await
        .map_err(|source| ConnectError::Connect {
            address: address.clone(),
            source,
        })?;

    if matches!(target.scheme(), "https" | "wss") {
        let stream = handshake_tls(&backend_connector(), tcp, host, &address).await?;
        Ok(StreamType::Tls(Box::new(stream)))
    } else {
        Ok(StreamType::Plain(tcp))
    }
}

async fn handshake_tls(
    connector: &TlsConnector,
    tcp: TcpStream,
    host: &str,
    address: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectError> {
    let server_name = ServerName::try_from(host.trim_matches(['[', ']']).to_string())
        .map_err(|_| ConnectError::InvalidServerName(host.to_string()))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|source| ConnectError::Tls {
            address: address.to_string(),
            source,
        })
}

/// Host part of a `host:port` address.
fn host_of(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map_or(address, |(host, _port)| host)
}
