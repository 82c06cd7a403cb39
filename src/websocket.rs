use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use hyper::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use url::Url;

use crate::forward::authority;
use crate::http::{
    DecodeError, DecodedRequest, copy_body, parse_response_head, read_head, respond_error,
};
use crate::transport::connect_backend;

/// Raw bytes behind the `Sec-WebSocket-Key` sent when the caller gave none.
pub const PLACEHOLDER_KEY: &[u8; 16] = b"ABCDEFGHIJKLMNOP";
pub const WEBSOCKET_VERSION: &str = "13";

#[must_use]
pub fn to_websocket_scheme(scheme: &str) -> &str {
    match scheme {
        "http" => "ws",
        "https" => "wss",
        other => other,
    }
}

#[must_use]
pub fn to_http_scheme(scheme: &str) -> &str {
    match scheme {
        "ws" => "http",
        "wss" => "https",
        other => other,
    }
}

#[must_use]
pub fn placeholder_key() -> String {
    STANDARD.encode(PLACEHOLDER_KEY)
}

/// Backend WebSocket URL: the target's base path followed by the segments
/// below the mapping name, with the caller's query.
#[must_use]
pub fn websocket_url(target: &Url, remaining: &[String], query: Option<&str>) -> Url {
    let mut url = target.clone();
    let scheme = to_websocket_scheme(target.scheme());
    // Switching between special schemes cannot fail.
    let _ = url.set_scheme(scheme);

    let remaining = remaining.join("/");
    if !remaining.is_empty() {
        let base = target.path().trim_end_matches('/');
        url.set_path(&format!("{base}/{remaining}"));
    }
    url.set_query(query);
    url
}

fn with_scheme(url: &Url, scheme: &str) -> Url {
    let mut url = url.clone();
    let _ = url.set_scheme(scheme);
    url
}

fn request_target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

/// Fills in whatever the caller left out of a valid upgrade request.
fn prepare_upgrade(request: &mut DecodedRequest, url: &Url) -> Result<(), DecodeError> {
    request.uri = request_target(url).parse()?;
    request.version = 1;

    if !request
        .header("upgrade")
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    {
        request.set_header("Upgrade", "websocket");
    }
    if !request
        .header("connection")
        .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"))
    {
        request.set_header("Connection", "Upgrade");
    }
    if request.header("sec-websocket-key").is_none() {
        request.set_header("Sec-WebSocket-Key", &placeholder_key());
    }
    if request.header("sec-websocket-version").is_none() {
        request.set_header("Sec-WebSocket-Version", WEBSOCKET_VERSION);
    }
    if request.header("host").is_none() {
        request.set_header("Host", &authority(url));
    }
    Ok(())
}

/// Performs the upgrade with the backend on the caller's behalf, then splices
/// the proxy stream and the backend connection together.
///
/// The backend's handshake response reaches the caller verbatim; only a
/// `101` starts the relay. Ends as soon as either direction stops.
pub async fn relay<S>(
    client: &mut S,
    mut request: DecodedRequest,
    target: &Url,
    remaining: &[String],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let url = websocket_url(target, remaining, request.query());
    let dial_url = with_scheme(&url, to_http_scheme(url.scheme()));
    info!(url = %url, "Connecting to WebSocket backend");

    let backend = match connect_backend(&dial_url).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(url = %url, error = %e, "Failed to connect to WebSocket backend");
            respond_error(client, StatusCode::BAD_GATEWAY, "WebSocket server unavailable").await;
            return Ok(());
        }
    };

    prepare_upgrade(&mut request, &url).context("Invalid WebSocket backend URL")?;
    let mut backend = BufReader::new(backend);
    backend
        .write_all(&request.head_bytes())
        .await
        .context("Failed to send upgrade request to WebSocket backend")?;
    backend.flush().await?;

    let head = read_head(&mut backend)
        .await
        .context("Failed to read upgrade response from WebSocket backend")?;
    let response = parse_response_head(&head)
        .context("Invalid upgrade response from WebSocket backend")?;

    client.write_all(&head).await?;

    if response.status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        warn!(status = response.status, url = %url, "WebSocket backend refused upgrade");
        let bytes = copy_body(&mut backend, client, response.framing)
            .await
            .context("Failed to relay refusal body from WebSocket backend")?;
        client.flush().await?;
        debug!(bytes, "Refusal body relayed");
        return Ok(());
    }
    client.flush().await?;
    info!(url = %url, "WebSocket upgrade complete, relaying");

    // Frames the backend sent right after its 101 are still in the buffer
    // and go out first.
    let (mut backend_rx, mut backend_tx) = tokio::io::split(backend);
    let (mut client_rx, mut client_tx) = tokio::io::split(client);

    let (direction, result) = tokio::select! {
        result = tokio::io::copy(&mut client_rx, &mut backend_tx) => ("client to backend", result),
        result = tokio::io::copy(&mut backend_rx, &mut client_tx) => ("backend to client", result),
    };
    match result {
        Ok(bytes) => debug!(direction, bytes, "WebSocket relay direction finished"),
        Err(e) => debug!(direction, error = %e, "WebSocket relay direction failed"),
    }

    let _ = backend_tx.shutdown().await;
    info!(url = %url, "WebSocket connection closed");
    Ok(())
}
