use anyhow::{Result, bail};
use hyper::StatusCode;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ServiceMapping;
use crate::http::{DecodedRequest, read_request, respond_error};
use crate::{forward, websocket};

/// Path prefixes routed to the WebSocket relay regardless of headers.
const WEBSOCKET_PATH_PREFIXES: [&str; 2] = ["/api/ws", "/ws"];

/// Path segments with surrounding slashes removed. Never empty: a bare `/`
/// yields a single empty segment.
#[must_use]
pub fn split_path(path: &str) -> Vec<String> {
    path.trim_matches('/').split('/').map(str::to_string).collect()
}

/// Upgrade headers, or a path that only WebSocket clients use.
#[must_use]
pub fn is_websocket(request: &DecodedRequest) -> bool {
    let upgrade = request
        .header("upgrade")
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    let connection = request
        .header("connection")
        .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"));
    let path = request.path();

    (upgrade && connection)
        || WEBSOCKET_PATH_PREFIXES
            .iter()
            .any(|prefix| path.starts_with(prefix))
}

/// Parses a configured base URL. Only absolute URLs with a host are usable.
pub fn parse_target(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)?;
    if url.host_str().is_none() {
        bail!("target {raw:?} has no host");
    }
    Ok(url)
}

/// Serves one relay-opened stream: a single HTTP request, routed by the first
/// path segment to a local service.
///
/// The stream is closed when this returns, whatever the outcome.
#[tracing::instrument(skip_all)]
pub async fn handle_stream<S>(stream: S, services: Arc<ServiceMapping>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut stream = BufReader::new(stream);

    if let Err(e) = dispatch(&mut stream, &services).await {
        warn!(error = %format!("{e:#}"), "Proxy stream failed");
    }

    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Failed to close proxy stream");
    }
}

async fn dispatch<S>(stream: &mut BufReader<S>, services: &ServiceMapping) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_request(stream).await {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Failed to read request from stream");
            return Ok(());
        }
    };
    info!(method = %request.method, target = %request.uri, "Received request");

    let segments = split_path(request.path());
    let (name, remaining) = segments
        .split_first()
        .map_or(("", &[][..]), |(name, rest)| (name.as_str(), rest));

    let Some(local) = services.resolve(name) else {
        warn!(mapping = %name, "Mapping not found");
        respond_error(stream, StatusCode::NOT_FOUND, "Mapping Not Found").await;
        return Ok(());
    };

    let upgrade = is_websocket(&request);

    let target = match parse_target(local) {
        Ok(target) => target,
        Err(e) => {
            warn!(mapping = %name, target = %local, error = %e, "Invalid target configuration");
            respond_error(stream, StatusCode::INTERNAL_SERVER_ERROR, "Invalid Target Configuration").await;
            return Ok(());
        }
    };

    if upgrade {
        debug!(mapping = %name, "Routing to WebSocket relay");
        websocket::relay(stream, request, &target, remaining).await
    } else {
        debug!(mapping = %name, "Routing to HTTP forwarder");
        forward::forward(stream, request, &target, remaining).await
    }
}
