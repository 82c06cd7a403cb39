use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, StreamBody, combinators::UnsyncBoxBody};
use hyper::{
    Request, Response, StatusCode,
    body::{Frame, Incoming},
    client::conn::http1,
    header::{HOST, TRANSFER_ENCODING},
};
use hyper_util::rt::TokioIo;
use std::io;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::http::{
    BodyFraming, BodyReader, DecodeError, DecodedRequest, encode_chunk, last_chunk,
    respond_error, response_head,
};
use crate::transport::connect_backend;

/// Body pieces queued between the proxy stream and the backend connection.
const BODY_CHANNEL_DEPTH: usize = 8;

type OutboundBody = UnsyncBoxBody<Bytes, io::Error>;
type BodySender = mpsc::Sender<io::Result<Frame<Bytes>>>;

/// Request target sent to the backend: the path below the mapping name plus
/// the original query.
#[must_use]
pub fn backend_target(remaining: &[String], query: Option<&str>) -> String {
    let mut target = format!("/{}", remaining.join("/"));
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// `host[:port]` of a target URL, as used in a `Host` header.
#[must_use]
pub fn authority(target: &Url) -> String {
    let host = target.host_str().unwrap_or_default();
    match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Reissues `request` against the local service and streams the response
/// back onto `stream`.
///
/// The request body is read from `stream` while it is being sent, never
/// buffered whole. An unreachable backend is answered with
/// `502 Local service unavailable`.
pub async fn forward<S>(
    stream: &mut S,
    request: DecodedRequest,
    target: &Url,
    remaining: &[String],
) -> Result<()>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let path = backend_target(remaining, request.query());
    let head_only = request.method.eq_ignore_ascii_case("HEAD");
    let framing = request.framing()?;

    let (body, body_tx) = outbound_body(framing);
    let outbound = build_request(request, &path, target, body)?;
    info!(
        method = %outbound.method(),
        target = %target,
        path = %path,
        "Forwarding request to local service"
    );

    let response = match send(&mut *stream, framing, body_tx, target, outbound).await {
        Ok(response) => response,
        Err(e) => {
            warn!(
                target = %target,
                error = %format!("{e:#}"),
                "Failed to forward request to local service"
            );
            respond_error(stream, StatusCode::BAD_GATEWAY, "Local service unavailable").await;
            return Ok(());
        }
    };

    debug!(status = response.status().as_u16(), "Local service responded");
    write_response(stream, response, head_only)
        .await
        .context("Failed to write response to stream")
}

/// A body fed through a channel, or an empty one when nothing follows the
/// head.
fn outbound_body(framing: BodyFraming) -> (OutboundBody, Option<BodySender>) {
    if framing == BodyFraming::Empty {
        let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync();
        return (body, None);
    }

    let (tx, mut rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
    let frames = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
    (StreamBody::new(frames).boxed_unsync(), Some(tx))
}

fn build_request(
    request: DecodedRequest,
    path: &str,
    target: &Url,
    body: OutboundBody,
) -> Result<Request<OutboundBody>> {
    let mut builder = Request::builder().method(request.method.as_str()).uri(path);

    let mut has_host = false;
    for (name, value) in &request.headers {
        has_host |= name.eq_ignore_ascii_case(HOST.as_str());
        builder = builder.header(name.as_str(), value.as_slice());
    }
    if !has_host {
        builder = builder.header(HOST, authority(target));
    }

    builder
        .body(body)
        .context("Failed to build request for local service")
}

/// Sends the request while pumping its body from `reader` into the channel.
async fn send<R>(
    reader: &mut R,
    framing: BodyFraming,
    body_tx: Option<BodySender>,
    target: &Url,
    request: Request<OutboundBody>,
) -> Result<Response<Incoming>>
where
    R: AsyncBufRead + Unpin,
{
    let backend = connect_backend(target).await?;
    let (mut sender, connection) = http1::handshake(TokioIo::new(backend))
        .await
        .context("HTTP handshake with local service failed")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Local service connection closed");
        }
    });

    let response = sender.send_request(request);
    let Some(body_tx) = body_tx else {
        return response.await.context("Local service did not answer");
    };

    let pump = pump_body(reader, framing, body_tx);
    tokio::pin!(response, pump);
    let mut pumping = true;
    loop {
        tokio::select! {
            result = &mut response => return result.context("Local service did not answer"),
            result = &mut pump, if pumping => {
                pumping = false;
                match result {
                    Ok(bytes) => debug!(bytes, "Request body sent"),
                    Err(e) => debug!(error = %e, "Request body ended early"),
                }
            }
        }
    }
}

/// Moves the request body from the proxy stream to the backend. A decode
/// failure is passed on so the backend request fails too.
async fn pump_body<R>(
    reader: &mut R,
    framing: BodyFraming,
    tx: BodySender,
) -> Result<u64, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = BodyReader::new(reader, framing);
    let mut bytes = 0u64;
    loop {
        match body.next_chunk().await {
            Ok(Some(data)) => {
                bytes += data.len() as u64;
                if tx.send(Ok(Frame::data(data))).await.is_err() {
                    // Backend stopped reading.
                    return Ok(bytes);
                }
            }
            Ok(None) => return Ok(bytes),
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                return Err(e);
            }
        }
    }
}

/// Writes the backend response onto the proxy stream.
///
/// Headers are passed through unchanged; a chunked body is chunk-encoded
/// again since hyper hands out decoded data.
async fn write_response<S>(stream: &mut S, response: Response<Incoming>, head_only: bool) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let (parts, mut body) = response.into_parts();
    let chunked = parts
        .headers
        .get(TRANSFER_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));
    let has_body = !head_only
        && !parts.status.is_informational()
        && parts.status != StatusCode::NO_CONTENT
        && parts.status != StatusCode::NOT_MODIFIED;
    let framed = chunked && has_body;

    stream
        .write_all(&response_head(parts.version, parts.status, &parts.headers))
        .await?;

    let mut bytes = 0;
    while let Some(frame) = body.frame().await {
        let frame = frame.context("Failed to read response body from local service")?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        bytes += data.len();
        if framed {
            stream.write_all(&encode_chunk(&data)).await?;
        } else {
            stream.write_all(&data).await?;
        }
    }
    if framed {
        stream.write_all(last_chunk()).await?;
    }
    stream.flush().await?;

    debug!(status = parts.status.as_u16(), bytes, "Response relayed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::read_request;
    use crate::test_support::{spawn_http_backend, spawn_silent_backend, unused_port};
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, BufReader, duplex},
        time::timeout,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Sends `raw` down a proxy stream, runs the forwarder on the other end
    /// and returns everything it wrote back.
    async fn forward_raw(raw: &[u8], target: &str, remaining: &[&str]) -> Vec<u8> {
        let target = Url::parse(target).unwrap();
        let remaining: Vec<String> = remaining.iter().map(ToString::to_string).collect();

        let (agent, mut relay) = duplex(64 * 1024);
        relay.write_all(raw).await.unwrap();
        relay.shutdown().await.unwrap();

        let task = tokio::spawn(async move {
            let mut agent = BufReader::new(agent);
            let request = read_request(&mut agent).await.unwrap();
            forward(&mut agent, request, &target, &remaining).await.unwrap();
            agent.shutdown().await.unwrap();
        });

        let mut output = Vec::new();
        timeout(TEST_TIMEOUT, relay.read_to_end(&mut output))
            .await
            .unwrap()
            .unwrap();
        task.await.unwrap();
        output
    }

    mod targets {
        use super::*;

        #[test]
        fn strips_mapping_segment() {
            let remaining = vec!["api".to_string(), "v1".to_string(), "sysinfo".to_string()];
            assert_eq!(backend_target(&remaining, None), "/api/v1/sysinfo");
        }

        #[test]
        fn keeps_query() {
            let remaining = vec!["a".to_string(), "b".to_string()];
            assert_eq!(backend_target(&remaining, Some("x=1")), "/a/b?x=1");
        }

        #[test]
        fn bare_mapping_maps_to_root() {
            assert_eq!(backend_target(&[], None), "/");
        }

        #[test]
        fn authority_includes_explicit_port() {
            assert_eq!(authority(&Url::parse("http://127.0.0.1:5244").unwrap()), "127.0.0.1:5244");
            assert_eq!(authority(&Url::parse("http://localhost/").unwrap()), "localhost");
        }
    }

    mod proxying {
        use super::*;

        #[tokio::test]
        async fn relays_backend_response() {
            let (port, received) = spawn_http_backend(
                b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"ok\":true}",
            )
            .await;

            let output = forward_raw(
                b"GET /alist/api/v1/sysinfo HTTP/1.1\r\nHost: relay.example.com\r\n\r\n",
                &format!("http://127.0.0.1:{port}"),
                &["api", "v1", "sysinfo"],
            )
            .await;

            let output = String::from_utf8(output).unwrap();
            assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(output.contains("content-type: application/json\r\n"));
            assert!(output.ends_with("\r\n\r\n{\"ok\":true}"));

            let (request, body) = received.await.unwrap();
            assert_eq!(request.method, "GET");
            assert_eq!(request.target(), "/api/v1/sysinfo");
            assert_eq!(request.header("host"), Some("relay.example.com"));
            assert_eq!(request.header("transfer-encoding"), None);
            assert!(body.is_empty());
        }

        #[tokio::test]
        async fn preserves_method_headers_body_and_query() {
            let (port, received) =
                spawn_http_backend(b"HTTP/1.1 204 No Content\r\n\r\n").await;

            let output = forward_raw(
                b"POST /alist/a/b?x=1 HTTP/1.1\r\nHost: relay.example.com\r\nX-Custom: kept\r\nContent-Length: 3\r\n\r\nabc",
                &format!("http://127.0.0.1:{port}"),
                &["a", "b"],
            )
            .await;
            assert!(output.starts_with(b"HTTP/1.1 204 No Content\r\n"));

            let (request, body) = received.await.unwrap();
            assert_eq!(request.method, "POST");
            assert_eq!(request.target(), "/a/b?x=1");
            assert_eq!(request.header("x-custom"), Some("kept"));
            assert_eq!(request.header("content-length"), Some("3"));
            assert_eq!(body, b"abc");
        }

        #[tokio::test]
        async fn chunked_upload_is_streamed() {
            let (port, received) =
                spawn_http_backend(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n").await;

            let output = forward_raw(
                b"PUT /alist/fs/put HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
                &format!("http://127.0.0.1:{port}"),
                &["fs", "put"],
            )
            .await;
            assert!(output.starts_with(b"HTTP/1.1 201 Created\r\n"));

            let (request, body) = received.await.unwrap();
            assert!(request.is_chunked());
            assert_eq!(body, b"hello world");
        }

        #[tokio::test]
        async fn truncated_upload_fails_without_buffering() {
            let (port, received) = spawn_silent_backend().await;

            let output = forward_raw(
                b"POST /alist/fs/put HTTP/1.1\r\nHost: h\r\nContent-Length: 1099511627776\r\n\r\nabc",
                &format!("http://127.0.0.1:{port}"),
                &["fs", "put"],
            )
            .await;

            let output = String::from_utf8(output).unwrap();
            assert!(output.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
            assert!(output.ends_with("Local service unavailable"));

            let seen = timeout(TEST_TIMEOUT, received).await.unwrap().unwrap();
            // Whatever reached the backend is a prefix of what was sent.
            assert!(b"abc".starts_with(&seen));
        }

        #[tokio::test]
        async fn missing_host_uses_target_authority() {
            let (port, received) =
                spawn_http_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;

            forward_raw(
                b"GET /alist/ HTTP/1.1\r\n\r\n",
                &format!("http://127.0.0.1:{port}"),
                &[""],
            )
            .await;

            let (request, _) = received.await.unwrap();
            let expected = format!("127.0.0.1:{port}");
            assert_eq!(request.header("host"), Some(expected.as_str()));
        }

        #[tokio::test]
        async fn chunked_response_is_reframed() {
            let (port, _received) = spawn_http_backend(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
            )
            .await;

            let output = forward_raw(
                b"GET /alist/file HTTP/1.1\r\nHost: h\r\n\r\n",
                &format!("http://127.0.0.1:{port}"),
                &["file"],
            )
            .await;

            let output = String::from_utf8(output).unwrap();
            assert!(output.contains("transfer-encoding: chunked\r\n"));
            assert!(output.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
        }

        #[tokio::test]
        async fn unreachable_backend_is_bad_gateway() {
            let port = unused_port().await;

            let output = forward_raw(
                b"GET /alist/x HTTP/1.1\r\nHost: h\r\n\r\n",
                &format!("http://127.0.0.1:{port}"),
                &["x"],
            )
            .await;

            let output = String::from_utf8(output).unwrap();
            assert!(output.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
            assert!(output.ends_with("Local service unavailable"));
        }
    }
}
