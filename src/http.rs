//! HTTP/1.x plumbing for proxy streams: decoding the embedded request,
//! rendering response heads and the agent's own error responses.

use bytes::Bytes;
use hyper::{HeaderMap, StatusCode, Uri, Version, http::uri::InvalidUri};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upper bound for a request or response head.
pub const MAX_HEAD_LEN: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE_LEN: u64 = 4096;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed HTTP message: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("incomplete HTTP head")]
    Incomplete,
    #[error("HTTP head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,
    #[error("invalid request target: {0}")]
    InvalidTarget(#[from] InvalidUri),
    #[error("invalid body framing: {0}")]
    InvalidBody(String),
}

/// How the body following a head is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Response body that runs until the peer closes.
    UntilClose,
}

impl BodyFraming {
    /// Transfer-Encoding chunked wins over Content-Length.
    fn from_headers(
        transfer_encoding: Option<&str>,
        content_length: Option<&str>,
    ) -> Result<Option<Self>, DecodeError> {
        if transfer_encoding.is_some_and(|value| value.to_ascii_lowercase().contains("chunked")) {
            return Ok(Some(Self::Chunked));
        }
        content_length
            .map(|value| match value.trim().parse::<u64>() {
                Ok(0) => Ok(Self::Empty),
                Ok(len) => Ok(Self::Length(len)),
                Err(_) => Err(DecodeError::InvalidBody(format!(
                    "invalid Content-Length {value:?}"
                ))),
            })
            .transpose()
    }
}

/// Head of a request read off a proxy stream. The body stays in the
/// stream and is read with [`BodyReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub method: String,
    /// Request target, origin-form or absolute-form.
    pub uri: Uri,
    /// Minor version of HTTP/1.x.
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl DecodedRequest {
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Path plus optional `?query`, as sent in an origin-form request line.
    #[must_use]
    pub fn target(&self) -> &str {
        self.uri.path_and_query().map_or("/", |target| target.as_str())
    }

    /// First value of `name`, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
    }

    /// Replaces every value of `name` with `value`.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers
            .push((name.to_string(), value.as_bytes().to_vec()));
    }

    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.framing().is_ok_and(|framing| framing == BodyFraming::Chunked)
    }

    /// Requests without Content-Length or chunked encoding carry no body.
    pub fn framing(&self) -> Result<BodyFraming, DecodeError> {
        Ok(BodyFraming::from_headers(
            self.header("transfer-encoding"),
            self.header("content-length"),
        )?
        .unwrap_or(BodyFraming::Empty))
    }

    /// Request line and headers for a raw HTTP/1.1 connection. The body, if
    /// any, follows separately.
    #[must_use]
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} HTTP/1.{}\r\n",
            self.method,
            self.target(),
            self.version
        )
        .into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Reads a request head and checks its body framing. The body itself is
/// left in `reader`.
pub async fn read_request<R>(reader: &mut R) -> Result<DecodedRequest, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader).await?;
    let request = parse_request_head(&head)?;
    request.framing()?;
    Ok(request)
}

pub fn parse_request_head(head: &[u8]) -> Result<DecodedRequest, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(head)?.is_partial() {
        return Err(DecodeError::Incomplete);
    }

    Ok(DecodedRequest {
        method: req.method.unwrap_or_default().to_string(),
        uri: req.path.unwrap_or_default().parse()?,
        version: req.version.unwrap_or(1),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    })
}

/// Status line facts needed to relay a backend response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub framing: BodyFraming,
}

pub fn parse_response_head(head: &[u8]) -> Result<ResponseHead, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    if resp.parse(head)?.is_partial() {
        return Err(DecodeError::Incomplete);
    }

    let status = resp.code.unwrap_or_default();
    let header = |name: &str| {
        resp.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
    };
    let framing = if (100..200).contains(&status) || status == 204 || status == 304 {
        BodyFraming::Empty
    } else {
        BodyFraming::from_headers(header("transfer-encoding"), header("content-length"))?
            .unwrap_or(BodyFraming::UntilClose)
    };

    Ok(ResponseHead { status, framing })
}

/// Reads bytes up to and including the blank line ending an HTTP head.
///
/// Leading empty lines are skipped. Bytes after the head stay buffered in
/// `reader`.
pub async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let limit = (MAX_HEAD_LEN - head.len()) as u64;
        let line_start = head.len();
        let n = (&mut *reader)
            .take(limit)
            .read_until(b'\n', &mut head)
            .await?;

        if n == 0 {
            return Err(if head.is_empty() {
                io::Error::from(io::ErrorKind::UnexpectedEof).into()
            } else {
                DecodeError::Incomplete
            });
        }
        if !head.ends_with(b"\n") {
            return Err(if head.len() >= MAX_HEAD_LEN {
                DecodeError::HeadTooLarge
            } else {
                DecodeError::Incomplete
            });
        }

        let line = &head[line_start..];
        if line == b"\r\n" || line == b"\n" {
            if line_start == 0 {
                head.clear();
                continue;
            }
            return Ok(head);
        }
        if head.len() >= MAX_HEAD_LEN {
            return Err(DecodeError::HeadTooLarge);
        }
    }
}

const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[must_use]
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// Terminating chunk plus empty trailer section.
#[must_use]
pub const fn last_chunk() -> &'static [u8] {
    LAST_CHUNK
}

#[derive(Debug, Clone, Copy)]
enum BodyState {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    UntilClose,
    Done,
}

/// Yields a message body piece by piece with its transfer framing removed.
///
/// Each piece is at most what `reader` already has buffered, so memory use
/// does not depend on any length the peer declares.
pub struct BodyReader<R> {
    reader: R,
    state: BodyState,
}

impl<R: AsyncBufRead + Unpin> BodyReader<R> {
    pub const fn new(reader: R, framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty => BodyState::Done,
            BodyFraming::Length(len) => BodyState::Length(len),
            BodyFraming::Chunked => BodyState::ChunkSize,
            BodyFraming::UntilClose => BodyState::UntilClose,
        };
        Self { reader, state }
    }

    /// Next piece of body data, or `None` once the body is complete.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, DecodeError> {
        loop {
            match self.state {
                BodyState::Done | BodyState::Length(0) => {
                    self.state = BodyState::Done;
                    return Ok(None);
                }
                BodyState::Length(remaining) => {
                    let data = read_some(&mut self.reader, remaining).await?;
                    self.state = BodyState::Length(remaining - data.len() as u64);
                    return Ok(Some(data));
                }
                BodyState::ChunkData(0) => {
                    if !read_chunk_line(&mut self.reader).await?.is_empty() {
                        return Err(DecodeError::InvalidBody(
                            "chunk data not followed by CRLF".to_string(),
                        ));
                    }
                    self.state = BodyState::ChunkSize;
                }
                BodyState::ChunkData(remaining) => {
                    let data = read_some(&mut self.reader, remaining).await?;
                    self.state = BodyState::ChunkData(remaining - data.len() as u64);
                    return Ok(Some(data));
                }
                BodyState::ChunkSize => {
                    let line = read_chunk_line(&mut self.reader).await?;
                    let size_field = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_field, 16).map_err(|_| {
                        DecodeError::InvalidBody(format!("invalid chunk size {size_field:?}"))
                    })?;
                    if size == 0 {
                        self.skip_trailers().await?;
                        self.state = BodyState::Done;
                    } else {
                        self.state = BodyState::ChunkData(size);
                    }
                }
                BodyState::UntilClose => {
                    let data = self.reader.fill_buf().await?;
                    if data.is_empty() {
                        self.state = BodyState::Done;
                        continue;
                    }
                    let data = Bytes::copy_from_slice(data);
                    self.reader.consume(data.len());
                    return Ok(Some(data));
                }
            }
        }
    }

    /// Trailers are dropped.
    async fn skip_trailers(&mut self) -> Result<(), DecodeError> {
        for _ in 0..MAX_HEADERS {
            if read_chunk_line(&mut self.reader).await?.is_empty() {
                return Ok(());
            }
        }
        Err(DecodeError::InvalidBody("too many trailers".to_string()))
    }
}

/// Takes up to `limit` buffered bytes; EOF before that is an error.
async fn read_some<R>(reader: &mut R, limit: u64) -> Result<Bytes, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let buf = reader.fill_buf().await?;
    if buf.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "body ended early").into());
    }
    let len = usize::try_from(limit).map_or(buf.len(), |limit| buf.len().min(limit));
    let data = Bytes::copy_from_slice(&buf[..len]);
    reader.consume(len);
    Ok(data)
}

async fn read_chunk_line<R>(reader: &mut R) -> Result<String, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    (&mut *reader)
        .take(MAX_CHUNK_LINE_LEN)
        .read_until(b'\n', &mut line)
        .await?;
    if !line.ends_with(b"\n") {
        return Err(DecodeError::InvalidBody(
            "unterminated chunk line".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&line).trim_end().to_string())
}

/// Copies a body from `reader` to `writer` as it arrives. Chunked bodies are
/// re-chunked, everything else is written as is.
pub async fn copy_body<R, W>(
    reader: R,
    writer: &mut W,
    framing: BodyFraming,
) -> Result<u64, DecodeError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut body = BodyReader::new(reader, framing);
    let mut copied = 0u64;
    while let Some(data) = body.next_chunk().await? {
        copied += data.len() as u64;
        if framing == BodyFraming::Chunked {
            writer.write_all(&encode_chunk(&data)).await?;
        } else {
            writer.write_all(&data).await?;
        }
    }
    if framing == BodyFraming::Chunked {
        writer.write_all(LAST_CHUNK).await?;
    }
    Ok(copied)
}

/// Status line and headers of a response, ready to be written to a stream.
#[must_use]
pub fn response_head(version: Version, status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut out = format!(
        "{version:?} {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    )
    .into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// A complete `text/plain` response generated by the agent itself.
#[must_use]
pub fn error_response(status: StatusCode, message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{message}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        message.len(),
    )
    .into_bytes()
}

/// Best-effort error response; the stream is abandoned either way.
pub async fn respond_error<W>(stream: &mut W, status: StatusCode, message: &str)
where
    W: AsyncWrite + Unpin,
{
    let response = error_response(status, message);
    if let Err(e) = async {
        stream.write_all(&response).await?;
        stream.flush().await
    }
    .await
    {
        debug!(error = %e, status = status.as_u16(), "Failed to write error response");
    }
}
