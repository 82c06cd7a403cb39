//! Multiplexed session over the authenticated relay transport.
//!
//! The yamux connection is owned by a single driver task. Everything else
//! talks to it through [`Control`] (open streams, close, liveness) or, for
//! inbound streams, through [`Session::accept_stream`].

use futures_util::future::poll_fn;
use std::{
    collections::VecDeque,
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::{
    compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};
use yamux::{Connection, ConnectionError, Mode};

use crate::stream::WriteTimeout;

/// One logical stream inside a session, usable with tokio IO.
pub type ProxyStream = Compat<yamux::Stream>;

type OpenReply = oneshot::Sender<Result<yamux::Stream, ConnectionError>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("multiplexer error: {0}")]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound for each stream's receive window.
    pub max_stream_window: usize,
    pub max_streams: usize,
    /// TCP keep-alive interval for the underlying transport.
    pub keepalive_interval: Duration,
    /// A transport write stalled for this long fails the session.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_stream_window: 256 * 1024,
            max_streams: 512,
            keepalive_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    fn yamux_config(&self) -> yamux::Config {
        let mut config = yamux::Config::default();
        config.set_max_num_streams(self.max_streams);
        // yamux caps each stream's window at connection window / max streams.
        config.set_max_connection_receive_window(Some(self.max_stream_window * self.max_streams));
        config
    }
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct Control {
    requests: mpsc::Sender<OpenReply>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl Control {
    pub async fn open_stream(&self) -> Result<ProxyStream, SessionError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(reply)
            .await
            .map_err(|_| SessionError::Closed)?;
        let stream = response.await.map_err(|_| SessionError::Closed)??;
        debug!(stream_id = %stream.id(), "Opened outbound stream");
        Ok(stream.compat())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.shutdown.is_cancelled()
    }

    /// Resolves once the session has terminated for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Asks the driver to close the connection. In-flight and future
    /// `open_stream`/`accept_stream` calls fail.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

pub struct Session {
    control: Control,
    inbound: mpsc::UnboundedReceiver<yamux::Stream>,
    driver: JoinHandle<()>,
}

impl Session {
    /// Starts a client-side session on an authenticated transport.
    pub fn open<T>(transport: T, config: &SessionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_mode(transport, config, Mode::Client)
    }

    pub(crate) fn with_mode<T>(transport: T, config: &SessionConfig, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let transport = WriteTimeout::new(transport, config.write_timeout).compat();
        let connection = Connection::new(transport, config.yamux_config(), mode);

        let (requests, request_rx) = mpsc::channel(32);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        let driver = tokio::spawn(drive(
            connection,
            request_rx,
            inbound_tx,
            shutdown.clone(),
            closed.clone(),
        ));

        Self {
            control: Control {
                requests,
                shutdown,
                closed,
            },
            inbound,
            driver,
        }
    }

    #[must_use]
    pub fn control(&self) -> Control {
        self.control.clone()
    }

    /// Waits for the next stream opened by the relay.
    ///
    /// An error means the session is over.
    pub async fn accept_stream(&mut self) -> Result<ProxyStream, SessionError> {
        let stream = self.inbound.recv().await.ok_or(SessionError::Closed)?;
        debug!(stream_id = %stream.id(), "Accepted inbound stream");
        Ok(stream.compat())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Closes the connection and waits for the driver to finish.
    pub async fn close(mut self) {
        self.control.close();
        if let Err(e) = (&mut self.driver).await {
            warn!(error = %e, "Session driver task failed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.control.close();
    }
}

enum Event {
    Inbound(yamux::Stream),
    Failed(ConnectionError),
    Ended,
}

async fn drive<T>(
    mut connection: Connection<T>,
    mut requests: mpsc::Receiver<OpenReply>,
    inbound: mpsc::UnboundedSender<yamux::Stream>,
    shutdown: CancellationToken,
    closed: CancellationToken,
) where
    T: futures_util::AsyncRead + futures_util::AsyncWrite + Unpin,
{
    let mut pending = VecDeque::new();

    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => None,
            event = poll_fn(|cx| poll_connection(&mut connection, &mut requests, &mut pending, cx)) => Some(event),
        };

        let Some(event) = event else {
            debug!("Closing session");
            if let Err(e) = poll_fn(|cx| connection.poll_close(cx)).await {
                debug!(error = %e, "Error while closing session");
            }
            break;
        };

        match event {
            Event::Inbound(stream) => {
                // A dropped receiver means nobody accepts anymore; the
                // stream is dropped and reset.
                let _ = inbound.send(stream);
            }
            Event::Failed(e) => {
                warn!(error = %e, "Session connection failed");
                break;
            }
            Event::Ended => {
                info!("Session closed by remote");
                break;
            }
        }
    }

    closed.cancel();
}

/// Drives the connection: serves queued open requests and yields the next
/// inbound stream or the end of the connection.
fn poll_connection<T>(
    connection: &mut Connection<T>,
    requests: &mut mpsc::Receiver<OpenReply>,
    pending: &mut VecDeque<OpenReply>,
    cx: &mut Context<'_>,
) -> Poll<Event>
where
    T: futures_util::AsyncRead + futures_util::AsyncWrite + Unpin,
{
    while let Poll::Ready(Some(reply)) = requests.poll_recv(cx) {
        pending.push_back(reply);
    }

    while !pending.is_empty() {
        match connection.poll_new_outbound(cx) {
            Poll::Ready(result) => {
                if let Some(reply) = pending.pop_front() {
                    let _ = reply.send(result);
                }
            }
            Poll::Pending => break,
        }
    }

    match connection.poll_next_inbound(cx) {
        Poll::Ready(Some(Ok(stream))) => Poll::Ready(Event::Inbound(stream)),
        Poll::Ready(Some(Err(e))) => Poll::Ready(Event::Failed(e)),
        Poll::Ready(None) => Poll::Ready(Event::Ended),
        Poll::Pending => Poll::Pending,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        time::timeout,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Agent-side session plus a server-side session standing in for the relay.
    pub(crate) fn session_pair() -> (Session, Session) {
        let (client_io, server_io) = duplex(1024 * 1024);
        let config = SessionConfig::default();
        let client = Session::open(client_io, &config);
        let server = Session::with_mode(server_io, &config, Mode::Server);
        (client, server)
    }

    #[test]
    fn default_config_uses_reference_values() {
        let config = SessionConfig::default();
        assert_eq!(config.max_stream_window, 256 * 1024);
        assert_eq!(config.keepalive_interval, Duration::from_secs(10));
        assert_eq!(config.write_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn outbound_stream_reaches_peer() {
        let (client, mut server) = session_pair();

        let mut stream = client.control().open_stream().await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut inbound = timeout(TEST_TIMEOUT, server.accept_stream())
            .await
            .unwrap()
            .unwrap();
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn inbound_stream_is_accepted() {
        let (mut client, server) = session_pair();

        let server_control = server.control();
        tokio::spawn(async move {
            let mut stream = server_control.open_stream().await.unwrap();
            stream.write_all(b"request").await.unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            assert_eq!(reply, b"response");
        });

        let mut stream = timeout(TEST_TIMEOUT, client.accept_stream())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");
        stream.write_all(b"response").await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let (client, mut server) = session_pair();
        let control = client.control();

        let mut first = control.open_stream().await.unwrap();
        let mut second = control.open_stream().await.unwrap();
        first.write_all(b"one").await.unwrap();
        second.write_all(b"two").await.unwrap();
        first.shutdown().await.unwrap();
        drop(first);

        second.shutdown().await.unwrap();
        let mut payloads = Vec::new();
        for _ in 0..2 {
            let mut stream = timeout(TEST_TIMEOUT, server.accept_stream())
                .await
                .unwrap()
                .unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            payloads.push(received);
        }
        payloads.sort();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn remote_close_ends_accept_loop() {
        let (mut client, server) = session_pair();
        let control = client.control();

        server.close().await;

        let result = timeout(TEST_TIMEOUT, client.accept_stream()).await.unwrap();
        assert!(matches!(result, Err(SessionError::Closed)));
        timeout(TEST_TIMEOUT, control.closed()).await.unwrap();
        assert!(control.is_closed());
    }

    #[tokio::test]
    async fn local_close_fails_open_stream() {
        let (client, _server) = session_pair();
        let control = client.control();

        client.close().await;

        assert!(control.is_closed());
        assert!(control.open_stream().await.is_err());
    }
}
