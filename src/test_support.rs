//! Loopback backends shared by the proxy tests.

use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::oneshot,
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring,
        pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
    },
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::handshake::server::{Request, Response},
};

use crate::http::{BodyReader, DecodedRequest, read_request};

/// A port nothing listens on.
pub(crate) async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// One-shot HTTP backend: reads a single request with its body, answers
/// with `response` verbatim and closes. The request is handed back.
pub(crate) async fn spawn_http_backend(
    response: &'static [u8],
) -> (u16, oneshot::Receiver<(DecodedRequest, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = BufReader::new(socket);
        let request = read_request(&mut socket).await.unwrap();

        let mut body = Vec::new();
        let mut reader = BodyReader::new(&mut socket, request.framing().unwrap());
        while let Some(data) = reader.next_chunk().await.unwrap() {
            body.extend_from_slice(&data);
        }

        socket.write_all(response).await.unwrap();
        let _ = socket.shutdown().await;
        let _ = tx.send((request, body));
    });

    (port, rx)
}

/// HTTP backend that never answers. Hands back the raw bytes received after
/// the request head once the agent drops the connection.
pub(crate) async fn spawn_silent_backend() -> (u16, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = BufReader::new(socket);
        let mut rest = Vec::new();
        if read_request(&mut socket).await.is_ok() {
            let _ = socket.read_to_end(&mut rest).await;
        }
        let _ = tx.send(rest);
    });

    (port, rx)
}

/// WebSocket echo backend for a single connection. Yields the request target
/// seen during the handshake.
pub(crate) async fn spawn_websocket_echo() -> (u16, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request, response: Response| {
            let _ = tx.send(request.uri().to_string());
            Ok(response)
        };
        let mut websocket = accept_hdr_async(socket, callback).await.unwrap();
        while let Some(Ok(message)) = websocket.next().await {
            if (message.is_text() || message.is_binary()) && websocket.send(message).await.is_err() {
                break;
            }
        }
    });

    (port, rx)
}

/// TLS server with a fresh self-signed certificate for `127.0.0.1`. Echoes
/// whatever the first client sends until it closes.
pub(crate) async fn spawn_tls_echo() -> SocketAddr {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        // A client that rejects the certificate aborts the handshake.
        let Ok(stream) = acceptor.accept(socket).await else {
            return;
        };
        let (mut rx, mut tx) = tokio::io::split(stream);
        let _ = tokio::io::copy(&mut rx, &mut tx).await;
    });

    address
}
