use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::config::ServiceMapping;
use crate::session::Control;

/// `register <clientId> <name>=<url> ...`, services in name order.
#[must_use]
pub fn registration_message(client_id: &str, services: &ServiceMapping) -> String {
    let mut message = format!("register {client_id}");
    for (name, url) in services.iter() {
        message.push(' ');
        message.push_str(name);
        message.push('=');
        message.push_str(url);
    }
    message
}

/// Announces this client and its services on a dedicated stream.
///
/// Fire-and-forget: no acknowledgment is read. Any failure is fatal to the
/// session attempt.
pub async fn send(control: &Control, client_id: &str, services: &ServiceMapping) -> Result<()> {
    let mut stream = control
        .open_stream()
        .await
        .context("Failed to open registration stream")?;

    let message = registration_message(client_id, services);
    let written = stream.write_all(message.as_bytes()).await;
    let closed = stream.shutdown().await;
    written.context("Failed to send registration message")?;
    closed.context("Failed to close registration stream")?;

    info!(
        client_id = %client_id,
        services = services.len(),
        "Registered with relay"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::session_pair;
    use std::time::Duration;
    use tokio::{io::AsyncReadExt, time::timeout};

    fn services() -> ServiceMapping {
        [
            ("video", "ws://127.0.0.1:1882"),
            ("alist", "http://127.0.0.1:5244"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn message_lists_every_service() {
        assert_eq!(
            registration_message("home-1a2b3c4d", &services()),
            "register home-1a2b3c4d alist=http://127.0.0.1:5244 video=ws://127.0.0.1:1882"
        );
    }

    #[test]
    fn message_without_services() {
        assert_eq!(
            registration_message("home", &ServiceMapping::default()),
            "register home"
        );
    }

    #[test]
    fn message_ignores_insertion_order() {
        let reordered: ServiceMapping = [
            ("alist", "http://127.0.0.1:5244"),
            ("video", "ws://127.0.0.1:1882"),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            registration_message("id", &services()),
            registration_message("id", &reordered)
        );
    }

    #[tokio::test]
    async fn sends_message_on_its_own_stream() {
        let (client, mut relay) = session_pair();

        send(&client.control(), "home-1a2b3c4d", &services())
            .await
            .unwrap();

        let mut stream = timeout(Duration::from_secs(5), relay.accept_stream())
            .await
            .unwrap()
            .unwrap();
        let mut received = String::new();
        stream.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, registration_message("home-1a2b3c4d", &services()));
    }

    #[tokio::test]
    async fn fails_on_closed_session() {
        let (client, _relay) = session_pair();
        let control = client.control();
        client.close().await;

        assert!(send(&control, "home", &services()).await.is_err());
    }
}
