use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use crate::config::{Config, RelayConfig, ServiceMapping};
use crate::handshake::Greeting;
use crate::heartbeat::{self, HEARTBEAT_INTERVAL};
use crate::identity::{ClientIdentity, machine_fingerprint};
use crate::session::{Session, SessionConfig};
use crate::tls::relay_connector;
use crate::{handshake, proxy, register, transport};

/// Pause between the end of one session attempt and the next.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Keeps exactly one relay session alive, reconnecting forever.
pub struct Supervisor {
    relay: RelayConfig,
    identity: ClientIdentity,
    services: Arc<ServiceMapping>,
    tls: Option<TlsConnector>,
    session: SessionConfig,
}

impl Supervisor {
    /// Resolves everything that stays fixed across reconnects: identity,
    /// TLS settings and the service table.
    pub fn new(config: Config) -> Result<Self> {
        let fingerprint = match &config.relay.fingerprint {
            Some(fingerprint) => fingerprint.clone(),
            None => machine_fingerprint()?,
        };
        let identity = ClientIdentity::new(config.relay.client_id.clone(), fingerprint);

        let tls = if config.relay.tls {
            Some(relay_connector(
                config.relay.tls_insecure,
                config.relay.ca_file.as_deref(),
            )?)
        } else {
            None
        };

        info!(
            client_id = %identity.registration_id(),
            relay = %config.relay.address,
            tls = config.relay.tls,
            services = config.services.len(),
            "Agent configured"
        );

        Ok(Self {
            relay: config.relay,
            identity,
            services: Arc::new(config.services),
            tls,
            session: SessionConfig::default(),
        })
    }

    #[must_use]
    pub const fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Runs session attempts back to back. Never returns.
    pub async fn run(&self) {
        loop {
            match self.run_once().await {
                Ok(()) => info!("Session ended, reconnecting in {}s", RETRY_DELAY.as_secs()),
                Err(e) => error!(
                    error = %format!("{e:#}"),
                    "Session attempt failed, retrying in {}s",
                    RETRY_DELAY.as_secs()
                ),
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    /// One full attempt: connect, authenticate, register, then serve inbound
    /// streams until the session ends.
    ///
    /// `Ok` means an established session ended; errors come from the steps
    /// before serving started.
    pub async fn run_once(&self) -> Result<()> {
        info!(address = %self.relay.address, tls = self.tls.is_some(), "Connecting to relay");
        let mut transport = transport::connect(
            &self.relay.address,
            self.tls.as_ref(),
            self.session.keepalive_interval,
        )
        .await?;
        debug!(
            peer = ?transport.peer_addr().ok(),
            tls = transport.is_tls(),
            "Connected to relay"
        );

        let greeting = Greeting::for_transport(transport.is_tls());
        handshake::perform(&mut transport, &self.relay.key, greeting).await?;

        let mut session = Session::open(transport, &self.session);
        let control = session.control();

        let client_id = self.identity.registration_id();
        if let Err(e) = register::send(&control, &client_id, &self.services).await {
            session.close().await;
            return Err(e);
        }

        let heartbeat = tokio::spawn(heartbeat::run(control, HEARTBEAT_INTERVAL));

        let mut streams = 0u64;
        let reason = loop {
            match session.accept_stream().await {
                Ok(stream) => {
                    streams += 1;
                    tokio::spawn(proxy::handle_stream(stream, Arc::clone(&self.services)));
                }
                Err(e) => break e,
            }
        };
        info!(reason = %reason, streams, "Session closed");

        session.close().await;
        if let Err(e) = heartbeat.await {
            debug!(error = %e, "Heartbeat task ended abnormally");
        }
        Ok(())
    }
}

/// Runs the agent with `config` until the process is stopped.
pub async fn run(config: Config) -> Result<()> {
    let supervisor = Supervisor::new(config)?;
    supervisor.run().await;
    Ok(())
}
