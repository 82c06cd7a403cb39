use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::BTreeMap, fs, path::Path};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub relay: RelayConfig,
    #[serde(default)]
    pub services: ServiceMapping,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// `host:port` of the relay server.
    pub address: String,
    /// Base client identifier; the machine fingerprint is appended to it.
    pub client_id: String,
    /// Shared secret sent during the handshake.
    pub key: String,
    #[serde(default)]
    pub tls: bool,
    /// Skip certificate verification. Only for self-signed test relays.
    #[serde(default)]
    pub tls_insecure: bool,
    /// Extra PEM root certificates trusted for the relay connection.
    pub ca_file: Option<String>,
    /// Overrides the fingerprint derived from the host.
    pub fingerprint: Option<String>,
}

/// Service name to local base URL table exposed through the tunnel.
///
/// Entries are kept verbatim; URLs are only parsed when a request is
/// dispatched, so one bad entry cannot take down the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ServiceMapping(BTreeMap<String, String>);

/// Alias kept for relays that still route `/ws/...` to the video service.
const LEGACY_WS_ALIAS: (&str, &str) = ("ws", "video");

impl ServiceMapping {
    #[must_use]
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }

    /// Looks up the local base URL for a mapping name.
    ///
    /// An unmapped `ws` falls back to the `video` entry.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .or_else(|| {
                if name == LEGACY_WS_ALIAS.0 {
                    self.0.get(LEGACY_WS_ALIAS.1)
                } else {
                    None
                }
            })
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(name, url)| (name.as_str(), url.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ServiceMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, url)| (name.into(), url.into()))
                .collect(),
        )
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}
