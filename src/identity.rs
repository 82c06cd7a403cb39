use anyhow::{Result, anyhow};
use sha2::{Digest, Sha256};
use std::fs;

/// Sources tried, in order, for a host attribute that survives reboots.
const MACHINE_ID_FILES: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

const FINGERPRINT_LEN: usize = 8;

/// Identity announced to the relay. Computed once per process and reused on
/// every reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub base_client_id: String,
    pub hardware_fingerprint: String,
}

impl ClientIdentity {
    #[must_use]
    pub fn new(base_client_id: impl Into<String>, hardware_fingerprint: impl Into<String>) -> Self {
        Self {
            base_client_id: base_client_id.into(),
            hardware_fingerprint: hardware_fingerprint.into(),
        }
    }

    /// Identifier sent in the `register` line.
    #[must_use]
    pub fn registration_id(&self) -> String {
        format!("{}{}", self.base_client_id, self.hardware_fingerprint)
    }
}

/// Short, stable fingerprint of arbitrary host attributes.
#[must_use]
pub fn fingerprint_of(source: &str) -> String {
    let digest = Sha256::digest(source.trim().as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Derives the fingerprint of this machine.
pub fn machine_fingerprint() -> Result<String> {
    let source = MACHINE_ID_FILES
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .find(|content| !content.trim().is_empty())
        .or_else(host_name)
        .ok_or_else(|| anyhow!("No stable host attribute available for fingerprinting"))?;
    Ok(fingerprint_of(&source))
}

fn host_name() -> Option<String> {
    fs::read_to_string("/etc/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .filter(|name| !name.trim().is_empty())
}
