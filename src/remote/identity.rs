use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use super::channel::SecureChannel;
use crate::platform::common::atomic_write_with_mode;

const IDENTITY_VERSION: &str = "1.0";
pub const DEVICE_ID_LEN: usize = 16;

/// Shared secret a parent must enter to talk to this device
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceIdentity {
    version: String,
    device_id: String,
    created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Fresh identifier: 16 upper-case hex digits from a random UUID
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();

        Self {
            version: IDENTITY_VERSION.to_string(),
            device_id: simple[..DEVICE_ID_LEN].to_uppercase(),
            created_at: Utc::now(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn channel(&self) -> SecureChannel {
        SecureChannel::from_device_id(&self.device_id)
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity file: {}", path.display()))?;

        let identity: DeviceIdentity = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse identity file: {}", path.display()))?;

        if identity.version != IDENTITY_VERSION {
            anyhow::bail!(
                "Unsupported identity file version {} in {}",
                identity.version,
                path.display()
            );
        }

        if !is_valid_device_id(&identity.device_id) {
            anyhow::bail!("Identity file {} holds a malformed device id", path.display());
        }

        Ok(Some(identity))
    }

    /// Written owner-readable only, since the identifier doubles as the key
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize identity")?;

        atomic_write_with_mode(path, content.as_bytes(), 0o600)
            .with_context(|| format!("Failed to write identity file: {}", path.display()))?;

        Ok(())
    }

    pub fn load_or_create(path: &Path) -> Result<Self> {
        if let Some(identity) = Self::load(path)? {
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!("Generated new device identity at {}", path.display());

        Ok(identity)
    }
}

pub fn is_valid_device_id(id: &str) -> bool {
    id.len() == DEVICE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
}

/// Normalize a user-entered identifier (surrounding space, lower case)
pub fn normalize_device_id(input: &str) -> Result<String> {
    let id = input.trim().to_uppercase();
    if !is_valid_device_id(&id) {
        anyhow::bail!(
            "Device id must be {} hexadecimal characters (got {:?})",
            DEVICE_ID_LEN,
            input
        );
    }
    Ok(id)
}
