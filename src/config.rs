//! Inbound and outbound configuration.
//!
//! The inbound config names the client UUIDs allowed to handshake, an
//! optional traffic-profile per client, and the local cover server that
//! receives everything else. Client IDs are validated and canonicalized
//! when the handler is built, so a config with a malformed UUID never makes
//! it to the listener.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Inbound (server-side) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Clients allowed to authenticate, by UUID.
    pub clients: Vec<ClientConfig>,
    /// Cover web server for non-Reflex traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackConfig>,
}

/// One authorized client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client UUID, any textual form `uuid` accepts.
    pub id: String,
    /// Traffic-profile name enabling egress morphing for this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    /// User level, indexes the timeout policy.
    #[serde(default)]
    pub level: u32,
}

impl ClientConfig {
    /// Parse and canonicalize the client UUID.
    pub fn parse_id(&self) -> Result<Uuid> {
        Uuid::parse_str(self.id.trim())
            .map_err(|e| Error::config(format!("invalid client UUID {:?}: {}", self.id, e)))
    }
}

/// Cover server the fallback splicer forwards to, on 127.0.0.1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// TCP port of the cover web server.
    pub dest: u16,
}

/// Outbound (client-side) configuration. The client protocol itself is not
/// implemented here; this exists so a shared config file round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Server address.
    pub address: String,
    /// Server port.
    pub port: u16,
    /// Client UUID.
    pub id: String,
}

impl OutboundConfig {
    /// Validate the config, canonicalizing the UUID.
    pub fn validate(&mut self) -> Result<()> {
        let id = Uuid::parse_str(self.id.trim())
            .map_err(|e| Error::config(format!("invalid outbound UUID {:?}: {}", self.id, e)))?;
        self.id = id.to_string();

        if self.address.is_empty() {
            return Err(Error::config("outbound address cannot be empty"));
        }
        Ok(())
    }
}
