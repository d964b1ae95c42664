//! Coordinator configuration.
//!
//! Loaded from an optional TOML file with a `TSS_` environment overlay;
//! every duration has the documented default so a bare config with just a
//! participant id is enough to run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use tss_network::EndpointConfig;
use tss_types::{ParticipantId, Role};

use crate::error::{CoordinatorError, CoordinatorResult};

/// Pre-configured peer coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u16,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// This node's logical participant id (1-based).
    pub participant_id: u16,
    /// Symbolic name; defaults to `node-<id>`.
    pub name: String,
    /// Capability role: `third-party` refuses reshare and sign.
    pub role: Role,
    /// Pre-configured peer coordinators.
    pub peers: Vec<PeerConfig>,
    /// Transport listen port; 0 disables server mode.
    pub listen_port: u16,
    /// HTTP initiation surface port; 0 disables it.
    pub api_port: u16,
    /// Close a client transport after its terminal session message.
    pub auto_disconnect: bool,
    /// Gate sessions on connected client count instead of static membership.
    pub open_enrollment: bool,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub write_deadline_secs: u64,
    pub participant_wait_timeout_secs: u64,
    pub connect_backoff_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            participant_id: 1,
            name: String::new(),
            role: Role::Enterprise,
            peers: Vec::new(),
            listen_port: 0,
            api_port: 0,
            auto_disconnect: false,
            open_enrollment: false,
            idle_timeout_secs: 60,
            heartbeat_interval_secs: 54,
            write_deadline_secs: 10,
            participant_wait_timeout_secs: 30,
            connect_backoff_secs: 2,
        }
    }
}

impl CoordinatorConfig {
    /// Load from an optional TOML file, overlaid with `TSS_`-prefixed
    /// environment variables (e.g. `TSS_PARTICIPANT_ID=2`).
    pub fn load(path: Option<&str>) -> CoordinatorResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("TSS"));
        let mut loaded: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CoordinatorError::InvalidRequest(format!("config: {e}")))?;
        loaded.normalize();
        loaded.validate()?;
        Ok(loaded)
    }

    fn normalize(&mut self) {
        if self.name.is_empty() {
            self.name = format!("node-{}", self.participant_id);
        }
    }

    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.participant_id == 0 {
            return Err(CoordinatorError::InvalidRequest(
                "participant_id must be positive".to_string(),
            ));
        }
        if self
            .peers
            .iter()
            .any(|peer| peer.id == self.participant_id)
        {
            return Err(CoordinatorError::InvalidRequest(
                "peer list must not contain this node".to_string(),
            ));
        }
        Ok(())
    }

    pub fn local_id(&self) -> ParticipantId {
        ParticipantId(self.participant_id)
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            write_deadline: Duration::from_secs(self.write_deadline_secs),
        }
    }

    pub fn participant_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.participant_wait_timeout_secs)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_secs(self.connect_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tss_types::SessionKind;

    #[test]
    fn defaults_match_documented_timings() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.idle_timeout_secs, 60);
        assert_eq!(config.heartbeat_interval_secs, 54);
        assert_eq!(config.write_deadline_secs, 10);
        assert_eq!(config.participant_wait_timeout_secs, 30);
        assert!(!config.open_enrollment);
    }

    #[test]
    fn role_gate_is_data_driven() {
        let mut config = CoordinatorConfig::default();
        config.role = Role::ThirdParty;
        assert!(config.role.allows(SessionKind::Dkg));
        assert!(!config.role.allows(SessionKind::EcdsaSign));
    }

    #[test]
    fn validate_rejects_self_in_peer_list() {
        let mut config = CoordinatorConfig {
            participant_id: 2,
            ..CoordinatorConfig::default()
        };
        config.peers.push(PeerConfig {
            id: 2,
            addr: "127.0.0.1:9000".to_string(),
        });
        assert!(config.validate().is_err());
    }
}
