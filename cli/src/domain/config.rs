//! Setup document types — the persisted provisioning state.
//!
//! Pure data: serde derives only, no I/O. All mutation goes through
//! `ConfigStore::update` in `crate::state`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written by this build. Loading a newer version fails
/// closed rather than attempting a lossy downgrade.
pub const SCHEMA_VERSION: u32 = 2;

/// Lifecycle of a single phase record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

/// Per-phase persisted record. Created when the phase first leaves
/// `Pending`; the live value is overwritten on each transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Opaque pre-state captured by the phase during execute, sufficient to
    /// undo its changes (e.g. prior sshd_config contents). May reference
    /// sensitive material, which is why the document is written mode 600.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rollback_data: BTreeMap<String, String>,
}

impl PhaseRecord {
    /// A record that has never left `Pending`.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: PhaseStatus::Pending,
            started_at: None,
            finished_at: None,
            rollback_data: BTreeMap::new(),
        }
    }
}

/// Network parameters the phases provision against.
///
/// All string fields are stored in the canonical form produced by
/// `domain::validate` — phases still re-validate before building argv.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// VPN subnet in canonical CIDR form (e.g. "10.66.66.0/24").
    pub vpn_subnet: String,
    /// Server address inside the VPN subnet.
    pub vpn_server_ip: String,
    /// UDP port WireGuard listens on.
    pub wireguard_port: u16,
    /// SSH port kept reachable through the firewall.
    pub ssh_port: u16,
    /// WireGuard interface to create (e.g. "wg0").
    pub wg_interface: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            vpn_subnet: "10.66.66.0/24".to_string(),
            vpn_server_ip: "10.66.66.1".to_string(),
            wireguard_port: 51820,
            ssh_port: 22,
            wg_interface: "wg0".to_string(),
        }
    }
}

/// Facts about the server being provisioned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Public endpoint clients dial (hostname or IP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_endpoint: Option<String>,
    /// Server public key, recorded after the wireguard-server phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wg_public_key: Option<String>,
}

/// The root persisted object. One JSON document at
/// `~/.vpnforge/setup.json`, mode 600.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupDocument {
    pub version: u32,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub server: ServerInfo,
    /// Map from phase id to its live record.
    #[serde(default)]
    pub phases: BTreeMap<u8, PhaseRecord>,
}

impl Default for SetupDocument {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            network: NetworkSettings::default(),
            server: ServerInfo::default(),
            phases: BTreeMap::new(),
        }
    }
}

impl SetupDocument {
    /// Status of a phase, `Pending` if it has no record yet.
    #[must_use]
    pub fn phase_status(&self, id: u8) -> PhaseStatus {
        self.phases
            .get(&id)
            .map_or(PhaseStatus::Pending, |r| r.status)
    }

    /// The live record for a phase, creating a `Pending` one on first use.
    pub fn phase_record_mut(&mut self, id: u8) -> &mut PhaseRecord {
        self.phases.entry(id).or_insert_with(PhaseRecord::pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_document_has_current_schema_version() {
        let doc = SetupDocument::default();
        assert_eq!(doc.version, SCHEMA_VERSION);
        assert!(doc.phases.is_empty());
    }

    #[test]
    fn test_phase_status_defaults_to_pending() {
        let doc = SetupDocument::default();
        assert_eq!(doc.phase_status(1), PhaseStatus::Pending);
    }

    #[test]
    fn test_phase_record_roundtrips_through_json() {
        let mut doc = SetupDocument::default();
        let record = doc.phase_record_mut(2);
        record.status = PhaseStatus::Completed;
        record
            .rollback_data
            .insert("sysctl.ip_forward".to_string(), "0".to_string());

        let json = serde_json::to_string(&doc).expect("serialize");
        let loaded: SetupDocument = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(loaded.phase_status(2), PhaseStatus::Completed);
        assert_eq!(
            loaded.phases[&2].rollback_data["sysctl.ip_forward"],
            "0"
        );
    }

    #[test]
    fn test_retired_network_fields_are_ignored_on_load() {
        // Documents written by older builds may carry network keys this
        // build no longer uses; they must still load.
        let json = r#"{
            "version": 2,
            "network": {
                "vpn_subnet": "10.66.66.0/24",
                "vpn_server_ip": "10.66.66.1",
                "wireguard_port": 51820,
                "ssh_port": 22,
                "wg_interface": "wg0",
                "wan_interface": "eth0"
            }
        }"#;
        let doc: SetupDocument = serde_json::from_str(json).expect("deserialize");
        assert_eq!(doc.network.wg_interface, "wg0");
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&PhaseStatus::RolledBack).expect("serialize");
        assert_eq!(json, r#""rolled_back""#);
    }
}
