use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::forwarding::{KeyMaterial, SshEndpoint, TunnelSpec};

/// Last-resort forward target when the backend names none
pub const FALLBACK_FORWARD_HOST: &str = "127.0.0.1";

/// Network placement of the container a tunnel targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetNetwork {
    #[serde(default)]
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
}

/// A tunnel endpoint allocated by the backend API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRecord {
    pub tunnel_id: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub target_port: u16,
    #[serde(default)]
    pub target_container: String,
    #[serde(default)]
    pub target_container_id: String,
    #[serde(default)]
    pub target_network: TargetNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_name: Option<String>,
    #[serde(default)]
    pub expires_at: String,
}

impl TunnelRecord {
    /// Host the far side forwards to: docker name, first alias, IP, then loopback
    pub fn forward_host(&self) -> String {
        let docker_name = self
            .docker_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());
        let alias = self
            .target_network
            .aliases
            .iter()
            .flatten()
            .map(|alias| alias.trim())
            .find(|alias| !alias.is_empty());
        let ip = Some(self.target_network.ip_address.trim()).filter(|ip| !ip.is_empty());

        docker_name
            .or(alias)
            .or(ip)
            .unwrap_or(FALLBACK_FORWARD_HOST)
            .to_string()
    }

    /// Expired when `expiresAt` is a valid RFC 3339 time before `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        DateTime::parse_from_rfc3339(&self.expires_at)
            .map(|expires_at| expires_at < now)
            .unwrap_or(false)
    }

    /// Records targeting one container
    pub fn filter_for_container<'a>(
        records: &'a [TunnelRecord],
        container_id: &'a str,
    ) -> impl Iterator<Item = &'a TunnelRecord> {
        records
            .iter()
            .filter(move |record| record.target_container_id == container_id)
    }

    /// Spec for this record, listening on `local_port` or else on the target port
    pub fn into_spec(self, key: KeyMaterial, local_port: Option<u16>) -> TunnelSpec {
        let remote_host = self.forward_host();
        TunnelSpec {
            endpoint: SshEndpoint::new(self.ssh_host.trim(), self.ssh_port, self.ssh_user.trim()),
            key,
            bind_address: None,
            local_port: local_port.unwrap_or(self.target_port),
            remote_host,
            remote_port: self.target_port,
            id: self.tunnel_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record() -> TunnelRecord {
        serde_json::from_str(
            r#"{
                "tunnelId": "tun_42",
                "sshHost": " edge.example.com ",
                "sshPort": 2201,
                "sshUser": "tunnel ",
                "targetPort": 5432,
                "targetContainerId": "ctr_1",
                "targetNetwork": { "ipAddress": "10.0.3.7", "aliases": ["", "db"] },
                "expiresAt": "2026-01-01T00:00:00Z"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_forward_host_resolution_order() {
        let mut rec = record();
        assert_eq!(rec.forward_host(), "db");

        rec.docker_name = Some("project-db-1".to_string());
        assert_eq!(rec.forward_host(), "project-db-1");

        rec.docker_name = None;
        rec.target_network.aliases = None;
        assert_eq!(rec.forward_host(), "10.0.3.7");

        rec.target_network.ip_address = String::new();
        assert_eq!(rec.forward_host(), FALLBACK_FORWARD_HOST);
    }

    #[test]
    fn test_expiry() {
        let rec = record();
        let before = Utc.with_ymd_and_hms(2025, 12, 31, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        assert!(!rec.is_expired(before));
        assert!(rec.is_expired(after));

        let mut unparseable = rec;
        unparseable.expires_at = "soon".to_string();
        assert!(!unparseable.is_expired(after));
    }

    #[test]
    fn test_filter_for_container() {
        let mut other = record();
        other.tunnel_id = "tun_43".to_string();
        other.target_container_id = "ctr_2".to_string();
        let records = vec![record(), other];

        let ids: Vec<&str> = TunnelRecord::filter_for_container(&records, "ctr_2")
            .map(|r| r.tunnel_id.as_str())
            .collect();
        assert_eq!(ids, ["tun_43"]);
    }

    #[test]
    fn test_into_spec_defaults_local_port_to_target_port() {
        let spec = record().into_spec(KeyMaterial::File("/keys/tun_42".into()), None);

        assert_eq!(spec.id, "tun_42");
        assert_eq!(spec.endpoint, SshEndpoint::new("edge.example.com", 2201, "tunnel"));
        assert_eq!(spec.local_port, 5432);
        assert_eq!(spec.target(), "db:5432");
        assert!(spec.validate().is_ok());

        let spec = record().into_spec(KeyMaterial::File("/keys/tun_42".into()), Some(15432));
        assert_eq!(spec.local_port, 15432);
    }
}
