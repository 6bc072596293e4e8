use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Deadline applied to every discovery lookup.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// A `(public IP, public port)` pair observed by the colony via STUN.
/// Port 0 means the observation failed and the entry is unusable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedEndpoint {
    pub ip: String,
    pub port: u16,
}

/// Reachability snapshot for a colony, as returned by discovery.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ColonyInfo {
    /// Colony WireGuard public key (base64).
    pub public_key: String,
    /// Candidate endpoints in "host:port" form, most preferred first.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// STUN-observed endpoints, proven reachable from behind NAT.
    #[serde(default)]
    pub observed_endpoints: Vec<ObservedEndpoint>,
    /// Colony address inside the tunnel.
    #[serde(default)]
    pub mesh_ipv4: String,
    #[serde(default)]
    pub mesh_ipv6: String,
    /// Colony RPC port.
    #[serde(default)]
    pub connect_port: u16,
    /// Free-form metadata; `wireguard_port` is recognized by endpoint selection.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// What the agent announces about itself when registering with discovery.
#[derive(Debug, Serialize)]
pub struct AgentAnnouncement {
    pub agent_id: String,
    pub mesh_id: String,
    pub public_key: String,
    pub observed_endpoint: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentRegistration {
    pub ttl_seconds: u64,
}

/// Relay session handed out by discovery when two peers cannot reach each
/// other directly. Presently only exercised by tests; the endpoint selector
/// keeps a hook for it.
#[derive(Debug, Deserialize)]
pub struct RelaySession {
    pub session_id: String,
    pub relay_endpoint: String,
    pub expires_at: u64,
}

/// HTTP client for the discovery rendezvous service.
pub struct DiscoveryClient {
    base_url: String,
    client: Client,
}

impl DiscoveryClient {
    pub fn new(base_url: &str, insecure: bool) -> Result<Self> {
        let mut builder = Client::builder().timeout(LOOKUP_TIMEOUT);
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(DiscoveryClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: builder.build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Look up reachability info for a colony.
    pub async fn lookup(&self, colony_id: &str) -> Result<ColonyInfo> {
        let url = format!("{}/colonies/{}", self.base_url, colony_id);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(anyhow!("discovery lookup failed: {}", resp.status()));
        }

        Ok(resp.json::<ColonyInfo>().await?)
    }

    /// Publish the agent's observed public endpoint so the colony can find us.
    pub async fn register_agent(&self, announcement: &AgentAnnouncement) -> Result<AgentRegistration> {
        let url = format!("{}/agents/register", self.base_url);
        let resp = self.client.post(&url).json(announcement).send().await?;

        if !resp.status().is_success() {
            return Err(anyhow!("discovery agent registration failed: {}", resp.status()));
        }

        Ok(resp.json::<AgentRegistration>().await?)
    }

    /// Ask discovery for a relay session between us and the colony.
    pub async fn request_relay(
        &self,
        mesh_id: &str,
        agent_pubkey: &str,
        colony_pubkey: &str,
    ) -> Result<RelaySession> {
        let url = format!("{}/relay/request", self.base_url);
        let body = serde_json::json!({
            "mesh_id": mesh_id,
            "agent_public_key": agent_pubkey,
            "colony_public_key": colony_pubkey,
        });

        let resp = self.client.post(&url).json(&body).send().await?;

        if !resp.status().is_success() {
            return Err(anyhow!("relay request failed: {}", resp.status()));
        }

        Ok(resp.json::<RelaySession>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colony_info_tolerates_sparse_payload() {
        let info: ColonyInfo =
            serde_json::from_str(r#"{"public_key":"pk","endpoints":["colony.example:9000"]}"#)
                .unwrap();

        assert_eq!(info.public_key, "pk");
        assert_eq!(info.endpoints, vec!["colony.example:9000"]);
        assert!(info.observed_endpoints.is_empty());
        assert_eq!(info.connect_port, 0);
    }
}
