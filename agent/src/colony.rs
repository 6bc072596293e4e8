use crate::config::ServiceSpec;
use crate::preflight::EbpfCapabilities;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Deadline for a single register or heartbeat RPC attempt.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts per registration URL before moving to the next candidate.
const ATTEMPTS_PER_URL: u32 = 3;

/// Runtime context attached to registration when the probe ran.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RuntimeContext {
    pub runtime: String,
    pub sidecar: bool,
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub colony_id: String,
    pub public_key: String,
    pub agent_version: String,
    pub labels: HashMap<String, String>,
    pub services: Vec<ServiceSpec>,
    pub ebpf: EbpfCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeContext>,
    /// Deprecated single-component name, still populated for colonies that
    /// predate multi-service agents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl RegisterRequest {
    pub fn new(
        agent_id: &str,
        colony_id: &str,
        public_key: &str,
        labels: HashMap<String, String>,
        services: Vec<ServiceSpec>,
        ebpf: EbpfCapabilities,
        runtime: Option<RuntimeContext>,
    ) -> Self {
        let component = match services.as_slice() {
            [only] => Some(only.name.clone()),
            _ => None,
        };

        RegisterRequest {
            agent_id: agent_id.to_string(),
            colony_id: colony_id.to_string(),
            public_key: public_key.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            labels,
            services,
            ebpf,
            runtime,
            component,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerInfo {
    pub public_key: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub mesh_ip: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,
    #[serde(default)]
    pub reason: String,
    /// Mesh assignment in "ip|subnet" form. The delimiter format is what
    /// colonies speak on the wire; see [`parse_mesh_assignment`].
    #[serde(default)]
    pub assigned_ip: String,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    agent_id: &'a str,
    status: &'a str,
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    ok: bool,
}

/// Split a colony mesh assignment of the form "ip|subnet".
pub fn parse_mesh_assignment(raw: &str) -> Result<(String, String)> {
    match raw.split_once('|') {
        Some((ip, subnet)) if !ip.is_empty() && !subnet.is_empty() => {
            Ok((ip.to_string(), subnet.to_string()))
        }
        _ => Err(anyhow!("malformed mesh assignment {:?}", raw)),
    }
}

/// Wire transport for colony RPCs. The seam exists so the connection manager
/// can be exercised without a network.
#[async_trait]
pub trait ColonyTransport: Send + Sync {
    /// One Register attempt against one base URL.
    async fn register(&self, base_url: &str, req: &RegisterRequest) -> Result<RegisterResponse>;

    /// One heartbeat against the colony's mesh address; Ok(true) means the
    /// colony acknowledged us.
    async fn heartbeat(&self, base_url: &str, agent_id: &str, status: &str) -> Result<bool>;
}

pub struct HttpColonyTransport {
    client: reqwest::Client,
}

impl HttpColonyTransport {
    pub fn new(insecure: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(RPC_TIMEOUT);
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(HttpColonyTransport {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl ColonyTransport for HttpColonyTransport {
    async fn register(&self, base_url: &str, req: &RegisterRequest) -> Result<RegisterResponse> {
        let url = format!("{}/agents/register", base_url.trim_end_matches('/'));
        let resp = self.client.post(&url).json(req).send().await?;

        if !resp.status().is_success() {
            return Err(anyhow!("register returned {}", resp.status()));
        }

        Ok(resp.json::<RegisterResponse>().await?)
    }

    async fn heartbeat(&self, base_url: &str, agent_id: &str, status: &str) -> Result<bool> {
        let url = format!("{}/agents/heartbeat", base_url.trim_end_matches('/'));
        let body = HeartbeatRequest { agent_id, status };
        let resp = self.client.post(&url).json(&body).send().await?;

        if !resp.status().is_success() {
            return Err(anyhow!("heartbeat returned {}", resp.status()));
        }

        Ok(resp.json::<HeartbeatResponse>().await?.ok)
    }
}

/// Successful registration, including which URL worked so callers can keep
/// it sticky.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
    pub mesh_ip: String,
    pub mesh_subnet: String,
    pub url: String,
}

/// One failed attempt, kept for operator debugging when every URL fails.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub url: String,
    pub attempt: u32,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("no registration URL candidates")]
    NoCandidates,
    #[error("registration exhausted {} attempts: {}", .0.len(), describe_failures(.0))]
    Exhausted(Vec<AttemptFailure>),
}

fn describe_failures(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} (attempt {}): {}", f.url, f.attempt, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Try each candidate URL up to three times with a linear per-attempt delay.
/// The first accepted response wins and its URL becomes the sticky one.
pub async fn register_with_retry(
    transport: &dyn ColonyTransport,
    urls: &[String],
    req: &RegisterRequest,
) -> Result<RegistrationOutcome, RegistrationError> {
    if urls.is_empty() {
        return Err(RegistrationError::NoCandidates);
    }

    let mut failures = Vec::new();

    for url in urls {
        for attempt in 1..=ATTEMPTS_PER_URL {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_secs((attempt - 1) as u64)).await;
            }

            debug!(component = "registration", url = %url, attempt, "register attempt");

            match transport.register(url, req).await {
                Ok(resp) if resp.accepted => match parse_mesh_assignment(&resp.assigned_ip) {
                    Ok((mesh_ip, mesh_subnet)) => {
                        return Ok(RegistrationOutcome {
                            mesh_ip,
                            mesh_subnet,
                            url: url.clone(),
                        });
                    }
                    Err(e) => failures.push(AttemptFailure {
                        url: url.clone(),
                        attempt,
                        reason: e.to_string(),
                    }),
                },
                Ok(resp) => {
                    warn!(component = "registration", url = %url, attempt, reason = %resp.reason,
                        "colony rejected registration");
                    failures.push(AttemptFailure {
                        url: url.clone(),
                        attempt,
                        reason: format!("rejected: {}", resp.reason),
                    });
                }
                Err(e) => failures.push(AttemptFailure {
                    url: url.clone(),
                    attempt,
                    reason: e.to_string(),
                }),
            }
        }
    }

    Err(RegistrationError::Exhausted(failures))
}
