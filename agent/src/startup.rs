use crate::bootstrap::{self, BootstrapConfig, DEFAULT_BOOTSTRAP_TIMEOUT};
use crate::certs::CertStore;
use crate::colony::HttpColonyTransport;
use crate::config::{self, ResolvedConfig};
use crate::connection::{ConnectionManager, ConnectionSettings, ConnectionState};
use crate::discovery::{AgentAnnouncement, ColonyInfo, DiscoveryClient};
use crate::endpoint::DEFAULT_CONNECT_PORT;
use crate::identity::AgentKeys;
use crate::preflight::{self, PreflightReport};
use crate::server::{self, RuntimeState};
use crate::storage::TelemetryStore;
use crate::stun::{self, PublicEndpoint};
use crate::wireguard::{Datapath, WgDevice};
use anyhow::anyhow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Bound on the runtime HTTP server drain at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Bound on each background loop exiting: one tick plus one pending RPC
/// deadline.
const LOOP_EXIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    Preflight,
    Config,
    Bootstrap,
    Network,
    Storage,
    Agent,
    Registration,
    Services,
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StartupPhase::Preflight => "preflight",
            StartupPhase::Config => "config",
            StartupPhase::Bootstrap => "bootstrap",
            StartupPhase::Network => "network",
            StartupPhase::Storage => "storage",
            StartupPhase::Agent => "agent",
            StartupPhase::Registration => "registration",
            StartupPhase::Services => "services",
        };
        f.write_str(s)
    }
}

/// A classified fatal startup failure. Recoverable conditions never become
/// one of these; they are logged and startup continues.
#[derive(Debug, thiserror::Error)]
#[error("startup failed during {phase}: {source:#}")]
pub struct StartupError {
    pub phase: StartupPhase,
    #[source]
    pub source: anyhow::Error,
}

fn fatal(phase: StartupPhase) -> impl FnOnce(anyhow::Error) -> StartupError {
    move |source| StartupError { phase, source }
}

// ------------------------------------------------------------------
// Typed phase outputs: each phase consumes the previous one, so the
// orchestration cannot run out of order.
// ------------------------------------------------------------------

pub struct Validated {
    pub cfg: ResolvedConfig,
    pub preflight: PreflightReport,
}

/// How network bring-up went. Recoverable degradation (no STUN mapping,
/// discovery down) lands here instead of an error, so callers holding the
/// server can assert on it.
#[derive(Debug, Clone, Default)]
pub struct NetworkResult {
    pub observed_endpoint: Option<String>,
    pub nat_type: Option<&'static str>,
    pub stun_error: Option<String>,
    /// A discovery endpoint was configured and the client was built.
    pub discovery_configured: bool,
    /// The colony lookup succeeded during startup.
    pub colony_discovered: bool,
    pub discovery_error: Option<String>,
    /// The observed endpoint was accepted by discovery.
    pub announced: bool,
}

pub struct NetworkReady {
    validated: Validated,
    keys: AgentKeys,
    wg: Arc<WgDevice>,
    discovery: Option<Arc<DiscoveryClient>>,
    colony_info: Option<ColonyInfo>,
    result: NetworkResult,
}

/// The running agent. Dropping it does not stop anything; call
/// [`AgentServer::stop`] for the ordered teardown.
pub struct AgentServer {
    pub connection: Arc<ConnectionManager>,
    pub storage: Arc<TelemetryStore>,
    pub runtime: Arc<RuntimeState>,
    pub services: Vec<String>,
    pub network_result: NetworkResult,
    wg: Arc<WgDevice>,
    shutdown_tx: watch::Sender<bool>,
    runtime_handle: JoinHandle<()>,
    loop_handles: Vec<JoinHandle<()>>,
}

// ------------------------------------------------------------------
// Phases
// ------------------------------------------------------------------

fn validate() -> Result<Validated, StartupError> {
    let preflight = preflight::probe().map_err(fatal(StartupPhase::Preflight))?;
    let cfg = config::resolve().map_err(fatal(StartupPhase::Config))?;

    info!(
        component = "startup",
        agent_id = %cfg.agent_id,
        colony = %cfg.colony_id,
        elevated = preflight.elevated,
        degraded = preflight.degraded,
        "configuration resolved"
    );

    Ok(Validated { cfg, preflight })
}

async fn bootstrap_certificates(validated: &Validated) -> Result<(), StartupError> {
    let cfg = &validated.cfg;

    if cfg.ca_fingerprint.is_none() {
        info!(component = "startup", "bootstrap bypassed: no CA fingerprint configured");
        return Ok(());
    }

    let store = CertStore::new(&cfg.base_dir);
    let bootstrap_cfg = BootstrapConfig {
        agent_id: cfg.agent_id.clone(),
        colony_id: cfg.colony_id.clone(),
        ca_fingerprint: cfg.ca_fingerprint.clone(),
        psk: cfg.bootstrap_psk.clone(),
        discovery_url: cfg.discovery_endpoint.clone(),
        colony_endpoint: cfg.colony_endpoint.clone(),
        timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
        insecure: cfg.insecure,
    };

    let result = bootstrap::run(&store, &bootstrap_cfg)
        .await
        .map_err(|e| fatal(StartupPhase::Bootstrap)(anyhow!(e)))?;

    info!(
        component = "startup",
        bootstrapped = result.bootstrapped,
        identity = %result.credentials.identity,
        "identity credentials ready"
    );
    Ok(())
}

/// Produce keys, probe STUN while the WireGuard port is still free, start
/// the tunnel bare, then try to learn about the colony. Discovery being
/// down is not fatal; the agent starts in `waiting_discovery`.
async fn init_network(validated: Validated) -> Result<NetworkReady, StartupError> {
    let cfg = &validated.cfg;
    let keys = AgentKeys::generate();
    let mut result = NetworkResult::default();

    let stun_servers = cfg.stun_servers.clone();
    let wg_port = cfg.wireguard_port;
    let observed = tokio::task::spawn_blocking(move || {
        stun::discover_public_endpoint(&stun_servers, wg_port)
    })
    .await
    .map_err(|e| fatal(StartupPhase::Network)(anyhow!("stun probe task: {}", e)))?;

    let observed: Option<PublicEndpoint> = match observed {
        Ok(ep) => {
            info!(component = "startup", endpoint = %ep.addr, nat = ep.nat.as_str(), "public endpoint observed");
            result.observed_endpoint = Some(ep.addr.to_string());
            result.nat_type = Some(ep.nat.as_str());
            Some(ep)
        }
        Err(e) => {
            warn!(component = "startup", reason = %e, "STUN discovery failed; continuing without observed endpoint");
            result.stun_error = Some(e.to_string());
            None
        }
    };

    let wg = Arc::new(WgDevice::create(&keys.private_key, cfg.wireguard_port, None));
    wg.start().map_err(fatal(StartupPhase::Network))?;

    let discovery = match cfg.discovery_endpoint.as_deref() {
        Some(url) => match DiscoveryClient::new(url, cfg.insecure) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!(component = "startup", reason = %e, "discovery client unavailable");
                result.discovery_error = Some(e.to_string());
                None
            }
        },
        None => None,
    };
    result.discovery_configured = discovery.is_some();

    let mut colony_info = None;
    if let Some(discovery) = &discovery {
        // Announce the observed endpoint regardless of how the colony
        // lookup goes; the two RPCs are independent and other peers need
        // our mapping either way.
        if observed.is_some() {
            result.announced =
                publish_observed_endpoint(discovery, cfg, &keys, observed.as_ref()).await;
        }

        match discovery.lookup(&cfg.colony_id).await {
            Ok(info) => {
                result.colony_discovered = true;
                colony_info = Some(info);
            }
            Err(e) => {
                warn!(
                    component = "startup",
                    state = "waiting_discovery",
                    reason = %e,
                    "discovery unreachable; agent will keep looking in the background"
                );
                result.discovery_error = Some(e.to_string());
            }
        }
    }

    // Config-less mode: a directly supplied colony endpoint stands in for
    // discovery output until a lookup succeeds.
    if colony_info.is_none() {
        if let Some(endpoint) = &cfg.colony_endpoint {
            info!(component = "startup", endpoint = %endpoint, "using configured colony endpoint");
            colony_info = Some(synthesize_colony_info(endpoint));
        }
    }

    Ok(NetworkReady {
        validated,
        keys,
        wg,
        discovery,
        colony_info,
        result,
    })
}

async fn publish_observed_endpoint(
    discovery: &DiscoveryClient,
    cfg: &ResolvedConfig,
    keys: &AgentKeys,
    observed: Option<&PublicEndpoint>,
) -> bool {
    let mut metadata = HashMap::new();
    if let Some(ep) = observed {
        metadata.insert("nat_type".to_string(), ep.nat.as_str().to_string());
    }

    let announcement = AgentAnnouncement {
        agent_id: cfg.agent_id.clone(),
        mesh_id: cfg.colony_id.clone(),
        public_key: keys.public_key.clone(),
        observed_endpoint: observed.map(|ep| ep.addr.to_string()),
        metadata,
    };

    match discovery.register_agent(&announcement).await {
        Ok(reg) => {
            info!(component = "startup", ttl = reg.ttl_seconds, "agent registered with discovery");
            true
        }
        Err(e) => {
            warn!(component = "startup", reason = %e, "discovery agent registration failed");
            false
        }
    }
}

/// Build a colony snapshot from a bare "host:port" endpoint.
fn synthesize_colony_info(endpoint: &str) -> ColonyInfo {
    let connect_port = endpoint
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(DEFAULT_CONNECT_PORT);

    ColonyInfo {
        endpoints: vec![endpoint.to_string()],
        connect_port,
        ..ColonyInfo::default()
    }
}

fn build_agent(network: NetworkReady, storage: Arc<TelemetryStore>) -> Result<AgentReadyParts, StartupError> {
    let NetworkReady {
        validated,
        keys,
        wg,
        discovery,
        colony_info,
        result: network_result,
    } = network;
    let Validated { cfg, preflight } = validated;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let transport = HttpColonyTransport::new(cfg.insecure)
        .map_err(fatal(StartupPhase::Agent))?;

    let connection = Arc::new(ConnectionManager::new(
        ConnectionSettings {
            agent_id: cfg.agent_id.clone(),
            colony_id: cfg.colony_id.clone(),
            public_key: keys.public_key.clone(),
            labels: cfg.labels.clone(),
            services: cfg.services.clone(),
            ebpf: preflight.ebpf,
            runtime: None,
        },
        discovery,
        Arc::new(transport),
        wg.clone() as Arc<dyn Datapath>,
        colony_info,
        shutdown_rx,
    ));

    let services: Vec<String> = cfg.services.iter().map(|s| s.name.clone()).collect();
    let runtime = Arc::new(RuntimeState::new(
        cfg.agent_id.clone(),
        connection.clone(),
        storage.clone(),
        services,
        preflight.degraded,
    ));

    Ok(AgentReadyParts {
        cfg,
        wg,
        storage,
        connection,
        runtime,
        network_result,
        shutdown_tx,
    })
}

struct AgentReadyParts {
    cfg: ResolvedConfig,
    wg: Arc<WgDevice>,
    storage: Arc<TelemetryStore>,
    connection: Arc<ConnectionManager>,
    runtime: Arc<RuntimeState>,
    network_result: NetworkResult,
    shutdown_tx: watch::Sender<bool>,
}

// ------------------------------------------------------------------
// Orchestration
// ------------------------------------------------------------------

/// Run the full phased build-up and return a running agent. Fatal phases
/// propagate; recoverable ones degrade and continue.
pub async fn start() -> Result<AgentServer, StartupError> {
    // Phases 1 + 2.
    let validated = validate()?;

    // Phase 3.
    bootstrap_certificates(&validated).await?;

    // Phase 4.
    let network = init_network(validated).await?;

    // Phase 5: never fatal, falls back to memory internally.
    let storage = Arc::new(TelemetryStore::open(&network.validated.cfg.storage_path));
    if storage.is_memory() {
        warn!(component = "startup", "running with in-memory telemetry storage");
    }

    // Phase 6.
    let parts = build_agent(network, storage)?;
    let runtime_handle = server::serve(parts.runtime.clone(), parts.shutdown_tx.subscribe())
        .await
        .map_err(fatal(StartupPhase::Agent))?;

    let AgentReadyParts {
        cfg,
        wg,
        storage,
        connection,
        runtime,
        network_result,
        shutdown_tx,
    } = parts;

    // Phase 7: one synchronous attempt; the reconnection loop owns retries.
    match connection.attempt_registration().await {
        Ok((ip, subnet)) => {
            info!(component = "startup", mesh_ip = %ip, subnet = %subnet, "initial registration succeeded")
        }
        Err(e) => {
            warn!(component = "startup", reason = %e, "initial registration failed; reconnection loop will retry");
            connection.trigger_reconnection();
        }
    }

    // Phase 8: services and background loops.
    let services = register_services(&cfg, storage.as_ref());

    let loop_handles = vec![
        {
            let nudge = connection.clone();
            connection.start_discovery_loop(move |info| {
                info!(
                    component = "discovery",
                    colony_endpoints = info.endpoints.len(),
                    "colony reachable; nudging registration"
                );
                nudge.trigger_reconnection();
            })
        },
        connection.start_reconnection_loop(),
        connection.start_heartbeat_loop(cfg.heartbeat_interval),
    ];

    // Kick the discovery loop immediately when we booted blind.
    if connection.state() == ConnectionState::WaitingDiscovery {
        connection.trigger_discovery();
    }

    announce(&connection, services.len());

    Ok(AgentServer {
        connection,
        storage,
        runtime,
        services,
        network_result,
        wg,
        shutdown_tx,
        runtime_handle,
        loop_handles,
    })
}

/// Start the agent, block until a shutdown signal, tear down in reverse
/// order. This is the binary entry point.
pub async fn run() -> Result<(), StartupError> {
    let server = start().await?;
    wait_for_shutdown_signal().await;
    server.stop().await;
    Ok(())
}

fn register_services(cfg: &ResolvedConfig, storage: &TelemetryStore) -> Vec<String> {
    let mut services: Vec<String> = cfg.services.iter().map(|s| s.name.clone()).collect();

    for spec in &cfg.services {
        info!(component = "services", service = %spec.name, port = spec.port, "service registered");
        let _ = storage.put(
            &format!("services/{}", spec.name),
            &serde_json::json!({ "name": spec.name, "port": spec.port }),
        );
    }

    // Local collectors exposed through the runtime API.
    services.push("system-metrics".to_string());
    services
}

fn announce(connection: &ConnectionManager, service_count: usize) {
    match connection.state() {
        ConnectionState::WaitingDiscovery => {
            info!(
                component = "startup",
                state = "waiting_discovery",
                services = service_count,
                "agent running without colony info; discovery loop is searching"
            );
        }
        state => {
            info!(
                component = "startup",
                state = %state,
                assigned_ip = connection.assigned_ip().as_deref().unwrap_or("-"),
                services = service_count,
                "agent running"
            );
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(component = "startup", reason = %e, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => info!(component = "startup", "received ctrl-c"),
            _ = sigterm.recv() => info!(component = "startup", "received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

impl AgentServer {
    /// Ordered teardown: signal everything, drain the HTTP server with a
    /// bound, wait for the loops, then stop the tunnel.
    pub async fn stop(self) {
        info!(component = "startup", "shutting down");
        let _ = self.shutdown_tx.send(true);

        if tokio::time::timeout(SHUTDOWN_DRAIN, self.runtime_handle)
            .await
            .is_err()
        {
            warn!(component = "startup", "runtime service did not drain in time");
        }

        for handle in self.loop_handles {
            if tokio::time::timeout(LOOP_EXIT, handle).await.is_err() {
                warn!(component = "startup", "background loop did not exit in time");
            }
        }

        self.wg.stop();
        info!(component = "startup", "shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_colony_info_carries_endpoint_and_port() {
        let info = synthesize_colony_info("colony.example:9100");
        assert_eq!(info.endpoints, vec!["colony.example:9100"]);
        assert_eq!(info.connect_port, 9100);

        let no_port = synthesize_colony_info("colony.example");
        assert_eq!(no_port.connect_port, DEFAULT_CONNECT_PORT);
    }

    #[test]
    fn startup_error_names_the_phase() {
        let err = fatal(StartupPhase::Config)(anyhow!("CORAL_WIREGUARD_PORT \"x\" is not a valid port"));
        let msg = err.to_string();
        assert!(msg.contains("config"));
        assert!(msg.contains("CORAL_WIREGUARD_PORT"));
    }
}
