use crate::identity;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use tracing::{debug, info};

pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Agent-side WireGuard listen port. Offset from the colony default so
/// co-located deployments do not collide.
const DEFAULT_AGENT_WG_PORT: u16 = 51821;

/// A service this agent fronts inside the colony.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ServiceSpec {
    pub fn named(name: &str) -> Self {
        ServiceSpec {
            name: name.to_string(),
            port: None,
            labels: HashMap::new(),
        }
    }
}

/// One config layer as stored on disk. Every field optional so layers can
/// overlay each other.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub colony_id: Option<String>,
    pub colony_endpoint: Option<String>,
    pub discovery_endpoint: Option<String>,
    pub ca_fingerprint: Option<String>,
    pub bootstrap_psk: Option<String>,
    pub storage_path: Option<PathBuf>,
    pub wireguard_port: Option<u16>,
    pub stun_servers: Option<Vec<String>>,
    pub mesh_subnet: Option<String>,
    pub services: Option<Vec<ServiceSpec>>,
    pub heartbeat_interval_secs: Option<u64>,
    pub labels: Option<HashMap<String, String>>,
}

/// Environment overrides, parsed once. The set of recognized variables is
/// closed; anything else is ignored.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub colony_id: Option<String>,
    pub colony_endpoint: Option<String>,
    pub discovery_endpoint: Option<String>,
    pub ca_fingerprint: Option<String>,
    pub insecure: bool,
    pub storage_path: Option<PathBuf>,
    pub wireguard_port: Option<String>,
    pub stun_servers: Option<String>,
    pub mesh_subnet: Option<String>,
    pub services: Option<String>,
    pub heartbeat_interval: Option<String>,
}

impl EnvOverrides {
    pub fn from_process_env() -> Self {
        EnvOverrides {
            colony_id: env::var("CORAL_COLONY_ID").ok(),
            colony_endpoint: env::var("CORAL_COLONY_ENDPOINT").ok(),
            discovery_endpoint: env::var("CORAL_DISCOVERY_ENDPOINT").ok(),
            ca_fingerprint: env::var("CORAL_CA_FINGERPRINT").ok(),
            insecure: env::var("CORAL_INSECURE").is_ok(),
            storage_path: env::var("CORAL_STORAGE_PATH").ok().map(PathBuf::from),
            wireguard_port: env::var("CORAL_WIREGUARD_PORT").ok(),
            stun_servers: env::var("CORAL_STUN_SERVERS").ok(),
            mesh_subnet: env::var("CORAL_MESH_SUBNET").ok(),
            services: env::var("CORAL_SERVICES").ok(),
            heartbeat_interval: env::var("CORAL_HEARTBEAT_INTERVAL").ok(),
        }
    }
}

/// Fully merged configuration the rest of the agent runs on.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub agent_id: String,
    pub colony_id: String,
    pub colony_endpoint: Option<String>,
    pub discovery_endpoint: Option<String>,
    pub ca_fingerprint: Option<String>,
    pub bootstrap_psk: Option<String>,
    pub base_dir: PathBuf,
    pub storage_path: PathBuf,
    pub wireguard_port: u16,
    pub stun_servers: Vec<String>,
    pub mesh_subnet: Option<String>,
    pub services: Vec<ServiceSpec>,
    pub heartbeat_interval: Duration,
    pub labels: HashMap<String, String>,
    pub insecure: bool,
}

/// Base directory holding global config, per-colony configs and certs.
pub fn base_dir() -> PathBuf {
    if let Ok(dir) = env::var("CORAL_CONFIG") {
        return PathBuf::from(dir);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".coral")
}

fn load_layer(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }

    let raw = fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing config {}", path.display()))
}

/// Resolve configuration with the fixed precedence (highest wins):
/// env overrides, project-local, per-colony, global, built-in defaults.
pub fn resolve() -> Result<ResolvedConfig> {
    let base = base_dir();
    let envs = EnvOverrides::from_process_env();

    let global = load_layer(&base.join("config.json"))?;
    let project = load_layer(Path::new(".coral/config.json"))?;

    // Colony id has to settle before the per-colony layer can load.
    let colony_id = envs
        .colony_id
        .clone()
        .or_else(|| project.colony_id.clone())
        .or_else(|| global.colony_id.clone())
        .or_else(|| envs.colony_endpoint.as_ref().map(|_| "default".to_string()))
        .ok_or_else(|| {
            anyhow!("no colony configured: set CORAL_COLONY_ID or add colony_id to a config file")
        })?;

    let colony = load_layer(&base.join("colonies").join(format!("{}.json", colony_id)))?;

    resolve_layers(&base, colony_id, global, colony, project, envs)
}

/// Pure merge over already-loaded layers. Split out so precedence is
/// testable without touching the filesystem or process environment.
pub fn resolve_layers(
    base: &Path,
    colony_id: String,
    global: FileConfig,
    colony: FileConfig,
    project: FileConfig,
    envs: EnvOverrides,
) -> Result<ResolvedConfig> {
    // Low to high: global < colony < project.
    let mut merged = global;
    for layer in [colony, project] {
        overlay(&mut merged, layer);
    }

    let colony_endpoint = envs.colony_endpoint.clone().or(merged.colony_endpoint);
    if colony_endpoint.is_some() && merged.discovery_endpoint.is_none() {
        info!(colony = %colony_id, "config-less mode: colony endpoint supplied directly");
    }

    let wireguard_port = match envs.wireguard_port.as_deref() {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| anyhow!("CORAL_WIREGUARD_PORT {:?} is not a valid port", raw))?,
        None => merged.wireguard_port.unwrap_or(DEFAULT_AGENT_WG_PORT),
    };

    let stun_servers = match envs.stun_servers.as_deref() {
        Some(raw) => split_list(raw),
        None => merged
            .stun_servers
            .unwrap_or_else(|| vec![DEFAULT_STUN_SERVER.to_string()]),
    };

    let mesh_subnet = envs.mesh_subnet.clone().or(merged.mesh_subnet);
    if let Some(subnet) = &mesh_subnet {
        validate_cidr(subnet)?;
    }

    let services = match envs.services.as_deref() {
        Some(raw) => split_list(raw).into_iter().map(|n| ServiceSpec::named(&n)).collect(),
        None => merged.services.unwrap_or_default(),
    };

    let heartbeat_interval = match envs.heartbeat_interval.as_deref() {
        Some(raw) => parse_duration_secs(raw)
            .ok_or_else(|| anyhow!("CORAL_HEARTBEAT_INTERVAL {:?} is not a valid duration", raw))?,
        None => Duration::from_secs(
            merged
                .heartbeat_interval_secs
                .unwrap_or(DEFAULT_HEARTBEAT_SECS),
        ),
    };

    let storage_path = envs
        .storage_path
        .clone()
        .or(merged.storage_path)
        .unwrap_or_else(default_storage_path);

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "agent".to_string());
    let service_names: Vec<String> = services.iter().map(|s| s.name.clone()).collect();
    let agent_id = identity::derive_agent_id(&host, &service_names);

    debug!(agent_id = %agent_id, colony = %colony_id, services = services.len(), "config resolved");

    Ok(ResolvedConfig {
        agent_id,
        colony_id,
        colony_endpoint,
        discovery_endpoint: envs.discovery_endpoint.clone().or(merged.discovery_endpoint),
        ca_fingerprint: envs.ca_fingerprint.clone().or(merged.ca_fingerprint),
        bootstrap_psk: merged.bootstrap_psk,
        base_dir: base.to_path_buf(),
        storage_path,
        wireguard_port,
        stun_servers,
        mesh_subnet,
        services,
        heartbeat_interval,
        labels: merged.labels.unwrap_or_default(),
        insecure: envs.insecure,
    })
}

fn overlay(base: &mut FileConfig, layer: FileConfig) {
    macro_rules! take {
        ($field:ident) => {
            if layer.$field.is_some() {
                base.$field = layer.$field;
            }
        };
    }

    take!(colony_id);
    take!(colony_endpoint);
    take!(discovery_endpoint);
    take!(ca_fingerprint);
    take!(bootstrap_psk);
    take!(storage_path);
    take!(wireguard_port);
    take!(stun_servers);
    take!(mesh_subnet);
    take!(services);
    take!(heartbeat_interval_secs);
    take!(labels);
}

fn default_storage_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("coral")
        .join("agent")
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Accepts "30" or "30s".
fn parse_duration_secs(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim().trim_end_matches('s');
    trimmed.parse::<u64>().ok().filter(|n| *n > 0).map(Duration::from_secs)
}

fn validate_cidr(raw: &str) -> Result<()> {
    let (addr, prefix) = raw
        .split_once('/')
        .ok_or_else(|| anyhow!("mesh subnet {:?} is not CIDR notation", raw))?;

    addr.parse::<Ipv4Addr>()
        .map_err(|_| anyhow!("mesh subnet {:?} has an invalid address", raw))?;

    let bits: u8 = prefix
        .parse()
        .map_err(|_| anyhow!("mesh subnet {:?} has an invalid prefix", raw))?;
    if bits > 32 {
        return Err(anyhow!("mesh subnet {:?} prefix exceeds 32", raw));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers() -> (FileConfig, FileConfig, FileConfig) {
        let global = FileConfig {
            discovery_endpoint: Some("https://disco.global:8443".into()),
            wireguard_port: Some(51820),
            heartbeat_interval_secs: Some(60),
            ..FileConfig::default()
        };
        let colony = FileConfig {
            discovery_endpoint: Some("https://disco.colony:8443".into()),
            mesh_subnet: Some("100.64.0.0/10".into()),
            ..FileConfig::default()
        };
        let project = FileConfig {
            services: Some(vec![ServiceSpec::named("api")]),
            ..FileConfig::default()
        };
        (global, colony, project)
    }

    #[test]
    fn later_layers_win() {
        let (global, colony, project) = layers();
        let cfg = resolve_layers(
            Path::new("/tmp/coral-test"),
            "prod".into(),
            global,
            colony,
            project,
            EnvOverrides::default(),
        )
        .unwrap();

        assert_eq!(cfg.discovery_endpoint.as_deref(), Some("https://disco.colony:8443"));
        assert_eq!(cfg.wireguard_port, 51820);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(cfg.services.len(), 1);
    }

    #[test]
    fn env_beats_every_file_layer() {
        let (global, colony, project) = layers();
        let envs = EnvOverrides {
            discovery_endpoint: Some("https://disco.env:8443".into()),
            heartbeat_interval: Some("15s".into()),
            services: Some("api,worker".into()),
            ..EnvOverrides::default()
        };

        let cfg = resolve_layers(
            Path::new("/tmp/coral-test"),
            "prod".into(),
            global,
            colony,
            project,
            envs,
        )
        .unwrap();

        assert_eq!(cfg.discovery_endpoint.as_deref(), Some("https://disco.env:8443"));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.services.len(), 2);
    }

    #[test]
    fn malformed_port_and_duration_are_fatal() {
        let envs = EnvOverrides {
            wireguard_port: Some("seventy".into()),
            ..EnvOverrides::default()
        };
        assert!(resolve_layers(
            Path::new("/tmp/coral-test"),
            "prod".into(),
            FileConfig::default(),
            FileConfig::default(),
            FileConfig::default(),
            envs,
        )
        .is_err());

        let envs = EnvOverrides {
            heartbeat_interval: Some("soon".into()),
            ..EnvOverrides::default()
        };
        assert!(resolve_layers(
            Path::new("/tmp/coral-test"),
            "prod".into(),
            FileConfig::default(),
            FileConfig::default(),
            FileConfig::default(),
            envs,
        )
        .is_err());
    }

    #[test]
    fn invalid_mesh_subnet_is_fatal() {
        let envs = EnvOverrides {
            mesh_subnet: Some("100.64.0.0/40".into()),
            ..EnvOverrides::default()
        };
        assert!(resolve_layers(
            Path::new("/tmp/coral-test"),
            "prod".into(),
            FileConfig::default(),
            FileConfig::default(),
            FileConfig::default(),
            envs,
        )
        .is_err());
    }
}
