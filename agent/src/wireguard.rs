use anyhow::{anyhow, Result};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use tracing::{info, warn};

const DEFAULT_INTERFACE: &str = "coral0";
const DEFAULT_MTU: u16 = 1420;

/// Colony peer configuration applied to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCfg {
    pub public_key: String,
    pub endpoint: String,
    /// CIDR entries routed through the peer (colony mesh IPv4 /32, IPv6 /128).
    pub allowed_ips: Vec<String>,
    pub keepalive_secs: u16,
}

/// The datapath operations the connection manager drives. Split out so the
/// state machine can be exercised against a recording fake.
pub trait Datapath: Send + Sync {
    /// Put exactly this address on the interface, replacing whatever was
    /// there. Called before `add_peer` so routes are correct from the first
    /// packet.
    fn assign_ip(&self, ip: &str, subnet: &str) -> Result<()>;

    /// Install or replace the colony peer.
    fn add_peer(&self, peer: &PeerCfg) -> Result<()>;

    /// Re-install routes for the current peer's allowed IPs.
    fn refresh_routes(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct DeviceState {
    address: Option<(String, String)>,
    peer: Option<PeerCfg>,
    up: bool,
}

/// WireGuard device managed through a rendered config file plus runtime
/// `wg` / `ip` invocations.
pub struct WgDevice {
    iface: String,
    private_key: String,
    listen_port: u16,
    mtu: u16,
    config_path: PathBuf,
    state: Mutex<DeviceState>,
}

impl WgDevice {
    pub fn create(private_key: &str, listen_port: u16, mtu: Option<u16>) -> Self {
        let iface = DEFAULT_INTERFACE.to_string();
        let config_path = PathBuf::from("/etc/wireguard").join(format!("{}.conf", iface));

        WgDevice {
            iface,
            private_key: private_key.to_string(),
            listen_port,
            mtu: mtu.unwrap_or(DEFAULT_MTU),
            config_path,
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn interface(&self) -> &str {
        &self.iface
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Bring the tunnel up with no peer and no address; both arrive after
    /// registration.
    pub fn start(&self) -> Result<()> {
        let rendered = {
            let state = self.state.lock().unwrap();
            self.render(&state)
        };
        self.persist(&rendered)?;

        if self.already_up() {
            info!(component = "wireguard", iface = %self.iface, "interface already up");
        } else {
            let status = Command::new("wg-quick")
                .arg("up")
                .arg(&self.config_path)
                .status()
                .map_err(|e| anyhow!("invoking wg-quick: {}", e))?;
            if !status.success() {
                return Err(anyhow!("wg-quick up {} failed with {}", self.iface, status));
            }
            info!(component = "wireguard", iface = %self.iface, port = self.listen_port, "interface up");
        }

        self.state.lock().unwrap().up = true;
        Ok(())
    }

    pub fn stop(&self) {
        let up = self.state.lock().unwrap().up;
        if !up {
            return;
        }

        if let Err(e) = Command::new("wg-quick").arg("down").arg(&self.config_path).status() {
            warn!(component = "wireguard", iface = %self.iface, reason = %e, "wg-quick down failed");
        }
        self.state.lock().unwrap().up = false;
    }

    fn already_up(&self) -> bool {
        Command::new("wg")
            .arg("show")
            .arg(&self.iface)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Drop every route pointing at the interface. Unused at steady state
    /// since assign-then-add keeps routes correct, kept for operator rescue.
    pub fn flush_peer_routes(&self) {
        let _ = Command::new("ip")
            .args(["route", "flush", "dev", &self.iface])
            .status();
    }

    fn render(&self, state: &DeviceState) -> String {
        let mut lines = vec!["[Interface]".to_string()];
        lines.push(format!("PrivateKey = {}", self.private_key));
        lines.push(format!("ListenPort = {}", self.listen_port));
        lines.push(format!("MTU = {}", self.mtu));
        if let Some((ip, subnet)) = &state.address {
            lines.push(format!("Address = {}/{}", ip, prefix_of(subnet)));
        }

        if let Some(peer) = &state.peer {
            lines.push(String::new());
            lines.push("[Peer]".to_string());
            lines.push(format!("PublicKey = {}", peer.public_key));
            lines.push(format!("AllowedIPs = {}", peer.allowed_ips.join(", ")));
            lines.push(format!("Endpoint = {}", peer.endpoint));
            lines.push(format!("PersistentKeepalive = {}", peer.keepalive_secs));
        }

        lines.join("\n") + "\n"
    }

    fn persist(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Ok(existing) = fs::read_to_string(&self.config_path) {
            if existing == contents {
                return Ok(());
            }
        }

        fs::write(&self.config_path, contents)?;
        Ok(())
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| anyhow!("invoking {}: {}", program, e))?;
        if !status.success() {
            return Err(anyhow!("{} {} failed with {}", program, args.join(" "), status));
        }
        Ok(())
    }
}

impl Datapath for WgDevice {
    fn assign_ip(&self, ip: &str, subnet: &str) -> Result<()> {
        let cidr = format!("{}/{}", ip, prefix_of(subnet));

        // The interface carries exactly the assigned address.
        let _ = Command::new("ip")
            .args(["-4", "address", "flush", "dev", &self.iface])
            .status();
        self.run("ip", &["address", "replace", &cidr, "dev", &self.iface])?;

        let rendered = {
            let mut state = self.state.lock().unwrap();
            state.address = Some((ip.to_string(), subnet.to_string()));
            self.render(&state)
        };
        self.persist(&rendered)?;

        info!(component = "wireguard", iface = %self.iface, address = %cidr, "interface address assigned");
        Ok(())
    }

    fn add_peer(&self, peer: &PeerCfg) -> Result<()> {
        let previous = self.state.lock().unwrap().peer.clone();

        if let Some(old) = &previous {
            if old.public_key != peer.public_key {
                let _ = Command::new("wg")
                    .args(["set", &self.iface, "peer", &old.public_key, "remove"])
                    .status();
            }
        }

        let keepalive = peer.keepalive_secs.to_string();
        let allowed = peer.allowed_ips.join(",");
        self.run(
            "wg",
            &[
                "set",
                &self.iface,
                "peer",
                &peer.public_key,
                "endpoint",
                &peer.endpoint,
                "persistent-keepalive",
                &keepalive,
                "allowed-ips",
                &allowed,
            ],
        )?;

        let rendered = {
            let mut state = self.state.lock().unwrap();
            state.peer = Some(peer.clone());
            self.render(&state)
        };
        self.persist(&rendered)?;

        info!(component = "wireguard", iface = %self.iface, endpoint = %peer.endpoint, "colony peer configured");
        self.refresh_routes()
    }

    fn refresh_routes(&self) -> Result<()> {
        let allowed = match &self.state.lock().unwrap().peer {
            Some(peer) => peer.allowed_ips.clone(),
            None => return Ok(()),
        };

        for cidr in allowed {
            self.run("ip", &["route", "replace", &cidr, "dev", &self.iface])?;
        }

        Ok(())
    }
}

/// Prefix length of a CIDR subnet; a bare address counts as host-routed.
fn prefix_of(subnet: &str) -> u8 {
    subnet
        .rsplit_once('/')
        .and_then(|(_, bits)| bits.parse().ok())
        .unwrap_or(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_interface_only_before_registration() {
        let dev = WgDevice::create("PRIVKEY", 51821, None);
        let rendered = dev.render(&DeviceState::default());

        assert_eq!(
            rendered,
            "[Interface]\nPrivateKey = PRIVKEY\nListenPort = 51821\nMTU = 1420\n"
        );
    }

    #[test]
    fn renders_peer_with_keepalive() {
        let dev = WgDevice::create("PRIVKEY", 51821, Some(1380));
        let state = DeviceState {
            address: Some(("100.64.0.7".into(), "100.64.0.0/10".into())),
            peer: Some(PeerCfg {
                public_key: "COLONYKEY".into(),
                endpoint: "1.2.3.4:51820".into(),
                allowed_ips: vec!["100.64.0.1/32".into(), "fd00::1/128".into()],
                keepalive_secs: 25,
            }),
            up: false,
        };

        let rendered = dev.render(&state);
        assert!(rendered.contains("Address = 100.64.0.7/10"));
        assert!(rendered.contains("MTU = 1380"));
        assert!(rendered.contains("AllowedIPs = 100.64.0.1/32, fd00::1/128"));
        assert!(rendered.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn prefix_defaults_to_host_route() {
        assert_eq!(prefix_of("100.64.0.0/10"), 10);
        assert_eq!(prefix_of("100.64.0.7"), 32);
        assert_eq!(prefix_of("100.64.0.0/nope"), 32);
    }
}
