use crate::discovery::ColonyInfo;
use std::net::IpAddr;

/// WireGuard port used when neither STUN nor colony metadata supplies one.
pub const DEFAULT_WIREGUARD_PORT: u16 = 51820;

/// Colony RPC port used when discovery reports `connect_port` as 0.
pub const DEFAULT_CONNECT_PORT: u16 = 9000;

/// Sticky connection memory consulted during endpoint selection.
#[derive(Debug, Default, Clone)]
pub struct StickyEndpoints {
    /// WireGuard endpoint of the most recent successful heartbeat.
    pub last_successful_endpoint: Option<String>,
    /// HTTP URL of the most recent successful registration.
    pub last_successful_reg_url: Option<String>,
}

/// Pick the colony WireGuard endpoint from discovery info plus sticky state.
///
/// Passes, in order; first hit wins:
/// 1. STUN-observed IPv4 endpoints (proven reachable from behind NAT).
///    Observed entries deliberately outrank a sticky match.
/// 2. Sticky reuse of `last_successful_endpoint` when it is still a candidate.
/// 3. Loopback candidates, when the last registration went to a loopback host.
/// 4. Remaining non-loopback discovery endpoints.
/// 5. Loopback fallback.
///
/// A relay pass would slot between 4 and 5 once `Discovery.request_relay`
/// sessions are wired into the datapath.
pub fn select_wg_endpoint(info: &ColonyInfo, sticky: &StickyEndpoints) -> Option<String> {
    for obs in &info.observed_endpoints {
        if obs.ip.is_empty() || obs.port == 0 {
            continue;
        }
        match obs.ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) if !ip.is_loopback() => {
                return Some(format!("{}:{}", obs.ip, obs.port));
            }
            _ => continue,
        }
    }

    let port = wireguard_port(info);
    let candidates: Vec<String> = info
        .endpoints
        .iter()
        .filter_map(|ep| host_of(ep))
        .map(|host| format_endpoint(host, port))
        .collect();

    // Sticky reuse honors loopback if loopback is what last worked.
    if let Some(last) = sticky.last_successful_endpoint.as_deref() {
        if candidates.iter().any(|c| c == last) {
            return Some(last.to_string());
        }
    }

    // Same-host deployments: when registration last succeeded against a
    // loopback URL, pin WireGuard to loopback as well.
    if sticky
        .last_successful_reg_url
        .as_deref()
        .map(reg_url_targets_loopback)
        .unwrap_or(false)
    {
        if let Some(local) = candidates.iter().find(|c| candidate_is_loopback(c)) {
            return Some(local.clone());
        }
    }

    for candidate in &candidates {
        if Some(candidate.as_str()) == sticky.last_successful_endpoint.as_deref() {
            continue;
        }
        if !candidate_is_loopback(candidate) {
            return Some(candidate.clone());
        }
    }

    candidates.into_iter().find(|c| candidate_is_loopback(c))
}

/// Determine the colony WireGuard port: first usable STUN observation, then
/// the `wireguard_port` metadata key, then the protocol default.
pub fn wireguard_port(info: &ColonyInfo) -> u16 {
    if let Some(obs) = info.observed_endpoints.first() {
        if obs.port != 0 {
            return obs.port;
        }
    }

    if let Some(raw) = info.metadata.get("wireguard_port") {
        if let Ok(port) = raw.parse::<u32>() {
            if port > 0 && port <= u16::MAX as u32 {
                return port as u16;
            }
        }
    }

    DEFAULT_WIREGUARD_PORT
}

/// Build the ordered HTTP registration URL candidates for a colony.
///
/// Hosts come from the discovery endpoints plus the colony mesh addresses,
/// deduplicated in insertion order. A sticky `last_successful_reg_url` is
/// moved to the front when still present.
pub fn registration_url_candidates(
    info: &ColonyInfo,
    last_successful_reg_url: Option<&str>,
    default_port: u16,
) -> Vec<String> {
    let port = if info.connect_port == 0 {
        default_port
    } else {
        info.connect_port
    };

    let mut urls: Vec<String> = Vec::new();
    let mut push = |host: &str| {
        if host.is_empty() {
            return;
        }
        let url = format!("http://{}:{}", bracket_host(host), port);
        if !urls.contains(&url) {
            urls.push(url);
        }
    };

    for ep in &info.endpoints {
        if let Some(host) = host_of(ep) {
            push(host);
        }
    }
    push(&info.mesh_ipv4);
    push(&info.mesh_ipv6);

    if let Some(sticky) = last_successful_reg_url {
        if let Some(pos) = urls.iter().position(|u| u == sticky) {
            let url = urls.remove(pos);
            urls.insert(0, url);
        }
    }

    urls
}

/// Split the host portion out of a "host:port" endpoint. Bracketed IPv6
/// forms are unwrapped.
fn host_of(endpoint: &str) -> Option<&str> {
    if let Some(end) = endpoint.rfind(']') {
        return endpoint.get(1..end);
    }

    match endpoint.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => Some(host),
        _ => Some(endpoint),
    }
}

fn format_endpoint(host: &str, port: u16) -> String {
    format!("{}:{}", bracket_host(host), port)
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_matches(['[', ']'])
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

fn candidate_is_loopback(candidate: &str) -> bool {
    host_of(candidate).map(is_loopback_host).unwrap_or(false)
}

fn reg_url_targets_loopback(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    host_of(authority).map(is_loopback_host).unwrap_or(false)
}
