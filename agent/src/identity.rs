use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Curve25519 keypair for the WireGuard overlay, base64 encoded. Generated
/// once per process during network initialization and never persisted.
#[derive(Debug, Clone)]
pub struct AgentKeys {
    pub private_key: String,
    pub public_key: String,
}

impl AgentKeys {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        AgentKeys {
            private_key: STANDARD.encode(secret.to_bytes()),
            public_key: STANDARD.encode(public.to_bytes()),
        }
    }
}

/// Derive the stable agent ID from the host name and the configured
/// services: host name lowercased with `.` and `_` mapped to `-`, suffixed
/// with the sole service name, `-multi` for two or more services, or left
/// bare for a passive agent.
pub fn derive_agent_id(host: &str, services: &[String]) -> String {
    let base: String = host
        .to_lowercase()
        .chars()
        .map(|c| if c == '.' || c == '_' { '-' } else { c })
        .collect();

    match services {
        [] => base,
        [only] => format!("{}-{}", base, only),
        _ => format!("{}-multi", base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_distinct_base64() {
        let a = AgentKeys::generate();
        let b = AgentKeys::generate();

        assert_ne!(a.private_key, b.private_key);
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(&a.public_key)
                .unwrap()
                .len(),
            32
        );
    }

    #[test]
    fn agent_id_mapping_rules() {
        assert_eq!(derive_agent_id("Web-01.prod_east", &[]), "web-01-prod-east");
        assert_eq!(
            derive_agent_id("web01", &["api".to_string()]),
            "web01-api"
        );
        assert_eq!(
            derive_agent_id("web01", &["api".to_string(), "worker".to_string()]),
            "web01-multi"
        );
    }
}
