use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const SECS_PER_DAY: u64 = 86_400;

/// Days remaining above which no renewal activity is needed.
pub const RENEWAL_THRESHOLD_DAYS: i64 = 30;
/// Days remaining at or below which the agent re-enrolls eagerly.
pub const EXPIRING_SOON_THRESHOLD_DAYS: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    Valid,
    RenewalNeeded,
    ExpiringSoon,
    Expired,
}

/// Identity credentials issued by the colony CA during bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertCredentials {
    pub private_key_pem: String,
    pub cert_chain_pem: String,
    /// SPIFFE-like identity, e.g. `spiffe://coral/colony/prod/agent/web01-api`.
    pub identity: String,
    /// Unix seconds.
    pub expires_at: u64,
}

impl CertCredentials {
    pub fn days_remaining_at(&self, now_secs: u64) -> i64 {
        (self.expires_at as i64 - now_secs as i64) / SECS_PER_DAY as i64
    }

    pub fn days_remaining(&self) -> i64 {
        self.days_remaining_at(unix_now())
    }

    pub fn status(&self) -> CertStatus {
        classify(self.days_remaining())
    }
}

/// Classification by days to expiry: > 30 valid, (15, 30] renewal needed,
/// (0, 15] expiring soon, otherwise expired.
pub fn classify(days_remaining: i64) -> CertStatus {
    if days_remaining > RENEWAL_THRESHOLD_DAYS {
        CertStatus::Valid
    } else if days_remaining > EXPIRING_SOON_THRESHOLD_DAYS {
        CertStatus::RenewalNeeded
    } else if days_remaining > 0 {
        CertStatus::ExpiringSoon
    } else {
        CertStatus::Expired
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct CertInfo {
    pub status: CertStatus,
    pub days_remaining: i64,
    pub agent_id: Option<String>,
}

/// On-disk credential store under `<base>/certs/`.
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new(base_dir: &std::path::Path) -> Self {
        CertStore {
            dir: base_dir.join("certs"),
        }
    }

    fn credentials_path(&self) -> PathBuf {
        self.dir.join("credentials.json")
    }

    fn agent_id_path(&self) -> PathBuf {
        self.dir.join("agent_id")
    }

    pub fn exists(&self) -> bool {
        self.credentials_path().exists()
    }

    pub fn load(&self) -> Result<CertCredentials> {
        let path = self.credentials_path();
        let raw = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, creds: &CertCredentials) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.credentials_path();
        fs::write(&path, serde_json::to_vec_pretty(creds)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Agent ID persistence is best-effort; callers treat failure as a
    /// warning.
    pub fn save_agent_id(&self, agent_id: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.agent_id_path(), agent_id.as_bytes())?;
        Ok(())
    }

    pub fn load_agent_id(&self) -> Option<String> {
        fs::read_to_string(self.agent_id_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn info(&self) -> Option<CertInfo> {
        let creds = self.load().ok()?;
        Some(CertInfo {
            status: creds.status(),
            days_remaining: creds.days_remaining(),
            agent_id: self.load_agent_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_threshold_table() {
        assert_eq!(classify(200), CertStatus::Valid);
        assert_eq!(classify(31), CertStatus::Valid);
        assert_eq!(classify(30), CertStatus::RenewalNeeded);
        assert_eq!(classify(16), CertStatus::RenewalNeeded);
        assert_eq!(classify(15), CertStatus::ExpiringSoon);
        assert_eq!(classify(1), CertStatus::ExpiringSoon);
        assert_eq!(classify(0), CertStatus::Expired);
        assert_eq!(classify(-5), CertStatus::Expired);
    }

    #[test]
    fn days_remaining_uses_expiry() {
        let creds = CertCredentials {
            private_key_pem: "key".into(),
            cert_chain_pem: "chain".into(),
            identity: "spiffe://coral/test".into(),
            expires_at: 200 * SECS_PER_DAY,
        };

        assert_eq!(creds.days_remaining_at(0), 200);
        assert_eq!(creds.days_remaining_at(199 * SECS_PER_DAY), 1);
        assert_eq!(creds.days_remaining_at(201 * SECS_PER_DAY), -1);
    }

    #[test]
    fn store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CertStore::new(tmp.path());

        assert!(!store.exists());

        let creds = CertCredentials {
            private_key_pem: "key".into(),
            cert_chain_pem: "chain".into(),
            identity: "spiffe://coral/colony/prod/agent/web01".into(),
            expires_at: unix_now() + 40 * SECS_PER_DAY,
        };
        store.save(&creds).unwrap();
        store.save_agent_id("web01-api").unwrap();

        assert!(store.exists());
        let loaded = store.load().unwrap();
        assert_eq!(loaded.identity, creds.identity);

        let info = store.info().unwrap();
        assert_eq!(info.status, CertStatus::Valid);
        assert_eq!(info.agent_id.as_deref(), Some("web01-api"));
    }
}
