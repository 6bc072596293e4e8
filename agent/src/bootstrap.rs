use crate::certs::{CertCredentials, CertStatus, CertStore};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Overall deadline for the whole bootstrap operation.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-request deadline inside the enrollment exchange.
const ENROLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap requested but no CA fingerprint configured (CORAL_CA_FINGERPRINT)")]
    MissingFingerprint,
    #[error("bootstrap requested but no discovery endpoint configured (CORAL_DISCOVERY_ENDPOINT)")]
    MissingDiscoveryEndpoint,
    #[error("enrollment did not complete within {0:?}")]
    EnrollmentTimeout(Duration),
    #[error("enrollment rejected: {0}")]
    EnrollmentRejected(String),
    #[error("persisting credentials failed: {0}")]
    StoragePersistFailed(#[source] anyhow::Error),
}

/// Outcome metric recorded for every bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Success,
    Failure,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub agent_id: String,
    pub colony_id: String,
    /// `sha256:<hex>` fingerprint of the colony CA; mandatory for enrollment.
    pub ca_fingerprint: Option<String>,
    /// Pre-shared key authorizing first enrollment, if the colony demands one.
    pub psk: Option<String>,
    pub discovery_url: Option<String>,
    pub colony_endpoint: Option<String>,
    pub timeout: Duration,
    pub insecure: bool,
}

#[derive(Debug)]
pub struct BootstrapResult {
    pub credentials: CertCredentials,
    /// False when an existing certificate was reused without network I/O.
    pub bootstrapped: bool,
}

#[derive(Debug, Serialize)]
struct EnrollRequest<'a> {
    agent_id: &'a str,
    colony_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    psk: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    colony_endpoint: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EnrollResponse {
    private_key: String,
    cert_chain: String,
    spiffe_id: String,
    expires_at: u64,
    /// Base64 DER of the issuing CA, checked against the pinned fingerprint.
    ca_cert: String,
}

/// Obtain or reuse identity credentials.
///
/// An existing certificate short-circuits everything when it is `Valid` or
/// `RenewalNeeded` (background renewal is the certificate manager's
/// concern). `ExpiringSoon` enrolls eagerly but falls back to the existing
/// certificate when enrollment fails; `Expired` or absent must enroll.
pub async fn run(store: &CertStore, cfg: &BootstrapConfig) -> Result<BootstrapResult, BootstrapError> {
    let started = Instant::now();
    let result = run_inner(store, cfg).await;

    let outcome = match &result {
        Ok(_) => BootstrapOutcome::Success,
        Err(BootstrapError::EnrollmentTimeout(_)) => BootstrapOutcome::Timeout,
        Err(_) => BootstrapOutcome::Failure,
    };
    info!(
        component = "bootstrap",
        outcome = ?outcome,
        duration_ms = started.elapsed().as_millis() as u64,
        "bootstrap finished"
    );

    result
}

async fn run_inner(
    store: &CertStore,
    cfg: &BootstrapConfig,
) -> Result<BootstrapResult, BootstrapError> {
    let existing = if store.exists() {
        match store.load() {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!(component = "bootstrap", reason = %e, "existing certificate unreadable; enrolling");
                None
            }
        }
    } else {
        None
    };

    if let Some(creds) = &existing {
        match creds.status() {
            CertStatus::Valid => {
                return Ok(BootstrapResult {
                    credentials: creds.clone(),
                    bootstrapped: false,
                });
            }
            CertStatus::RenewalNeeded => {
                info!(
                    component = "bootstrap",
                    days_remaining = creds.days_remaining(),
                    "certificate due for background renewal; reusing it"
                );
                return Ok(BootstrapResult {
                    credentials: creds.clone(),
                    bootstrapped: false,
                });
            }
            CertStatus::ExpiringSoon => {
                info!(
                    component = "bootstrap",
                    days_remaining = creds.days_remaining(),
                    "certificate expiring soon; attempting enrollment"
                );
            }
            CertStatus::Expired => {
                warn!(component = "bootstrap", "certificate expired; enrollment required");
            }
        }
    }

    match enroll(cfg).await {
        Ok(credentials) => {
            store
                .save(&credentials)
                .map_err(BootstrapError::StoragePersistFailed)?;
            if let Err(e) = store.save_agent_id(&cfg.agent_id) {
                warn!(component = "bootstrap", reason = %e, "could not persist agent id");
            }
            Ok(BootstrapResult {
                credentials,
                bootstrapped: true,
            })
        }
        Err(e) => {
            // An almost-expired certificate still beats no certificate.
            if let Some(creds) = existing {
                if creds.status() == CertStatus::ExpiringSoon {
                    warn!(component = "bootstrap", reason = %e, "enrollment failed; keeping expiring certificate");
                    return Ok(BootstrapResult {
                        credentials: creds,
                        bootstrapped: false,
                    });
                }
            }
            Err(e)
        }
    }
}

async fn enroll(cfg: &BootstrapConfig) -> Result<CertCredentials, BootstrapError> {
    let fingerprint = cfg
        .ca_fingerprint
        .as_deref()
        .ok_or(BootstrapError::MissingFingerprint)?;
    let discovery_url = cfg
        .discovery_url
        .as_deref()
        .ok_or(BootstrapError::MissingDiscoveryEndpoint)?;

    match tokio::time::timeout(cfg.timeout, enroll_once(cfg, discovery_url, fingerprint)).await {
        Ok(result) => result,
        Err(_) => Err(BootstrapError::EnrollmentTimeout(cfg.timeout)),
    }
}

async fn enroll_once(
    cfg: &BootstrapConfig,
    discovery_url: &str,
    fingerprint: &str,
) -> Result<CertCredentials, BootstrapError> {
    let mut builder = reqwest::Client::builder().timeout(ENROLL_REQUEST_TIMEOUT);
    if cfg.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    let client = builder
        .build()
        .map_err(|e| BootstrapError::EnrollmentRejected(e.to_string()))?;

    let url = format!("{}/bootstrap/enroll", discovery_url.trim_end_matches('/'));
    let body = EnrollRequest {
        agent_id: &cfg.agent_id,
        colony_id: &cfg.colony_id,
        psk: cfg.psk.as_deref(),
        colony_endpoint: cfg.colony_endpoint.as_deref(),
    };

    let resp = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| BootstrapError::EnrollmentRejected(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let reason = resp.text().await.unwrap_or_default();
        return Err(BootstrapError::EnrollmentRejected(format!(
            "{} {}",
            status, reason
        )));
    }

    let enrolled: EnrollResponse = resp
        .json()
        .await
        .map_err(|e| BootstrapError::EnrollmentRejected(e.to_string()))?;

    verify_ca_fingerprint(fingerprint, &enrolled.ca_cert)?;

    Ok(CertCredentials {
        private_key_pem: enrolled.private_key,
        cert_chain_pem: enrolled.cert_chain,
        identity: enrolled.spiffe_id,
        expires_at: enrolled.expires_at,
    })
}

/// Check the issuing CA returned by enrollment against the pinned
/// `sha256:<hex>` fingerprint.
fn verify_ca_fingerprint(pinned: &str, ca_cert_b64: &str) -> Result<(), BootstrapError> {
    let hex = pinned
        .strip_prefix("sha256:")
        .ok_or_else(|| BootstrapError::EnrollmentRejected(format!(
            "CA fingerprint {:?} must use sha256:<hex> form",
            pinned
        )))?;

    let der = STANDARD
        .decode(ca_cert_b64.trim())
        .map_err(|_| BootstrapError::EnrollmentRejected("CA certificate is not valid base64".into()))?;

    let digest = Sha256::digest(&der);
    let actual: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    if !actual.eq_ignore_ascii_case(hex) {
        return Err(BootstrapError::EnrollmentRejected(format!(
            "CA fingerprint mismatch: pinned sha256:{}, presented sha256:{}",
            hex, actual
        )));
    }

    Ok(())
}
