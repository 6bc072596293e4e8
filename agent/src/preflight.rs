#[cfg(target_os = "macos")]
use anyhow::anyhow;
use anyhow::Result;
use serde::Serialize;
use std::fs;
use tracing::{info, warn};

// Linux capability bit numbers, from linux/capability.h.
const CAP_NET_ADMIN: u32 = 12;
const CAP_SYS_PTRACE: u32 = 19;
const CAP_SYS_ADMIN: u32 = 21;
const CAP_SYS_RESOURCE: u32 = 24;
const CAP_SYSLOG: u32 = 34;
const CAP_PERFMON: u32 = 38;
const CAP_BPF: u32 = 39;

/// What each capability unlocks. `alt` is an accepted substitute
/// (CAP_SYS_ADMIN predates the finer-grained bits).
struct Requirement {
    name: &'static str,
    effect: &'static str,
    bit: u32,
    alt: Option<u32>,
}

const REQUIREMENTS: &[Requirement] = &[
    Requirement { name: "CAP_NET_ADMIN", effect: "tunnel management", bit: CAP_NET_ADMIN, alt: None },
    Requirement { name: "CAP_BPF", effect: "eBPF collectors", bit: CAP_BPF, alt: Some(CAP_SYS_ADMIN) },
    Requirement { name: "CAP_PERFMON", effect: "CPU profiling", bit: CAP_PERFMON, alt: Some(CAP_SYS_ADMIN) },
    Requirement { name: "CAP_SYS_PTRACE", effect: "process tracing", bit: CAP_SYS_PTRACE, alt: None },
    Requirement { name: "CAP_SYS_RESOURCE", effect: "eBPF memory locking", bit: CAP_SYS_RESOURCE, alt: None },
    Requirement { name: "CAP_SYSLOG", effect: "kernel symbol resolution", bit: CAP_SYSLOG, alt: None },
];

/// Capability record sent to the colony during registration so it knows
/// which collectors this agent can run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EbpfCapabilities {
    pub collectors: bool,
    pub profiling: bool,
    pub tracing: bool,
    pub memlock: bool,
    pub kernel_symbols: bool,
}

#[derive(Debug)]
pub struct PreflightReport {
    pub elevated: bool,
    /// Human-readable "NAME (effect)" entries for everything absent.
    pub missing: Vec<String>,
    /// Set when the agent continues without some privilege.
    pub degraded: bool,
    pub ebpf: EbpfCapabilities,
}

/// Probe the host for the privileges the datapath and collectors need.
///
/// On macOS the agent cannot function without elevation, so absence is
/// fatal. On Linux each missing capability downgrades the corresponding
/// feature and the agent records itself as degraded.
pub fn probe() -> Result<PreflightReport> {
    let elevated = unsafe { libc::geteuid() } == 0;

    #[cfg(target_os = "macos")]
    {
        if !elevated {
            return Err(anyhow!(
                "elevated privileges are required on macOS for tunnel management; re-run with sudo"
            ));
        }

        return Ok(PreflightReport {
            elevated,
            missing: Vec::new(),
            degraded: false,
            ebpf: EbpfCapabilities {
                collectors: true,
                profiling: true,
                tracing: true,
                memlock: true,
                kernel_symbols: true,
            },
        });
    }

    #[cfg(not(target_os = "macos"))]
    {
        let caps = fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_cap_eff(&status))
            .unwrap_or(0);

        let report = evaluate(elevated, caps);

        for entry in &report.missing {
            warn!(component = "preflight", missing = %entry, "capability absent; feature degraded");
        }
        if report.degraded {
            warn!(component = "preflight", "starting degraded; some collectors disabled");
        } else {
            info!(component = "preflight", "all required capabilities present");
        }

        Ok(report)
    }
}

#[cfg_attr(target_os = "macos", allow(dead_code))]
fn evaluate(elevated: bool, caps: u64) -> PreflightReport {
    let has = |bit: u32| caps & (1u64 << bit) != 0;
    let satisfied = |req: &Requirement| has(req.bit) || req.alt.map(has).unwrap_or(false);

    let missing: Vec<String> = REQUIREMENTS
        .iter()
        .filter(|req| !satisfied(req))
        .map(|req| format!("{} ({})", req.name, req.effect))
        .collect();

    let ebpf = EbpfCapabilities {
        collectors: has(CAP_BPF) || has(CAP_SYS_ADMIN),
        profiling: has(CAP_PERFMON) || has(CAP_SYS_ADMIN),
        tracing: has(CAP_SYS_PTRACE),
        memlock: has(CAP_SYS_RESOURCE),
        kernel_symbols: has(CAP_SYSLOG),
    };

    PreflightReport {
        elevated,
        degraded: !missing.is_empty(),
        missing,
        ebpf,
    }
}

/// Pull the effective capability mask out of /proc/self/status.
#[cfg_attr(target_os = "macos", allow(dead_code))]
fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("CapEff:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: u64 = 0x0000_01ff_ffff_ffff;

    #[test]
    fn cap_eff_parses_proc_status() {
        let status = "Name:\tcoral-agent\nCapInh:\t0000000000000000\nCapEff:\t000001ffffffffff\n";
        assert_eq!(parse_cap_eff(status), Some(FULL));
        assert_eq!(parse_cap_eff("CapEff:\t0000000000000000\n"), Some(0));
        assert_eq!(parse_cap_eff("Name:\tx\n"), None);
    }

    #[test]
    fn full_mask_is_not_degraded() {
        let report = evaluate(true, FULL);
        assert!(!report.degraded);
        assert!(report.missing.is_empty());
        assert!(report.ebpf.collectors && report.ebpf.profiling);
    }

    #[test]
    fn sys_admin_substitutes_for_bpf_and_perfmon() {
        let caps = (1u64 << CAP_SYS_ADMIN) | (1u64 << CAP_NET_ADMIN);
        let report = evaluate(false, caps);

        assert!(report.ebpf.collectors);
        assert!(report.ebpf.profiling);
        // Still degraded: ptrace, resource and syslog are absent.
        assert!(report.degraded);
        assert!(report.missing.iter().any(|m| m.contains("CAP_SYS_PTRACE")));
    }

    #[test]
    fn empty_mask_reports_every_requirement() {
        let report = evaluate(false, 0);
        assert_eq!(report.missing.len(), REQUIREMENTS.len());
        assert!(report.degraded);
    }
}
