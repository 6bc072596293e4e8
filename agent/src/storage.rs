use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

enum Backend {
    Disk { dir: PathBuf },
    Memory { docs: Mutex<HashMap<String, Value>> },
}

/// Telemetry document store. Disk-backed when the storage path is usable,
/// otherwise a plain in-memory map; opening never fails.
pub struct TelemetryStore {
    backend: Backend,
}

impl TelemetryStore {
    pub fn open(path: &Path) -> Self {
        match fs::create_dir_all(path) {
            Ok(()) => {
                info!(component = "storage", path = %path.display(), "telemetry store opened");
                TelemetryStore {
                    backend: Backend::Disk {
                        dir: path.to_path_buf(),
                    },
                }
            }
            Err(e) => {
                warn!(
                    component = "storage",
                    path = %path.display(),
                    reason = %e,
                    "storage unavailable; falling back to in-memory"
                );
                TelemetryStore::in_memory()
            }
        }
    }

    pub fn in_memory() -> Self {
        TelemetryStore {
            backend: Backend::Memory {
                docs: Mutex::new(HashMap::new()),
            },
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.backend, Backend::Memory { .. })
    }

    pub fn put(&self, key: &str, doc: &Value) -> Result<()> {
        match &self.backend {
            Backend::Disk { dir } => {
                let path = dir.join(format!("{}.json", sanitize(key)));
                fs::write(&path, serde_json::to_vec_pretty(doc)?)
                    .with_context(|| format!("writing {}", path.display()))?;
                Ok(())
            }
            Backend::Memory { docs } => {
                docs.lock().unwrap().insert(key.to_string(), doc.clone());
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match &self.backend {
            Backend::Disk { dir } => {
                let path = dir.join(format!("{}.json", sanitize(key)));
                let raw = fs::read(path).ok()?;
                serde_json::from_slice(&raw).ok()
            }
            Backend::Memory { docs } => docs.lock().unwrap().get(key).cloned(),
        }
    }
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disk_store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TelemetryStore::open(tmp.path());
        assert!(!store.is_memory());

        store.put("bootstrap/outcome", &json!({"outcome": "success"})).unwrap();
        let doc = store.get("bootstrap/outcome").unwrap();
        assert_eq!(doc["outcome"], "success");
    }

    #[test]
    fn unwritable_path_falls_back_to_memory() {
        let store = TelemetryStore::open(Path::new("/proc/nonexistent/coral"));
        assert!(store.is_memory());

        store.put("k", &json!(1)).unwrap();
        assert_eq!(store.get("k").unwrap(), json!(1));
    }
}
