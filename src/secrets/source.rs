//! Where secret values come from.
//!
//! Every source returns the raw secret data: key -> base64 value, exactly as
//! a Kubernetes Secret stores it.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::SecretError;

pub type SecretData = BTreeMap<String, String>;

#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self, namespace: &str, name: &str) -> Result<SecretData, SecretError>;
}

fn fetch_err(namespace: &str, name: &str, reason: impl Into<String>) -> SecretError {
    SecretError::Fetch {
        namespace: namespace.to_string(),
        secret: name.to_string(),
        reason: reason.into(),
    }
}

/// Reads secrets from the live cluster with `kubectl get secret -o json`.
pub struct KubectlSource {
    context: Option<String>,
    timeout: Duration,
}

impl KubectlSource {
    pub fn new(context: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            context,
            timeout: timeout.unwrap_or(Duration::from_secs(15)),
        }
    }

    fn args(&self, namespace: &str, name: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(8);
        if let Some(ctx) = &self.context {
            args.push("--context".to_string());
            args.push(ctx.clone());
        }
        args.extend(
            ["get", "secret", name, "-n", namespace, "-o", "json"]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }
}

/// Extracts `.data` from a `kubectl get secret -o json` document.
pub fn parse_secret_json(namespace: &str, name: &str, raw: &[u8]) -> Result<SecretData, SecretError> {
    let doc: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| fetch_err(namespace, name, format!("invalid json: {}", e)))?;
    let Some(data) = doc.get("data").and_then(|d| d.as_object()) else {
        return Ok(SecretData::new());
    };
    data.iter()
        .map(|(k, v)| {
            v.as_str()
                .map(|s| (k.clone(), s.to_string()))
                .ok_or_else(|| fetch_err(namespace, name, format!("key {:?} is not a string", k)))
        })
        .collect()
}

#[async_trait]
impl SecretSource for KubectlSource {
    async fn fetch(&self, namespace: &str, name: &str) -> Result<SecretData, SecretError> {
        let output = Command::new("kubectl")
            .args(self.args(namespace, name))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, output)
            .await
            .map_err(|_| fetch_err(namespace, name, format!("kubectl timed out after {:?}", self.timeout)))?
            .map_err(|e| fetch_err(namespace, name, format!("kubectl: {}", e)))?;

        if !output.status.success() {
            return Err(fetch_err(
                namespace,
                name,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_secret_json(namespace, name, &output.stdout)
    }
}

/// Local stand-in store: a YAML document `namespace -> secret -> key -> base64`.
/// Re-read on every fetch so edits show up on refresh.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretSource for FileSource {
    async fn fetch(&self, namespace: &str, name: &str) -> Result<SecretData, SecretError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| fetch_err(namespace, name, format!("{:?}: {}", self.path, e)))?;
        let mut store: BTreeMap<String, BTreeMap<String, SecretData>> = serde_yaml::from_str(&text)
            .map_err(|e| fetch_err(namespace, name, format!("{:?}: {}", self.path, e)))?;
        store
            .get_mut(namespace)
            .and_then(|ns| ns.remove(name))
            .ok_or_else(|| fetch_err(namespace, name, "secret not found"))
    }
}

#[cfg(test)]
pub use memory::MemorySource;

#[cfg(test)]
mod memory {
    use super::*;
    use base64::Engine as _;
    use parking_lot::Mutex;

    /// In-memory source holding plain values; encodes on fetch.
    #[derive(Default)]
    pub struct MemorySource {
        secrets: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
    }

    impl MemorySource {
        pub fn insert(&self, namespace: &str, name: &str, key: &str, plain: &str) {
            self.secrets
                .lock()
                .entry((namespace.to_string(), name.to_string()))
                .or_default()
                .insert(
                    key.to_string(),
                    base64::engine::general_purpose::STANDARD.encode(plain),
                );
        }

        pub fn insert_raw(&self, namespace: &str, name: &str, key: &str, encoded: &str) {
            self.secrets
                .lock()
                .entry((namespace.to_string(), name.to_string()))
                .or_default()
                .insert(key.to_string(), encoded.to_string());
        }
    }

    #[async_trait]
    impl SecretSource for MemorySource {
        async fn fetch(&self, namespace: &str, name: &str) -> Result<SecretData, SecretError> {
            self.secrets
                .lock()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| fetch_err(namespace, name, "secret not found"))
        }
    }
}
