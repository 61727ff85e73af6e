//! Secret bundle resolution.
//!
//! A bundle is fetched, decoded, rendered and written in one pass. Any failure
//! fails the whole bundle and leaves its destination untouched.

use base64::Engine as _;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use super::source::SecretSource;
use super::SecretError;
use crate::config::SecretBundle;
use crate::metrics;
use crate::template;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionReport {
    /// Bundle name -> written file.
    pub resolved: BTreeMap<String, PathBuf>,
    /// Bundle name -> error message.
    pub failed: BTreeMap<String, String>,
}

impl ResolutionReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.failed.keys().cloned().collect()
    }
}

pub struct SecretResolver {
    source: Arc<dyn SecretSource>,
    bundles: Vec<SecretBundle>,
}

impl SecretResolver {
    pub fn new(source: Arc<dyn SecretSource>, bundles: Vec<SecretBundle>) -> Self {
        Self { source, bundles }
    }

    pub fn bundles(&self) -> &[SecretBundle] {
        &self.bundles
    }

    /// Resolves every bundle. Failures are collected, not short-circuited.
    pub async fn resolve_all(&self) -> ResolutionReport {
        let mut report = ResolutionReport::default();
        for bundle in &self.bundles {
            let result = self.resolve(bundle).await;
            metrics::record_bundle(&bundle.name, result.is_ok());
            match result {
                Ok(path) => {
                    info!(
                        component = "secrets",
                        event = "bundle_resolved",
                        bundle = %bundle.name,
                        path = ?path,
                        "secret bundle written"
                    );
                    report.resolved.insert(bundle.name.clone(), path);
                }
                Err(e) => {
                    error!(
                        component = "secrets",
                        event = "bundle_failed",
                        bundle = %bundle.name,
                        error = %e,
                        "secret bundle failed"
                    );
                    report.failed.insert(bundle.name.clone(), e.to_string());
                }
            }
        }
        report
    }

    /// Re-runs resolution for every bundle.
    pub async fn refresh(&self) -> ResolutionReport {
        info!(component = "secrets", event = "refresh", bundles = self.bundles.len(), "refreshing secret bundles");
        self.resolve_all().await
    }

    pub async fn resolve(&self, bundle: &SecretBundle) -> Result<PathBuf, SecretError> {
        let data = self
            .source
            .fetch(&bundle.namespace, &bundle.secret)
            .await
            .map_err(|e| e.for_bundle(&bundle.name))?;
        let values = decode(bundle, &data)?;
        let rendered = render(bundle, &values)?;
        write_atomic(&bundle.name, &bundle.destination.path, rendered.as_bytes())?;
        Ok(bundle.destination.path.clone())
    }
}

/// Placeholder -> decoded value. Without substitutions every key in the
/// secret is its own placeholder.
fn decode(bundle: &SecretBundle, data: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>, SecretError> {
    let pairs: Vec<(String, String)> = if bundle.destination.substitutions.is_empty() {
        data.keys().map(|k| (k.clone(), k.clone())).collect()
    } else {
        bundle
            .destination
            .substitutions
            .iter()
            .map(|(p, k)| (p.clone(), k.clone()))
            .collect()
    };

    let mut values = BTreeMap::new();
    for (placeholder, key) in pairs {
        let encoded = data.get(&key).ok_or_else(|| SecretError::MissingKey {
            bundle: bundle.name.clone(),
            key: key.clone(),
        })?;
        let decode_err = |reason: String| SecretError::Decode {
            bundle: bundle.name.clone(),
            key: key.clone(),
            reason,
        };
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| decode_err(e.to_string()))?;
        let text = String::from_utf8(raw).map_err(|e| decode_err(e.to_string()))?;
        values.insert(placeholder, text);
    }
    Ok(values)
}

fn render(bundle: &SecretBundle, values: &BTreeMap<String, String>) -> Result<String, SecretError> {
    match &bundle.destination.template {
        Some(text) => template::render(text, values).map_err(|source| SecretError::Render {
            bundle: bundle.name.clone(),
            source,
        }),
        None => Ok(values
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect()),
    }
}

/// Writes through a temp file in the destination directory and renames it
/// into place, so readers see either the old or the new file.
pub fn write_atomic(bundle: &str, path: &Path, contents: &[u8]) -> Result<(), SecretError> {
    let write_err = |source: std::io::Error| SecretError::Write {
        bundle: bundle.to_string(),
        path: path.to_path_buf(),
        source,
    };

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| bundle.to_string());
    let tmp = dir.join(format!(".{}.tmp-{}", file_name, std::process::id()));

    let result = (|| {
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        f.write_all(contents)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(write_err(e));
    }
    Ok(())
}
