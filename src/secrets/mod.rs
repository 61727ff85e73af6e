// Package secrets materialises remote secrets into local files before units start.

pub mod resolver;
pub mod source;

#[cfg(test)]
mod resolver_test;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{SecretSourceSpec, Secrets};
use crate::template::TemplateError;

pub use resolver::{ResolutionReport, SecretResolver};
pub use source::{FileSource, KubectlSource, SecretSource};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("fetch {namespace}/{secret}: {reason}")]
    Fetch {
        namespace: String,
        secret: String,
        reason: String,
    },
    #[error("bundle {bundle:?}: {source}")]
    Bundle {
        bundle: String,
        #[source]
        source: Box<SecretError>,
    },
    #[error("bundle {bundle:?}: key {key:?} missing from secret")]
    MissingKey { bundle: String, key: String },
    #[error("bundle {bundle:?}: key {key:?} is not valid base64 utf-8: {reason}")]
    Decode {
        bundle: String,
        key: String,
        reason: String,
    },
    #[error("bundle {bundle:?}: {source}")]
    Render {
        bundle: String,
        #[source]
        source: TemplateError,
    },
    #[error("bundle {bundle:?}: write {path:?}: {source}")]
    Write {
        bundle: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SecretError {
    /// Attaches the bundle name to a source-level error.
    pub fn for_bundle(self, bundle: &str) -> Self {
        match self {
            e @ SecretError::Fetch { .. } => SecretError::Bundle {
                bundle: bundle.to_string(),
                source: Box::new(e),
            },
            other => other,
        }
    }
}

/// Builds the configured secret source.
pub fn source_from_config(cfg: &Secrets) -> Arc<dyn SecretSource> {
    match &cfg.source {
        SecretSourceSpec::Kubectl { context, timeout } => {
            Arc::new(KubectlSource::new(context.clone(), *timeout))
        }
        SecretSourceSpec::File { path } => Arc::new(FileSource::new(path.clone())),
    }
}
