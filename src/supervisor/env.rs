//! Environment assembly for launched units.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{LaunchSpec, SupervisorError};
use crate::config::{ServiceDescriptor, UnitKind};

/// Environment variable carrying the gateway base URL.
pub const GATEWAY_URL_ENV: &str = "DEVSTACK_GATEWAY_URL";

/// Parses `KEY=VALUE` lines. Blank lines and `#` comments are skipped, an
/// `export ` prefix is tolerated and matching outer quotes are stripped.
pub fn parse_env(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    out
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

pub fn read_env_file(unit: &str, path: &Path) -> Result<BTreeMap<String, String>, SupervisorError> {
    let text = std::fs::read_to_string(path).map_err(|e| SupervisorError::InvalidSpec {
        unit: unit.to_string(),
        reason: format!("env file {:?}: {}", path, e),
    })?;
    Ok(parse_env(&text))
}

/// Builds the launch spec for a descriptor. Later sources win: `base`, then
/// env files in order, then secret bundle outputs, then inline `env`.
pub fn build_launch_spec(
    desc: &ServiceDescriptor,
    bundle_outputs: &BTreeMap<String, PathBuf>,
    base: &BTreeMap<String, String>,
) -> Result<LaunchSpec, SupervisorError> {
    let mut env = base.clone();

    for file in &desc.env_files {
        let path = match &desc.working_dir {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file.clone(),
        };
        env.extend(read_env_file(&desc.name, &path)?);
    }

    for bundle in &desc.secrets {
        let path = bundle_outputs
            .get(bundle)
            .ok_or_else(|| SupervisorError::InvalidSpec {
                unit: desc.name.clone(),
                reason: format!("unknown secret bundle {:?}", bundle),
            })?;
        env.extend(read_env_file(&desc.name, path)?);
    }

    env.extend(desc.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let command = desc.command.clone().unwrap_or_default();
    if desc.kind == UnitKind::Process && command.is_empty() {
        return Err(SupervisorError::InvalidSpec {
            unit: desc.name.clone(),
            reason: "process unit without a command".to_string(),
        });
    }

    Ok(LaunchSpec {
        name: desc.name.clone(),
        kind: desc.kind,
        command,
        image: desc.image.clone(),
        working_dir: desc.working_dir.clone(),
        env,
        ports: desc.ports.clone(),
    })
}
