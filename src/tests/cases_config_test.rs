// End-to-end tests for configuration rejection before anything starts.

use std::collections::BTreeMap;

use crate::app::{check, App};
use crate::config::{Config, Destination, SecretBundle, SecretSourceSpec, Secrets};
use crate::support::{sh_unit, stack_config};
use tokio_util::sync::CancellationToken;

/// A dependency cycle is reported with its path and nothing is launched.
#[tokio::test]
async fn test_cycle_rejected_before_start() {
    let marker = tempfile::tempdir().unwrap();
    let touched = marker.path().join("started");
    let script = format!("touch {}; sleep 60", touched.display());
    let cfg = stack_config(vec![
        sh_unit("a", &["c"], &script),
        sh_unit("b", &["a"], &script),
        sh_unit("c", &["b"], &script),
    ]);

    let err = App::new(CancellationToken::new(), cfg.clone()).await.err().unwrap();
    let msg = format!("{:#}", err);
    assert!(msg.contains("dependency cycle"), "got: {}", msg);
    assert!(check(&cfg).is_err());
    assert!(!touched.exists());
}

/// Unknown dependencies are rejected by `check`.
#[test]
fn test_unknown_dependency_rejected() {
    let cfg = stack_config(vec![sh_unit("api", &["db"], "sleep 1")]);
    let msg = format!("{:#}", check(&cfg).unwrap_err());
    assert!(msg.contains("unknown service"), "got: {}", msg);
}

/// `check` reports layers without starting anything.
#[test]
fn test_check_reports_layers() {
    let cfg = stack_config(vec![
        sh_unit("db", &[], "sleep 1"),
        sh_unit("cache", &[], "sleep 1"),
        sh_unit("api", &["db", "cache"], "sleep 1"),
    ]);
    let report = check(&cfg).unwrap();
    assert_eq!(report.layers.len(), 2);
    assert_eq!(report.layers[1], vec!["api".to_string()]);
    assert!(report.rules.is_none());
}

fn with_failing_secrets(mut cfg: Config, store: &std::path::Path, out: &std::path::Path, block: bool) -> Config {
    std::fs::write(store, "justice: {}\n").unwrap();
    cfg.stack.secrets = Some(Secrets {
        on_failure: if block {
            crate::config::SecretFailurePolicy::Block
        } else {
            crate::config::SecretFailurePolicy::Abort
        },
        source: SecretSourceSpec::File {
            path: store.to_path_buf(),
        },
        bundles: vec![SecretBundle {
            name: "db-creds".to_string(),
            namespace: "justice".to_string(),
            secret: "db-creds".to_string(),
            destination: Destination {
                path: out.to_path_buf(),
                template: None,
                substitutions: BTreeMap::new(),
            },
        }],
    });
    cfg
}

/// Under the abort policy a missing secret fails startup naming the bundle.
#[tokio::test]
async fn test_missing_secret_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = with_failing_secrets(
        stack_config(vec![sh_unit("db", &[], "sleep 60")]),
        &dir.path().join("store.yaml"),
        &dir.path().join("db.env"),
        false,
    );
    let err = App::new(CancellationToken::new(), cfg).await.err().unwrap();
    assert!(err.to_string().contains("db-creds"), "got: {}", err);
    assert!(!dir.path().join("db.env").exists());
}

/// Under the block policy the app starts and the reading unit stays pending.
#[tokio::test]
async fn test_missing_secret_blocks_unit() {
    let dir = tempfile::tempdir().unwrap();
    let mut api = sh_unit("api", &[], "sleep 60");
    api.secrets = vec!["db-creds".to_string()];
    let cfg = with_failing_secrets(
        stack_config(vec![api]),
        &dir.path().join("store.yaml"),
        &dir.path().join("db.env"),
        true,
    );
    let stack = crate::support::TestStack::start(cfg).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let api = stack.handle().unit("api").unwrap();
    assert_eq!(api.state, "pending");
    assert!(api.blocked_by.unwrap().contains("db-creds"));
    stack.stop().await.unwrap();
}
