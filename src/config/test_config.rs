use super::{
    Api, Config, Devstack, Gateway, Logs, ProbeSpec, Scheduler, ServiceDescriptor, StackBox,
    UnitKind,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Creates a new test configuration.
pub fn new_test_config() -> Config {
    Devstack {
        stack: StackBox {
            env: super::TEST.to_string(),
            name: Some("devstack-test".to_string()),
            logs: Some(Logs {
                level: Some("debug".to_string()),
            }),
            api: Some(Api {
                name: Some("devstack-console".to_string()),
                port: Some("8097".to_string()),
                log_capacity: Some(200),
            }),
            scheduler: Some(Scheduler {
                max_concurrent_starts: None,
                shutdown_grace: Some(Duration::from_secs(2)),
                launch_window: Some(Duration::from_millis(200)),
            }),
            gateway: Some(Gateway {
                port: Some(8098),
                bind: Some("127.0.0.1".to_string()),
                rules_path: PathBuf::from("cfg/rules.yaml"),
                reload_interval: Some(Duration::from_millis(200)),
                upstream_timeout: Some(Duration::from_secs(2)),
                journal_capacity: Some(50),
                max_body_bytes: Some(1 << 20),
            }),
            secrets: None,
            services: vec![
                process_unit("db", &[]),
                process_unit("api", &["db"]),
                process_unit("ui", &["api"]),
            ],
        },
    }
}

/// Builds a process unit running `sleep` with a `launched` probe.
pub fn process_unit(name: &str, depends_on: &[&str]) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        kind: UnitKind::Process,
        command: Some(vec!["sleep".to_string(), "3600".to_string()]),
        image: None,
        working_dir: None,
        env: BTreeMap::new(),
        env_files: Vec::new(),
        secrets: Vec::new(),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        ports: Vec::new(),
        address: None,
        readiness: Some(ProbeSpec::launched()),
    }
}
