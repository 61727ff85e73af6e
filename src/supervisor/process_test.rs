#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::UnitKind;
    use crate::supervisor::{
        LaunchSpec, LogHub, ProcessSupervisor, StopOutcome, Supervisor, SupervisorError,
    };

    fn sh(name: &str, script: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            kind: UnitKind::Process,
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            image: None,
            working_dir: None,
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            ports: Vec::new(),
        }
    }

    fn supervisor() -> (Arc<LogHub>, ProcessSupervisor) {
        let logs = Arc::new(LogHub::new(100));
        let sup = ProcessSupervisor::new(logs.clone(), Duration::from_millis(300));
        (logs, sup)
    }

    /// A nonzero exit inside the launch window is a launch failure carrying
    /// the exit code and the last output lines.
    #[tokio::test]
    async fn test_launch_failure_reports_diagnostics() {
        let (_, sup) = supervisor();
        let err = sup
            .start(&sh("broken", "echo missing config >&2; exit 3"))
            .await
            .unwrap_err();

        match err {
            SupervisorError::LaunchFailed {
                unit,
                code,
                diagnostics,
            } => {
                assert_eq!(unit, "broken");
                assert_eq!(code, Some(3));
                assert!(diagnostics.contains("missing config"), "{}", diagnostics);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!sup.is_tracked("broken"));
    }

    /// A missing binary fails at spawn.
    #[tokio::test]
    async fn test_spawn_error() {
        let (_, sup) = supervisor();
        let mut spec = sh("ghost", "");
        spec.command = vec!["/no/such/binary".to_string()];
        assert!(matches!(
            sup.start(&spec).await,
            Err(SupervisorError::Spawn { .. })
        ));
    }

    /// Output is captured per stream with the unit env applied.
    #[tokio::test]
    async fn test_output_is_captured() {
        let (logs, sup) = supervisor();
        let launched = sup
            .start(&sh("echo", "echo $GREETING; sleep 0.5; exit 0"))
            .await
            .unwrap();
        assert!(launched.pid.is_some());

        let mut exit = launched.exit.clone();
        let done = exit.wait_for(|e| e.is_some()).await.unwrap().clone().unwrap();
        assert!(done.success());
        assert_eq!(logs.buffer("echo").tail(1)[0].text, "hello");
    }

    /// SIGTERM is enough for a well-behaved process.
    #[tokio::test]
    async fn test_graceful_stop() {
        let (_, sup) = supervisor();
        sup.start(&sh("sleeper", "exec sleep 30")).await.unwrap();

        let outcome = sup.stop("sleeper", Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(!sup.is_tracked("sleeper"));
        assert_eq!(
            sup.stop("sleeper", Duration::from_secs(1)).await.unwrap(),
            StopOutcome::NotRunning
        );
    }

    /// A process ignoring SIGTERM is killed once the grace period runs out.
    #[tokio::test]
    async fn test_forced_stop() {
        let (_, sup) = supervisor();
        sup.start(&sh("stubborn", "trap '' TERM; sleep 30"))
            .await
            .unwrap();

        let outcome = sup
            .stop("stubborn", Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert!(!sup.is_tracked("stubborn"));
    }
}
