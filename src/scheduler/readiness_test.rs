#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    use crate::config::{ProbeProtocol, ProbeSpec};
    use crate::probe::{ProbeOutcome, Prober};
    use crate::scheduler::readiness::{monitor_health, poll_until_ready};
    use crate::scheduler::ReadinessOutcome;

    /// Replays a fixed script of results, then repeats the last one.
    struct Scripted(Mutex<VecDeque<bool>>);

    impl Scripted {
        fn new(script: &[bool]) -> Self {
            Self(Mutex::new(script.iter().copied().collect()))
        }
    }

    #[async_trait]
    impl Prober for Scripted {
        async fn check(&self, _unit: &str, _spec: &ProbeSpec) -> ProbeOutcome {
            let mut script = self.0.lock();
            let ok = if script.len() > 1 {
                script.pop_front().unwrap_or(false)
            } else {
                script.front().copied().unwrap_or(false)
            };
            ProbeOutcome {
                ok,
                detail: if ok { "up".into() } else { "down".into() },
                latency: Duration::ZERO,
            }
        }
    }

    fn spec() -> ProbeSpec {
        ProbeSpec {
            protocol: ProbeProtocol::Tcp,
            target: Some("127.0.0.1:1".into()),
            interval: Some(Duration::from_millis(100)),
            ..ProbeSpec::launched()
        }
    }

    /// A flapping probe must reach the success threshold consecutively.
    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_requires_consecutive_passes() {
        let prober = Scripted::new(&[true, false, true, true]);
        let mut spec = spec();
        spec.success_threshold = Some(2);

        let mut attempts = Vec::new();
        let outcome = poll_until_ready(&prober, "api", &spec, &CancellationToken::new(), |n, o| {
            attempts.push((n, o.ok))
        })
        .await;

        assert_eq!(outcome, ReadinessOutcome::Ready);
        assert_eq!(attempts, vec![(1, true), (2, false), (3, true), (4, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let prober = Scripted::new(&[false]);
        let mut spec = spec();
        spec.max_attempts = Some(3);

        let outcome = poll_until_ready(&prober, "api", &spec, &CancellationToken::new(), |_, _| {}).await;
        assert_eq!(
            outcome,
            ReadinessOutcome::Exhausted {
                attempts: 3,
                detail: "down".into()
            }
        );
    }

    /// Cancellation during the initial delay returns without probing.
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_initial_delay() {
        let prober = Scripted::new(&[true]);
        let mut spec = spec();
        spec.initial_delay = Some(Duration::from_secs(60));
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let mut probed = false;
        let outcome = poll_until_ready(&prober, "api", &spec, &token, |_, _| probed = true).await;
        assert_eq!(outcome, ReadinessOutcome::Cancelled);
        assert!(!probed);
    }

    /// The monitor reports unhealthy only after the failure threshold and
    /// healthy again after the success threshold.
    #[tokio::test(start_paused = true)]
    async fn test_monitor_thresholds() {
        let prober = Scripted::new(&[true, false, false, true, false, false, false, true, true]);
        let mut spec = spec();
        spec.failure_threshold = Some(3);
        spec.success_threshold = Some(2);
        let token = CancellationToken::new();

        let mut changes = Vec::new();
        let cancel = token.clone();
        monitor_health(&prober, "api", &spec, &token, |attempt, _, changed| {
            if let Some(healthy) = changed {
                changes.push((attempt, healthy));
            }
            if attempt == 9 {
                cancel.cancel();
            }
        })
        .await;

        assert_eq!(changes, vec![(7, false), (9, true)]);
    }

    /// A zero interval set in code does not kill the monitor task; it keeps
    /// reporting failures at the default pace.
    #[tokio::test(start_paused = true)]
    async fn test_monitor_survives_zero_interval() {
        let prober = std::sync::Arc::new(Scripted::new(&[false]));
        let mut spec = spec();
        spec.interval = Some(Duration::ZERO);
        spec.failure_threshold = Some(2);
        let token = CancellationToken::new();

        let task = tokio::spawn({
            let prober = prober.clone();
            let token = token.clone();
            async move {
                let mut unhealthy_at = None;
                let cancel = token.clone();
                monitor_health(prober.as_ref(), "api", &spec, &token, |attempt, _, changed| {
                    if changed == Some(false) {
                        unhealthy_at = Some(attempt);
                        cancel.cancel();
                    }
                })
                .await;
                unhealthy_at
            }
        });

        let unhealthy_at = task.await.expect("monitor task must not panic");
        assert_eq!(unhealthy_at, Some(2));
    }
}
