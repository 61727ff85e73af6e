//! Readiness polling and post-ready health monitoring.

use std::time::Duration;
use tokio::time::{sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProbeSpec;
use crate::probe::{ProbeOutcome, Prober};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    Exhausted { attempts: u32, detail: String },
    Cancelled,
}

/// Probes until `success_threshold` consecutive successes, `max_attempts`
/// attempts, or cancellation. `report` sees every attempt.
pub async fn poll_until_ready<F>(
    prober: &dyn Prober,
    unit: &str,
    spec: &ProbeSpec,
    token: &CancellationToken,
    mut report: F,
) -> ReadinessOutcome
where
    F: FnMut(u32, &ProbeOutcome),
{
    if !spec.initial_delay().is_zero() && !pause(token, spec.initial_delay()).await {
        return ReadinessOutcome::Cancelled;
    }

    let mut consecutive = 0u32;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            _ = token.cancelled() => return ReadinessOutcome::Cancelled,
            outcome = prober.check(unit, spec) => outcome,
        };
        report(attempt, &outcome);

        if outcome.ok {
            consecutive += 1;
            if consecutive >= spec.success_threshold() {
                return ReadinessOutcome::Ready;
            }
        } else {
            consecutive = 0;
            debug!(
                component = "scheduler",
                event = "probe_failed",
                unit,
                attempt,
                detail = %outcome.detail,
                "readiness probe attempt failed"
            );
        }

        if attempt >= spec.max_attempts() {
            return ReadinessOutcome::Exhausted {
                attempts: attempt,
                detail: outcome.detail,
            };
        }
        if !pause(token, spec.interval()).await {
            return ReadinessOutcome::Cancelled;
        }
    }
}

/// Keeps probing a Ready unit. `on_probe` sees every attempt; its last
/// argument is `Some(false)` after `failure_threshold` consecutive failures
/// and `Some(true)` after `success_threshold` consecutive successes once
/// unhealthy.
pub async fn monitor_health<F>(
    prober: &dyn Prober,
    unit: &str,
    spec: &ProbeSpec,
    token: &CancellationToken,
    mut on_probe: F,
) where
    F: FnMut(u32, &ProbeOutcome, Option<bool>),
{
    let mut interval = tokio::time::interval(spec.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately; the readiness probe just passed.
    interval.tick().await;

    let mut healthy = true;
    let mut fails = 0u32;
    let mut oks = 0u32;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {
                let outcome = tokio::select! {
                    _ = token.cancelled() => return,
                    outcome = prober.check(unit, spec) => outcome,
                };
                attempt = attempt.wrapping_add(1);

                let mut changed = None;
                if outcome.ok {
                    fails = 0;
                    if !healthy {
                        oks += 1;
                        if oks >= spec.success_threshold() {
                            healthy = true;
                            oks = 0;
                            changed = Some(true);
                        }
                    }
                } else {
                    oks = 0;
                    if healthy {
                        fails += 1;
                        if fails >= spec.failure_threshold() {
                            healthy = false;
                            fails = 0;
                            changed = Some(false);
                        }
                    }
                }
                on_probe(attempt, &outcome, changed);
            }
        }
    }
}

/// Sleeps unless cancelled first. Returns false on cancellation.
async fn pause(token: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep(d) => true,
    }
}
