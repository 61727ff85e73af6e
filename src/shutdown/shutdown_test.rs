#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_ok, task};
    use tokio_util::sync::CancellationToken;

    use crate::shutdown::GracefulShutdown;

    /// Shutdown completes once every registered task reported done.
    #[tokio::test]
    async fn test_waits_for_registered_tasks() {
        let token = CancellationToken::new();
        let gsh = GracefulShutdown::new(token.clone()).with_timeout(Duration::from_secs(5));
        gsh.add(2);

        for delay in [50u64, 150] {
            let gsh = gsh.clone();
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                gsh.done();
            });
        }

        token.cancel();
        gsh.await_shutdown().await.unwrap();
    }

    /// A task that never reports done makes the wait fail after the timeout.
    #[tokio::test(start_paused = true)]
    async fn test_times_out_on_stuck_task() {
        let token = CancellationToken::new();
        let gsh = GracefulShutdown::new(token.clone()).with_timeout(Duration::from_secs(1));
        gsh.add(1);

        token.cancel();
        assert!(gsh.await_shutdown().await.is_err());
    }

    /// The wait stays pending until the last registered task reports done.
    #[tokio::test]
    async fn test_pending_until_last_done() {
        let token = CancellationToken::new();
        let gsh = GracefulShutdown::new(token.clone());
        gsh.add(2);
        token.cancel();

        let mut wait = task::spawn(gsh.await_shutdown());
        assert_pending!(wait.poll());

        gsh.done();
        assert_pending!(wait.poll());

        gsh.done();
        assert!(wait.is_woken());
        assert_ready_ok!(wait.poll());
    }
}
