//! Secret bundle refresh controller.

use axum::{http::StatusCode, response::Response, routing::post, Router};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use super::controller::json;
use crate::http::Controller;
use crate::scheduler::SchedulerHandle;
use crate::secrets::SecretResolver;

pub const SECRETS_REFRESH_PATH: &str = "/devstack/secrets/refresh";

/// SecretsController re-resolves every bundle on demand. Units blocked on a
/// bundle that now resolves become startable.
#[derive(Clone)]
pub struct SecretsController {
    resolver: Arc<SecretResolver>,
    scheduler: SchedulerHandle,
}

impl SecretsController {
    pub fn new(resolver: Arc<SecretResolver>, scheduler: SchedulerHandle) -> Self {
        Self { resolver, scheduler }
    }

    async fn refresh(&self) -> Response {
        let report = self.resolver.refresh().await;
        let failed: HashSet<String> = report.failed.keys().cloned().collect();
        if let Err(e) = self.scheduler.set_failed_bundles(failed) {
            warn!(component = "secrets", event = "refresh_unapplied", error = %e, "scheduler not running");
        }
        let status = if report.is_ok() {
            StatusCode::OK
        } else {
            StatusCode::MULTI_STATUS
        };
        json(status, &report)
    }
}

impl Controller for SecretsController {
    fn add_route(&self, router: Router) -> Router {
        let controller = self.clone();
        router.route(
            SECRETS_REFRESH_PATH,
            post(move || {
                let controller = controller.clone();
                async move { controller.refresh().await }
            }),
        )
    }
}
