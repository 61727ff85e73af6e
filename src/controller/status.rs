//! Unit status and restart controller.

use axum::{
    extract::Path,
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Router,
};
use serde::Serialize;

use super::controller::{error, json};
use crate::http::Controller;
use crate::model::UnitStatus;
use crate::scheduler::{SchedulerError, SchedulerHandle};

pub const STATUS_PATH: &str = "/devstack/status";
pub const RESTART_PATH: &str = "/devstack/units/:name/restart";

#[derive(Debug, Serialize)]
struct StatusResponse {
    stack: String,
    ready: usize,
    total: usize,
    units: Vec<UnitStatus>,
}

#[derive(Debug, Serialize)]
struct RestartResponse {
    unit: String,
    restarting: bool,
}

/// StatusController exposes the scheduler's unit table and the partial
/// restart action.
#[derive(Clone)]
pub struct StatusController {
    stack: String,
    scheduler: SchedulerHandle,
}

impl StatusController {
    pub fn new(stack: impl Into<String>, scheduler: SchedulerHandle) -> Self {
        Self {
            stack: stack.into(),
            scheduler,
        }
    }

    fn status(&self) -> Response {
        let units = self.scheduler.status();
        let resp = StatusResponse {
            stack: self.stack.clone(),
            ready: units.iter().filter(|u| u.state == "ready").count(),
            total: units.len(),
            units,
        };
        json(StatusCode::OK, &resp)
    }

    async fn restart(&self, name: String) -> Response {
        match self.scheduler.restart(&name).await {
            Ok(()) => json(
                StatusCode::ACCEPTED,
                &RestartResponse {
                    unit: name,
                    restarting: true,
                },
            ),
            Err(e @ SchedulerError::UnknownUnit(_)) => error(StatusCode::NOT_FOUND, e.to_string()),
            Err(e @ SchedulerError::RestartNotAllowed { .. }) => error(StatusCode::CONFLICT, e.to_string()),
            Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    }
}

impl Controller for StatusController {
    fn add_route(&self, router: Router) -> Router {
        let status = self.clone();
        let restart = self.clone();
        router
            .route(STATUS_PATH, get(move || {
                let controller = status.clone();
                async move { controller.status() }
            }))
            .route(
                RESTART_PATH,
                post(move |Path(name): Path<String>| {
                    let controller = restart.clone();
                    async move { controller.restart(name).await }
                }),
            )
    }
}
