//! Gateway journal and routing rules controller.

use axum::{
    extract::Query,
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::controller::{error, json};
use crate::gateway::rule::RuleSummary;
use crate::gateway::{Gateway, JournalEntry};
use crate::http::Controller;

pub const JOURNAL_PATH: &str = "/devstack/gateway/journal";
pub const RULES_PATH: &str = "/devstack/gateway/rules";
pub const RULES_RELOAD_PATH: &str = "/devstack/gateway/rules/reload";

const DEFAULT_JOURNAL_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct JournalQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct JournalResponse {
    total: usize,
    entries: Vec<JournalEntry>,
}

#[derive(Debug, Serialize)]
struct RulesResponse {
    generation: u64,
    rules: Vec<RuleSummary>,
}

/// GatewayController exposes the call journal, the active rule set and an
/// explicit rules reload.
#[derive(Clone)]
pub struct GatewayController {
    gateway: Arc<Gateway>,
}

impl GatewayController {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    fn journal(&self, limit: Option<usize>) -> Response {
        let journal = self.gateway.journal();
        let resp = JournalResponse {
            total: journal.len(),
            entries: journal.recent(limit.unwrap_or(DEFAULT_JOURNAL_LIMIT)),
        };
        json(StatusCode::OK, &resp)
    }

    fn rules(&self) -> Response {
        let store = self.gateway.rules();
        let resp = RulesResponse {
            generation: store.generation(),
            rules: store.current().summaries(),
        };
        json(StatusCode::OK, &resp)
    }

    fn reload(&self) -> Response {
        match self.gateway.rules().reload() {
            Ok(_) => self.rules(),
            Err(e) => error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        }
    }
}

impl Controller for GatewayController {
    fn add_route(&self, router: Router) -> Router {
        let journal = self.clone();
        let rules = self.clone();
        let reload = self.clone();
        router
            .route(
                JOURNAL_PATH,
                get(move |Query(q): Query<JournalQuery>| {
                    let controller = journal.clone();
                    async move { controller.journal(q.limit) }
                }),
            )
            .route(RULES_PATH, get(move || {
                let controller = rules.clone();
                async move { controller.rules() }
            }))
            .route(RULES_RELOAD_PATH, post(move || {
                let controller = reload.clone();
                async move { controller.reload() }
            }))
    }
}
