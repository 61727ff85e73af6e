//! Unit log tail and live stream controller.

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::controller::{error, json};
use crate::http::Controller;
use crate::scheduler::SchedulerHandle;
use crate::supervisor::{LogHub, LogLine, LogStream};

pub const LOGS_PATH: &str = "/devstack/units/:name/logs";
pub const LOGS_STREAM_PATH: &str = "/devstack/units/:name/logs/stream";

const DEFAULT_TAIL: usize = 100;

#[derive(Debug, Deserialize)]
struct TailQuery {
    lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TailResponse {
    unit: String,
    dropped: u64,
    lines: Vec<LogLine>,
}

/// LogsController serves bounded tails and SSE follow streams.
#[derive(Clone)]
pub struct LogsController {
    logs: Arc<LogHub>,
    scheduler: SchedulerHandle,
}

impl LogsController {
    pub fn new(logs: Arc<LogHub>, scheduler: SchedulerHandle) -> Self {
        Self { logs, scheduler }
    }

    fn tail(&self, name: String, lines: Option<usize>) -> Response {
        if self.scheduler.unit(&name).is_none() {
            return error(StatusCode::NOT_FOUND, format!("unknown unit {:?}", name));
        }
        let n = lines.unwrap_or(DEFAULT_TAIL);
        let resp = match self.logs.get(&name) {
            Some(buffer) => TailResponse {
                unit: name,
                dropped: buffer.dropped(),
                lines: buffer.tail(n),
            },
            None => TailResponse {
                unit: name,
                dropped: 0,
                lines: Vec::new(),
            },
        };
        json(StatusCode::OK, &resp)
    }

    fn stream(&self, name: String) -> Response {
        if self.scheduler.unit(&name).is_none() {
            return error(StatusCode::NOT_FOUND, format!("unknown unit {:?}", name));
        }
        let rx = self.logs.buffer(&name).subscribe();
        Sse::new(follow(rx))
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
            .into_response()
    }
}

/// Turns a log subscription into SSE events. A lagging follower gets a
/// `lagged` event with the number of lines it lost and keeps going.
fn follow(rx: broadcast::Receiver<LogLine>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        let event = match rx.recv().await {
            Ok(line) => {
                let name = match line.stream {
                    LogStream::Stdout => "stdout",
                    LogStream::Stderr => "stderr",
                };
                Event::default()
                    .event(name)
                    .json_data(&line)
                    .unwrap_or_else(|_| Event::default().event(name).data(line.text.clone()))
            }
            Err(broadcast::error::RecvError::Lagged(n)) => Event::default().event("lagged").data(n.to_string()),
            Err(broadcast::error::RecvError::Closed) => return None,
        };
        Some((Ok(event), rx))
    })
}

impl Controller for LogsController {
    fn add_route(&self, router: Router) -> Router {
        let tail = self.clone();
        let streamer = self.clone();
        router
            .route(
                LOGS_PATH,
                get(move |Path(name): Path<String>, Query(q): Query<TailQuery>| {
                    let controller = tail.clone();
                    async move { controller.tail(name, q.lines) }
                }),
            )
            .route(
                LOGS_STREAM_PATH,
                get(move |Path(name): Path<String>| {
                    let controller = streamer.clone();
                    async move { controller.stream(name) }
                }),
            )
    }
}
