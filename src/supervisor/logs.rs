//! Per-unit log capture.
//!
//! Every unit owns a bounded ring of recent lines for tails and a broadcast
//! channel for live followers. Writers never wait on readers: the ring drops
//! its oldest line when full and lagging subscribers lose their oldest lines.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;
const STREAM_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub unit: String,
    pub stream: LogStream,
    pub at: DateTime<Utc>,
    pub text: String,
}

pub struct LogBuffer {
    unit: String,
    capacity: usize,
    lines: Mutex<VecDeque<LogLine>>,
    dropped: AtomicU64,
    tx: broadcast::Sender<LogLine>,
}

impl LogBuffer {
    pub fn new(unit: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(STREAM_CHANNEL_CAPACITY);
        Self {
            unit: unit.into(),
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 1024))),
            dropped: AtomicU64::new(0),
            tx,
        }
    }

    pub fn push(&self, stream: LogStream, text: impl Into<String>) {
        let line = LogLine {
            unit: self.unit.clone(),
            stream,
            at: Utc::now(),
            text: text.into(),
        };

        {
            let mut lines = self.lines.lock();
            if lines.len() == self.capacity {
                lines.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            lines.push_back(line.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(line);
    }

    /// Last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Last `n` lines joined, used for launch failure diagnostics.
    pub fn tail_text(&self, n: usize) -> String {
        self.tail(n)
            .into_iter()
            .map(|l| l.text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }

    /// Lines evicted from the ring since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry of log buffers keyed by unit name. Buffers outlive restarts so a
/// tail shows output across attempts.
pub struct LogHub {
    capacity: usize,
    buffers: DashMap<String, Arc<LogBuffer>>,
}

impl LogHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: DashMap::new(),
        }
    }

    pub fn buffer(&self, unit: &str) -> Arc<LogBuffer> {
        self.buffers
            .entry(unit.to_string())
            .or_insert_with(|| Arc::new(LogBuffer::new(unit, self.capacity)))
            .clone()
    }

    pub fn get(&self, unit: &str) -> Option<Arc<LogBuffer>> {
        self.buffers.get(unit).map(|b| b.clone())
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
