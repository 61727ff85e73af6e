//! Bounded journal of gateway calls.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Outcome {
    Status { code: u16 },
    Fault { fault: &'static str },
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub id: u64,
    pub at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub rule: Option<String>,
    pub disposition: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    pub outcome: Outcome,
    pub latency_ms: u64,
}

/// Fields of an entry before the journal assigns its id.
#[derive(Debug, Clone)]
pub struct Record {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub rule: Option<String>,
    pub disposition: Option<&'static str>,
    pub upstream: Option<String>,
    pub outcome: Outcome,
    pub latency_ms: u64,
}

struct Ring {
    next_id: u64,
    entries: VecDeque<JournalEntry>,
}

pub struct Journal {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl Journal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(Ring {
                next_id: 1,
                entries: VecDeque::with_capacity(capacity.clamp(1, 4096)),
            }),
        }
    }

    /// Appends a call, evicting the oldest entry when full. Returns its id.
    pub fn push(&self, record: Record) -> u64 {
        let mut ring = self.ring.lock();
        let id = ring.next_id;
        ring.next_id += 1;
        if ring.entries.len() == self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(JournalEntry {
            id,
            at: Utc::now(),
            method: record.method,
            path: record.path,
            query: record.query,
            rule: record.rule,
            disposition: record.disposition,
            upstream: record.upstream,
            outcome: record.outcome,
            latency_ms: record.latency_ms,
        });
        id
    }

    /// Newest first, at most `limit` entries.
    pub fn recent(&self, limit: usize) -> Vec<JournalEntry> {
        self.ring.lock().entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
