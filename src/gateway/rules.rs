//! Rule sets and hot reload.
//!
//! A [`RuleSet`] is immutable. The [`RuleStore`] swaps whole sets through an
//! `ArcSwap`, so every call resolves against one consistent set.

use arc_swap::ArcSwap;
use axum::http::Method;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::rule::{RoutingRule, RuleContext, RuleError, RuleSummary, RulesFile};

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    pub fn parse(text: &str, ctx: &RuleContext) -> Result<Self, RuleError> {
        let file: RulesFile = serde_yaml::from_str(text)?;
        let rules = file
            .rules
            .iter()
            .enumerate()
            .map(|(i, d)| d.compile(i, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    /// Picks the single rule for a call: highest priority, then longest
    /// literal path prefix, then earliest declaration.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&RoutingRule> {
        self.rules
            .iter()
            .filter(|r| r.matches(method, path))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.path.specificity().cmp(&b.path.specificity()))
                    .then(b.order.cmp(&a.order))
            })
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn summaries(&self) -> Vec<RuleSummary> {
        self.rules.iter().map(RoutingRule::summary).collect()
    }
}

pub struct RuleStore {
    path: Option<PathBuf>,
    ctx: RuleContext,
    current: ArcSwap<RuleSet>,
    modified: Mutex<Option<SystemTime>>,
    generation: AtomicU64,
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl RuleStore {
    /// Loads the rules file. A bad initial file is an error; later reload
    /// failures keep the previous set.
    pub fn load(path: impl Into<PathBuf>, mut ctx: RuleContext) -> Result<Self, RuleError> {
        let path = path.into();
        if ctx.base_dir.is_none() {
            ctx.base_dir = path.parent().map(Path::to_path_buf);
        }
        let modified = modified_at(&path);
        let set = Self::read(&path, &ctx)?;
        info!(
            component = "gateway",
            event = "rules_loaded",
            path = ?path,
            rules = set.len(),
            "routing rules loaded"
        );
        Ok(Self {
            path: Some(path),
            ctx,
            current: ArcSwap::from_pointee(set),
            modified: Mutex::new(modified),
            generation: AtomicU64::new(1),
        })
    }

    /// Store over a fixed set with no backing file.
    pub fn from_set(set: RuleSet) -> Self {
        Self {
            path: None,
            ctx: RuleContext::default(),
            current: ArcSwap::from_pointee(set),
            modified: Mutex::new(None),
            generation: AtomicU64::new(1),
        }
    }

    fn read(path: &Path, ctx: &RuleContext) -> Result<RuleSet, RuleError> {
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        RuleSet::parse(&text, ctx)
    }

    pub fn current(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Bumped on every successful swap.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn swap(&self, set: RuleSet) {
        self.current.store(Arc::new(set));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Re-reads the rules file and swaps the set on success. Returns the new
    /// rule count.
    pub fn reload(&self) -> Result<usize, RuleError> {
        let Some(path) = &self.path else {
            return Ok(self.current().len());
        };
        *self.modified.lock() = modified_at(path);

        match Self::read(path, &self.ctx) {
            Ok(set) => {
                let n = set.len();
                self.swap(set);
                info!(component = "gateway", event = "rules_reloaded", path = ?path, rules = n, "routing rules reloaded");
                Ok(n)
            }
            Err(e) => {
                error!(
                    component = "gateway",
                    event = "rules_reload_failed",
                    path = ?path,
                    error = %e,
                    "rules reload failed, keeping previous set"
                );
                Err(e)
            }
        }
    }

    fn changed(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let now = modified_at(path);
        now.is_some() && now != *self.modified.lock()
    }

    /// Polls the rules file's modification time and reloads on change.
    pub async fn watch(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(component = "gateway", event = "rules_watcher_stopped", "rules watcher stopped");
                    return;
                }
                _ = interval.tick() => {
                    if self.changed() {
                        // Failure is logged by reload and the old set stays active.
                        let _ = self.reload();
                    }
                }
            }
        }
    }
}
