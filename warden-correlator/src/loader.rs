//! Rule loading and hot reload.
//!
//! Walks the rules directory in filename order, parses each file as one
//! rule document or an array of them (YAML; JSON parses as a YAML subset),
//! validates, and publishes a fresh immutable snapshot. A debounced
//! filesystem watcher triggers reloads while the process runs.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core::error::{CoreError, Result};
use warden_core::metrics::Metrics;
use warden_model::{Rule, RuleId};

use crate::snapshot::{CompiledRule, RuleSnapshot, SnapshotHolder};
use crate::window::WindowBuffer;

/// A rule file holds either a single document or an array of documents.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuleFile {
    Single(Box<Rule>),
    Many(Vec<Rule>),
}

const RULE_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

pub struct RuleLoader {
    rules_dir: PathBuf,
    holder: Arc<SnapshotHolder>,
    version: AtomicU64,
    metrics: Arc<Metrics>,
    /// When set, the window buffer's retention is resized after each
    /// publish to cover the largest rule window.
    window: Option<(Arc<WindowBuffer>, Duration)>,
}

impl fmt::Debug for RuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleLoader")
            .field("rules_dir", &self.rules_dir)
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}

impl RuleLoader {
    pub fn new(rules_dir: PathBuf, holder: Arc<SnapshotHolder>, metrics: Arc<Metrics>) -> Self {
        Self {
            rules_dir,
            holder,
            version: AtomicU64::new(0),
            metrics,
            window: None,
        }
    }

    /// Keep `window`'s retention in sync with the published snapshots.
    pub fn resize_window(mut self, window: Arc<WindowBuffer>, default_window: Duration) -> Self {
        self.window = Some((window, default_window));
        self
    }

    /// Build and publish a fresh snapshot from disk. Returns the published
    /// snapshot; parse and validation failures skip the offending rule or
    /// file and the build continues.
    pub fn load_once(&self) -> Result<Arc<RuleSnapshot>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.rules_dir)
            .map_err(CoreError::Io)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| RULE_EXTENSIONS.contains(&ext))
            })
            .collect();
        files.sort();

        let mut rules: Vec<CompiledRule> = Vec::new();
        let mut positions: HashMap<RuleId, usize> = HashMap::new();

        for path in &files {
            let raw = match std::fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(file = %path.display(), "rule file unreadable, skipping: {e}");
                    self.metrics.incr("rule_files_unreadable");
                    continue;
                }
            };
            let parsed: RuleFile = match serde_yaml::from_str(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(file = %path.display(), "rule file parse error, skipping: {e}");
                    self.metrics.incr("rule_parse_errors");
                    continue;
                }
            };
            let documents = match parsed {
                RuleFile::Single(rule) => vec![*rule],
                RuleFile::Many(batch) => batch,
            };
            for rule in documents {
                self.admit(rule, path, &mut rules, &mut positions);
            }
        }

        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = RuleSnapshot { version, rules };
        info!(
            version,
            rules = snapshot.rules.len(),
            files = files.len(),
            "rule snapshot published"
        );
        self.holder.publish(snapshot);
        let published = self.holder.current();
        if let Some((window, default_window)) = &self.window {
            let max_window = published.max_window(default_window.as_secs());
            window.set_max_age(Duration::from_secs(max_window));
        }
        Ok(published)
    }

    fn admit(
        &self,
        rule: Rule,
        path: &std::path::Path,
        rules: &mut Vec<CompiledRule>,
        positions: &mut HashMap<RuleId, usize>,
    ) {
        if !rule.enabled {
            debug!(rule = %rule.id, "disabled rule skipped");
            return;
        }
        let id = rule.id.clone();
        let compiled = match CompiledRule::compile(rule) {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!(rule = %id, file = %path.display(), "invalid rule rejected: {e}");
                self.metrics.incr("rules_rejected");
                return;
            }
        };
        match positions.get(&id) {
            Some(&position) => {
                warn!(rule = %id, file = %path.display(), "duplicate rule id, later file wins");
                self.metrics.incr("rule_id_collisions");
                rules[position] = compiled;
            }
            None => {
                positions.insert(id, rules.len());
                rules.push(compiled);
            }
        }
    }

    /// Watch the rules directory and reload after each debounced change
    /// burst, until cancelled. Requires hot reload to be enabled in config.
    pub async fn watch(self: Arc<Self>, debounce: Duration, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = match new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) if !events.is_empty() => {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(errors) => {
                    for e in errors {
                        warn!("rules watcher error: {e}");
                    }
                }
            }
        }) {
            Ok(debouncer) => debouncer,
            Err(e) => {
                warn!("rules watcher unavailable, hot reload disabled: {e}");
                return;
            }
        };
        if let Err(e) = debouncer.watch(&self.rules_dir, RecursiveMode::Recursive) {
            warn!(dir = %self.rules_dir.display(), "cannot watch rules dir: {e}");
            return;
        }
        info!(dir = %self.rules_dir.display(), "rules hot reload active");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    if let Err(e) = self.load_once() {
                        warn!(kind = e.kind(), "rule reload failed, keeping current snapshot: {e}");
                        self.metrics.incr("rule_reload_failures");
                    }
                }
            }
        }
        debug!("rules watcher stopped");
    }
}
