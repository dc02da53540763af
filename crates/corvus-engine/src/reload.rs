//! Debounced rule directory reload.
//!
//! Rescans are read-mostly: the directory is re-parsed off the hot path and
//! the compiled set swapped atomically into the pipeline. A failed rescan
//! (parse errors everywhere, IO trouble) is logged and the previous rule
//! set stays in effect.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use corvus_rule::{CorrelationRule, RuleLoadOutcome, load_rule_directory};

use crate::error::Result;
use crate::pipeline::{Pipeline, RuleSet};

/// Load a rules directory and compile it, dropping rules whose aggregation
/// window exceeds `max_window_secs` (when configured).
///
/// Per-file load errors and oversized-window rejections are logged; the
/// outcome is returned so callers can surface them.
pub fn load_and_compile(
    dir: &Path,
    max_window_secs: Option<u64>,
) -> Result<(RuleSet, RuleLoadOutcome)> {
    let outcome = load_rule_directory(dir)?;
    for err in &outcome.errors {
        warn!(file = %err.file, error = %err.message, "rule file rejected");
    }
    for w in &outcome.warnings {
        warn!("{w}");
    }

    let admitted: Vec<CorrelationRule> = outcome
        .rules
        .iter()
        .filter(|rule| {
            let within = max_window_secs.is_none_or(|max| {
                rule.aggregation
                    .as_ref()
                    .is_none_or(|agg| agg.window_seconds <= max)
            });
            if !within {
                warn!(rule_id = %rule.id, "aggregation window exceeds configured maximum; rule dropped");
            }
            within
        })
        .cloned()
        .collect();

    let set = RuleSet::compile(admitted)?;
    Ok((set, outcome))
}

/// Debounced directory rescanner.
pub struct RuleReloader {
    dir: PathBuf,
    debounce: Duration,
    max_window_secs: Option<u64>,
    last_attempt: Mutex<Instant>,
}

impl RuleReloader {
    pub fn new(dir: PathBuf, debounce: Duration, max_window_secs: Option<u64>) -> Self {
        RuleReloader {
            dir,
            debounce,
            max_window_secs,
            last_attempt: Mutex::new(Instant::now()),
        }
    }

    /// Rescan and swap the pipeline's rule set if the debounce interval has
    /// elapsed. Returns the new rule count on a successful swap.
    ///
    /// All failures keep the previous set: evaluators never observe a
    /// half-updated or empty-because-broken rule list.
    pub fn maybe_reload(&self, pipeline: &Pipeline) -> Option<usize> {
        {
            let mut last = match self.last_attempt.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.elapsed() < self.debounce {
                return None;
            }
            *last = Instant::now();
        }

        match load_and_compile(&self.dir, self.max_window_secs) {
            Ok((set, _)) => {
                let count = set.len();
                pipeline.swap_rules(set);
                Some(count)
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "rule reload failed; keeping previous set");
                None
            }
        }
    }
}
