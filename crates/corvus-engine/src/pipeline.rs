//! Rule evaluation pipeline: trigger matching → condition evaluation →
//! aggregation check → alert creation, per incoming event.
//!
//! The compiled rule set is immutable and swapped atomically behind an
//! `RwLock<Arc<_>>`; evaluation always works against one consistent
//! snapshot, so a hot reload can never expose a half-updated rule list.
//!
//! Failure isolation is per rule: a rule whose evaluation errors is logged
//! and skipped so it cannot block the remaining rules for the same event.
//! The exception is a transient store/repository failure that survives its
//! retries — that is surfaced to the caller so the message is not committed
//! and will be redelivered.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use corvus_rule::{CorrelationRule, Trigger};

use crate::alert::{AlertFactory, AlertRecord, RuleFiring};
use crate::condition::{CompiledCondition, scalar_matches};
use crate::error::Result;
use crate::event::NormalizedEvent;
use crate::repository::AlertRepository;
use crate::window::{AggregationEvaluator, CompiledAggregation, WindowStore};

// =============================================================================
// Compiled rule set
// =============================================================================

/// A rule compiled for evaluation: predicates built, regexes compiled.
pub struct CompiledRule {
    pub rule: CorrelationRule,
    pub(crate) conditions: Vec<CompiledCondition>,
    pub(crate) aggregation: Option<CompiledAggregation>,
}

impl CompiledRule {
    fn compile(rule: CorrelationRule) -> Result<Self> {
        let conditions = rule
            .conditions
            .iter()
            .map(CompiledCondition::compile)
            .collect::<Result<Vec<_>>>()?;
        let aggregation = rule
            .aggregation
            .as_ref()
            .map(CompiledAggregation::compile)
            .transpose()?;
        Ok(CompiledRule {
            rule,
            conditions,
            aggregation,
        })
    }
}

/// An immutable, compiled set of enabled rules indexed by trigger event type.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    by_event_type: HashMap<String, Vec<usize>>,
}

impl RuleSet {
    /// Compile a set of validated rules. Disabled rules are kept out of the
    /// trigger index and never evaluated.
    pub fn compile(rules: Vec<CorrelationRule>) -> Result<RuleSet> {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut by_event_type: HashMap<String, Vec<usize>> = HashMap::new();

        for rule in rules {
            let idx = compiled.len();
            let enabled = rule.enabled;
            let cr = CompiledRule::compile(rule)?;
            if enabled {
                for trigger in &cr.rule.triggers {
                    by_event_type
                        .entry(trigger.event_type.clone())
                        .or_default()
                        .push(idx);
                }
            }
            compiled.push(cr);
        }

        Ok(RuleSet {
            rules: compiled,
            by_event_type,
        })
    }

    /// Empty set, useful before the first successful directory load.
    pub fn empty() -> RuleSet {
        RuleSet {
            rules: Vec::new(),
            by_event_type: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn candidates(&self, event_type: &str) -> &[usize] {
        self.by_event_type
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Backoff applied to transient store/repository failures at the pipeline
/// boundary.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay: Duration,
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            exponential: true,
        }
    }
}

impl RetryConfig {
    fn delay(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
        } else {
            self.base_delay
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Orchestrates rule evaluation for incoming events.
///
/// Event time is the pipeline's clock: window registration and alert
/// timestamps both derive from `event.timestamp`, which keeps redelivered
/// events idempotent and makes replays deterministic.
pub struct Pipeline {
    rules: RwLock<Arc<RuleSet>>,
    evaluator: AggregationEvaluator,
    factory: AlertFactory,
    retry: RetryConfig,
    store: Arc<dyn WindowStore>,
}

impl Pipeline {
    pub fn new(
        rules: RuleSet,
        store: Arc<dyn WindowStore>,
        repo: Arc<dyn AlertRepository>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Pipeline {
            rules: RwLock::new(Arc::new(rules)),
            evaluator: AggregationEvaluator::new(store.clone(), key_prefix),
            factory: AlertFactory::new(repo),
            retry: RetryConfig::default(),
            store,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Atomically replace the rule set. In-flight evaluations keep their
    /// snapshot; the next event sees the new set.
    pub fn swap_rules(&self, rules: RuleSet) {
        let arc = Arc::new(rules);
        match self.rules.write() {
            Ok(mut guard) => *guard = arc,
            Err(poisoned) => *poisoned.into_inner() = arc,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Drop fully expired window groups. Driven by the consumer's cleanup
    /// interval.
    pub fn purge_windows(&self, now: i64) -> Result<usize> {
        self.store.purge_expired(now)
    }

    fn snapshot(&self) -> Arc<RuleSet> {
        match self.rules.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Evaluate every candidate rule against one event, returning the alerts
    /// created or folded by this event (at most one per firing rule).
    pub fn process_event(&self, event: &NormalizedEvent) -> Result<Vec<AlertRecord>> {
        let rules = self.snapshot();
        let mut alerts = Vec::new();

        for &idx in rules.candidates(&event.event_type) {
            let compiled = &rules.rules[idx];
            match self.evaluate_rule(compiled, event) {
                Ok(Some(alert)) => alerts.push(alert),
                Ok(None) => {}
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        rule_id = %compiled.rule.id,
                        error = %e,
                        "rule evaluation failed; continuing with remaining rules"
                    );
                }
            }
        }

        Ok(alerts)
    }

    fn evaluate_rule(
        &self,
        compiled: &CompiledRule,
        event: &NormalizedEvent,
    ) -> Result<Option<AlertRecord>> {
        let rule = &compiled.rule;
        let Some(trigger) = rule.trigger_for(&event.event_type) else {
            return Ok(None);
        };
        if !trigger_matches(trigger, event) {
            return Ok(None);
        }

        // All conditions must hold (AND semantics).
        if !compiled.conditions.iter().all(|c| c.evaluate(event)) {
            return Ok(None);
        }

        let decision = match &compiled.aggregation {
            None => None,
            Some(agg) => {
                let now = event.timestamp.timestamp();
                let decision = self.run_with_retry("window store update", || {
                    self.evaluator.evaluate(agg, &rule.id, event, now)
                })?;
                if !decision.fired {
                    debug!(
                        rule_id = %rule.id,
                        count = decision.count,
                        value = decision.value,
                        "threshold not crossed"
                    );
                    return Ok(None);
                }
                Some(decision)
            }
        };

        let firing = RuleFiring {
            rule,
            event,
            matched_conditions: compiled
                .conditions
                .iter()
                .map(|c| c.description().to_string())
                .collect(),
            decision,
        };

        let alert = self.run_with_retry("alert persistence", || {
            self.factory.create_or_update(&firing)
        })?;
        Ok(Some(alert))
    }

    fn run_with_retry<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    warn!(attempt, error = %e, "{what} failed; retrying with backoff");
                    std::thread::sleep(self.retry.delay(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Source and filter checks beyond the event-type index.
fn trigger_matches(trigger: &Trigger, event: &NormalizedEvent) -> bool {
    if let Some(source) = &trigger.source
        && source != event.source()
    {
        return false;
    }
    trigger.filters.iter().all(|(field, expected)| {
        event
            .field(field)
            .is_some_and(|v| scalar_matches(&v, expected, false))
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryAlertRepository;
    use crate::window::MemoryWindowStore;
    use chrono::{TimeZone, Utc};
    use corvus_rule::parse_rule_str;
    use serde_json::json;

    fn pipeline_for(rules: &[&str]) -> Pipeline {
        let parsed: Vec<CorrelationRule> =
            rules.iter().map(|r| parse_rule_str(r).unwrap()).collect();
        Pipeline::new(
            RuleSet::compile(parsed).unwrap(),
            Arc::new(MemoryWindowStore::default()),
            Arc::new(MemoryAlertRepository::new()),
            "corvus:",
        )
    }

    fn event(event_type: &str, ip: &str, secs: i64) -> NormalizedEvent {
        let mut ev = NormalizedEvent::new(event_type);
        ev.timestamp = Utc.timestamp_opt(secs, 0).unwrap();
        ev.source_ip = Some(ip.to_string());
        ev.protocol = Some("ssh".to_string());
        ev
    }

    const SIMPLE_RULE: &str = r#"
id: ssh-login
name: SSH login failure
severity: medium
triggers:
  - type: event
    event_type: login_failure
conditions:
  - field: protocol
    operator: equals
    value: ssh
"#;

    const OTHER_TYPE_RULE: &str = r#"
id: dns-spike
name: DNS anomaly
severity: low
triggers:
  - type: event
    event_type: dns_query
"#;

    #[test]
    fn non_aggregated_rule_fires_immediately() {
        let p = pipeline_for(&[SIMPLE_RULE, OTHER_TYPE_RULE]);
        let alerts = p.process_event(&event("login_failure", "10.0.0.1", 1000)).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "ssh-login");
        assert_eq!(
            alerts[0].matched_conditions,
            vec!["protocol:equals:ssh".to_string()]
        );
        assert_eq!(alerts[0].aggregation_count, None);
    }

    #[test]
    fn failing_condition_skips_the_rule() {
        let p = pipeline_for(&[SIMPLE_RULE]);
        let mut ev = event("login_failure", "10.0.0.1", 1000);
        ev.protocol = Some("rdp".to_string());
        assert!(p.process_event(&ev).unwrap().is_empty());
    }

    #[test]
    fn unrelated_event_type_selects_no_rules() {
        let p = pipeline_for(&[SIMPLE_RULE]);
        assert!(p
            .process_event(&event("process_start", "10.0.0.1", 1000))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn disabled_rules_are_not_evaluated() {
        let disabled = r#"
id: off-rule
name: disabled
enabled: false
severity: low
triggers:
  - type: event
    event_type: login_failure
"#;
        let p = pipeline_for(&[disabled]);
        assert!(p
            .process_event(&event("login_failure", "10.0.0.1", 1000))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn trigger_filters_gate_candidacy() {
        let filtered = r#"
id: filtered
name: filtered
severity: low
triggers:
  - type: threshold
    event_type: login_failure
    filters:
      protocol: ssh
"#;
        let p = pipeline_for(&[filtered]);
        assert_eq!(
            p.process_event(&event("login_failure", "10.0.0.1", 1000))
                .unwrap()
                .len(),
            1
        );

        let mut ev = event("login_failure", "10.0.0.1", 1001);
        ev.protocol = Some("rdp".to_string());
        assert!(p.process_event(&ev).unwrap().is_empty());
    }

    #[test]
    fn trigger_source_filter() {
        let sourced = r#"
id: sourced
name: sourced
severity: low
triggers:
  - type: event
    event_type: login_failure
    source: fw-01
"#;
        let p = pipeline_for(&[sourced]);
        let mut ev = event("login_failure", "10.0.0.1", 1000);
        ev.device_name = Some("fw-02".to_string());
        assert!(p.process_event(&ev).unwrap().is_empty());

        ev.device_name = Some("fw-01".to_string());
        assert_eq!(p.process_event(&ev).unwrap().len(), 1);
    }

    #[test]
    fn hot_swap_is_atomic_per_event() {
        let p = pipeline_for(&[SIMPLE_RULE]);
        assert_eq!(p.rule_count(), 1);

        let replacement = parse_rule_str(OTHER_TYPE_RULE).unwrap();
        p.swap_rules(RuleSet::compile(vec![replacement]).unwrap());
        assert_eq!(p.rule_count(), 1);
        assert!(p
            .process_event(&event("login_failure", "10.0.0.1", 1000))
            .unwrap()
            .is_empty());
        assert_eq!(
            p.process_event(&event("dns_query", "10.0.0.1", 1001))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn metadata_conditions_participate() {
        let rule = r#"
id: meta-rule
name: metadata condition
severity: low
triggers:
  - type: event
    event_type: login_failure
conditions:
  - field: username
    operator: equals
    value: root
"#;
        let p = pipeline_for(&[rule]);
        let mut ev = event("login_failure", "10.0.0.1", 1000);
        ev.metadata.insert("username".to_string(), json!("root"));
        assert_eq!(p.process_event(&ev).unwrap().len(), 1);
    }
}
