//! # corvus-engine
//!
//! Stateful security-event correlation: condition evaluation, sliding-window
//! aggregation, and deduplicated, lifecycle-tracked alerts.
//!
//! # Architecture
//!
//! 1. [`NormalizedEvent`]s arrive through an [`EventSource`]
//! 2. The [`Pipeline`] selects candidate rules by trigger event type
//! 3. Compiled conditions are evaluated (AND semantics, fail closed)
//! 4. Rules with an aggregation consult the [`WindowStore`] — one atomic
//!    add + trim + aggregate per event — and fire on a threshold crossing
//! 5. The alert factory folds repeated firings by dedup key; the
//!    [`AlertRepository`] persists records and their status history
//!
//! Workers run the pipeline concurrently across processes; the window store
//! and alert repository are the only shared mutable state, reached solely
//! through atomic operations. Delivery is at-least-once — the consumer
//! commits only after successful processing, and the dedup key makes
//! redelivered crossings idempotent at the alert layer.

pub mod alert;
pub mod condition;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod reload;
pub mod repository;
pub mod window;

pub use alert::{AlertFactory, AlertRecord, AlertStatus, RuleFiring, StatusHistoryEntry};
pub use condition::CompiledCondition;
pub use config::{ConfigError, EngineConfig};
pub use consumer::{
    AlertSink, Consumer, ConsumerStats, EventSource, JsonLinesSink, JsonLinesSource,
    ShutdownFlag, SourceMessage,
};
pub use error::{EngineError, Result};
pub use event::NormalizedEvent;
pub use pipeline::{CompiledRule, Pipeline, RetryConfig, RuleSet};
pub use reload::{RuleReloader, load_and_compile};
pub use repository::{AlertQuery, AlertRepository, MemoryAlertRepository, SqliteAlertRepository};
pub use window::{
    AggregationEvaluator, CompiledAggregation, MemoryWindowStore, WindowDecision, WindowSnapshot,
    WindowStore,
};
