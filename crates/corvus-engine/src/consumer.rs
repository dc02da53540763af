//! Pull-based consumption loop.
//!
//! One loop per worker process, synchronous per-message handling: evaluate
//! all candidate rules, persist/update alerts, publish, then commit. A
//! message is committed only after successful processing, which yields
//! at-least-once delivery — on a crash or a persistent store failure the
//! message is redelivered and the alert-layer dedup key absorbs the repeat.
//!
//! Cancellation is observed between messages; the in-flight message is
//! always finished so aggregation state is never half-applied.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::alert::AlertRecord;
use crate::error::Result;
use crate::event::NormalizedEvent;
use crate::pipeline::Pipeline;
use crate::reload::RuleReloader;

// =============================================================================
// Source / sink seams
// =============================================================================

/// One message pulled from the transport.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    pub payload: String,
    pub offset: u64,
}

/// Narrow interface to the pub/sub transport. Offset management mechanics
/// live behind `commit`; this core only decides *when* to commit.
pub trait EventSource {
    /// Pull the next message. `Ok(None)` means the source is exhausted.
    fn next(&mut self) -> Result<Option<SourceMessage>>;

    /// Mark a message as successfully processed.
    fn commit(&mut self, message: &SourceMessage) -> Result<()>;
}

/// Newline-delimited JSON events from any reader (stdin, a file, a socket).
pub struct JsonLinesSource<R: BufRead> {
    reader: R,
    next_offset: u64,
    committed: u64,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        JsonLinesSource {
            reader,
            next_offset: 0,
            committed: 0,
        }
    }

    /// Highest committed offset (exclusive).
    pub fn committed(&self) -> u64 {
        self.committed
    }
}

impl<R: BufRead> EventSource for JsonLinesSource<R> {
    fn next(&mut self) -> Result<Option<SourceMessage>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let offset = self.next_offset;
            self.next_offset += 1;
            return Ok(Some(SourceMessage {
                payload: trimmed.to_string(),
                offset,
            }));
        }
    }

    fn commit(&mut self, message: &SourceMessage) -> Result<()> {
        self.committed = message.offset + 1;
        Ok(())
    }
}

/// Downstream publication of alerts (optional).
pub trait AlertSink {
    fn publish(&mut self, alert: &AlertRecord) -> Result<()>;
}

/// Alerts as newline-delimited JSON on any writer.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink { writer }
    }
}

impl<W: Write> AlertSink for JsonLinesSink<W> {
    fn publish(&mut self, alert: &AlertRecord) -> Result<()> {
        let line = serde_json::to_string(alert)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}

// =============================================================================
// Shutdown flag
// =============================================================================

/// Cooperative cancellation signal shared between the consumer loop and a
/// signal handler.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// Counters from one consumer run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub processed: u64,
    pub alerts: u64,
    pub malformed: u64,
}

/// The per-worker consumption loop.
pub struct Consumer {
    source: Box<dyn EventSource>,
    pipeline: Arc<Pipeline>,
    sink: Option<Box<dyn AlertSink>>,
    reloader: Option<RuleReloader>,
    cleanup_interval: Option<Duration>,
    last_cleanup: Instant,
}

impl Consumer {
    pub fn new(source: Box<dyn EventSource>, pipeline: Arc<Pipeline>) -> Self {
        Consumer {
            source,
            pipeline,
            sink: None,
            reloader: None,
            cleanup_interval: None,
            last_cleanup: Instant::now(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_reloader(mut self, reloader: RuleReloader) -> Self {
        self.reloader = Some(reloader);
        self
    }

    /// Periodically drop fully expired window groups.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Run until the source is exhausted, the shutdown flag is set, or a
    /// transient failure survives its retries.
    ///
    /// On that last case the failing message is *not* committed and the
    /// error propagates; a supervisor restart resumes from the last commit.
    pub fn run(&mut self, shutdown: &ShutdownFlag) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();

        while !shutdown.is_set() {
            if let Some(reloader) = &self.reloader
                && let Some(count) = reloader.maybe_reload(&self.pipeline)
            {
                info!(rules = count, "rule set reloaded");
            }
            self.maybe_cleanup();

            let Some(message) = self.source.next()? else {
                break;
            };

            let event: NormalizedEvent = match serde_json::from_str(&message.payload) {
                Ok(ev) => ev,
                Err(e) => {
                    // Malformed input would fail identically on every
                    // redelivery; commit past it instead of wedging the loop.
                    warn!(offset = message.offset, error = %e, "dropping malformed event");
                    stats.malformed += 1;
                    self.source.commit(&message)?;
                    continue;
                }
            };

            match self.pipeline.process_event(&event) {
                Ok(alerts) => {
                    stats.alerts += alerts.len() as u64;
                    if let Some(sink) = &mut self.sink {
                        for alert in &alerts {
                            // The alert is already persisted; publication is
                            // best-effort notification.
                            if let Err(e) = sink.publish(alert) {
                                warn!(alert_id = %alert.id, error = %e, "alert publication failed");
                            }
                        }
                    }
                    self.source.commit(&message)?;
                    stats.processed += 1;
                }
                Err(e) => {
                    error!(
                        offset = message.offset,
                        error = %e,
                        "event processing failed after retries; leaving message uncommitted"
                    );
                    return Err(e);
                }
            }
        }

        Ok(stats)
    }

    fn maybe_cleanup(&mut self) {
        let Some(interval) = self.cleanup_interval else {
            return;
        };
        if self.last_cleanup.elapsed() < interval {
            return;
        }
        self.last_cleanup = Instant::now();
        match self.pipeline.purge_windows(Utc::now().timestamp()) {
            Ok(removed) if removed > 0 => info!(removed, "purged expired window groups"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "window cleanup failed"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
