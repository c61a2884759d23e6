//! Pattern matching stage of the crash-detection pipeline.
//!
//! The matcher is the single consumer of the monitor's line queue. Each line
//! is handed to line observers first, then checked against every crash
//! signature; every match becomes a [`CrashEvent`] delivered to crash
//! observers in registration order. A failing or panicking observer is logged
//! and skipped, never allowed to stall the pipeline.

use crate::errors::FuzzError;
use crate::runtime::lock;
use crate::signatures::{match_line, CrashSignature};
use crate::types::{CrashEvent, LogLine};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

pub trait LineObserver: Send + Sync {
    fn on_line(&self, line: &LogLine);
}

pub trait CrashObserver: Send + Sync {
    fn on_crash(&self, event: &CrashEvent) -> Result<(), FuzzError>;
}

#[derive(Debug, Default)]
pub struct MatcherCounters {
    pub crashes_detected: AtomicU64,
    pub observer_failures: AtomicU64,
}

pub struct PatternMatcher {
    signatures: Vec<CrashSignature>,
    line_observers: Vec<Arc<dyn LineObserver>>,
    crash_observers: Vec<Arc<dyn CrashObserver>>,
    counters: Arc<MatcherCounters>,
}

impl PatternMatcher {
    pub fn new(signatures: Vec<CrashSignature>) -> Self {
        Self {
            signatures,
            line_observers: Vec::new(),
            crash_observers: Vec::new(),
            counters: Arc::new(MatcherCounters::default()),
        }
    }

    pub fn register_line_observer(&mut self, observer: Arc<dyn LineObserver>) {
        self.line_observers.push(observer);
    }

    pub fn register_crash_observer(&mut self, observer: Arc<dyn CrashObserver>) {
        self.crash_observers.push(observer);
    }

    pub fn counters(&self) -> Arc<MatcherCounters> {
        self.counters.clone()
    }

    /// Runs one line through observers and signatures, returning the events
    /// that were published.
    pub fn process(&self, line: &LogLine) -> Vec<CrashEvent> {
        for observer in &self.line_observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_line(line))).is_err() {
                self.counters.observer_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("line observer panicked; continuing");
            }
        }

        let events = match_line(&self.signatures, line);
        for event in &events {
            self.counters.crashes_detected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                signature = %event.signature_name,
                severity = event.severity.as_str(),
                line = %event.matched_line,
                "crash signature matched"
            );
            self.publish(event);
        }
        events
    }

    fn publish(&self, event: &CrashEvent) {
        for (index, observer) in self.crash_observers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| observer.on_crash(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.counters.observer_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(observer = index, error = %err, "crash observer failed");
                }
                Err(_) => {
                    self.counters.observer_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(observer = index, "crash observer panicked");
                }
            }
        }
    }

    /// Consumes the queue until its producer hangs up. Once a drain deadline
    /// has been set and passed, remaining lines are acknowledged unprocessed.
    pub fn consume(&self, queue: &mut UnboundedReceiver<LogLine>, state: &QueueState) {
        while let Some(line) = queue.blocking_recv() {
            if state.drain_expired() {
                state.discarded.fetch_add(1, Ordering::Relaxed);
            } else {
                self.process(&line);
            }
            state.note_processed();
        }
        tracing::debug!("pattern matcher queue closed");
    }
}

/// Bookkeeping shared by the reader (producer) and the matcher (consumer).
#[derive(Debug, Default)]
pub struct QueueState {
    enqueued: AtomicU64,
    processed: Mutex<u64>,
    progressed: Condvar,
    drain_deadline: OnceLock<Instant>,
    discarded: AtomicU64,
}

impl QueueState {
    pub fn note_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
    }

    fn note_processed(&self) {
        let mut processed = lock(&self.processed);
        *processed += 1;
        self.progressed.notify_all();
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        *lock(&self.processed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Marks the queue as stopping; lines still queued after `budget` are
    /// discarded instead of matched.
    pub fn begin_drain(&self, budget: Duration) {
        let now = Instant::now();
        let _ = self
            .drain_deadline
            .set(now.checked_add(budget).unwrap_or(now));
    }

    pub fn stopping(&self) -> bool {
        self.drain_deadline.get().is_some()
    }

    fn drain_expired(&self) -> bool {
        self.drain_deadline
            .get()
            .is_some_and(|deadline| Instant::now() >= *deadline)
    }

    /// Waits until every line enqueued before the call has been handled.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let target = self.enqueued();
        let guard = lock(&self.processed);
        let (guard, _) = self
            .progressed
            .wait_timeout_while(guard, timeout, |processed| *processed < target)
            .unwrap_or_else(PoisonError::into_inner);
        *guard >= target
    }
}
