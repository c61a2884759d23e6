use crate::errors::FuzzError;
use crate::matcher::CrashObserver;
use crate::runtime::lock;
use crate::types::{CrashEvent, Timestamp};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct CrashEntry {
    event: CrashEvent,
    claimed_by: Option<String>,
}

/// Append-only record of every crash event seen since the campaign began.
///
/// Written from the matcher thread through [`CrashObserver`], read by the
/// orchestrator between test cases. Attribution claims events so that each
/// one belongs to at most one test: the earliest test whose window contains
/// the event wins.
#[derive(Debug, Default)]
pub struct CrashLog {
    entries: Mutex<Vec<CrashEntry>>,
}

impl CrashLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: CrashEvent) {
        lock(&self.entries).push(CrashEntry {
            event,
            claimed_by: None,
        });
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<CrashEvent> {
        lock(&self.entries)
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// Claims every unclaimed event in the closed window `[from, to]` for
    /// `case_id` and returns them in detection order.
    pub fn claim_window(&self, case_id: &str, from: Timestamp, to: Timestamp) -> Vec<CrashEvent> {
        let mut entries = lock(&self.entries);
        entries
            .iter_mut()
            .filter(|entry| entry.claimed_by.is_none() && in_window(&entry.event, from, to))
            .map(|entry| {
                entry.claimed_by = Some(case_id.to_string());
                entry.event.clone()
            })
            .collect()
    }

    pub fn claimed_by(&self, index: usize) -> Option<String> {
        lock(&self.entries)
            .get(index)
            .and_then(|entry| entry.claimed_by.clone())
    }

    pub fn unclaimed_count(&self) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|entry| entry.claimed_by.is_none())
            .count()
    }
}

impl CrashObserver for CrashLog {
    fn on_crash(&self, event: &CrashEvent) -> Result<(), FuzzError> {
        self.publish(event.clone());
        Ok(())
    }
}

fn in_window(event: &CrashEvent, from: Timestamp, to: Timestamp) -> bool {
    from <= event.detected_at && event.detected_at <= to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use chrono::{Duration, TimeZone, Utc};

    fn at(millis: i64) -> Timestamp {
        Utc.timestamp_millis_opt(1_700_000_000_000 + millis)
            .single()
            .expect("valid")
    }

    fn event(millis: i64) -> CrashEvent {
        CrashEvent {
            detected_at: at(millis),
            signature_name: "Segfault".to_string(),
            severity: Severity::Critical,
            matched_line: format!("segmentation fault @{millis}"),
        }
    }

    #[test]
    fn window_bounds_are_inclusive_and_outside_events_are_excluded() {
        let log = CrashLog::new();
        for millis in [-1, 0, 500, 1000, 1001] {
            log.publish(event(millis));
        }

        let attributed = log.claim_window("case-1", at(0), at(1000));
        let detected = attributed
            .iter()
            .map(|e| e.detected_at)
            .collect::<Vec<_>>();
        assert_eq!(detected, vec![at(0), at(500), at(1000)]);
        assert_eq!(log.unclaimed_count(), 2);
        assert_eq!(log.claimed_by(0), None);
        assert_eq!(log.claimed_by(1).as_deref(), Some("case-1"));
    }

    #[test]
    fn overlapping_windows_attribute_to_the_earliest_test() {
        let log = CrashLog::new();
        log.publish(event(1000));
        log.publish(event(1200));

        let first = log.claim_window("case-1", at(0), at(1000) + Duration::milliseconds(500));
        let second = log.claim_window("case-2", at(1000), at(3000));
        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(log.claimed_by(1).as_deref(), Some("case-1"));
        assert_eq!(log.unclaimed_count(), 0);
    }

    #[test]
    fn observer_publishes_into_the_log() {
        let log = CrashLog::new();
        log.on_crash(&event(7)).expect("publish");
        assert_eq!(log.snapshot(), vec![event(7)]);
        assert!(!log.is_empty());
    }
}
