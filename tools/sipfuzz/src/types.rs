use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Every instant the crate records or compares uses this one representation.
pub type Timestamp = DateTime<Utc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub captured_at: Timestamp,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashEvent {
    pub detected_at: Timestamp,
    pub signature_name: String,
    pub severity: Severity,
    pub matched_line: String,
}

pub const FAILED_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub succeeded: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub timed_out: bool,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
}

impl ExecutionOutcome {
    pub fn completed(
        exit_code: i32,
        stdout: String,
        stderr: String,
        started_at: Timestamp,
        ended_at: Timestamp,
    ) -> Self {
        Self {
            succeeded: exit_code == 0,
            exit_code,
            stdout,
            stderr,
            duration: elapsed(started_at, ended_at),
            timed_out: false,
            started_at,
            ended_at,
        }
    }

    pub fn timed_out(
        stdout: String,
        stderr: String,
        started_at: Timestamp,
        ended_at: Timestamp,
    ) -> Self {
        Self {
            succeeded: false,
            exit_code: FAILED_EXIT_CODE,
            stdout,
            stderr,
            duration: elapsed(started_at, ended_at),
            timed_out: true,
            started_at,
            ended_at,
        }
    }

    pub fn runner_error(message: String, started_at: Timestamp, ended_at: Timestamp) -> Self {
        Self {
            succeeded: false,
            exit_code: FAILED_EXIT_CODE,
            stdout: String::new(),
            stderr: message,
            duration: elapsed(started_at, ended_at),
            timed_out: false,
            started_at,
            ended_at,
        }
    }

    /// Any non-zero exit or timeout marks the case as a potential crash.
    pub fn is_failure(&self) -> bool {
        self.exit_code != 0 || self.timed_out
    }

    pub fn truncated(&self, max_chars: usize) -> Self {
        Self {
            stdout: truncate_chars(&self.stdout, max_chars),
            stderr: truncate_chars(&self.stderr, max_chars),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub index: usize,
    pub case_id: String,
    pub scenario: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub case_id: String,
    pub scenario: PathBuf,
    pub outcome: ExecutionOutcome,
    pub attributed_crashes: Vec<CrashEvent>,
    pub crash_case: Option<PathBuf>,
}

impl TestResult {
    pub fn is_crash_case(&self) -> bool {
        self.outcome.is_failure() || !self.attributed_crashes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignMode {
    Baseline,
    Fuzz,
}

impl CampaignMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Fuzz => "fuzz",
        }
    }
}

pub fn elapsed(from: Timestamp, to: Timestamp) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

pub fn shift(at: Timestamp, by: Duration) -> Timestamp {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn succeeded_requires_zero_exit_and_no_timeout() {
        let ok = ExecutionOutcome::completed(0, String::new(), String::new(), at(0), at(2));
        assert!(ok.succeeded);
        assert_eq!(ok.duration, Duration::from_secs(2));

        let failed = ExecutionOutcome::completed(3, String::new(), String::new(), at(0), at(1));
        assert!(!failed.succeeded);
        assert!(failed.is_failure());

        let timed_out = ExecutionOutcome::timed_out(String::new(), String::new(), at(0), at(5));
        assert!(!timed_out.succeeded);
        assert_eq!(timed_out.exit_code, FAILED_EXIT_CODE);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn outcome_serializes_duration_as_seconds_and_times_as_rfc3339() {
        let outcome = ExecutionOutcome::completed(0, "out".into(), String::new(), at(0), at(1));
        let value = serde_json::to_value(&outcome).expect("encode");
        assert_eq!(value["duration"], 1.0);
        assert_eq!(value["started_at"], "1970-01-01T00:00:00Z");
        let decoded: ExecutionOutcome = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, outcome);
    }
}
