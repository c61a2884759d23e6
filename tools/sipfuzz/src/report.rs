use crate::config::OutputConfig;
use crate::errors::FuzzError;
use crate::monitor::MonitorStats;
use crate::runtime::{FileSystem, ProcessRequest};
use crate::types::{CampaignMode, CrashEvent, ExecutionOutcome, LogLine, TestResult, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn file_stamp(at: Timestamp) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub program: String,
    pub args: Vec<String>,
}

impl From<&ProcessRequest> for CommandRecord {
    fn from(request: &ProcessRequest) -> Self {
        Self {
            program: request.program.clone(),
            args: request.args.clone(),
        }
    }
}

/// Everything needed to replay one flagged test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashCaseRecord {
    pub case_id: String,
    pub scenario_file: PathBuf,
    pub scenario_copy: PathBuf,
    pub scenario_sha256: String,
    pub recorded_at: Timestamp,
    pub command: CommandRecord,
    pub result: ExecutionOutcome,
    pub attributed_crashes: Vec<CrashEvent>,
    pub log_excerpt: Vec<LogLine>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSummary {
    pub enabled: bool,
    pub degraded: bool,
    pub restarts: u32,
    pub warnings: Vec<String>,
    /// One entry per monitor session; more than one after a restart.
    pub sessions: Vec<MonitorStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub mode: CampaignMode,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub target: String,
    pub total_tests: usize,
    pub failed_tests: usize,
    pub crash_cases: usize,
    pub total_crashes: usize,
    pub unattributed_crashes: usize,
    pub monitoring: MonitoringSummary,
    pub persistence_warnings: Vec<String>,
    pub results: Vec<TestResult>,
    pub crash_details: Vec<CrashEvent>,
}

pub struct CampaignSummaryInput {
    pub mode: CampaignMode,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub target: String,
    pub results: Vec<TestResult>,
    pub crash_details: Vec<CrashEvent>,
    pub unattributed_crashes: usize,
    pub monitoring: MonitoringSummary,
    pub persistence_warnings: Vec<String>,
}

impl CampaignReport {
    /// Counts are derived from `results`; streams are cut to `max_chars`.
    pub fn summarize(input: CampaignSummaryInput, max_chars: usize) -> Self {
        let results = input
            .results
            .into_iter()
            .map(|result| TestResult {
                outcome: result.outcome.truncated(max_chars),
                ..result
            })
            .collect::<Vec<_>>();
        Self {
            mode: input.mode,
            started_at: input.started_at,
            finished_at: input.finished_at,
            target: input.target,
            total_tests: results.len(),
            failed_tests: results.iter().filter(|r| r.outcome.is_failure()).count(),
            crash_cases: results.iter().filter(|r| r.crash_case.is_some()).count(),
            total_crashes: input.crash_details.len(),
            unattributed_crashes: input.unattributed_crashes,
            monitoring: input.monitoring,
            persistence_warnings: input.persistence_warnings,
            results,
            crash_details: input.crash_details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineReport {
    pub test_type: String,
    pub timestamp: Timestamp,
    pub scenario: PathBuf,
    pub target: String,
    pub result: ExecutionOutcome,
    pub crashes: Vec<CrashEvent>,
    pub monitoring: MonitoringSummary,
}

/// Writes campaign artifacts under the configured output tree.
pub struct ResultStore {
    fs: Arc<dyn FileSystem>,
    output: OutputConfig,
}

impl ResultStore {
    pub fn new(fs: Arc<dyn FileSystem>, output: OutputConfig) -> Self {
        Self { fs, output }
    }

    pub fn prepare_dirs(&self) -> Result<(), FuzzError> {
        for dir in self.output.all_dirs() {
            self.fs.create_dir_all(dir).map_err(|e| {
                FuzzError::Report(format!("cannot create output dir {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Writes `crash_<stamp>_<index>.json` and the scenario copy next to it.
    pub fn persist_crash_case(
        &self,
        stamp: &str,
        index: usize,
        request: &ProcessRequest,
        result: &TestResult,
        log_excerpt: Vec<LogLine>,
        recorded_at: Timestamp,
    ) -> Result<PathBuf, FuzzError> {
        let base = format!("crash_{stamp}_{index:04}");
        let extension = result
            .scenario
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("xml");
        let scenario_copy = self.output.crashes_dir.join(format!("{base}.{extension}"));
        let record_path = self.output.crashes_dir.join(format!("{base}.json"));

        let scenario = self.fs.read_bytes(&result.scenario)?;
        let scenario_sha256 = format!("{:x}", Sha256::digest(&scenario));
        self.fs.copy_file(&result.scenario, &scenario_copy)?;

        let record = CrashCaseRecord {
            case_id: result.case_id.clone(),
            scenario_file: result.scenario.clone(),
            scenario_copy,
            scenario_sha256,
            recorded_at,
            command: CommandRecord::from(request),
            result: result.outcome.truncated(self.output.max_captured_chars),
            attributed_crashes: result.attributed_crashes.clone(),
            log_excerpt,
        };
        self.write_json(&record_path, &record)?;
        tracing::info!(case_id = %result.case_id, path = %record_path.display(), "crash case saved");
        Ok(record_path)
    }

    pub fn write_campaign_report(&self, report: &CampaignReport, stamp: &str) -> Result<PathBuf, FuzzError> {
        let path = self.output.base_dir.join(format!("fuzzing_results_{stamp}.json"));
        self.write_json(&path, report)?;
        Ok(path)
    }

    pub fn write_baseline_report(&self, report: &BaselineReport, stamp: &str) -> Result<PathBuf, FuzzError> {
        let path = self.output.base_dir.join(format!("baseline_result_{stamp}.json"));
        self.write_json(&path, report)?;
        Ok(path)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), FuzzError> {
        let rendered =
            serde_json::to_string_pretty(value).map_err(|e| FuzzError::Report(e.to_string()))?;
        self.fs.write_string(path, &rendered)
    }
}
