//! Campaign orchestration.
//!
//! One [`Campaign`] drives either a baseline run or a fuzzing campaign. The
//! log monitor, when enabled, runs for the whole campaign; each test case is
//! executed synchronously and the crash events whose capture time falls in
//! the closed window `[started_at, ended_at + grace]` are claimed for it.
//! A single failing case never aborts the campaign.

use crate::config::AppConfig;
use crate::crash_log::CrashLog;
use crate::errors::FuzzError;
use crate::generator::{run_generator, ListedScenarios, ScenarioSource};
use crate::invocation::{generator_invocation, logcat_clear_request, logcat_request, test_invocation};
use crate::line_buffer::LineBuffer;
use crate::logging::{structured_progress_line, JsonlLogger};
use crate::monitor::{clear_source, LogMonitor, LogSource, MonitorHandle, MonitorHealth};
use crate::phase::{CampaignPhase, PhaseTracker};
use crate::report::{
    file_stamp, BaselineReport, CampaignReport, CampaignSummaryInput, MonitoringSummary,
    ResultStore,
};
use crate::runtime::{ProcessRequest, ProductionRuntime};
use crate::signatures::default_signatures;
use crate::types::{
    shift, truncate_chars, CampaignMode, ExecutionOutcome, TestCase, TestResult, Timestamp,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Produces a fresh log source for every monitor session.
pub type SourceFactory = Box<dyn Fn() -> LogSource + Send>;

const BASELINE_PREVIEW_CHARS: usize = 1000;

pub struct Campaign<'a> {
    cfg: &'a AppConfig,
    runtime: &'a ProductionRuntime,
    cwd: PathBuf,
    store: ResultStore,
    events: JsonlLogger,
    run_stamp: String,
    crash_log: Arc<CrashLog>,
    line_buffer: Arc<LineBuffer>,
    tracker: PhaseTracker,
    source: Option<SourceFactory>,
    session: Option<MonitorHandle>,
    monitoring: MonitoringSummary,
    persistence_warnings: Vec<String>,
}

impl<'a> Campaign<'a> {
    pub fn new(cfg: &'a AppConfig, runtime: &'a ProductionRuntime, cwd: &Path) -> Self {
        let run_stamp = file_stamp(runtime.clock.now());
        runtime.process_runner.set_kill_grace(cfg.runner.kill_grace());
        let events = JsonlLogger::new(
            runtime.file_system.clone(),
            cfg.output.logs_dir.join(format!("campaign_{run_stamp}.jsonl")),
        );
        Self {
            cfg,
            runtime,
            cwd: cwd.to_path_buf(),
            store: ResultStore::new(runtime.file_system.clone(), cfg.output.clone()),
            events,
            run_stamp,
            crash_log: Arc::new(CrashLog::new()),
            line_buffer: Arc::new(LineBuffer::new(cfg.monitor.line_buffer_capacity)),
            tracker: PhaseTracker::default(),
            source: None,
            session: None,
            monitoring: MonitoringSummary {
                enabled: cfg.monitor.enabled,
                ..MonitoringSummary::default()
            },
            persistence_warnings: Vec::new(),
        }
    }

    /// Uses the configured logcat command as the monitor source.
    pub fn with_device_log(self) -> Result<Self, FuzzError> {
        let request = logcat_request(&self.cfg.monitor)?;
        Ok(self.with_log_source(Box::new(move || LogSource::Command(request.clone()))))
    }

    pub fn with_log_source(mut self, source: SourceFactory) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_crash_log(mut self, crash_log: Arc<CrashLog>) -> Self {
        self.crash_log = crash_log;
        self
    }

    pub fn crash_log(&self) -> Arc<CrashLog> {
        self.crash_log.clone()
    }

    pub fn phase(&self) -> CampaignPhase {
        self.tracker.phase
    }

    pub fn run_fuzz(&mut self) -> Result<(CampaignReport, PathBuf), FuzzError> {
        let started_at = self.runtime.clock.now();
        self.say(&format!(
            "[*] Starting SIP fuzzing campaign against {}",
            self.cfg.target.address()
        ));
        test_invocation(self.cfg, &self.cfg.fuzzing.template, 0, None)?;
        self.store.prepare_dirs()?;

        if let Some(generator) = &self.cfg.fuzzing.generator {
            let request = generator_invocation(self.cfg, generator, Some(&self.cwd))?;
            run_generator(self.runtime.process_runner.as_ref(), &request)?;
        }
        let extension = self
            .cfg
            .fuzzing
            .template
            .extension()
            .and_then(|ext| ext.to_str());
        let mut scenarios = ListedScenarios::scan(
            self.runtime.file_system.as_ref(),
            &self.cfg.output.scenarios_dir,
            extension,
            self.cfg.fuzzing.iterations as usize,
        )?;
        let total = scenarios.len_hint();
        self.say(&format!("[*] {total} scenarios queued"));
        self.events.record(
            "info",
            "campaign_started",
            json!({"target": self.cfg.target.address(), "scenarios": total, "stamp": self.run_stamp}),
        );

        self.start_monitoring("logcat")?;

        let mut results = Vec::with_capacity(total);
        while let Some(case) = scenarios.next_case()? {
            self.check_monitor();
            self.tracker.transition(CampaignPhase::Dispatch)?;
            let result = self.execute_case(&case, total)?;
            results.push(result);
            if results.len() < total {
                self.runtime
                    .clock
                    .sleep(self.cfg.fuzzing.delay_between_tests())?;
            }
        }

        self.stop_monitoring();
        self.tracker.transition(CampaignPhase::Stopped)?;

        let report = CampaignReport::summarize(
            CampaignSummaryInput {
                mode: CampaignMode::Fuzz,
                started_at,
                finished_at: self.runtime.clock.now(),
                target: self.cfg.target.address(),
                results,
                crash_details: self.crash_log.snapshot(),
                unattributed_crashes: self.crash_log.unclaimed_count(),
                monitoring: self.monitoring.clone(),
                persistence_warnings: self.persistence_warnings.clone(),
            },
            self.cfg.output.max_captured_chars,
        );
        let path = self.store.write_campaign_report(&report, &self.run_stamp)?;
        self.events.record(
            "info",
            "campaign_finished",
            json!({
                "total_tests": report.total_tests,
                "crash_cases": report.crash_cases,
                "total_crashes": report.total_crashes,
                "report": path.display().to_string(),
            }),
        );
        self.say("[*] Fuzzing campaign completed");
        self.say(&format!("[*] Total tests: {}", report.total_tests));
        self.say(&format!("[*] Crash cases: {}", report.crash_cases));
        self.say(&format!("[*] Crashes detected: {}", report.total_crashes));
        self.say(&format!("[*] Results saved to: {}", path.display()));
        Ok((report, path))
    }

    pub fn run_baseline(&mut self) -> Result<(BaselineReport, PathBuf), FuzzError> {
        let template = self.cfg.fuzzing.template.clone();
        self.say("[*] Running baseline test (no fuzzing)");
        self.say(&format!("[*] Using template: {}", template.display()));
        let request = test_invocation(
            self.cfg,
            &template,
            self.runtime.clock.now().timestamp(),
            Some(&self.cwd),
        )?;
        self.store.prepare_dirs()?;
        self.start_monitoring("logcat_baseline")?;

        let Some(case) = ListedScenarios::single(&template).next_case()? else {
            return Err(FuzzError::Generator("baseline template yielded no case".to_string()));
        };
        self.tracker.transition(CampaignPhase::Dispatch)?;
        self.tracker.begin_case(&case.case_id)?;
        let outcome = self
            .runtime
            .process_runner
            .run(&request, self.cfg.runner.timeout());
        self.tracker.transition(CampaignPhase::Attributing)?;
        self.print_baseline_summary(&outcome);

        if self.session.is_some() {
            self.runtime.clock.sleep(self.cfg.monitor.settle())?;
        }
        self.stop_monitoring();
        self.tracker.transition(CampaignPhase::Recording)?;
        self.tracker.finish_case()?;
        self.tracker.transition(CampaignPhase::Stopped)?;

        let crashes = self.crash_log.snapshot();
        if !crashes.is_empty() {
            self.say(&format!(
                "[!] Crashes detected during baseline test: {}",
                crashes.len()
            ));
            for crash in &crashes {
                self.say(&format!(
                    "    - {}: {}",
                    crash.signature_name,
                    truncate_chars(&crash.matched_line, 80)
                ));
            }
        }

        let report = BaselineReport {
            test_type: CampaignMode::Baseline.as_str().to_string(),
            timestamp: self.runtime.clock.now(),
            scenario: template,
            target: self.cfg.target.address(),
            result: outcome,
            crashes,
            monitoring: self.monitoring.clone(),
        };
        let path = self.store.write_baseline_report(&report, &self.run_stamp)?;
        self.say(&format!("[*] Baseline result saved to: {}", path.display()));
        Ok((report, path))
    }

    fn execute_case(&mut self, case: &TestCase, total: usize) -> Result<TestResult, FuzzError> {
        let clock = self.runtime.clock.clone();
        let request = test_invocation(
            self.cfg,
            &case.scenario,
            clock.now().timestamp(),
            Some(&self.cwd),
        )?;
        self.tracker.begin_case(&case.case_id)?;
        self.say(&format!(
            "[{}/{}] Testing: {}",
            case.index + 1,
            total,
            case.scenario.display()
        ));

        let started_at = clock.now();
        let outcome = self
            .runtime
            .process_runner
            .run(&request, self.cfg.runner.timeout());
        let ended_at = clock.now();

        self.tracker.transition(CampaignPhase::Attributing)?;
        let window_end = shift(ended_at, self.cfg.fuzzing.attribution_grace());
        if window_end > ended_at {
            clock.sleep_until(window_end)?;
        }
        if let Some(session) = &self.session {
            if !session.wait_idle(self.cfg.monitor.idle_timeout()) {
                tracing::warn!(case_id = %case.case_id, "matcher still busy; attributing with what has been matched");
            }
        }
        let attributed = self
            .crash_log
            .claim_window(&case.case_id, started_at, window_end);

        self.tracker.transition(CampaignPhase::Recording)?;
        let mut result = TestResult {
            case_id: case.case_id.clone(),
            scenario: case.scenario.clone(),
            outcome,
            attributed_crashes: attributed,
            crash_case: None,
        };
        if result.is_crash_case() {
            self.record_crash_case(case, &request, &mut result, started_at, window_end);
        }
        self.tracker.finish_case()?;

        self.say(&structured_progress_line(
            &case.case_id,
            if result.is_crash_case() { "flagged" } else { "clean" },
            &format!(
                "exit_code={} timed_out={} crashes={} duration={:.2}s",
                result.outcome.exit_code,
                result.outcome.timed_out,
                result.attributed_crashes.len(),
                result.outcome.duration.as_secs_f64()
            ),
        ));
        self.events.record(
            if result.is_crash_case() { "warn" } else { "info" },
            "case_finished",
            json!({
                "case_id": result.case_id,
                "exit_code": result.outcome.exit_code,
                "timed_out": result.outcome.timed_out,
                "crashes": result.attributed_crashes,
                "crash_case": result.crash_case,
                "stderr": truncate_chars(&result.outcome.stderr, self.cfg.output.max_captured_chars),
            }),
        );
        Ok(result)
    }

    fn record_crash_case(
        &mut self,
        case: &TestCase,
        request: &ProcessRequest,
        result: &mut TestResult,
        from: Timestamp,
        to: Timestamp,
    ) {
        self.say(&format!(
            "  [!] Potential issue detected (exit_code: {}, crashes: {})",
            result.outcome.exit_code,
            result.attributed_crashes.len()
        ));
        let excerpt = self.line_buffer.lines_between(from, to);
        match self.store.persist_crash_case(
            &self.run_stamp,
            case.index,
            request,
            result,
            excerpt,
            self.runtime.clock.now(),
        ) {
            Ok(path) => result.crash_case = Some(path),
            Err(err) => {
                tracing::warn!(case_id = %case.case_id, error = %err, "failed to persist crash case");
                self.persistence_warnings
                    .push(format!("{}: {err}", case.case_id));
            }
        }
    }

    fn start_monitoring(&mut self, sink_prefix: &str) -> Result<(), FuzzError> {
        if !self.cfg.monitor.enabled {
            return Ok(());
        }
        if self.source.is_none() {
            return Err(FuzzError::Monitor(
                "monitoring is enabled but no log source was attached".to_string(),
            ));
        }
        self.tracker.transition(CampaignPhase::Monitoring)?;
        if self.cfg.monitor.clear_on_start {
            let request = logcat_clear_request(&self.cfg.monitor)?;
            if !clear_source(self.runtime.process_runner.as_ref(), &request) {
                self.monitoring
                    .warnings
                    .push(format!("clearing log source failed: {}", request.command_line()));
            }
        }
        self.say("[*] Starting log monitoring...");
        self.open_session(sink_prefix)?;
        self.runtime.clock.sleep(self.cfg.monitor.settle())?;
        Ok(())
    }

    fn open_session(&mut self, sink_prefix: &str) -> Result<(), FuzzError> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        let mut monitor = LogMonitor::new(self.runtime.clock.clone(), default_signatures()?)
            .with_drain_timeout(self.cfg.monitor.drain_timeout())
            .with_kill_grace(self.cfg.runner.kill_grace());
        monitor.register_line_observer(self.line_buffer.clone());
        monitor.register_crash_observer(self.crash_log.clone());

        let stamp = file_stamp(self.runtime.clock.now());
        let sink_path = self
            .cfg
            .output
            .logcat_dir
            .join(format!("{sink_prefix}_{stamp}.log"));
        let sink = match self.runtime.file_system.create_sink(&sink_path) {
            Ok(sink) => Some(sink),
            Err(err) => {
                tracing::warn!(path = %sink_path.display(), error = %err, "log capture file unavailable");
                self.monitoring
                    .warnings
                    .push(format!("log capture file unavailable: {err}"));
                None
            }
        };
        self.session = Some(monitor.start(source(), sink));
        Ok(())
    }

    /// Warns once on the first degradation; restarts if configured.
    fn check_monitor(&mut self) {
        let Some(MonitorHealth::Degraded(reason)) = self.session.as_ref().map(MonitorHandle::health)
        else {
            return;
        };
        if !self.monitoring.degraded {
            self.monitoring.degraded = true;
            self.monitoring
                .warnings
                .push(format!("log monitor degraded: {reason}"));
            self.say(&format!("[!] Log monitoring degraded: {reason}"));
            self.events
                .record("warn", "monitor_degraded", json!({"reason": reason}));
        }
        if self.cfg.monitor.restart_on_source_loss {
            if let Some(mut session) = self.session.take() {
                self.monitoring.sessions.push(session.stop());
            }
            self.monitoring.restarts += 1;
            tracing::info!(restarts = self.monitoring.restarts, "restarting log monitor");
            if let Err(err) = self.open_session("logcat") {
                tracing::warn!(error = %err, "log monitor restart failed");
                self.monitoring
                    .warnings
                    .push(format!("log monitor restart failed: {err}"));
            }
        }
    }

    fn stop_monitoring(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.say("[*] Stopping log monitoring...");
            if let MonitorHealth::Degraded(reason) = session.health() {
                if !self.monitoring.degraded {
                    self.monitoring.degraded = true;
                    self.monitoring
                        .warnings
                        .push(format!("log monitor degraded: {reason}"));
                }
            }
            let stats = session.stop();
            self.monitoring.sessions.push(stats);
        }
    }

    fn print_baseline_summary(&self, outcome: &ExecutionOutcome) {
        let rule = "=".repeat(60);
        self.say(&rule);
        self.say("BASELINE TEST RESULT");
        self.say(&rule);
        self.say(&format!("Success: {}", outcome.succeeded));
        self.say(&format!("Exit Code: {}", outcome.exit_code));
        self.say(&format!("Duration: {:.2}s", outcome.duration.as_secs_f64()));
        self.say(&format!("Timeout: {}", outcome.timed_out));
        if !outcome.stdout.is_empty() {
            self.say("--- STDOUT ---");
            self.say(&truncate_chars(&outcome.stdout, BASELINE_PREVIEW_CHARS));
        }
        if !outcome.stderr.is_empty() {
            self.say("--- STDERR ---");
            self.say(&truncate_chars(&outcome.stderr, BASELINE_PREVIEW_CHARS));
        }
        self.say(&rule);
    }

    fn say(&self, line: &str) {
        if let Err(err) = self.runtime.terminal.write_line(line) {
            tracing::debug!(error = %err, "terminal write failed");
        }
    }
}
