use crate::errors::FuzzError;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/fuzzing_config.toml";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub iterations: Option<u32>,
    pub template: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub target: TargetConfig,
    pub runner: RunnerConfig,
    pub fuzzing: FuzzingConfig,
    pub authentication: AuthenticationConfig,
    pub monitor: MonitorConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    pub ip: String,
    pub port: u16,
}

impl TargetConfig {
    pub fn address(&self) -> String {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            _ => format!("{}:{}", self.ip, self.port),
        }
    }
}

/// A program plus argument template. Arguments may carry `{placeholder}`s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
    pub kill_grace_millis: u64,
    /// Directory the test binary writes its trace files to, as the binary sees it.
    pub trace_dir: String,
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FuzzingConfig {
    pub template: PathBuf,
    pub iterations: u32,
    pub delay_between_tests_seconds: f64,
    pub attribution_grace_millis: u64,
    pub generator: Option<CommandConfig>,
}

impl FuzzingConfig {
    pub fn delay_between_tests(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_between_tests_seconds).unwrap_or(Duration::ZERO)
    }

    pub fn attribution_grace(&self) -> Duration {
        Duration::from_millis(self.attribution_grace_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticationConfig {
    pub csv_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub device_id: Option<String>,
    pub command: Option<CommandConfig>,
    pub clear_command: Option<CommandConfig>,
    pub clear_on_start: bool,
    pub settle_seconds: u64,
    pub idle_timeout_millis: u64,
    pub drain_timeout_millis: u64,
    pub restart_on_source_loss: bool,
    pub line_buffer_capacity: usize,
}

impl MonitorConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    pub base_dir: PathBuf,
    pub scenarios_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub logcat_dir: PathBuf,
    pub crashes_dir: PathBuf,
    pub max_captured_chars: usize,
}

impl OutputConfig {
    pub fn all_dirs(&self) -> [&Path; 5] {
        [
            &self.base_dir,
            &self.scenarios_dir,
            &self.logs_dir,
            &self.logcat_dir,
            &self.crashes_dir,
        ]
    }
}

pub fn default_runner_args() -> Vec<String> {
    [
        "exec",
        "-i",
        "sipp-test",
        "sipp",
        "{target}",
        "-sf",
        "{scenario}",
        "-m",
        "1",
        "-l",
        "1",
        "-inf",
        "{auth_file}",
        "-trace_msg",
        "-trace_err",
        "-message_file",
        "{logs_dir}/sipp_{stamp}_msg.log",
        "-error_file",
        "{logs_dir}/sipp_{stamp}_err.log",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target: TargetConfig {
                ip: "127.0.0.1".to_string(),
                port: 5060,
            },
            runner: RunnerConfig {
                program: "docker".to_string(),
                args: default_runner_args(),
                timeout_seconds: 30,
                kill_grace_millis: 1_000,
                trace_dir: "/workspace/output/logs".to_string(),
            },
            fuzzing: FuzzingConfig {
                template: PathBuf::from("scenarios/register_template.xml"),
                iterations: 100,
                delay_between_tests_seconds: 2.0,
                attribution_grace_millis: 0,
                generator: None,
            },
            authentication: AuthenticationConfig { csv_file: None },
            monitor: MonitorConfig {
                enabled: false,
                device_id: None,
                command: None,
                clear_command: None,
                clear_on_start: true,
                settle_seconds: 2,
                idle_timeout_millis: 1_000,
                drain_timeout_millis: 2_000,
                restart_on_source_loss: false,
                line_buffer_capacity: 5_000,
            },
            output: OutputConfig {
                base_dir: PathBuf::from("output"),
                scenarios_dir: PathBuf::from("output/scenarios"),
                logs_dir: PathBuf::from("output/logs"),
                logcat_dir: PathBuf::from("output/logcat"),
                crashes_dir: PathBuf::from("output/crashes"),
                max_captured_chars: 500,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    target: Option<PartialTargetConfig>,
    runner: Option<PartialRunnerConfig>,
    fuzzing: Option<PartialFuzzingConfig>,
    authentication: Option<AuthenticationConfig>,
    monitor: Option<PartialMonitorConfig>,
    output: Option<PartialOutputConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialTargetConfig {
    ip: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialRunnerConfig {
    program: Option<String>,
    args: Option<Vec<String>>,
    timeout_seconds: Option<u64>,
    kill_grace_millis: Option<u64>,
    trace_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialFuzzingConfig {
    template: Option<PathBuf>,
    iterations: Option<u32>,
    delay_between_tests_seconds: Option<f64>,
    attribution_grace_millis: Option<u64>,
    generator: Option<CommandConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialMonitorConfig {
    enabled: Option<bool>,
    device_id: Option<String>,
    command: Option<CommandConfig>,
    clear_command: Option<CommandConfig>,
    clear_on_start: Option<bool>,
    settle_seconds: Option<u64>,
    idle_timeout_millis: Option<u64>,
    drain_timeout_millis: Option<u64>,
    restart_on_source_loss: Option<bool>,
    line_buffer_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialOutputConfig {
    base_dir: Option<PathBuf>,
    scenarios_dir: Option<PathBuf>,
    logs_dir: Option<PathBuf>,
    logcat_dir: Option<PathBuf>,
    crashes_dir: Option<PathBuf>,
    max_captured_chars: Option<usize>,
}

/// Defaults, then the TOML file (if any), then CLI overrides, then validation.
pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, FuzzError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let path = absolutize_path(process_cwd, path);
        let file_contents = fs.read_to_string(&path)?;
        cfg = parse_config(&file_contents)?;
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn parse_config(contents: &str) -> Result<AppConfig, FuzzError> {
    let partial: PartialAppConfig =
        toml::from_str(contents).map_err(|e| FuzzError::ConfigParse(e.to_string()))?;
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, partial);
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(target) = partial.target {
        if let Some(ip) = target.ip {
            cfg.target.ip = ip;
        }
        if let Some(port) = target.port {
            cfg.target.port = port;
        }
    }

    if let Some(runner) = partial.runner {
        if let Some(program) = runner.program {
            cfg.runner.program = program;
        }
        if let Some(args) = runner.args {
            cfg.runner.args = args;
        }
        if let Some(value) = runner.timeout_seconds {
            cfg.runner.timeout_seconds = value;
        }
        if let Some(value) = runner.kill_grace_millis {
            cfg.runner.kill_grace_millis = value;
        }
        if let Some(value) = runner.trace_dir {
            cfg.runner.trace_dir = value;
        }
    }

    if let Some(fuzzing) = partial.fuzzing {
        if let Some(template) = fuzzing.template {
            cfg.fuzzing.template = template;
        }
        if let Some(iterations) = fuzzing.iterations {
            cfg.fuzzing.iterations = iterations;
        }
        if let Some(value) = fuzzing.delay_between_tests_seconds {
            cfg.fuzzing.delay_between_tests_seconds = value;
        }
        if let Some(value) = fuzzing.attribution_grace_millis {
            cfg.fuzzing.attribution_grace_millis = value;
        }
        if fuzzing.generator.is_some() {
            cfg.fuzzing.generator = fuzzing.generator;
        }
    }

    if let Some(authentication) = partial.authentication {
        cfg.authentication = authentication;
    }

    if let Some(monitor) = partial.monitor {
        if let Some(value) = monitor.enabled {
            cfg.monitor.enabled = value;
        }
        if monitor.device_id.is_some() {
            cfg.monitor.device_id = monitor.device_id;
        }
        if monitor.command.is_some() {
            cfg.monitor.command = monitor.command;
        }
        if monitor.clear_command.is_some() {
            cfg.monitor.clear_command = monitor.clear_command;
        }
        if let Some(value) = monitor.clear_on_start {
            cfg.monitor.clear_on_start = value;
        }
        if let Some(value) = monitor.settle_seconds {
            cfg.monitor.settle_seconds = value;
        }
        if let Some(value) = monitor.idle_timeout_millis {
            cfg.monitor.idle_timeout_millis = value;
        }
        if let Some(value) = monitor.drain_timeout_millis {
            cfg.monitor.drain_timeout_millis = value;
        }
        if let Some(value) = monitor.restart_on_source_loss {
            cfg.monitor.restart_on_source_loss = value;
        }
        if let Some(value) = monitor.line_buffer_capacity {
            cfg.monitor.line_buffer_capacity = value;
        }
    }

    if let Some(output) = partial.output {
        if let Some(value) = output.base_dir {
            cfg.output.base_dir = value;
        }
        if let Some(value) = output.scenarios_dir {
            cfg.output.scenarios_dir = value;
        }
        if let Some(value) = output.logs_dir {
            cfg.output.logs_dir = value;
        }
        if let Some(value) = output.logcat_dir {
            cfg.output.logcat_dir = value;
        }
        if let Some(value) = output.crashes_dir {
            cfg.output.crashes_dir = value;
        }
        if let Some(value) = output.max_captured_chars {
            cfg.output.max_captured_chars = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(iterations) = overrides.iterations {
        cfg.fuzzing.iterations = iterations;
    }
    if let Some(template) = &overrides.template {
        cfg.fuzzing.template = template.clone();
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

/// Upper bound for every configured wait.
const MAX_WAIT_MILLIS: u64 = 3_600_000;

pub fn validate_config(cfg: &AppConfig) -> Result<(), FuzzError> {
    if cfg.target.ip.parse::<IpAddr>().is_err() {
        return Err(FuzzError::InvalidConfig(format!(
            "target.ip `{}` is not a valid IP address",
            cfg.target.ip
        )));
    }
    if cfg.target.port == 0 {
        return Err(FuzzError::InvalidConfig(
            "target.port must be between 1 and 65535".to_string(),
        ));
    }

    if cfg.runner.program.trim().is_empty() {
        return Err(FuzzError::InvalidConfig(
            "runner.program must not be empty".to_string(),
        ));
    }
    if cfg.runner.timeout_seconds == 0 {
        return Err(FuzzError::InvalidConfig(
            "runner.timeout_seconds must be greater than zero".to_string(),
        ));
    }

    if cfg.fuzzing.iterations == 0 {
        return Err(FuzzError::InvalidConfig(
            "fuzzing.iterations must be greater than zero".to_string(),
        ));
    }
    if cfg.fuzzing.template.as_os_str().is_empty() {
        return Err(FuzzError::InvalidConfig(
            "fuzzing.template must not be empty".to_string(),
        ));
    }
    let delay = cfg.fuzzing.delay_between_tests_seconds;
    if !delay.is_finite() || delay < 0.0 {
        return Err(FuzzError::InvalidConfig(
            "fuzzing.delay_between_tests_seconds must be a non-negative number".to_string(),
        ));
    }
    if let Some(generator) = &cfg.fuzzing.generator {
        if generator.program.trim().is_empty() {
            return Err(FuzzError::InvalidConfig(
                "fuzzing.generator.program must not be empty".to_string(),
            ));
        }
    }

    for (name, millis) in [
        ("runner.timeout_seconds", cfg.runner.timeout_seconds.saturating_mul(1_000)),
        ("runner.kill_grace_millis", cfg.runner.kill_grace_millis),
        ("fuzzing.attribution_grace_millis", cfg.fuzzing.attribution_grace_millis),
        ("monitor.settle_seconds", cfg.monitor.settle_seconds.saturating_mul(1_000)),
        ("monitor.idle_timeout_millis", cfg.monitor.idle_timeout_millis),
        ("monitor.drain_timeout_millis", cfg.monitor.drain_timeout_millis),
    ] {
        if millis > MAX_WAIT_MILLIS {
            return Err(FuzzError::InvalidConfig(format!(
                "{name} must not exceed one hour"
            )));
        }
    }

    if cfg.monitor.line_buffer_capacity == 0 {
        return Err(FuzzError::InvalidConfig(
            "monitor.line_buffer_capacity must be greater than zero".to_string(),
        ));
    }
    for (name, command) in [
        ("monitor.command", &cfg.monitor.command),
        ("monitor.clear_command", &cfg.monitor.clear_command),
    ] {
        if command.as_ref().is_some_and(|c| c.program.trim().is_empty()) {
            return Err(FuzzError::InvalidConfig(format!(
                "{name}.program must not be empty"
            )));
        }
    }

    Ok(())
}
