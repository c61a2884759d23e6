pub mod campaign;
pub mod config;
pub mod crash_log;
pub mod errors;
pub mod generator;
pub mod invocation;
pub mod line_buffer;
pub mod logging;
pub mod matcher;
pub mod monitor;
pub mod phase;
pub mod report;
pub mod runtime;
pub mod signatures;
pub mod types;

use campaign::Campaign;
use clap::{error::ErrorKind, ArgGroup, Parser};
use config::{load_config, CliOverrides, DEFAULT_CONFIG_PATH};
use errors::FuzzError;
use logging::init_tracing;
use runtime::ProductionRuntime;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Parser)]
#[command(name = "sipfuzz", version)]
#[command(about = "SIP fuzzing campaign runner with live device crash detection")]
#[command(group(ArgGroup::new("mode").required(true).args(["baseline", "fuzz"])))]
pub struct Cli {
    /// Run the template scenario once, without fuzzing
    #[arg(long, default_value_t = false)]
    pub baseline: bool,
    /// Run a fuzzing campaign over the generated scenarios
    #[arg(long, default_value_t = false)]
    pub fuzz: bool,
    /// Configuration file; `config/fuzzing_config.toml` is used when present
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub iterations: Option<u32>,
    #[arg(long)]
    pub template: Option<PathBuf>,
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

pub fn run() -> Result<i32, FuzzError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| FuzzError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, FuzzError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(FuzzError::Cli(error.to_string())),
        },
    };
    init_tracing(cli.verbose);

    let overrides = CliOverrides {
        config_path: resolve_config_path(&cli, cwd, runtime),
        iterations: cli.iterations,
        template: cli.template.clone(),
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    tracing::debug!(config = ?overrides.config_path, target = %cfg.target.address(), "configuration loaded");

    let mut campaign = Campaign::new(&cfg, runtime, cwd);
    if cfg.monitor.enabled {
        campaign = campaign.with_device_log()?;
    }
    if cli.baseline {
        campaign.run_baseline()?;
    } else {
        campaign.run_fuzz()?;
    }
    Ok(0)
}

/// An explicit `--config` must exist; the default path is optional.
fn resolve_config_path(cli: &Cli, cwd: &Path, runtime: &ProductionRuntime) -> Option<PathBuf> {
    if cli.config.is_some() {
        return cli.config.clone();
    }
    let default = cwd.join(DEFAULT_CONFIG_PATH);
    runtime
        .file_system
        .exists(&default)
        .then(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
