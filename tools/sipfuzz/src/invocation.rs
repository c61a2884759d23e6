//! Command templating for the test binary, the scenario generator and the
//! log source.
//!
//! Arguments may contain `{name}` placeholders. A placeholder that is known
//! but has no value (say `{auth_file}` with no credentials configured) drops
//! its argument, together with the flag right before it when that flag starts
//! with `-`. Unknown placeholders are configuration errors.

use crate::config::{AppConfig, CommandConfig, MonitorConfig};
use crate::errors::FuzzError;
use crate::runtime::ProcessRequest;
use regex::Regex;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    entries: Vec<(&'static str, Option<String>)>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.entries.push((name, Some(value.into())));
        self
    }

    pub fn maybe(mut self, name: &'static str, value: Option<String>) -> Self {
        self.entries.push((name, value));
        self
    }

    fn lookup(&self, name: &str) -> Option<&Option<String>> {
        self.entries
            .iter()
            .rev()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

pub fn render_args(args: &[String], placeholders: &Placeholders) -> Result<Vec<String>, FuzzError> {
    let pattern = Regex::new(r"\{([a-z_]+)\}")
        .map_err(|e| FuzzError::InvalidConfig(format!("placeholder pattern: {e}")))?;

    let mut rendered: Vec<String> = Vec::with_capacity(args.len());
    for arg in args {
        let mut out = String::with_capacity(arg.len());
        let mut last = 0;
        let mut dropped = false;
        for caps in pattern.captures_iter(arg) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&arg[last..whole.start()]);
            last = whole.end();
            match placeholders.lookup(name.as_str()) {
                Some(Some(value)) => out.push_str(value),
                Some(None) => dropped = true,
                None => {
                    return Err(FuzzError::InvalidConfig(format!(
                        "unknown placeholder `{}` in argument `{arg}`",
                        whole.as_str()
                    )))
                }
            }
        }
        if dropped {
            if rendered.last().is_some_and(|flag| flag.starts_with('-')) {
                rendered.pop();
            }
            continue;
        }
        out.push_str(&arg[last..]);
        rendered.push(out);
    }
    Ok(rendered)
}

fn render_command(
    command: &CommandConfig,
    placeholders: &Placeholders,
    cwd: Option<&Path>,
) -> Result<ProcessRequest, FuzzError> {
    Ok(ProcessRequest {
        program: command.program.clone(),
        args: render_args(&command.args, placeholders)?,
        cwd: cwd.map(Path::to_path_buf),
    })
}

/// The command line for one test case. `stamp` names the binary's trace files.
pub fn test_invocation(
    cfg: &AppConfig,
    scenario: &Path,
    stamp: i64,
    cwd: Option<&Path>,
) -> Result<ProcessRequest, FuzzError> {
    let placeholders = Placeholders::new()
        .set("target", cfg.target.address())
        .set("target_ip", cfg.target.ip.clone())
        .set("target_port", cfg.target.port.to_string())
        .set("scenario", scenario.display().to_string())
        .maybe("auth_file", cfg.authentication.csv_file.clone())
        .set("logs_dir", cfg.runner.trace_dir.clone())
        .set("stamp", stamp.to_string());
    let command = CommandConfig {
        program: cfg.runner.program.clone(),
        args: cfg.runner.args.clone(),
    };
    render_command(&command, &placeholders, cwd)
}

pub fn generator_invocation(
    cfg: &AppConfig,
    generator: &CommandConfig,
    cwd: Option<&Path>,
) -> Result<ProcessRequest, FuzzError> {
    let placeholders = Placeholders::new()
        .set("template", cfg.fuzzing.template.display().to_string())
        .set("count", cfg.fuzzing.iterations.to_string())
        .set("scenarios_dir", cfg.output.scenarios_dir.display().to_string());
    render_command(generator, &placeholders, cwd)
}

pub fn logcat_request(monitor: &MonitorConfig) -> Result<ProcessRequest, FuzzError> {
    let command = monitor.command.clone().unwrap_or_else(|| adb(&["logcat", "-v", "threadtime", "*:V"]));
    render_command(&command, &device_placeholders(monitor), None)
}

pub fn logcat_clear_request(monitor: &MonitorConfig) -> Result<ProcessRequest, FuzzError> {
    let command = monitor.clear_command.clone().unwrap_or_else(|| adb(&["logcat", "-c"]));
    render_command(&command, &device_placeholders(monitor), None)
}

fn adb(tail: &[&str]) -> CommandConfig {
    let mut args = vec!["-s".to_string(), "{device_id}".to_string()];
    args.extend(tail.iter().map(|arg| arg.to_string()));
    CommandConfig {
        program: "adb".to_string(),
        args,
    }
}

fn device_placeholders(monitor: &MonitorConfig) -> Placeholders {
    Placeholders::new().maybe("device_id", monitor.device_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn default_test_invocation_matches_the_docker_sipp_line() {
        let mut cfg = AppConfig::default();
        cfg.target.ip = "192.168.1.10".to_string();
        cfg.authentication.csv_file = Some("/workspace/auth.csv".to_string());

        let request = test_invocation(&cfg, Path::new("output/scenarios/s_001.xml"), 1700000000, None)
            .expect("render");
        assert_eq!(
            request.command_line(),
            "docker exec -i sipp-test sipp 192.168.1.10:5060 -sf output/scenarios/s_001.xml \
             -m 1 -l 1 -inf /workspace/auth.csv -trace_msg -trace_err \
             -message_file /workspace/output/logs/sipp_1700000000_msg.log \
             -error_file /workspace/output/logs/sipp_1700000000_err.log"
        );
    }

    #[test]
    fn missing_auth_drops_the_flag_pair() {
        let cfg = AppConfig::default();
        let request = test_invocation(&cfg, Path::new("a.xml"), 1, Some(Path::new("/w")))
            .expect("render");
        assert!(!request.args.iter().any(|arg| arg == "-inf"));
        assert!(request.args.contains(&"-trace_msg".to_string()));
        assert_eq!(request.cwd, Some(PathBuf::from("/w")));
    }

    #[test]
    fn unknown_placeholders_are_rejected() {
        let err = render_args(&strings(&["--x={bogus}"]), &Placeholders::new()).expect_err("unknown");
        assert!(format!("{err}").contains("{bogus}"));
    }

    #[test]
    fn literal_braces_and_partial_substitution_survive() {
        let placeholders = Placeholders::new().set("count", "5");
        let rendered =
            render_args(&strings(&["{}", "n={count}/{count}", "{Upper}"]), &placeholders).expect("render");
        assert_eq!(rendered, strings(&["{}", "n=5/5", "{Upper}"]));
    }

    #[test]
    fn generator_gets_template_count_and_output_dir() {
        let cfg = AppConfig::default();
        let generator = CommandConfig {
            program: "python3".to_string(),
            args: strings(&["gen.py", "{template}", "--count", "{count}", "--out", "{scenarios_dir}"]),
        };
        let request = generator_invocation(&cfg, &generator, None).expect("render");
        assert_eq!(
            request.args,
            strings(&[
                "gen.py",
                "scenarios/register_template.xml",
                "--count",
                "100",
                "--out",
                "output/scenarios"
            ])
        );
    }

    #[test]
    fn logcat_commands_follow_the_device_selection() {
        let mut monitor = AppConfig::default().monitor;
        assert_eq!(
            logcat_request(&monitor).expect("render").command_line(),
            "adb logcat -v threadtime *:V"
        );
        monitor.device_id = Some("R58M123".to_string());
        assert_eq!(
            logcat_clear_request(&monitor).expect("render").command_line(),
            "adb -s R58M123 logcat -c"
        );
    }
}
