use crate::errors::FuzzError;
use crate::runtime::{FileSystem, ProcessRequest, ProcessRunner};
use crate::types::TestCase;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const GENERATOR_TIMEOUT: Duration = Duration::from_secs(600);

/// Yields test cases in execution order.
pub trait ScenarioSource {
    fn next_case(&mut self) -> Result<Option<TestCase>, FuzzError>;
    fn len_hint(&self) -> usize;
}

#[derive(Debug, Clone, Default)]
pub struct ListedScenarios {
    pending: VecDeque<TestCase>,
    total: usize,
}

impl ListedScenarios {
    pub fn from_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let pending = paths
            .into_iter()
            .enumerate()
            .map(|(index, scenario)| TestCase {
                index,
                case_id: case_id_for(&scenario),
                scenario,
            })
            .collect::<VecDeque<_>>();
        Self {
            total: pending.len(),
            pending,
        }
    }

    pub fn single(scenario: &Path) -> Self {
        Self::from_paths([scenario.to_path_buf()])
    }

    /// Files in `dir` sharing `extension`, sorted by name, capped at `limit`.
    pub fn scan(
        fs: &dyn FileSystem,
        dir: &Path,
        extension: Option<&str>,
        limit: usize,
    ) -> Result<Self, FuzzError> {
        let listed = fs.list_dir(dir).map_err(|e| {
            FuzzError::Generator(format!("cannot read scenarios dir {}: {e}", dir.display()))
        })?;
        let mut paths = listed
            .into_iter()
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == extension)
            .collect::<Vec<_>>();
        paths.sort();
        paths.truncate(limit);

        if paths.is_empty() {
            let wanted = extension.map(|ext| format!(".{ext} ")).unwrap_or_default();
            return Err(FuzzError::Generator(format!(
                "no {wanted}scenarios found in {}",
                dir.display()
            )));
        }
        tracing::info!(dir = %dir.display(), count = paths.len(), "scenarios enumerated");
        Ok(Self::from_paths(paths))
    }
}

impl ScenarioSource for ListedScenarios {
    fn next_case(&mut self) -> Result<Option<TestCase>, FuzzError> {
        Ok(self.pending.pop_front())
    }

    fn len_hint(&self) -> usize {
        self.total
    }
}

pub fn case_id_for(scenario: &Path) -> String {
    scenario
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| scenario.display().to_string())
}

/// Runs the external generator once. Any failure is fatal to the campaign.
pub fn run_generator(runner: &dyn ProcessRunner, request: &ProcessRequest) -> Result<(), FuzzError> {
    tracing::info!(command = %request.command_line(), "running scenario generator");
    let outcome = runner.run(request, GENERATOR_TIMEOUT);
    if outcome.timed_out {
        return Err(FuzzError::Generator(format!(
            "generator timed out after {GENERATOR_TIMEOUT:?}"
        )));
    }
    if !outcome.succeeded {
        return Err(FuzzError::Generator(format!(
            "generator exited with {}: {}",
            outcome.exit_code,
            outcome.stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeFileSystem, FakeProcessRunner, FakeResponse};

    fn drain(source: &mut dyn ScenarioSource) -> Vec<TestCase> {
        let mut cases = Vec::new();
        while let Some(case) = source.next_case().expect("next") {
            cases.push(case);
        }
        cases
    }

    #[test]
    fn scan_filters_sorts_and_caps() {
        let fs = FakeFileSystem::default();
        for name in ["c.xml", "a.xml", "notes.txt", "b.xml"] {
            fs.write_string(&Path::new("/s").join(name), "<scenario/>")
                .expect("seed");
        }
        let mut source = ListedScenarios::scan(&fs, Path::new("/s"), Some("xml"), 2).expect("scan");
        assert_eq!(source.len_hint(), 2);
        let cases = drain(&mut source);
        assert_eq!(
            cases
                .iter()
                .map(|c| (c.index, c.case_id.as_str()))
                .collect::<Vec<_>>(),
            vec![(0, "a"), (1, "b")]
        );
        assert_eq!(source.next_case().expect("done"), None);
    }

    #[test]
    fn empty_or_unreadable_directories_are_fatal() {
        let fs = FakeFileSystem::with_file("/s/readme.md", "x");
        let err = ListedScenarios::scan(&fs, Path::new("/s"), Some("xml"), 10).expect_err("empty");
        assert!(format!("{err}").contains("no .xml scenarios"));

        fs.set_fail_next(FuzzError::Io("permission denied".to_string()));
        let err = ListedScenarios::scan(&fs, Path::new("/s"), Some("xml"), 10).expect_err("unreadable");
        assert!(matches!(err, FuzzError::Generator(message) if message.contains("permission denied")));
    }

    #[test]
    fn single_scenario_uses_the_file_stem() {
        let mut source = ListedScenarios::single(Path::new("scenarios/register_template.xml"));
        let cases = drain(&mut source);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].case_id, "register_template");
    }

    #[test]
    fn generator_failure_is_an_error() {
        let runner = FakeProcessRunner::new(FakeClock::default(), Duration::from_secs(1));
        runner.push_exit(0);
        runner.push_response(FakeResponse::Exit {
            code: 2,
            stdout: String::new(),
            stderr: "bad template\n".to_string(),
        });
        let request = ProcessRequest {
            program: "gen".to_string(),
            args: vec![],
            cwd: None,
        };
        run_generator(&runner, &request).expect("first run ok");
        let err = run_generator(&runner, &request).expect_err("second fails");
        assert!(format!("{err}").contains("exited with 2: bad template"));
    }
}
