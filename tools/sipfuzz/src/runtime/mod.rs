use crate::errors::FuzzError;
use crate::types::{shift, ExecutionOutcome, Timestamp};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub mod process;
pub mod supervisor;

pub use process::ProductionProcessRunner;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessRequest {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
    fn sleep_until(&self, deadline: Timestamp) -> Result<(), FuzzError>;

    fn sleep(&self, duration: Duration) -> Result<(), FuzzError> {
        self.sleep_until(shift(self.now(), duration))
    }
}

/// Runs one invocation to completion or timeout. Never fails: every spawn,
/// wait or timeout problem is reported inside the returned outcome.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, request: &ProcessRequest, timeout: Duration) -> ExecutionOutcome;

    /// How long a timed-out group gets between SIGTERM and SIGKILL.
    fn set_kill_grace(&self, _grace: Duration) {}
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, FuzzError>;
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, FuzzError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FuzzError>;
    /// Appends `line` plus a newline, creating the file if needed.
    fn append_line(&self, path: &Path, line: &str) -> Result<(), FuzzError>;
    /// Truncating writer for long-lived streams such as the logcat capture.
    fn create_sink(&self, path: &Path) -> Result<Box<dyn Write + Send>, FuzzError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), FuzzError>;
    fn copy_file(&self, from: &Path, to: &Path) -> Result<(), FuzzError>;
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>, FuzzError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), FuzzError>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }

    fn sleep_until(&self, deadline: Timestamp) -> Result<(), FuzzError> {
        if let Ok(duration) = (deadline - Utc::now()).to_std() {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FuzzError> {
        std::fs::read_to_string(path)
            .map_err(|e| FuzzError::Io(format!("{}: {e}", path.display())))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, FuzzError> {
        std::fs::read(path).map_err(|e| FuzzError::Io(format!("{}: {e}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FuzzError> {
        std::fs::write(path, contents)
            .map_err(|e| FuzzError::Io(format!("{}: {e}", path.display())))
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), FuzzError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FuzzError::Io(format!("{}: {e}", path.display())))?;
        writeln!(file, "{line}").map_err(|e| FuzzError::Io(format!("{}: {e}", path.display())))
    }

    fn create_sink(&self, path: &Path) -> Result<Box<dyn Write + Send>, FuzzError> {
        let file = std::fs::File::create(path)
            .map_err(|e| FuzzError::Io(format!("{}: {e}", path.display())))?;
        Ok(Box::new(file))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FuzzError> {
        std::fs::create_dir_all(path)
            .map_err(|e| FuzzError::Io(format!("{}: {e}", path.display())))
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<(), FuzzError> {
        std::fs::copy(from, to)
            .map(|_| ())
            .map_err(|e| FuzzError::Io(format!("{} -> {}: {e}", from.display(), to.display())))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>, FuzzError> {
        let mut entries = std::fs::read_dir(path)
            .map_err(|e| FuzzError::Io(format!("{}: {e}", path.display())))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        entries.sort();
        Ok(entries)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), FuzzError> {
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| FuzzError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(ProductionClock);
        Self {
            process_runner: Arc::new(ProductionProcessRunner::new(clock.clone())),
            clock,
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<Timestamp>>,
    sleeps: Arc<Mutex<Vec<Timestamp>>>,
}

impl FakeClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now = shift(*now, by);
    }

    pub fn sleeps(&self) -> Vec<Timestamp> {
        lock(&self.sleeps).clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        *lock(&self.now)
    }

    fn sleep_until(&self, deadline: Timestamp) -> Result<(), FuzzError> {
        lock(&self.sleeps).push(deadline);
        let mut now = lock(&self.now);
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<FuzzError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        lock(&fs.files).insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: FuzzError) {
        *lock(&self.fail_next) = Some(error);
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths = lock(&self.files).keys().cloned().collect::<Vec<_>>();
        paths.sort();
        paths
    }

    pub fn dirs(&self) -> Vec<PathBuf> {
        lock(&self.dirs).clone()
    }

    fn maybe_fail(&self) -> Result<(), FuzzError> {
        if let Some(err) = lock(&self.fail_next).take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FuzzError> {
        self.maybe_fail()?;
        self.file(path)
            .ok_or_else(|| FuzzError::Io(format!("missing file {}", path.display())))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, FuzzError> {
        self.read_to_string(path).map(String::into_bytes)
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FuzzError> {
        self.maybe_fail()?;
        lock(&self.files).insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), FuzzError> {
        self.maybe_fail()?;
        let mut files = lock(&self.files);
        let contents = files.entry(path.to_path_buf()).or_default();
        contents.push_str(line);
        contents.push('\n');
        Ok(())
    }

    fn create_sink(&self, path: &Path) -> Result<Box<dyn Write + Send>, FuzzError> {
        self.maybe_fail()?;
        lock(&self.files).insert(path.to_path_buf(), String::new());
        Ok(Box::new(FakeSink {
            files: self.files.clone(),
            path: path.to_path_buf(),
        }))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FuzzError> {
        self.maybe_fail()?;
        lock(&self.dirs).push(path.to_path_buf());
        Ok(())
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<(), FuzzError> {
        let contents = self.read_to_string(from)?;
        self.write_string(to, &contents)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>, FuzzError> {
        self.maybe_fail()?;
        Ok(self
            .paths()
            .into_iter()
            .filter(|file| file.parent() == Some(path))
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        lock(&self.files).contains_key(path)
    }
}

struct FakeSink {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    path: PathBuf,
}

impl Write for FakeSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock(&self.files)
            .entry(self.path.clone())
            .or_default()
            .push_str(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), FuzzError> {
        lock(&self.writes).push(line.to_string());
        Ok(())
    }
}

/// Replays queued outcomes in order and records every request it was given.
/// Each outcome is re-stamped with the fake clock so attribution windows line
/// up with the campaign's own timestamps; `run_for` advances that clock.
#[derive(Clone)]
pub struct FakeProcessRunner {
    clock: FakeClock,
    run_for: Duration,
    responses: Arc<Mutex<Vec<FakeResponse>>>,
    requests: Arc<Mutex<Vec<(ProcessRequest, Duration)>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeResponse {
    Exit { code: i32, stdout: String, stderr: String },
    Timeout,
    SpawnError(String),
}

impl FakeProcessRunner {
    pub fn new(clock: FakeClock, run_for: Duration) -> Self {
        Self {
            clock,
            run_for,
            responses: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push_response(&self, response: FakeResponse) {
        lock(&self.responses).push(response);
    }

    pub fn push_exit(&self, code: i32) {
        self.push_response(FakeResponse::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    pub fn requests(&self) -> Vec<(ProcessRequest, Duration)> {
        lock(&self.requests).clone()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn run(&self, request: &ProcessRequest, timeout: Duration) -> ExecutionOutcome {
        lock(&self.requests).push((request.clone(), timeout));
        let started_at = self.clock.now();
        let response = {
            let mut responses = lock(&self.responses);
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };
        match response {
            Some(FakeResponse::Exit {
                code,
                stdout,
                stderr,
            }) => {
                self.clock.advance(self.run_for);
                ExecutionOutcome::completed(code, stdout, stderr, started_at, self.clock.now())
            }
            Some(FakeResponse::Timeout) => {
                self.clock.advance(timeout);
                ExecutionOutcome::timed_out(
                    String::new(),
                    format!("timed out after {timeout:?}"),
                    started_at,
                    self.clock.now(),
                )
            }
            Some(FakeResponse::SpawnError(message)) => {
                ExecutionOutcome::runner_error(message, started_at, self.clock.now())
            }
            None => ExecutionOutcome::runner_error(
                "no fake response queued".to_string(),
                started_at,
                self.clock.now(),
            ),
        }
    }
}
