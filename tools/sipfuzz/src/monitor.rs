//! Live log ingestion.
//!
//! A [`LogMonitor`] attaches to an append-only log source, tees every line
//! into an optional durable sink and into the matcher's queue. One reader
//! thread produces, one matcher thread consumes; both are owned by the
//! [`MonitorHandle`] returned from [`LogMonitor::start`].

use crate::matcher::{CrashObserver, LineObserver, MatcherCounters, PatternMatcher, QueueState};
use crate::runtime::supervisor::{isolate, GroupSupervisor, DEFAULT_KILL_GRACE};
use crate::runtime::{lock, Clock, ProcessRequest, ProcessRunner};
use crate::signatures::CrashSignature;
use crate::types::LogLine;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedSender};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const CLEAR_TIMEOUT: Duration = Duration::from_secs(10);
const READER_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub enum LogSource {
    /// Spawned as its own process group; stdout is the stream, stderr is dropped.
    Command(ProcessRequest),
    Reader(Box<dyn Read + Send>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorHealth {
    Running,
    Degraded(String),
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub lines_read: u64,
    pub lines_processed: u64,
    pub lines_discarded: u64,
    pub crashes_detected: u64,
    pub observer_failures: u64,
}

pub struct LogMonitor {
    clock: Arc<dyn Clock>,
    signatures: Vec<CrashSignature>,
    line_observers: Vec<Arc<dyn LineObserver>>,
    crash_observers: Vec<Arc<dyn CrashObserver>>,
    drain_timeout: Duration,
    kill_grace: Duration,
}

impl LogMonitor {
    pub fn new(clock: Arc<dyn Clock>, signatures: Vec<CrashSignature>) -> Self {
        Self {
            clock,
            signatures,
            line_observers: Vec::new(),
            crash_observers: Vec::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn register_line_observer(&mut self, observer: Arc<dyn LineObserver>) {
        self.line_observers.push(observer);
    }

    pub fn register_crash_observer(&mut self, observer: Arc<dyn CrashObserver>) {
        self.crash_observers.push(observer);
    }

    /// Attaches to `source`. Never fails: a source that cannot be opened
    /// yields a handle that is already degraded.
    pub fn start(&self, source: LogSource, sink: Option<Box<dyn Write + Send>>) -> MonitorHandle {
        let shared = Arc::new(Shared::default());
        let mut matcher = PatternMatcher::new(self.signatures.clone());
        for observer in &self.line_observers {
            matcher.register_line_observer(observer.clone());
        }
        for observer in &self.crash_observers {
            matcher.register_crash_observer(observer.clone());
        }
        let mut handle = MonitorHandle {
            shared: shared.clone(),
            counters: matcher.counters(),
            supervisor: None,
            reader: None,
            matcher: None,
            drain_timeout: self.drain_timeout,
            kill_grace: self.kill_grace,
        };

        let stream: Box<dyn Read + Send> = match source {
            LogSource::Reader(reader) => reader,
            LogSource::Command(request) => match spawn_source(&request) {
                Ok((stdout, supervisor)) => {
                    tracing::info!(pgid = supervisor.pgid(), command = %request.command_line(), "log source attached");
                    handle.supervisor = Some(supervisor);
                    stdout
                }
                Err(reason) => {
                    shared.degrade(reason);
                    return handle;
                }
            },
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<LogLine>();
        *lock(&shared.queue_tx) = Some(tx);
        let matcher_state = shared.clone();
        let spawned = thread::Builder::new()
            .name("sipfuzz-matcher".to_string())
            .spawn(move || matcher.consume(&mut rx, &matcher_state.queue));
        match spawned {
            Ok(join) => handle.matcher = Some(join),
            Err(err) => {
                shared.degrade(format!("failed to start matcher thread: {err}"));
                shared.close_queue();
                handle.kill_source();
                return handle;
            }
        }

        let reader_state = shared.clone();
        let clock = self.clock.clone();
        let spawned = thread::Builder::new()
            .name("sipfuzz-log-reader".to_string())
            .spawn(move || read_lines(stream, sink, clock.as_ref(), &reader_state));
        match spawned {
            Ok(join) => handle.reader = Some(join),
            Err(err) => {
                shared.degrade(format!("failed to start reader thread: {err}"));
                shared.close_queue();
                handle.kill_source();
            }
        }
        handle
    }
}

/// Runs the pre-start clear command. Failure only warns.
pub fn clear_source(runner: &dyn ProcessRunner, request: &ProcessRequest) -> bool {
    let outcome = runner.run(request, CLEAR_TIMEOUT);
    if !outcome.succeeded {
        tracing::warn!(
            command = %request.command_line(),
            exit_code = outcome.exit_code,
            stderr = %outcome.stderr.trim(),
            "clearing log source failed; continuing"
        );
    }
    outcome.succeeded
}

#[derive(Debug)]
struct Shared {
    queue: QueueState,
    /// The reader's only way into the matcher queue. `None` once stopping.
    queue_tx: Mutex<Option<UnboundedSender<LogLine>>>,
    health: Mutex<MonitorHealth>,
    lines_read: AtomicU64,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            queue: QueueState::default(),
            queue_tx: Mutex::new(None),
            health: Mutex::new(MonitorHealth::Running),
            lines_read: AtomicU64::new(0),
        }
    }
}

impl Shared {
    /// Drops the sender. Waits for a line the reader is handing over, and
    /// lets the matcher see end of queue once that line is consumed.
    fn close_queue(&self) {
        lock(&self.queue_tx).take();
    }

    fn degrade(&self, reason: String) {
        let mut health = lock(&self.health);
        if *health == MonitorHealth::Running {
            tracing::warn!(reason = %reason, "log monitor degraded");
            *health = MonitorHealth::Degraded(reason);
        }
    }
}

pub struct MonitorHandle {
    shared: Arc<Shared>,
    counters: Arc<MatcherCounters>,
    supervisor: Option<GroupSupervisor>,
    reader: Option<JoinHandle<()>>,
    matcher: Option<JoinHandle<()>>,
    drain_timeout: Duration,
    kill_grace: Duration,
}

impl MonitorHandle {
    pub fn health(&self) -> MonitorHealth {
        lock(&self.shared.health).clone()
    }

    pub fn is_running(&self) -> bool {
        self.health() == MonitorHealth::Running
    }

    /// True once every line queued before the call has gone through the
    /// matcher; false if `timeout` passed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.queue.wait_idle(timeout)
    }

    pub fn stats(&self) -> MonitorStats {
        let discarded = self.shared.queue.discarded();
        MonitorStats {
            lines_read: self.shared.lines_read.load(Ordering::Relaxed),
            lines_processed: self.shared.queue.processed().saturating_sub(discarded),
            lines_discarded: discarded,
            crashes_detected: self.counters.crashes_detected.load(Ordering::Relaxed),
            observer_failures: self.counters.observer_failures.load(Ordering::Relaxed),
        }
    }

    /// Stops ingestion and joins the matcher. Nothing is queued once this
    /// returns; lines still queued after the drain timeout are discarded. A
    /// reader still blocked on a source that stays open is detached after the
    /// drain timeout. Calling it twice is harmless.
    pub fn stop(&mut self) -> MonitorStats {
        if self.health() == MonitorHealth::Stopped {
            return self.stats();
        }
        self.shared.queue.begin_drain(self.drain_timeout);
        self.shared.close_queue();
        self.kill_source();
        self.join_reader();
        if let Some(matcher) = self.matcher.take() {
            if matcher.join().is_err() {
                tracing::error!("matcher thread panicked");
            }
        }
        *lock(&self.shared.health) = MonitorHealth::Stopped;

        let stats = self.stats();
        tracing::info!(
            lines_read = stats.lines_read,
            lines_processed = stats.lines_processed,
            lines_discarded = stats.lines_discarded,
            crashes = stats.crashes_detected,
            "log monitor stopped"
        );
        stats
    }

    fn join_reader(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        let started = Instant::now();
        while !reader.is_finished() && started.elapsed() < self.drain_timeout {
            thread::sleep(READER_POLL_INTERVAL);
        }
        if !reader.is_finished() {
            tracing::debug!("log source still open; detaching reader thread");
            return;
        }
        if reader.join().is_err() {
            tracing::error!("log reader thread panicked");
        }
    }

    fn kill_source(&mut self) {
        if let Some(mut supervisor) = self.supervisor.take() {
            if let Err(err) = supervisor.terminate(self.kill_grace) {
                tracing::debug!(pgid = supervisor.pgid(), error = %err, "log source reap failed");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if self.health() != MonitorHealth::Stopped {
            self.shared.queue.begin_drain(Duration::ZERO);
            self.shared.close_queue();
            self.kill_source();
        }
    }
}

fn spawn_source(
    request: &ProcessRequest,
) -> Result<(Box<dyn Read + Send>, GroupSupervisor), String> {
    let mut command = Command::new(&request.program);
    command
        .args(&request.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }
    isolate(&mut command);

    let mut child = command
        .spawn()
        .map_err(|e| format!("failed to spawn log source {}: {e}", request.program))?;
    let stdout = child.stdout.take();
    let supervisor = GroupSupervisor::watch(child);
    match stdout {
        Some(stdout) => Ok((Box::new(stdout), supervisor)),
        None => Err("log source has no stdout pipe".to_string()),
    }
}

fn read_lines(
    stream: Box<dyn Read + Send>,
    mut sink: Option<Box<dyn Write + Send>>,
    clock: &dyn Clock,
    shared: &Shared,
) {
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    let ended = loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break "log source reached end of stream".to_string(),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => break format!("log source read failed: {err}"),
        }
        let gate = lock(&shared.queue_tx);
        let Some(queue) = gate.as_ref() else {
            break String::new();
        };
        let captured_at = clock.now();

        if let Some(out) = sink.as_mut() {
            if let Err(err) = out.write_all(&raw).and_then(|_| out.flush()) {
                tracing::warn!(error = %err, "log sink write failed; sink disabled");
                sink = None;
            }
        }

        let decoded = String::from_utf8_lossy(&raw);
        let mut text: &str = &decoded;
        text = text.strip_suffix('\n').unwrap_or(text);
        text = text.strip_suffix('\r').unwrap_or(text);
        shared.lines_read.fetch_add(1, Ordering::Relaxed);
        shared.queue.note_enqueued();
        let line = LogLine {
            captured_at,
            text: text.to_string(),
        };
        if queue.send(line).is_err() {
            break "matcher stopped consuming".to_string();
        }
    };

    if !shared.queue.stopping() {
        shared.degrade(ended);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_log::CrashLog;
    use crate::line_buffer::LineBuffer;
    use crate::runtime::{FakeClock, FakeProcessRunner, ProductionClock};
    use crate::signatures::default_signatures;
    use std::io::Cursor;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Slow;

    impl LineObserver for Slow {
        fn on_line(&self, _line: &LogLine) {
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn monitor() -> LogMonitor {
        LogMonitor::new(
            Arc::new(ProductionClock),
            default_signatures().expect("signatures"),
        )
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn reader(bytes: &[u8]) -> LogSource {
        LogSource::Reader(Box::new(Cursor::new(bytes.to_vec())))
    }

    #[test]
    fn lines_are_teed_to_sink_and_matched() {
        let mut monitor = monitor();
        let crashes = Arc::new(CrashLog::new());
        monitor.register_crash_observer(crashes.clone());
        let sink = SharedSink::default();
        let input = b"boot\r\nF libc: Fatal signal 6\nANR in com.android.phone\n";

        let mut handle = monitor.start(reader(input), Some(Box::new(sink.clone())));
        assert!(wait_for(|| !handle.is_running()));
        assert!(handle.wait_idle(Duration::from_secs(5)));

        let names = crashes
            .snapshot()
            .into_iter()
            .map(|e| e.signature_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Native Crash", "ANR"]);
        assert_eq!(lock(&sink.0).as_slice(), input);

        let stats = handle.stop();
        assert_eq!(stats.lines_read, 3);
        assert_eq!(stats.lines_processed, 3);
        assert_eq!(stats.crashes_detected, 2);
        assert_eq!(handle.health(), MonitorHealth::Stopped);
    }

    #[test]
    fn decoding_is_lossy_and_strips_line_endings() {
        let clock = FakeClock::default();
        let mut monitor = LogMonitor::new(
            Arc::new(clock.clone()),
            default_signatures().expect("signatures"),
        );
        let buffer = Arc::new(LineBuffer::new(10));
        monitor.register_line_observer(buffer.clone());

        let mut handle = monitor.start(reader(b"abc\r\n\xffSIGSEGV\nlast"), None);
        assert!(wait_for(|| !handle.is_running()));
        assert!(handle.wait_idle(Duration::from_secs(5)));

        let texts = buffer
            .lines_between(clock.now(), clock.now())
            .into_iter()
            .map(|line| line.text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["abc", "\u{FFFD}SIGSEGV", "last"]);
        handle.stop();
    }

    #[test]
    fn end_of_stream_degrades_instead_of_failing() {
        let handle = monitor().start(reader(b""), None);
        assert!(wait_for(|| !handle.is_running()));
        match handle.health() {
            MonitorHealth::Degraded(reason) => assert!(reason.contains("end of stream")),
            other => panic!("unexpected health {other:?}"),
        }
    }

    #[test]
    fn stop_with_backlog_discards_after_drain_timeout() {
        let mut monitor = monitor().with_drain_timeout(Duration::from_millis(50));
        monitor.register_line_observer(Arc::new(Slow));
        let input = "noise\n".repeat(200);

        let mut handle = monitor.start(reader(input.as_bytes()), None);
        assert!(wait_for(|| !handle.is_running()));
        let started = Instant::now();
        let stats = handle.stop();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stats.lines_read, 200);
        assert!(stats.lines_discarded > 0);
        assert_eq!(stats.lines_processed + stats.lines_discarded, 200);
        assert_eq!(handle.stop(), stats);
    }

    #[test]
    fn unspawnable_source_is_degraded_at_start() {
        let request = ProcessRequest {
            program: "/nonexistent/adb".to_string(),
            args: vec!["logcat".to_string()],
            cwd: None,
        };
        let mut handle = monitor().start(LogSource::Command(request), None);
        assert!(matches!(handle.health(), MonitorHealth::Degraded(_)));
        assert_eq!(handle.stop().lines_read, 0);
    }

    #[test]
    fn failed_clear_is_reported_not_raised() {
        let runner = FakeProcessRunner::new(FakeClock::default(), Duration::ZERO);
        runner.push_exit(1);
        runner.push_exit(0);
        let request = ProcessRequest {
            program: "adb".to_string(),
            args: vec!["logcat".to_string(), "-c".to_string()],
            cwd: None,
        };
        assert!(!clear_source(&runner, &request));
        assert!(clear_source(&runner, &request));
        assert_eq!(runner.requests()[0].1, CLEAR_TIMEOUT);
    }

    #[cfg(unix)]
    #[test]
    fn stop_returns_while_a_reader_source_stays_open() {
        use std::os::unix::net::UnixStream;
        use std::sync::mpsc as std_mpsc;

        let (mut writer, source) = UnixStream::pair().expect("socket pair");
        let mut monitor = monitor().with_drain_timeout(Duration::from_millis(100));
        let crashes = Arc::new(CrashLog::new());
        monitor.register_crash_observer(crashes.clone());
        let sink = SharedSink::default();

        let mut handle = monitor.start(
            LogSource::Reader(Box::new(source)),
            Some(Box::new(sink.clone())),
        );
        writer
            .write_all(b"F libc: Fatal signal 6\n")
            .expect("first line");
        assert!(wait_for(|| crashes.len() == 1));

        let (done_tx, done_rx) = std_mpsc::channel();
        thread::spawn(move || {
            let stats = handle.stop();
            let _ = done_tx.send((stats, handle.health()));
        });
        let (stats, health) = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("stop returned");
        assert_eq!(health, MonitorHealth::Stopped);
        assert_eq!(stats.lines_read, 1);

        // The detached reader wakes up but hands nothing over.
        writer
            .write_all(b"F libc: Fatal signal 11\n")
            .expect("late line");
        thread::sleep(Duration::from_millis(100));
        assert_eq!(crashes.len(), 1);
        assert_eq!(lock(&sink.0).as_slice(), b"F libc: Fatal signal 6\n");
    }

    #[cfg(unix)]
    #[test]
    fn command_source_is_torn_down_on_stop() {
        let mut monitor = monitor().with_kill_grace(Duration::from_millis(200));
        let crashes = Arc::new(CrashLog::new());
        monitor.register_crash_observer(crashes.clone());
        let request = ProcessRequest {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo 'E AndroidRuntime: FATAL EXCEPTION: main'; sleep 30".to_string(),
            ],
            cwd: None,
        };

        let mut handle = monitor.start(LogSource::Command(request), None);
        assert!(wait_for(|| !crashes.is_empty()));
        assert!(handle.is_running());

        let started = Instant::now();
        let stats = handle.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.crashes_detected, 1);
        assert_eq!(handle.health(), MonitorHealth::Stopped);
    }
}
