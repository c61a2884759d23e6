use crate::matcher::LineObserver;
use crate::runtime::lock;
use crate::types::{LogLine, Timestamp};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_LINE_CAPACITY: usize = 5_000;

/// Keeps the most recent log lines so crash cases can carry the excerpt that
/// surrounded the failing test.
#[derive(Debug)]
pub struct LineBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<LogLine>>,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, line: LogLine) {
        let mut lines = lock(&self.lines);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        lock(&self.lines).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines captured in the closed window `[from, to]`, oldest first.
    pub fn lines_between(&self, from: Timestamp, to: Timestamp) -> Vec<LogLine> {
        lock(&self.lines)
            .iter()
            .filter(|line| from <= line.captured_at && line.captured_at <= to)
            .cloned()
            .collect()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_CAPACITY)
    }
}

impl LineObserver for LineBuffer {
    fn on_line(&self, line: &LogLine) {
        self.push(line.clone());
    }
}
