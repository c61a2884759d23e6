use crate::errors::FuzzError;
use crate::runtime::FileSystem;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

/// Installs the global diagnostics subscriber on stderr. `RUST_LOG` wins over
/// `verbose`; later calls are ignored.
pub fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "sipfuzz=debug,info"
    } else {
        "sipfuzz=info,warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .ok();
}

/// Append-only structured event log for one campaign.
#[derive(Clone)]
pub struct JsonlLogger {
    fs: Arc<dyn FileSystem>,
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl AsRef<Path>) -> Self {
        Self {
            fs,
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), FuzzError> {
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| FuzzError::Io(e.to_string()))?;
        self.fs.append_line(&self.path, &line)
    }

    /// Like [`append`](Self::append), but a failed write only warns.
    pub fn record(&self, level: &str, event_type: &str, payload: Value) {
        let event = LogEvent {
            level,
            event_type,
            payload,
        };
        if let Err(err) = self.append(&event) {
            tracing::warn!(path = %self.path.display(), error = %err, "campaign event log write failed");
        }
    }
}

pub fn structured_progress_line(case_id: &str, phase: &str, message: &str) -> String {
    format!(
        "case_id={case_id} phase={phase} message={}",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
