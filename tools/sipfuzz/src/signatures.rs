use crate::errors::FuzzError;
use crate::types::{CrashEvent, LogLine, Severity};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct CrashSignature {
    pub name: &'static str,
    pub matcher: Regex,
    pub severity: Severity,
}

impl CrashSignature {
    pub fn new(
        name: &'static str,
        pattern: &str,
        case_insensitive: bool,
        severity: Severity,
    ) -> Result<Self, FuzzError> {
        let matcher = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| FuzzError::InvalidConfig(format!("signature {name}: {e}")))?;
        Ok(Self {
            name,
            matcher,
            severity,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }
}

const SIGNATURE_TABLE: &[(&str, &str, bool, Severity)] = &[
    (
        "Native Crash",
        r"FATAL EXCEPTION|Fatal signal|SIGSEGV",
        false,
        Severity::Critical,
    ),
    (
        "ANR",
        r"ANR in|Application Not Responding",
        false,
        Severity::High,
    ),
    (
        "IMS Error",
        r"ImsService.*error|VoLTE.*fail",
        true,
        Severity::Medium,
    ),
    ("SIP Error", r"SIP.*\b[45][0-9]{2}\b", false, Severity::Medium),
    (
        "Segfault",
        r"segmentation fault|SIGSEGV",
        true,
        Severity::Critical,
    ),
    (
        "Buffer Overflow",
        r"buffer overflow|stack smashing",
        true,
        Severity::Critical,
    ),
];

/// The fixed crash signature table, in evaluation order.
pub fn default_signatures() -> Result<Vec<CrashSignature>, FuzzError> {
    SIGNATURE_TABLE
        .iter()
        .map(|(name, pattern, insensitive, severity)| {
            CrashSignature::new(name, pattern, *insensitive, *severity)
        })
        .collect()
}

/// Every signature that matches fires, in table order.
pub fn match_line(signatures: &[CrashSignature], line: &LogLine) -> Vec<CrashEvent> {
    signatures
        .iter()
        .filter(|signature| signature.matches(&line.text))
        .map(|signature| CrashEvent {
            detected_at: line.captured_at,
            signature_name: signature.name.to_string(),
            severity: signature.severity,
            matched_line: line.text.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub line_number: usize,
    pub content: String,
}

/// Case-insensitive search over a saved log file, e.g. a logcat capture.
pub fn search_log_file(path: &Path, pattern: &str) -> Result<Vec<SearchHit>, FuzzError> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| FuzzError::InvalidConfig(format!("search pattern: {e}")))?;
    let file = std::fs::File::open(path)
        .map_err(|e| FuzzError::Io(format!("{}: {e}", path.display())))?;

    let mut hits = Vec::new();
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    let mut line_number = 0usize;
    loop {
        raw.clear();
        let read = reader
            .read_until(b'\n', &mut raw)
            .map_err(|e| FuzzError::Io(e.to_string()))?;
        if read == 0 {
            break;
        }
        line_number += 1;
        let text = String::from_utf8_lossy(&raw);
        if regex.is_match(&text) {
            hits.push(SearchHit {
                line_number,
                content: text.trim().to_string(),
            });
        }
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn line(text: &str) -> LogLine {
        LogLine {
            captured_at: Utc::now(),
            text: text.to_string(),
        }
    }

    fn names(events: &[CrashEvent]) -> Vec<&str> {
        events.iter().map(|e| e.signature_name.as_str()).collect()
    }

    #[test]
    fn each_signature_fires_on_its_defining_text() {
        let signatures = default_signatures().expect("table compiles");
        let cases = [
            ("E AndroidRuntime: FATAL EXCEPTION: main", "Native Crash", Severity::Critical),
            ("F libc    : Fatal signal 6 (SIGABRT)", "Native Crash", Severity::Critical),
            ("E ActivityManager: ANR in com.android.phone", "ANR", Severity::High),
            ("Application Not Responding: ims", "ANR", Severity::High),
            ("D imsservice: registration ERROR 3", "IMS Error", Severity::Medium),
            ("W volte: call setup FAILED", "IMS Error", Severity::Medium),
            ("I SIP/2.0 403 Forbidden", "SIP Error", Severity::Medium),
            ("I SIP/2.0 503 Service Unavailable", "SIP Error", Severity::Medium),
            ("I SIP/2.0 480 Temporarily Unavailable", "SIP Error", Severity::Medium),
            ("I SIP/2.0 486 Busy Here", "SIP Error", Severity::Medium),
            ("kernel: Segmentation Fault at 0x0", "Segfault", Severity::Critical),
            ("*** stack smashing detected ***", "Buffer Overflow", Severity::Critical),
            ("Buffer Overflow in parser", "Buffer Overflow", Severity::Critical),
        ];
        for (text, expected, severity) in cases {
            let events = match_line(&signatures, &line(text));
            assert_eq!(names(&events), vec![expected], "line: {text}");
            assert_eq!(events[0].severity, severity);
            assert_eq!(events[0].matched_line, text);
        }
    }

    #[test]
    fn one_line_can_fire_multiple_signatures() {
        let signatures = default_signatures().expect("table compiles");
        let captured = line("F DEBUG: signal 11 (SIGSEGV), segmentation fault in libims.so");
        let events = match_line(&signatures, &captured);
        assert_eq!(names(&events), vec!["Native Crash", "Segfault"]);
        assert!(events.iter().all(|e| e.detected_at == captured.captured_at));
    }

    #[test]
    fn case_sensitive_signatures_ignore_other_casing() {
        let signatures = default_signatures().expect("table compiles");
        assert!(match_line(&signatures, &line("fatal exception in main")).is_empty());
        assert!(match_line(&signatures, &line("anr in com.example")).is_empty());
        assert!(match_line(&signatures, &line("SIP/2.0 200 OK")).is_empty());
        assert!(match_line(&signatures, &line("")).is_empty());
    }

    #[test]
    fn file_search_reports_line_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logcat.log");
        std::fs::write(&path, b"ok\nFatal Signal 11\nfine\xff\nfatal again\n").expect("write");
        let hits = search_log_file(&path, "fatal").expect("search");
        assert_eq!(
            hits,
            vec![
                SearchHit {
                    line_number: 2,
                    content: "Fatal Signal 11".to_string()
                },
                SearchHit {
                    line_number: 4,
                    content: "fatal again".to_string()
                },
            ]
        );
    }
}
