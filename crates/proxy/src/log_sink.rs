//! Batched, best-effort NDJSON logging for upstream traffic.
//!
//! Writing one line per request/response/error straight to disk on the
//! request path would add a syscall to every call; instead handlers hand an
//! owned record to an unbounded-ish channel and move on, and a single
//! background task batches entries per kind and flushes them to their own
//! file, either once a batch fills up or on a timer, whichever comes first.
//! A full channel means the sink is falling behind, so entries are dropped
//! rather than applying backpressure to request handling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 4_096;

/// Which NDJSON file an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum LogKind {
    UpstreamRequest,
    UpstreamResponse,
    Error,
    PerformanceMetric,
}

impl LogKind {
    fn file_name(self) -> &'static str {
        match self {
            Self::UpstreamRequest => "upstream_requests.json",
            Self::UpstreamResponse => "upstream_responses.json",
            Self::Error => "error_logs.json",
            Self::PerformanceMetric => "performance_metrics.json",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::UpstreamRequest => "upstream_request",
            Self::UpstreamResponse => "upstream_response",
            Self::Error => "error",
            Self::PerformanceMetric => "performance_metric",
        }
    }
}

#[derive(Debug, Serialize)]
struct LogRecord {
    timestamp: u64,
    level: &'static str,
    r#type: &'static str,
    correlation_id: String,
    data: Value,
}

/// Handle handed to the rest of the proxy; cheap to clone-by-reference
/// (holds only a channel sender) and safe to call from any async context.
pub(crate) struct LogSink {
    sender: mpsc::Sender<(LogKind, String)>,
    body_capture_limit: Option<usize>,
}

impl LogSink {
    /// Spawns the background flusher and returns a handle to it. Dropping
    /// every clone of the returned sink closes the channel, which lets the
    /// flusher drain its buffers and exit instead of losing the tail batch.
    pub(crate) fn spawn(log_dir: impl Into<PathBuf>, profile: config::LoggingProfile) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let dir = log_dir.into();
        tokio::spawn(run_flusher(receiver, dir, profile));

        Self {
            sender,
            body_capture_limit: profile.body_capture_limit(),
        }
    }

    /// Truncates `body` to the configured capture limit for the active
    /// logging profile; `None` means capture in full.
    pub(crate) fn truncate_body(&self, body: &str) -> String {
        match self.body_capture_limit {
            None => body.to_string(),
            Some(limit) if body.len() <= limit => body.to_string(),
            Some(0) => String::new(),
            Some(limit) => format!("{}... [truncated]", &body[..floor_char_boundary(body, limit)]),
        }
    }

    fn enqueue(&self, kind: LogKind, level: &'static str, correlation_id: &str, data: Value) {
        let record = LogRecord {
            timestamp: now_unix(),
            level,
            r#type: kind.as_str(),
            correlation_id: correlation_id.to_string(),
            data,
        };

        let Ok(line) = serde_json::to_string(&record) else {
            log::error!("failed to serialize {} log entry", kind.as_str());
            return;
        };

        if self.sender.try_send((kind, line)).is_err() {
            log::warn!("log sink backlogged, dropping a {} entry", kind.as_str());
        }
    }

    pub(crate) fn upstream_request(&self, correlation_id: &str, data: Value) {
        self.enqueue(LogKind::UpstreamRequest, "info", correlation_id, data);
    }

    pub(crate) fn upstream_response(&self, correlation_id: &str, data: Value) {
        self.enqueue(LogKind::UpstreamResponse, "info", correlation_id, data);
    }

    pub(crate) fn error(&self, correlation_id: &str, data: Value) {
        self.enqueue(LogKind::Error, "error", correlation_id, data);
    }

    pub(crate) fn performance_metric(&self, correlation_id: &str, data: Value) {
        self.enqueue(LogKind::PerformanceMetric, "info", correlation_id, data);
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Largest byte index `<= limit` that lies on a UTF-8 char boundary, so
/// truncation never splits a multi-byte character.
fn floor_char_boundary(s: &str, limit: usize) -> usize {
    if limit >= s.len() {
        return s.len();
    }
    (0..=limit).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

async fn run_flusher(mut receiver: mpsc::Receiver<(LogKind, String)>, dir: PathBuf, profile: config::LoggingProfile) {
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        log::error!("failed to create log directory {}: {e}", dir.display());
    }

    let batch_size = profile.batch_size();
    let mut buffers: HashMap<LogKind, Vec<String>> = HashMap::new();
    let mut ticker = tokio::time::interval(profile.flush_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            entry = receiver.recv() => {
                match entry {
                    Some((kind, line)) => {
                        let buffer = buffers.entry(kind).or_default();
                        buffer.push(line);
                        if buffer.len() >= batch_size {
                            let lines = buffers.remove(&kind).unwrap_or_default();
                            flush(&dir, kind, lines).await;
                        }
                    }
                    None => {
                        flush_all(&dir, &mut buffers).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush_all(&dir, &mut buffers).await;
            }
        }
    }
}

async fn flush_all(dir: &PathBuf, buffers: &mut HashMap<LogKind, Vec<String>>) {
    for (kind, lines) in buffers.drain() {
        flush(dir, kind, lines).await;
    }
}

async fn flush(dir: &PathBuf, kind: LogKind, lines: Vec<String>) {
    if lines.is_empty() {
        return;
    }

    let path = dir.join(kind.file_name());
    let file = OpenOptions::new().create(true).append(true).open(&path).await;

    match file {
        Ok(mut file) => {
            let mut payload = lines.join("\n");
            payload.push('\n');
            if let Err(e) = file.write_all(payload.as_bytes()).await {
                log::error!("failed to write {} batch to {}: {e}", kind.as_str(), path.display());
            }
        }
        Err(e) => log::error!("failed to open log file {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_are_flushed_to_per_kind_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::spawn(dir.path(), config::LoggingProfile::MaxDetail);

        sink.upstream_request("corr-1", serde_json::json!({"model": "glm-4.5"}));
        sink.error("corr-1", serde_json::json!({"message": "boom"}));

        // MaxDetail flushes on every entry (batch_size == 1); give the
        // background task a turn to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let requests = tokio::fs::read_to_string(dir.path().join("upstream_requests.json")).await.unwrap();
        assert!(requests.contains("glm-4.5"));
        assert!(requests.contains("\"type\":\"upstream_request\""));

        let errors = tokio::fs::read_to_string(dir.path().join("error_logs.json")).await.unwrap();
        assert!(errors.contains("boom"));
    }

    #[test]
    fn truncate_body_respects_capture_limit() {
        let dir = std::env::temp_dir();
        let sink = LogSink::spawn(dir, config::LoggingProfile::Performance);
        let truncated = sink.truncate_body(&"x".repeat(1000));
        assert!(truncated.len() < 1000);
        assert!(truncated.ends_with("[truncated]"));
    }

    #[test]
    fn truncate_body_passthrough_for_max_detail() {
        let dir = std::env::temp_dir();
        let sink = LogSink::spawn(dir, config::LoggingProfile::MaxDetail);
        let body = "y".repeat(10_000);
        assert_eq!(sink.truncate_body(&body), body);
    }
}
