//! Structured audit logging.
//!
//! One JSON object per request, written as a single line to stdout and,
//! optionally, appended to a file. Downstream aggregators ingest the lines
//! directly. The record accumulates through the pipeline and is emitted
//! exactly once per request; [`AuditHandle`] enforces that even when a
//! streaming client disconnects mid-response.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

use super::pipeline::StageDecision;
use super::response::ResponseScan;

/// Final disposition of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allowed,
    Denied,
    UpstreamError,
    ClientCancelled,
}

/// One pipeline stage's contribution to the record.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: &'static str,
    pub allow: bool,
    pub reason_code: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl StageRecord {
    pub fn from_decision(name: &'static str, decision: &StageDecision) -> Self {
        Self {
            name,
            allow: decision.allow,
            reason_code: decision.reason,
            detail: decision.detail.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub timestamp_iso: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub model: String,
    pub provider: String,
    pub stream: bool,
    pub stages: Vec<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_scan: Option<ResponseScan>,
    pub outcome: Outcome,
}

impl AuditRecord {
    pub fn new(request_id: &str, model: &str, stream: bool) -> Self {
        Self {
            request_id: request_id.to_string(),
            timestamp_iso: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            client_id: None,
            model: model.to_string(),
            provider: String::new(),
            stream,
            stages: Vec::new(),
            upstream_latency_ms: None,
            response_scan: None,
            outcome: Outcome::Denied,
        }
    }
}

/// Short correlation id attached to every request and response.
pub fn new_request_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// Serialized JSON-line sink. Writes go to stdout and optionally a file;
/// both are guarded by the same lock so lines never interleave.
pub struct AuditSink {
    file: Option<Mutex<File>>,
}

impl AuditSink {
    pub fn new(file_path: Option<&Path>) -> Result<Self> {
        let file = file_path
            .map(|path| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open audit log: {}", path.display()))
                    .map(Mutex::new)
            })
            .transpose()?;
        Ok(Self { file })
    }

    pub fn emit(&self, record: &AuditRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit record");
                return;
            }
        };

        {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let _ = writeln!(out, "{line}");
        }

        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            if let Err(e) = writeln!(file, "{line}") {
                warn!(error = %e, "failed to write audit log file");
            }
        }
    }
}

/// Owns the record for one request's lifetime and guarantees exactly one
/// emission. Dropping the handle without finishing it means the client went
/// away mid-stream; the record is emitted with `client_cancelled`.
pub struct AuditHandle {
    record: Option<AuditRecord>,
    sink: Arc<AuditSink>,
}

impl AuditHandle {
    pub fn new(sink: Arc<AuditSink>, record: AuditRecord) -> Self {
        Self {
            record: Some(record),
            sink,
        }
    }

    pub fn record_mut(&mut self) -> &mut AuditRecord {
        self.record.as_mut().expect("record present until finish")
    }

    /// Emit the record with the given outcome. Consumes the handle.
    pub fn finish(mut self, outcome: Outcome) {
        if let Some(mut record) = self.record.take() {
            record.outcome = outcome;
            self.sink.emit(&record);
        }
    }
}

impl Drop for AuditHandle {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.outcome = Outcome::ClientCancelled;
            self.sink.emit(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> AuditRecord {
        let mut record = AuditRecord::new("abc123def456", "gpt-4o-mini", false);
        record.client_id = Some("client-a".to_string());
        record.provider = "openai".to_string();
        record.stages.push(StageRecord {
            name: "auth",
            allow: true,
            reason_code: "pass",
            detail: Value::Null,
        });
        record.stages.push(StageRecord {
            name: "injection",
            allow: false,
            reason_code: "injection_blocked",
            detail: json!({"score": 1.0}),
        });
        record
    }

    #[test]
    fn record_serializes_one_line() {
        let mut record = sample_record();
        record.outcome = Outcome::Denied;
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["request_id"], "abc123def456");
        assert_eq!(value["outcome"], "denied");
        assert_eq!(value["stages"][0]["name"], "auth");
        assert_eq!(value["stages"][1]["reason_code"], "injection_blocked");
        // Null details are omitted entirely
        assert!(value["stages"][0].get("detail").is_none());
        assert_eq!(value["stages"][1]["detail"]["score"], 1.0);
    }

    #[test]
    fn request_ids_are_short_and_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sink_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = AuditSink::new(Some(&path)).unwrap();

        let mut record = sample_record();
        record.outcome = Outcome::Allowed;
        sink.emit(&record);
        sink.emit(&record);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["outcome"], "allowed");
    }

    #[test]
    fn dropped_handle_emits_client_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(AuditSink::new(Some(&path)).unwrap());

        let handle = AuditHandle::new(sink.clone(), sample_record());
        drop(handle);

        let content = std::fs::read_to_string(&path).unwrap();
        let value: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(value["outcome"], "client_cancelled");
    }

    #[test]
    fn finished_handle_emits_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(AuditSink::new(Some(&path)).unwrap());

        let handle = AuditHandle::new(sink.clone(), sample_record());
        handle.finish(Outcome::Allowed);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        let value: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(value["outcome"], "allowed");
    }
}
