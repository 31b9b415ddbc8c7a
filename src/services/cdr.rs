//! Call detail records
//!
//! One JSON record per line in `cdr/cdr-<yyyy-mm-dd>.jsonl`. Appends are
//! best-effort through a bounded queue: a wedged disk drops records and
//! bumps a counter, it never blocks a call.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::Result;

/// How the call ended, from the caller's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    #[serde(rename = "answered")]
    Answered,
    #[serde(rename = "busy")]
    Busy,
    #[serde(rename = "no-answer")]
    NoAnswer,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Answered => "answered",
            Self::Busy => "busy",
            Self::NoAnswer => "no-answer",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Media quality summary for one direction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualitySummary {
    pub packets: u64,
    pub lost: u32,
    pub jitter_ms: f64,
    pub mos: f64,
}

/// Per-call record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDetailRecord {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub caller_display: Option<String>,
    pub disposition: Disposition,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub hangup_cause: String,
    pub codec: Option<String>,
    pub quality_a: QualitySummary,
    pub quality_b: QualitySummary,
    pub recording_path: Option<String>,
}

/// Where finished records go
#[async_trait]
pub trait CdrSink: Send + Sync {
    async fn append(&self, record: &CallDetailRecord) -> Result<()>;
}

/// Daily-rotated jsonl files
pub struct FileCdrSink {
    directory: PathBuf,
}

impl FileCdrSink {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn file_for(&self, when: DateTime<Utc>) -> PathBuf {
        self.directory
            .join(format!("cdr-{}.jsonl", when.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl CdrSink for FileCdrSink {
    async fn append(&self, record: &CallDetailRecord) -> Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.file_for(record.ended_at);
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// In-memory sink for tests and the call observer
#[derive(Default)]
pub struct MemoryCdrSink {
    records: std::sync::Mutex<Vec<CallDetailRecord>>,
}

impl MemoryCdrSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CallDetailRecord> {
        self.records.lock().expect("cdr sink lock").clone()
    }
}

#[async_trait]
impl CdrSink for MemoryCdrSink {
    async fn append(&self, record: &CallDetailRecord) -> Result<()> {
        self.records
            .lock()
            .expect("cdr sink lock")
            .push(record.clone());
        Ok(())
    }
}

/// Queue in front of a sink so callers never wait on the disk
pub struct CdrService {
    tx: mpsc::Sender<CallDetailRecord>,
    dropped: Arc<AtomicU64>,
}

impl CdrService {
    pub fn start(sink: Arc<dyn CdrSink>, queue_depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<CallDetailRecord>(queue_depth.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = sink.append(&record).await {
                    error!("CDR write failed for {}: {}", record.call_id, e);
                }
            }
            info!("CDR writer stopped");
        });

        Self { tx, dropped }
    }

    /// Fire-and-forget append
    pub fn submit(&self, record: CallDetailRecord) {
        if self.tx.try_send(record).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("CDR queue full, record dropped (total {})", dropped);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Aggregate view used by the status surface
    pub fn summarize(records: &[CallDetailRecord]) -> HashMap<String, u64> {
        let mut by_disposition: HashMap<String, u64> = HashMap::new();
        for record in records {
            *by_disposition
                .entry(record.disposition.to_string())
                .or_insert(0) += 1;
        }
        by_disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(call_id: &str, disposition: Disposition) -> CallDetailRecord {
        CallDetailRecord {
            call_id: call_id.to_string(),
            caller: "1001".to_string(),
            callee: "1002".to_string(),
            caller_display: Some("Alice".to_string()),
            disposition,
            started_at: Utc::now(),
            answered_at: Some(Utc::now()),
            ended_at: Utc::now(),
            duration_secs: 42,
            hangup_cause: "BYE".to_string(),
            codec: Some("PCMU".to_string()),
            quality_a: QualitySummary {
                packets: 2100,
                lost: 3,
                jitter_ms: 4.2,
                mos: 4.3,
            },
            quality_b: QualitySummary::default(),
            recording_path: None,
        }
    }

    #[tokio::test]
    async fn test_file_sink_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileCdrSink::new(dir.path());

        sink.append(&record("call-1", Disposition::Answered)).await.unwrap();
        sink.append(&record("call-2", Disposition::Busy)).await.unwrap();

        let path = sink.file_for(Utc::now());
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: CallDetailRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.call_id, "call-1");
        assert_eq!(parsed.disposition, Disposition::Answered);
        assert_eq!(parsed.duration_secs, 42);
    }

    #[tokio::test]
    async fn test_service_queues_to_sink() {
        let sink = Arc::new(MemoryCdrSink::new());
        let service = CdrService::start(Arc::clone(&sink) as Arc<dyn CdrSink>, 16);

        service.submit(record("call-1", Disposition::Answered));
        service.submit(record("call-2", Disposition::NoAnswer));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].disposition, Disposition::NoAnswer);
        assert_eq!(service.dropped(), 0);
    }

    #[test]
    fn test_summarize_by_disposition() {
        let records = vec![
            record("a", Disposition::Answered),
            record("b", Disposition::Answered),
            record("c", Disposition::Cancelled),
        ];
        let summary = CdrService::summarize(&records);
        assert_eq!(summary.get("answered"), Some(&2));
        assert_eq!(summary.get("cancelled"), Some(&1));
    }
}
