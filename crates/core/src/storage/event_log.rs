use crate::events::{Event, EventLog};
use crate::types::WorkflowId;
use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Buffered events per workflow before they are written out; the end of an
/// execution also writes them
const FLUSH_THRESHOLD: usize = 64;

/// Event log stored as one gzip-compressed JSON Lines file per workflow
pub struct JsonlEventLog {
    base_path: PathBuf,
    buffers: Mutex<HashMap<WorkflowId, Vec<Event>>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Format: <base>/<workflow_id>.jsonl.gz
    fn event_log_path(&self, workflow_id: &WorkflowId) -> PathBuf {
        self.base_path.join(format!("{}.jsonl.gz", workflow_id))
    }

    /// Write buffered events of one workflow to disk.
    ///
    /// Each flush appends one gzip member to the workflow's file, so earlier
    /// members are never read back or rewritten. Takes the buffer map so the
    /// caller keeps the lock until the append is done.
    async fn flush(
        &self,
        buffers: &mut HashMap<WorkflowId, Vec<Event>>,
        workflow_id: &WorkflowId,
    ) -> Result<()> {
        let pending = match buffers.remove(workflow_id) {
            Some(events) if !events.is_empty() => events,
            _ => return Ok(()),
        };

        let compressed = write_jsonl_gz(&pending)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.event_log_path(workflow_id))
            .await
            .context("Failed to open event log file")?;
        file.write_all(&compressed)
            .await
            .context("Failed to append to event log file")?;
        file.flush().await.context("Failed to flush event log file")?;
        Ok(())
    }
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(MultiGzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }
    Ok(events)
}

fn write_jsonl_gz(events: &[Event]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }
    encoder.finish().context("Failed to finish compression")
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let workflow_id = event.workflow_id.clone();
        let ends_execution = event.event_type.ends_execution();
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers.entry(workflow_id.clone()).or_default();
        buffer.push(event);

        if ends_execution || buffer.len() >= FLUSH_THRESHOLD {
            self.flush(&mut buffers, &workflow_id).await?;
        }
        Ok(())
    }

    async fn get_workflow_events(&self, workflow_id: &WorkflowId) -> Result<Vec<Event>> {
        let mut buffers = self.buffers.lock().await;
        self.flush(&mut buffers, workflow_id).await?;

        let path = self.event_log_path(workflow_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut events = read_jsonl_gz(&path)?;
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}
