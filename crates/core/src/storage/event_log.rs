use crate::events::{Event, EventLog, EventType};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use walkdir::WalkDir;

/// Buffered events for one run beyond which the buffer is written out
const FLUSH_THRESHOLD: usize = 100;

/// Event log implementation using gzip-compressed JSONL (JSON Lines) files
///
/// Events are buffered per run and written when the run finishes, when the
/// buffer grows past a threshold, or when the run's events are read.
pub struct JsonlEventLog {
    base_path: PathBuf,
    buffers: Mutex<HashMap<RunId, Vec<Event>>>,
    /// Held across every read-modify-write of the log files
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffers: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        })
    }

    /// Get the path to the event log file for a specific run
    /// Format: events/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    /// Flush buffered events of one run to disk
    pub async fn flush(&self, run_id: &RunId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.flush_locked(run_id).await
    }

    /// Caller must hold `write_lock`
    async fn flush_locked(&self, run_id: &RunId) -> Result<()> {
        let events = match self.buffers.lock().await.remove(run_id) {
            Some(events) if !events.is_empty() => events,
            _ => return Ok(()),
        };

        // Group events by day so each lands in its own file
        let mut events_by_day: HashMap<PathBuf, Vec<Event>> = HashMap::new();
        for event in events {
            let path = self.event_log_path(run_id, &event.timestamp);
            events_by_day.entry(path).or_default().push(event);
        }

        for (path, events) in events_by_day {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    /// All event log files written for a run
    fn get_log_files(&self, run_id: &RunId) -> Vec<PathBuf> {
        let events_dir = self.base_path.join("events");
        let filename = format!("{}.jsonl.gz", run_id);

        WalkDir::new(events_dir)
            .min_depth(4)
            .max_depth(4)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == filename.as_str())
            .map(|entry| entry.into_path())
            .collect()
    }
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

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

async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log file")?;

    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let run_id = event.run_id;
        let run_finished = matches!(
            event.event_type,
            EventType::RunCompleted { .. } | EventType::RunFailed { .. }
        );

        let buffered = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(run_id).or_default();
            buffer.push(event);
            buffer.len()
        };

        if run_finished || buffered > FLUSH_THRESHOLD {
            self.flush(&run_id).await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        let _guard = self.write_lock.lock().await;
        self.flush_locked(&run_id).await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&run_id) {
            all_events.extend(read_jsonl_gz(&file)?);
        }

        all_events.sort_by_key(|e| e.timestamp);
        Ok(all_events)
    }
}
