//! Day-partitioned append-only event log
//!
//! One segment file per calendar day (keyed by the envelope's produced-at
//! date), newline-delimited JSON. A single mutex serializes rotation and
//! append; readers open their own handles and never touch that lock.

use crate::events::{BusEvent, EventIdGen, FileCursor, Topic};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Segment file prefix; names sort lexically in day order
const SEGMENT_PREFIX: &str = "events-";
/// Segment file extension
const SEGMENT_EXT: &str = "log";

/// Append-only event log over day segments
pub struct EventLog {
    dir: PathBuf,
    flush_interval: Duration,
    ids: EventIdGen,
    writer: Mutex<Option<DaySegment>>,
}

struct DaySegment {
    day: NaiveDate,
    name: String,
    file: BufWriter<File>,
    offset: u64,
}

impl EventLog {
    /// Open (or create) a log under `dir`. A zero `flush_interval` flushes
    /// on every append; otherwise appends are buffered and a caller-spawned
    /// flush task bounds the data-loss window.
    pub fn open(dir: &Path, flush_interval: Duration) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating event log dir {}", dir.display()))?;
        }
        info!(
            dir = %dir.display(),
            flush_interval_ms = flush_interval.as_millis() as u64,
            "opened event log"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            flush_interval,
            ids: EventIdGen::new(),
            writer: Mutex::new(None),
        })
    }

    /// Append an envelope, assigning its id when unset, and return the
    /// cursor of the written record (segment + pre-write byte offset).
    pub fn append(&self, event: &mut BusEvent) -> Result<FileCursor> {
        if event.event_id == 0 {
            event.event_id = self.ids.next_id();
        }
        let day = event.produced_at.date_naive();
        let mut line = serde_json::to_vec(event).context("serializing event")?;
        line.push(b'\n');

        let mut guard = self.writer.lock();
        self.rotate_if_needed(&mut guard, day)?;
        let Some(segment) = guard.as_mut() else {
            return Err(anyhow::anyhow!("failed to open day segment"));
        };
        let cursor = FileCursor {
            file: segment.name.clone(),
            offset: segment.offset,
        };
        segment.file.write_all(&line)?;
        segment.offset += line.len() as u64;
        if self.flush_interval.is_zero() {
            segment.file.flush()?;
        }
        Ok(cursor)
    }

    /// Flush buffered appends to disk
    pub fn flush(&self) -> Result<()> {
        if let Some(segment) = self.writer.lock().as_mut() {
            segment.file.flush()?;
        }
        Ok(())
    }

    /// Spawn the interval flush task for a buffered log. Returns `None`
    /// when the log already flushes every append.
    #[must_use]
    pub fn start_flush_task(self: &std::sync::Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.flush_interval.is_zero() {
            return None;
        }
        let log = std::sync::Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(log.flush_interval);
            loop {
                interval.tick().await;
                if let Err(e) = log.flush() {
                    warn!("event log flush failed: {e:#}");
                }
            }
        }))
    }

    /// Scan the log in append order with `filter` applied. Readers use
    /// independent handles; appends proceed concurrently.
    pub fn iterate(&self, filter: EventFilter) -> Result<EventLogIter> {
        let mut segments = self.list_segments()?;
        if let Some(cursor) = &filter.cursor {
            segments.retain(|path| segment_name(path).is_none_or(|name| name >= cursor.file));
        }
        Ok(EventLogIter {
            segments,
            next_index: 0,
            reader: None,
            filter,
        })
    }

    /// Segment count and total byte/record counts, for observability
    pub fn stats(&self) -> Result<EventLogStats> {
        let segments = self.list_segments()?;
        let mut total_bytes = 0;
        let mut total_events = 0u64;
        for path in &segments {
            total_bytes += fs::metadata(path)?.len();
            let reader = BufReader::new(File::open(path)?);
            total_events += reader.lines().map_while(Result::ok).count() as u64;
        }
        Ok(EventLogStats {
            segment_count: segments.len() as u64,
            total_bytes,
            total_events,
        })
    }

    fn rotate_if_needed(&self, guard: &mut Option<DaySegment>, day: NaiveDate) -> Result<()> {
        let rotate = guard.as_ref().is_none_or(|s| s.day != day);
        if rotate {
            if let Some(old) = guard.take() {
                let mut file = old.file;
                file.flush()?;
                debug!(segment = %old.name, "closed day segment");
            }
            let name = format!("{SEGMENT_PREFIX}{}.{SEGMENT_EXT}", day.format("%Y%m%d"));
            let path = self.dir.join(&name);
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;
            let mut offset = file.metadata()?.len();
            // A crash mid-append can leave an unterminated tail; close the
            // line so new records keep their own framing. Readers skip the
            // malformed remnant.
            if offset > 0 {
                use std::io::{Read, Seek, SeekFrom};
                file.seek(SeekFrom::End(-1))?;
                let mut last = [0u8; 1];
                file.read_exact(&mut last)?;
                if last[0] != b'\n' {
                    file.write_all(b"\n")?;
                    offset += 1;
                    warn!(segment = %name, "repaired unterminated tail");
                }
            }
            debug!(segment = %name, offset, "opened day segment");
            *guard = Some(DaySegment {
                day,
                name,
                file: BufWriter::new(file),
                offset,
            });
        }
        Ok(())
    }

    fn list_segments(&self) -> Result<Vec<PathBuf>> {
        let mut segments: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| segment_name(path).is_some())
            .collect();
        segments.sort();
        Ok(segments)
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if let Some(segment) = self.writer.lock().as_mut() {
            if let Err(e) = segment.file.flush() {
                warn!("failed to flush event log on drop: {e}");
            }
        }
    }
}

fn segment_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    (name.starts_with(SEGMENT_PREFIX) && name.ends_with(&format!(".{SEGMENT_EXT}")))
        .then(|| name.to_string())
}

/// Log statistics
#[derive(Debug)]
pub struct EventLogStats {
    /// Number of day segments on disk
    pub segment_count: u64,
    /// Total bytes across segments
    pub total_bytes: u64,
    /// Total well-formed records across segments
    pub total_events: u64,
}

/// Record filter for [`EventLog::iterate`]
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Topics to keep; empty keeps all
    pub topics: Vec<Topic>,
    /// Sources to keep; empty keeps all
    pub sources: Vec<String>,
    /// Inclusive lower bound on occurred-at
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on occurred-at
    pub end: Option<DateTime<Utc>>,
    /// Resume position: records at or before this offset in the matching
    /// file are skipped
    pub cursor: Option<FileCursor>,
}

impl EventFilter {
    /// Whether an envelope passes the topic/source/time filters
    #[must_use]
    pub fn matches(&self, event: &BusEvent) -> bool {
        if !self.topics.is_empty() && !self.topics.contains(&event.topic) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.iter().any(|s| s == &event.source) {
            return false;
        }
        if self.start.is_some_and(|start| event.occurred_at < start) {
            return false;
        }
        if self.end.is_some_and(|end| event.occurred_at > end) {
            return false;
        }
        true
    }
}

/// Streaming reader over the log's segments in lexical (= chronological)
/// order. Malformed lines — torn writes from a crash mid-append — are
/// skipped, not fatal.
pub struct EventLogIter {
    segments: Vec<PathBuf>,
    next_index: usize,
    reader: Option<SegmentReader>,
    filter: EventFilter,
}

struct SegmentReader {
    name: String,
    reader: BufReader<File>,
    offset: u64,
}

impl EventLogIter {
    /// Next matching envelope with the cursor of the record it was read
    /// from, or `None` at end of log.
    pub fn next_event(&mut self) -> Result<Option<(BusEvent, FileCursor)>> {
        let mut line = String::new();
        loop {
            if self.reader.is_none() {
                let Some(path) = self.segments.get(self.next_index) else {
                    return Ok(None);
                };
                let name = segment_name(path).unwrap_or_default();
                self.next_index += 1;
                self.reader = Some(SegmentReader {
                    name,
                    reader: BufReader::new(File::open(path)?),
                    offset: 0,
                });
            }
            let Some(segment) = self.reader.as_mut() else {
                continue;
            };
            line.clear();
            let read = segment.reader.read_line(&mut line)?;
            if read == 0 {
                self.reader = None;
                continue;
            }
            let record_offset = segment.offset;
            segment.offset += read as u64;

            if let Some(cursor) = &self.filter.cursor {
                if segment.name == cursor.file && record_offset <= cursor.offset {
                    continue;
                }
            }

            let event: BusEvent = match serde_json::from_str(line.trim_end()) {
                Ok(event) => event,
                Err(e) => {
                    warn!(segment = %segment.name, offset = record_offset, "skipping malformed record: {e}");
                    continue;
                }
            };
            if !self.filter.matches(&event) {
                continue;
            }
            return Ok(Some((
                event,
                FileCursor {
                    file: segment.name.clone(),
                    offset: record_offset,
                },
            )));
        }
    }
}
