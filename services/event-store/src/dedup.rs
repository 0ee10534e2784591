//! Consumer delivery-marker store
//!
//! A (consumer_id, event_id) pair exists iff that event was already handed
//! to that consumer. Insertion is atomic first-wins, which is what turns
//! replay into at-most-once delivery per consumer.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

/// Persistent (consumer, event) delivery markers
pub trait ConsumeDedupStore: Send + Sync {
    /// Record the pair if unseen. `true` means this call won the insertion
    /// and the caller should dispatch; `false` means a duplicate.
    fn mark_if_first(&self, consumer_id: &str, event_id: u64) -> Result<bool>;
}

/// Volatile marker store for tests and single-run tooling
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    seen: Mutex<FxHashMap<String, FxHashSet<u64>>>,
}

impl MemoryDedupStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsumeDedupStore for MemoryDedupStore {
    fn mark_if_first(&self, consumer_id: &str, event_id: u64) -> Result<bool> {
        let mut seen = self.seen.lock();
        Ok(seen.entry(consumer_id.to_string()).or_default().insert(event_id))
    }
}

/// File-backed marker store: one `consumer_id\tevent_id` line per marker,
/// loaded at open, appended and flushed on every first-wins insertion.
pub struct FileDedupStore {
    inner: Mutex<FileDedupInner>,
}

struct FileDedupInner {
    seen: FxHashMap<String, FxHashSet<u64>>,
    writer: BufWriter<File>,
}

impl FileDedupStore {
    /// Open (or create) the marker file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating marker dir {}", parent.display()))?;
        }
        let mut seen: FxHashMap<String, FxHashSet<u64>> = FxHashMap::default();
        let mut loaded = 0u64;
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                match parse_marker(&line) {
                    Some((consumer, event_id)) => {
                        seen.entry(consumer.to_string()).or_default().insert(event_id);
                        loaded += 1;
                    }
                    // A torn tail from a crash mid-append is expected.
                    None if !line.trim().is_empty() => {
                        warn!("skipping malformed marker line: {line:?}");
                    }
                    None => {}
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), loaded, "opened consume-marker store");
        Ok(Self {
            inner: Mutex::new(FileDedupInner {
                seen,
                writer: BufWriter::new(file),
            }),
        })
    }
}

impl ConsumeDedupStore for FileDedupStore {
    fn mark_if_first(&self, consumer_id: &str, event_id: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let first = inner
            .seen
            .entry(consumer_id.to_string())
            .or_default()
            .insert(event_id);
        if first {
            writeln!(inner.writer, "{consumer_id}\t{event_id}")?;
            inner.writer.flush()?;
        }
        Ok(first)
    }
}

fn parse_marker(line: &str) -> Option<(&str, u64)> {
    let (consumer, id) = line.split_once('\t')?;
    if consumer.is_empty() {
        return None;
    }
    Some((consumer, id.parse().ok()?))
}
