//! The replicated log as seen by the applier
//!
//! Transport appends entries, the election algorithm advances the commit index, the
//! applier reads entries back by index when they are not in the in-flight cache.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::entry::LogEntry;
use crate::error::{Error, Result};
use crate::storage::durable::DurableStore;
use crate::storage::marshal::IndexMarshal;
use crate::storage::segment::Segment;

pub const DEFAULT_ENTRIES_PER_SEGMENT: u64 = 1024;
const COMMIT_ROTATION_THRESHOLD: u64 = 1000;

pub trait ReplicatedLog: Send + Sync {
    /// Appends the entry at `append_index() + 1` and returns its index
    fn append(&self, entry: LogEntry) -> Result<u64>;

    fn entry_at(&self, index: u64) -> Result<LogEntry>;

    /// Highest appended index, 0 for an empty log
    fn append_index(&self) -> u64;

    fn committed_index(&self) -> u64;

    /// Advances the commit index. Lower or equal values are ignored.
    fn commit(&self, index: u64) -> Result<()>;

    /// Drops `from` and every later entry. Committed entries cannot be truncated.
    fn truncate(&self, from: u64) -> Result<()>;
}

fn check_append(append_index: u64, entry: &LogEntry) -> Result<()> {
    if entry.index != append_index + 1 {
        return Err(Error::NonContiguousAppend {
            expected: append_index + 1,
            actual: entry.index,
        });
    }
    Ok(())
}

fn check_truncate(committed: u64, from: u64) -> Result<()> {
    if from <= committed {
        return Err(Error::ConsensusViolation(format!(
            "cannot truncate from {} at or below commit index {}",
            from, committed
        )));
    }
    Ok(())
}

/// In-memory log, no persistence across restarts
#[derive(Debug, Default)]
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
    reads: AtomicU64,
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    entries: Vec<LogEntry>,
    committed: u64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `entry_at` calls served so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ReplicatedLog for MemoryLog {
    fn append(&self, entry: LogEntry) -> Result<u64> {
        let mut inner = self.lock();
        check_append(inner.entries.len() as u64, &entry)?;
        let index = entry.index;
        inner.entries.push(entry);
        Ok(index)
    }

    fn entry_at(&self, index: u64) -> Result<LogEntry> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let inner = self.lock();
        index
            .checked_sub(1)
            .and_then(|i| inner.entries.get(i as usize))
            .cloned()
            .ok_or(Error::EntryNotFound(index))
    }

    fn append_index(&self) -> u64 {
        self.lock().entries.len() as u64
    }

    fn committed_index(&self) -> u64 {
        self.lock().committed
    }

    fn commit(&self, index: u64) -> Result<()> {
        let mut inner = self.lock();
        if index > inner.entries.len() as u64 {
            return Err(Error::EntryNotFound(index));
        }
        inner.committed = inner.committed.max(index);
        Ok(())
    }

    fn truncate(&self, from: u64) -> Result<()> {
        let mut inner = self.lock();
        check_truncate(inner.committed, from)?;
        inner.entries.truncate(from.saturating_sub(1) as usize);
        Ok(())
    }
}

/// Segmented on-disk log
///
/// Entries are bincode encoded into `segment_<start>.log` files, each holding up to
/// `entries_per_segment` consecutive indices. The commit index lives in a durable slot
/// next to the segments.
#[derive(Debug)]
pub struct FileLog {
    inner: Mutex<FileLogInner>,
}

#[derive(Debug)]
struct FileLogInner {
    base_path: PathBuf,
    segments: BTreeMap<u64, Segment>,
    entries_per_segment: u64,
    append_index: u64,
    commit: DurableStore<u64, IndexMarshal>,
}

fn parse_segment_start(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("segment_")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

impl FileLog {
    pub fn open<P: AsRef<Path>>(base_path: P, entries_per_segment: u64) -> Result<Self> {
        if entries_per_segment == 0 {
            return Err(Error::Config("entries per segment must be positive".into()));
        }
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        // Find all segment files
        let mut segment_files: Vec<(u64, PathBuf)> = fs::read_dir(&base_path)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if !path.is_file() {
                    return None;
                }
                parse_segment_start(&path).map(|start| (start, path))
            })
            .collect();
        segment_files.sort_by_key(|(start, _)| *start);

        // Load each segment, they must chain without gaps
        let mut segments = BTreeMap::new();
        let mut append_index = 0u64;
        for (start_index, path) in segment_files {
            if start_index != append_index + 1 {
                return Err(Error::recovery(
                    "log",
                    Error::Config(format!(
                        "segment {:?} starts at {}, log ends at {}",
                        path, start_index, append_index
                    )),
                ));
            }
            let segment = Segment::new(&path, start_index)?;
            append_index = segment.get_end_index();
            segments.insert(start_index, segment);
        }

        let commit = DurableStore::open(
            &base_path,
            "commit-index",
            0,
            COMMIT_ROTATION_THRESHOLD,
            IndexMarshal,
        )?;
        log::info!(
            "opened log at {:?}: {} segments, append index {}, commit index {}",
            base_path,
            segments.len(),
            append_index,
            commit.state()
        );

        Ok(FileLog {
            inner: Mutex::new(FileLogInner {
                base_path,
                segments,
                entries_per_segment,
                append_index,
                commit,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FileLogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn shutdown(self) -> Result<()> {
        let inner = self.inner.into_inner().unwrap_or_else(|e| e.into_inner());
        inner.commit.shutdown()
    }
}

impl FileLogInner {
    fn get_segment_path(&self, start_index: u64) -> PathBuf {
        self.base_path.join(format!("segment_{}.log", start_index))
    }

    fn segment_start(&self, index: u64) -> u64 {
        ((index - 1) / self.entries_per_segment) * self.entries_per_segment + 1
    }

    fn get_or_create_segment(&mut self, start_index: u64) -> Result<&mut Segment> {
        if !self.segments.contains_key(&start_index) {
            let path = self.get_segment_path(start_index);
            let segment = Segment::new(path, start_index)?;
            self.segments.insert(start_index, segment);
        }
        self.segments
            .get_mut(&start_index)
            .ok_or(Error::EntryNotFound(start_index))
    }

    fn committed(&self) -> u64 {
        (*self.commit.state()).min(self.append_index)
    }
}

impl ReplicatedLog for FileLog {
    fn append(&self, entry: LogEntry) -> Result<u64> {
        let mut inner = self.lock();
        check_append(inner.append_index, &entry)?;
        let index = entry.index;
        let bytes = bincode::serialize(&entry)?;

        let start = inner.segment_start(index);
        inner.get_or_create_segment(start)?.append(&[bytes])?;
        inner.append_index = index;
        Ok(index)
    }

    fn entry_at(&self, index: u64) -> Result<LogEntry> {
        let mut inner = self.lock();
        if index == 0 || index > inner.append_index {
            return Err(Error::EntryNotFound(index));
        }
        let segment = inner
            .segments
            .range_mut(..=index)
            .next_back()
            .map(|(_, segment)| segment)
            .ok_or(Error::EntryNotFound(index))?;
        let bytes = segment.read_entry(index)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn append_index(&self) -> u64 {
        self.lock().append_index
    }

    fn committed_index(&self) -> u64 {
        self.lock().committed()
    }

    fn commit(&self, index: u64) -> Result<()> {
        let mut inner = self.lock();
        if index > inner.append_index {
            return Err(Error::EntryNotFound(index));
        }
        if index <= *inner.commit.state() {
            return Ok(());
        }
        inner.commit.persist(index)
    }

    fn truncate(&self, from: u64) -> Result<()> {
        let mut inner = self.lock();
        check_truncate(inner.committed(), from)?;
        if from > inner.append_index {
            return Ok(());
        }

        let doomed: Vec<u64> = inner.segments.range(from..).map(|(s, _)| *s).collect();
        for start in doomed {
            if let Some(segment) = inner.segments.remove(&start) {
                segment.remove()?;
            }
        }
        if let Some((_, segment)) = inner.segments.range_mut(..from).next_back() {
            if segment.get_end_index() >= from {
                segment.truncate_from(from)?;
            }
        }
        inner.append_index = from - 1;
        log::info!("truncated log from index {}", from);
        Ok(())
    }
}
