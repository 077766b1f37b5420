//! Durable storage of a single small value in two alternating files
//!
//! Each slot `<name>` owns `<name>.a` and `<name>.b`. Records are appended to the active
//! file as `[ordinal: i64][len: u32][payload]` and forced to disk before the write is
//! acknowledged. After `rotation_threshold` records the next write truncates the other
//! file and continues there. Ordinals grow across both files, so at open the file whose
//! last complete record carries the higher ordinal is the active one. Restarting at 1 in
//! each file would make that comparison meaningless: a freshly rotated file would look
//! older than the one it replaced.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::marshal::{BincodeMarshal, Marshal};

const RECORD_HEADER_SIZE: usize = 12; // 8 bytes ordinal + 4 bytes payload length

/// Last complete record found in one file
#[derive(Debug)]
struct Scan<T> {
    last: Option<(i64, T)>,
    records: u64,
    end: u64,
}

#[derive(Debug)]
pub struct DurableStore<T, M = BincodeMarshal> {
    name: String,
    marshal: M,
    paths: [PathBuf; 2],
    active: usize,
    file: File,
    offset: u64,
    records_in_active: u64,
    ordinal: i64,
    rotation_threshold: u64,
    initial: T,
    state: T,
}

impl<T, M> DurableStore<T, M>
where
    T: Clone,
    M: Marshal<T>,
{
    /// Opens the slot and recovers the last fully written value.
    ///
    /// Any IO error here is fatal: a member must not start with ambiguous persisted state.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        name: &str,
        start_value: T,
        rotation_threshold: u64,
        marshal: M,
    ) -> Result<Self> {
        Self::recover(dir.as_ref(), name, start_value, rotation_threshold, marshal)
            .map_err(|e| Error::recovery(name, e))
    }

    fn recover(
        dir: &Path,
        name: &str,
        start_value: T,
        rotation_threshold: u64,
        marshal: M,
    ) -> Result<Self> {
        if rotation_threshold == 0 {
            return Err(Error::Config("rotation threshold must be positive".into()));
        }
        fs::create_dir_all(dir)?;
        let paths = [
            dir.join(format!("{}.a", name)),
            dir.join(format!("{}.b", name)),
        ];

        let scan_a = scan_file(&paths[0], &marshal)?;
        let scan_b = scan_file(&paths[1], &marshal)?;

        let b_is_newer = match (&scan_a.last, &scan_b.last) {
            (Some((ord_a, _)), Some((ord_b, _))) => ord_b > ord_a,
            (None, Some(_)) => true,
            _ => false,
        };
        let (active, scan) = if b_is_newer { (1, scan_b) } else { (0, scan_a) };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&paths[active])?;
        // drop a torn tail so the next record lands right after the last complete one
        if file.metadata()?.len() > scan.end {
            log::warn!(
                "discarding {} torn bytes at the end of {:?}",
                file.metadata()?.len() - scan.end,
                paths[active]
            );
            file.set_len(scan.end)?;
            file.sync_all()?;
        }

        let (ordinal, state) = match scan.last {
            Some((ordinal, value)) => (ordinal, value),
            None => (0, start_value),
        };
        log::debug!(
            "recovered durable state {} from {:?} at ordinal {}",
            name,
            paths[active],
            ordinal
        );

        Ok(DurableStore {
            name: name.to_string(),
            marshal,
            paths,
            active,
            file,
            offset: scan.end,
            records_in_active: scan.records,
            ordinal,
            rotation_threshold,
            initial: state.clone(),
            state,
        })
    }

    /// Value recovered at open (or the start value for a fresh slot)
    pub fn initial_state(&self) -> T {
        self.initial.clone()
    }

    /// Last value whose write was forced to disk
    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes and forces `value`. On failure nothing advances: the previous value stays
    /// authoritative in memory and on disk.
    pub fn persist(&mut self, value: T) -> Result<()> {
        let result = self.write_record(&value);
        match result {
            Ok(written) => {
                self.offset += written;
                self.records_in_active += 1;
                self.ordinal += 1;
                self.state = value;
                Ok(())
            }
            Err(e) => {
                metrics::PERSIST_FAILURE_COUNTER.inc();
                log::error!("failed to persist durable state {}: {}", self.name, e);
                Err(e)
            }
        }
    }

    fn write_record(&mut self, value: &T) -> Result<u64> {
        if self.records_in_active >= self.rotation_threshold {
            self.switch_file()?;
        }

        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&(self.ordinal + 1).to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        self.marshal.marshal(value, &mut buf)?;
        let payload_len = u32::try_from(buf.len() - RECORD_HEADER_SIZE)
            .map_err(|_| Error::Marshal("payload larger than 4GiB".into()))?;
        buf[8..RECORD_HEADER_SIZE].copy_from_slice(&payload_len.to_le_bytes());

        if let Err(e) = self.write_and_force(&buf) {
            // best effort, recovery ignores the partial record anyway
            let _ = self.file.set_len(self.offset);
            return Err(e.into());
        }
        Ok(buf.len() as u64)
    }

    fn write_and_force(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        self.file.write_all(buf)?;
        #[cfg(feature = "failpoints")]
        fail::fail_point!("durable-store-force", |_| Err(io::Error::new(
            io::ErrorKind::Other,
            "injected force failure"
        )));
        self.file.sync_data()
    }

    fn switch_file(&mut self) -> Result<()> {
        let next = 1 - self.active;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.paths[next])?;
        log::debug!(
            "rotating durable state {} to {:?} after {} records",
            self.name,
            self.paths[next],
            self.records_in_active
        );
        self.file.sync_all()?;
        self.file = file;
        self.active = next;
        self.offset = 0;
        self.records_in_active = 0;
        Ok(())
    }

    /// Forces and closes the active file
    pub fn shutdown(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn active_path(&self) -> &Path {
        &self.paths[self.active]
    }
}

fn scan_file<T, M: Marshal<T>>(path: &Path, marshal: &M) -> Result<Scan<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(scan_records(&bytes, marshal))
}

/// Walks the records of one file, stopping at the first one that is not complete
fn scan_records<T, M: Marshal<T>>(bytes: &[u8], marshal: &M) -> Scan<T> {
    let mut scan = Scan {
        last: None,
        records: 0,
        end: 0,
    };
    let mut pos = 0usize;
    while bytes.len() - pos >= RECORD_HEADER_SIZE {
        let mut ordinal = [0u8; 8];
        ordinal.copy_from_slice(&bytes[pos..pos + 8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[pos + 8..pos + RECORD_HEADER_SIZE]);
        let len = u32::from_le_bytes(len) as usize;

        let start = pos + RECORD_HEADER_SIZE;
        if bytes.len() - start < len {
            break;
        }
        let value = match marshal.unmarshal(&bytes[start..start + len]) {
            Ok(value) => value,
            Err(_) => break,
        };
        scan.last = Some((i64::from_le_bytes(ordinal), value));
        scan.records += 1;
        pos = start + len;
        scan.end = pos as u64;
    }
    scan
}

#[cfg(test)]
pub(crate) fn read_records<T, M: Marshal<T>>(path: &Path, marshal: &M) -> Vec<(i64, T)> {
    let bytes = fs::read(path).unwrap_or_default();
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some((ordinal, value, len)) = scan_records_one(&bytes[pos..], marshal) {
        out.push((ordinal, value));
        pos += len;
    }
    out
}

#[cfg(test)]
fn scan_records_one<T, M: Marshal<T>>(bytes: &[u8], marshal: &M) -> Option<(i64, T, usize)> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let ordinal = i64::from_le_bytes(bytes[..8].try_into().ok()?);
    let len = u32::from_le_bytes(bytes[8..RECORD_HEADER_SIZE].try_into().ok()?) as usize;
    let payload = bytes.get(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len)?;
    let value = marshal.unmarshal(payload).ok()?;
    Some((ordinal, value, RECORD_HEADER_SIZE + len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::marshal::IndexMarshal;
    use rand::Rng;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    const INDEX_RECORD_SIZE: u64 = (RECORD_HEADER_SIZE + 8) as u64;

    fn open_index(dir: &Path, threshold: u64) -> DurableStore<u64, IndexMarshal> {
        DurableStore::open(dir, "last-flushed", 0, threshold, IndexMarshal).unwrap()
    }

    #[test]
    fn test_fresh_slot_returns_start_value() {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path(), "term", 17u64, 10, IndexMarshal).unwrap();
        assert_eq!(store.initial_state(), 17);
        assert_eq!(*store.state(), 17);
    }

    #[test]
    fn test_rotation_scenario() {
        let dir = TempDir::new().unwrap();
        let mut store = open_index(dir.path(), 100);
        for value in 0..200u64 {
            store.persist(value).unwrap();
        }
        store.shutdown().unwrap();

        let file_a = read_records(&dir.path().join("last-flushed.a"), &IndexMarshal);
        let file_b = read_records(&dir.path().join("last-flushed.b"), &IndexMarshal);
        assert_eq!(file_a.len(), 100);
        assert_eq!(file_b.len(), 100);
        assert_eq!(file_a.first(), Some(&(1, 0)));
        assert_eq!(file_a.last(), Some(&(100, 99)));
        assert_eq!(file_b.first(), Some(&(101, 100)));
        assert_eq!(file_b.last(), Some(&(200, 199)));

        let store = open_index(dir.path(), 100);
        assert_eq!(store.initial_state(), 199);
    }

    #[test]
    fn test_switch_happens_on_threshold_plus_one() {
        let dir = TempDir::new().unwrap();
        let mut store = open_index(dir.path(), 3);
        for value in 1..=3u64 {
            store.persist(value).unwrap();
        }
        assert!(store.active_path().ends_with("last-flushed.a"));
        assert!(!dir.path().join("last-flushed.b").exists());

        store.persist(4).unwrap();
        assert!(store.active_path().ends_with("last-flushed.b"));
        let file_a = read_records(&dir.path().join("last-flushed.a"), &IndexMarshal);
        assert_eq!(file_a.len(), 3);

        // switching back truncates the old records of a
        for value in 5..=7u64 {
            store.persist(value).unwrap();
        }
        assert!(store.active_path().ends_with("last-flushed.a"));
        let file_a = read_records(&dir.path().join("last-flushed.a"), &IndexMarshal);
        assert_eq!(file_a, vec![(7, 7)]);
    }

    #[test]
    fn test_reopen_continues_in_active_file() {
        let dir = TempDir::new().unwrap();
        let mut store = open_index(dir.path(), 4);
        for value in 1..=6u64 {
            store.persist(value).unwrap();
        }
        drop(store);

        let mut store = open_index(dir.path(), 4);
        assert_eq!(store.initial_state(), 6);
        store.persist(7).unwrap();
        store.persist(8).unwrap();
        // b now holds 4 records, the next write rotates back to a
        store.persist(9).unwrap();
        drop(store);

        let file_b = read_records(&dir.path().join("last-flushed.b"), &IndexMarshal);
        assert_eq!(file_b.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![5, 6, 7, 8]);
        let store = open_index(dir.path(), 4);
        assert_eq!(store.initial_state(), 9);
    }

    #[test]
    fn test_torn_write_is_discarded() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let dir = TempDir::new().unwrap();
            let count: u64 = rng.gen_range(2..10);
            let mut store = open_index(dir.path(), 100);
            for value in 1..=count {
                store.persist(value * 10).unwrap();
            }
            drop(store);

            // crash in the middle of the last record
            let path = dir.path().join("last-flushed.a");
            let cut = rng.gen_range(1..INDEX_RECORD_SIZE);
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(count * INDEX_RECORD_SIZE - cut).unwrap();
            drop(file);

            let mut store = open_index(dir.path(), 100);
            assert_eq!(store.initial_state(), (count - 1) * 10);

            // the torn tail must not confuse the next recovery
            store.persist(1).unwrap();
            drop(store);
            let store = open_index(dir.path(), 100);
            assert_eq!(store.initial_state(), 1);
        }
    }

    #[test]
    fn test_crash_during_rotation_falls_back_to_old_file() {
        let dir = TempDir::new().unwrap();
        let mut store = open_index(dir.path(), 5);
        for value in 1..=5u64 {
            store.persist(value).unwrap();
        }
        drop(store);

        // new file got truncated and only half a record landed
        fs::write(dir.path().join("last-flushed.b"), [6u8, 0, 0, 0, 0, 0]).unwrap();

        let mut store = open_index(dir.path(), 5);
        assert_eq!(store.initial_state(), 5);
        store.persist(6).unwrap();
        assert!(store.active_path().ends_with("last-flushed.b"));
        drop(store);

        let store = open_index(dir.path(), 5);
        assert_eq!(store.initial_state(), 6);
        let file_b = read_records(&dir.path().join("last-flushed.b"), &IndexMarshal);
        assert_eq!(file_b, vec![(6, 6)]);
    }

    #[test]
    fn test_torn_only_record_of_new_file() {
        let dir = TempDir::new().unwrap();
        let mut store = open_index(dir.path(), 2);
        for value in 1..=3u64 {
            store.persist(value).unwrap();
        }
        drop(store);

        let path = dir.path().join("last-flushed.b");
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(INDEX_RECORD_SIZE - 3).unwrap();
        drop(file);

        let store = open_index(dir.path(), 2);
        assert_eq!(store.initial_state(), 2);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Vote {
        term: u64,
        voted_for: Option<String>,
    }

    #[test]
    fn test_variable_length_payloads() {
        let dir = TempDir::new().unwrap();
        let start = Vote {
            term: 0,
            voted_for: None,
        };
        let mut store =
            DurableStore::open(dir.path(), "vote", start.clone(), 3, BincodeMarshal).unwrap();
        assert_eq!(store.initial_state(), start);
        for term in 1..=8u64 {
            let voted_for = (term % 2 == 0).then(|| format!("member-{}", term));
            store.persist(Vote { term, voted_for }).unwrap();
        }
        drop(store);

        let store: DurableStore<Vote> =
            DurableStore::open(dir.path(), "vote", start, 3, BincodeMarshal).unwrap();
        assert_eq!(
            store.initial_state(),
            Vote {
                term: 8,
                voted_for: Some("member-8".to_string())
            }
        );
    }

    #[test]
    fn test_undecodable_record_is_end_of_file() {
        let dir = TempDir::new().unwrap();
        let mut store = open_index(dir.path(), 10);
        store.persist(5).unwrap();
        drop(store);

        // complete frame but a 3 byte payload the index marshal refuses
        let mut garbage = Vec::new();
        garbage.extend_from_slice(&2i64.to_le_bytes());
        garbage.extend_from_slice(&3u32.to_le_bytes());
        garbage.extend_from_slice(&[1, 2, 3]);
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("last-flushed.a"))
            .unwrap();
        file.write_all(&garbage).unwrap();
        drop(file);

        let store = open_index(dir.path(), 10);
        assert_eq!(store.initial_state(), 5);
    }

    #[test]
    fn test_marshal_failure_does_not_advance() {
        struct Picky;
        impl Marshal<u64> for Picky {
            fn marshal(&self, value: &u64, out: &mut Vec<u8>) -> Result<()> {
                if *value == 13 {
                    return Err(Error::Marshal("unlucky".into()));
                }
                IndexMarshal.marshal(value, out)
            }
            fn unmarshal(&self, bytes: &[u8]) -> Result<u64> {
                IndexMarshal.unmarshal(bytes)
            }
        }

        let dir = TempDir::new().unwrap();
        let mut store = DurableStore::open(dir.path(), "slot", 0u64, 10, Picky).unwrap();
        store.persist(12).unwrap();
        assert!(store.persist(13).is_err());
        assert_eq!(*store.state(), 12);
        store.persist(14).unwrap();
        drop(store);

        let store = DurableStore::open(dir.path(), "slot", 0u64, 10, Picky).unwrap();
        assert_eq!(store.initial_state(), 14);
    }

    #[test]
    fn test_open_fails_on_unreadable_slot() {
        let dir = TempDir::new().unwrap();
        // a directory where the file should be cannot be read
        fs::create_dir_all(dir.path().join("slot.a")).unwrap();
        let result = DurableStore::open(dir.path(), "slot", 0u64, 10, IndexMarshal);
        assert!(matches!(result, Err(Error::Recovery { name, .. }) if name == "slot"));
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn test_force_failure_keeps_previous_value() {
        let scenario = fail::FailScenario::setup();
        let dir = TempDir::new().unwrap();
        let mut store = open_index(dir.path(), 10);
        store.persist(1).unwrap();

        fail::cfg("durable-store-force", "return").unwrap();
        assert!(store.persist(2).is_err());
        assert_eq!(*store.state(), 1);
        fail::remove("durable-store-force");

        store.persist(3).unwrap();
        drop(store);
        let store = open_index(dir.path(), 10);
        assert_eq!(store.initial_state(), 3);
        scenario.teardown();
    }
}
