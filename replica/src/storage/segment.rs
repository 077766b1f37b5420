use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 8; // 8 bytes for start_index
const ENTRY_HEADER_SIZE: u64 = 8; // 8 bytes for entry size

/// One file of the durable log holding consecutive entries from `start_index`
#[derive(Debug)]
pub struct Segment {
    file: File,
    start_index: u64,
    end_index: u64,
    path: PathBuf,
    entry_positions: BTreeMap<u64, u64>, // index -> file position
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    start_index: u64,
}

impl Segment {
    pub fn new<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            start_index,
            end_index: start_index.saturating_sub(1),
            path: path.as_ref().to_path_buf(),
            entry_positions: BTreeMap::new(),
        };

        // Initialize header if file is empty
        if segment.file.metadata()?.len() < HEADER_SIZE {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_entry_positions()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            start_index: self.start_index,
        };

        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if header.start_index != self.start_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "segment {:?} starts at {}, expected {}",
                    self.path, header.start_index, self.start_index
                ),
            ));
        }
        Ok(())
    }

    fn write_entry_header(&mut self, size: u64) -> io::Result<()> {
        let size_bytes = size.to_le_bytes();
        self.file.write_all(&size_bytes)?;
        Ok(())
    }

    fn read_entry_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; 8];
        self.file.read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    /// Rebuilds the position table, cutting a torn trailing entry
    fn rebuild_entry_positions(&mut self) -> io::Result<()> {
        self.entry_positions.clear();
        let len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos + ENTRY_HEADER_SIZE <= len {
            self.file.seek(SeekFrom::Start(pos))?;
            let entry_size = self.read_entry_header()?;
            if pos + ENTRY_HEADER_SIZE + entry_size > len {
                break;
            }
            let entry_index = self.start_index + (self.entry_positions.len() as u64);
            self.entry_positions.insert(entry_index, pos);
            pos += ENTRY_HEADER_SIZE + entry_size;
        }

        if pos < len {
            log::warn!(
                "segment {:?}: dropping {} bytes of a torn entry",
                self.path,
                len - pos
            );
            self.file.set_len(pos)?;
        }
        self.end_index = (self.start_index + self.entry_positions.len() as u64).saturating_sub(1);
        Ok(())
    }

    /// Appends entries and forces them to disk. On failure the file is cut back to its
    /// previous length, a later append must not land behind a partial entry.
    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        let len = self.file.seek(SeekFrom::End(0))?;
        let end_index = self.end_index;
        let kept = self.start_index + self.entry_positions.len() as u64;

        if let Err(e) = self.write_entries(len, entries) {
            let _ = self.entry_positions.split_off(&kept);
            self.end_index = end_index;
            if let Err(cut) = self.file.set_len(len) {
                log::error!(
                    "segment {:?}: failed to drop a partial append: {}",
                    self.path,
                    cut
                );
            }
            return Err(e);
        }
        Ok(())
    }

    fn write_entries(&mut self, mut pos: u64, entries: &[Vec<u8>]) -> io::Result<()> {
        for entry in entries {
            let entry_size = entry.len() as u64;
            self.write_entry_header(entry_size)?;
            #[cfg(feature = "failpoints")]
            fail::fail_point!("segment-append-body", |_| Err(io::Error::new(
                io::ErrorKind::Other,
                "injected append failure"
            )));
            self.file.write_all(entry)?;

            let entry_index = self.end_index + 1;
            self.entry_positions.insert(entry_index, pos);
            self.end_index = entry_index;
            pos += ENTRY_HEADER_SIZE + entry_size;
        }
        self.file.sync_data()
    }

    pub fn read_entry(&mut self, index: u64) -> io::Result<Vec<u8>> {
        if index < self.start_index || index > self.end_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Index out of range",
            ));
        }

        let pos = *self.entry_positions.get(&index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Entry position not found")
        })?;

        self.file.seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;

        let mut entry = vec![0u8; entry_size as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Drops `index` and every entry after it
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        if index < self.start_index || index > self.end_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Index out of range",
            ));
        }

        if let Some(pos) = self.entry_positions.get(&index) {
            self.file.set_len(*pos)?;
            self.file.sync_data()?;
            let _ = self.entry_positions.split_off(&index);
            self.end_index = index - 1;
        }

        Ok(())
    }

    /// Deletes the segment file
    pub fn remove(self) -> io::Result<()> {
        drop(self.file);
        fs::remove_file(&self.path)
    }

    pub fn get_start_index(&self) -> u64 {
        self.start_index
    }

    pub fn get_end_index(&self) -> u64 {
        self.end_index
    }

    pub fn is_empty(&self) -> bool {
        self.end_index < self.start_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn entries(items: &[&[u8]]) -> Vec<Vec<u8>> {
        items.iter().map(|e| e.to_vec()).collect()
    }

    #[test]
    fn test_segment_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let segment = Segment::new(temp_file.path(), 1).unwrap();

        assert_eq!(segment.get_start_index(), 1);
        assert_eq!(segment.get_end_index(), 0);
        assert!(segment.is_empty());
    }

    #[test]
    fn test_segment_append() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::new(temp_file.path(), 1).unwrap();

        segment
            .append(&entries(&[b"first entry", b"second entry"]))
            .unwrap();

        assert_eq!(segment.get_end_index(), 2);
        assert!(!segment.is_empty());

        let first_entry = segment.read_entry(1).unwrap();
        assert_eq!(first_entry, b"first entry");

        let second_entry = segment.read_entry(2).unwrap();
        assert_eq!(second_entry, b"second entry");
    }

    #[test]
    fn test_segment_truncate() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::new(temp_file.path(), 1).unwrap();

        segment
            .append(&entries(&[b"first entry", b"second entry", b"third entry"]))
            .unwrap();

        segment.truncate_from(3).unwrap();
        assert_eq!(segment.get_end_index(), 2);

        let first_entry = segment.read_entry(1).unwrap();
        assert_eq!(first_entry, b"first entry");

        let second_entry = segment.read_entry(2).unwrap();
        assert_eq!(second_entry, b"second entry");

        assert!(segment.read_entry(3).is_err());

        segment.append(&entries(&[b"replacement"])).unwrap();
        assert_eq!(segment.read_entry(3).unwrap(), b"replacement");
    }

    #[test]
    fn test_segment_reopen_drops_torn_entry() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let mut segment = Segment::new(temp_file.path(), 5).unwrap();
            segment.append(&entries(&[b"alpha", b"beta"])).unwrap();
        }
        // a size header promising more bytes than were written
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(temp_file.path())
                .unwrap();
            file.write_all(&100u64.to_le_bytes()).unwrap();
            file.write_all(b"gam").unwrap();
        }

        let mut segment = Segment::new(temp_file.path(), 5).unwrap();
        assert_eq!(segment.get_end_index(), 6);
        assert_eq!(segment.read_entry(6).unwrap(), b"beta");
        segment.append(&entries(&[b"gamma"])).unwrap();
        drop(segment);

        let mut segment = Segment::new(temp_file.path(), 5).unwrap();
        assert_eq!(segment.read_entry(7).unwrap(), b"gamma");
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn test_failed_append_leaves_no_partial_entry() {
        let scenario = fail::FailScenario::setup();
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::new(temp_file.path(), 1).unwrap();
        segment.append(&entries(&[b"alpha"])).unwrap();

        // beta goes through, gamma fails after its size header
        fail::cfg("segment-append-body", "1*off->return").unwrap();
        assert!(segment.append(&entries(&[b"beta", b"gamma"])).is_err());
        fail::remove("segment-append-body");
        assert_eq!(segment.get_end_index(), 1);
        assert!(segment.read_entry(2).is_err());

        segment.append(&entries(&[b"delta"])).unwrap();
        assert_eq!(segment.read_entry(2).unwrap(), b"delta");
        drop(segment);

        let mut segment = Segment::new(temp_file.path(), 1).unwrap();
        assert_eq!(segment.get_end_index(), 2);
        assert_eq!(segment.read_entry(1).unwrap(), b"alpha");
        assert_eq!(segment.read_entry(2).unwrap(), b"delta");
        scenario.teardown();
    }

    #[test]
    fn test_segment_wrong_start_index() {
        let temp_file = NamedTempFile::new().unwrap();
        drop(Segment::new(temp_file.path(), 1).unwrap());
        assert!(Segment::new(temp_file.path(), 9).is_err());
    }
}
