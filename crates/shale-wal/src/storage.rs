//! Partitioned on-disk log layout.
//!
//! The log directory holds one file per partition, named `log.<n>` with
//! `n` starting at 1. Every partition has the same byte capacity; records
//! never straddle a partition boundary (the insert path zero-pads the tail
//! instead). Truncation deletes whole partition files from the front.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use shale_error::{Result, ShaleError};
use tracing::{debug, info};

/// Partition file management: open/create, positioned writes, whole-file
/// reads for the fetch path, and front truncation.
pub struct LogStorage {
    dir: PathBuf,
    capacity: u64,
    files: Mutex<BTreeMap<u32, File>>,
}

impl LogStorage {
    /// Open (creating if needed) the log directory.
    pub fn open(dir: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            capacity,
            files: Mutex::new(BTreeMap::new()),
        })
    }

    /// Bytes a partition can hold.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// `log.<n>` for partition `n`.
    #[must_use]
    pub fn make_log_name(partition: u32) -> String {
        format!("log.{partition}")
    }

    fn path_of(&self, partition: u32) -> PathBuf {
        self.dir.join(Self::make_log_name(partition))
    }

    /// Partition numbers present on disk, ascending.
    pub fn list_partitions(&self) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(num) = name.strip_prefix("log.") {
                if let Ok(p) = num.parse::<u32>() {
                    out.push(p);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    fn with_file<T>(&self, partition: u32, f: impl FnOnce(&File) -> Result<T>) -> Result<T> {
        let mut files = self.files.lock();
        if !files.contains_key(&partition) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.path_of(partition))?;
            debug!(partition, "opened log partition");
            files.insert(partition, file);
        }
        let file = files
            .get(&partition)
            .unwrap_or_else(|| unreachable!("inserted above"));
        f(file)
    }

    /// Positioned write into a partition.
    pub fn write_at(&self, partition: u32, offset: u32, bytes: &[u8]) -> Result<()> {
        if u64::from(offset) + bytes.len() as u64 > self.capacity {
            return Err(ShaleError::internal(format!(
                "write of {} bytes at {offset} exceeds partition capacity {}",
                bytes.len(),
                self.capacity
            )));
        }
        self.with_file(partition, |file| {
            file.write_all_at(bytes, u64::from(offset))?;
            Ok(())
        })
    }

    /// fsync a partition file.
    pub fn sync(&self, partition: u32) -> Result<()> {
        self.with_file(partition, |file| {
            file.sync_data()?;
            Ok(())
        })
    }

    /// Read a partition's current contents (used by the fetch buffers and
    /// by restart's forward scan; both only consume durable bytes).
    pub fn read_partition(&self, partition: u32) -> Result<Vec<u8>> {
        self.with_file(partition, |file| {
            let len = file.metadata()?.len();
            let mut buf = vec![0u8; len as usize];
            file.read_exact_at(&mut buf, 0)?;
            Ok(buf)
        })
    }

    /// Delete every partition strictly below `keep_from`. Returns the
    /// partitions removed.
    pub fn delete_below(&self, keep_from: u32) -> Result<Vec<u32>> {
        let mut removed = Vec::new();
        let mut files = self.files.lock();
        for partition in self.list_partitions()? {
            if partition >= keep_from {
                break;
            }
            files.remove(&partition);
            std::fs::remove_file(self.path_of(partition))?;
            removed.push(partition);
        }
        if !removed.is_empty() {
            info!(?removed, keep_from, "truncated log partitions");
        }
        Ok(removed)
    }
}
