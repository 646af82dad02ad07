//! The volume file: positioned page reads and writes with checksums.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use shale_error::{Result, ShaleError};
use shale_types::page::{self, off, PAGE_SIZE};
use shale_types::{PageBuf, PageId, PageType};
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

/// A single volume file of fixed-size pages.
///
/// Pages are addressed by `pid * PAGE_SIZE`. The file is sparse: reading a
/// page that was never written yields a zero-filled (virgin) image, which
/// callers recognize by its `Unknown` page type.
pub struct Volume {
    file: File,
    path: PathBuf,
}

impl Volume {
    /// Create a fresh volume file, truncating any existing one.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(path = %path.display(), "created volume");
        Ok(Self { file, path })
    }

    /// Open an existing volume file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(ShaleError::NotAVolume { path });
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!(path = %path.display(), "opened volume");
        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a page image. Never-written pages come back zero-filled;
    /// written pages are checksum-verified.
    pub fn read_page(&self, pid: PageId, buf: &mut PageBuf) -> Result<()> {
        let offset = u64::from(pid) * PAGE_SIZE as u64;
        let file_len = self.file.metadata()?.len();
        if offset >= file_len {
            buf.as_bytes_mut().fill(0);
            return Ok(());
        }
        self.file.read_exact_at(buf.as_bytes_mut(), offset)?;

        let bytes = buf.as_bytes();
        if PageType::from_u8(bytes[off::PAGE_TYPE]) == PageType::Unknown {
            // Virgin page inside the file extent (sparse hole).
            return Ok(());
        }
        let stored = page::read_u32(bytes, off::CHECKSUM);
        if stored != Self::checksum(bytes) {
            return Err(ShaleError::corrupt(pid, "checksum mismatch"));
        }
        let stored_pid = page::read_u32(bytes, off::PID);
        if stored_pid != pid {
            return Err(ShaleError::corrupt(
                pid,
                format!("page claims pid {stored_pid}"),
            ));
        }
        trace!(pid, "read page");
        Ok(())
    }

    /// Write a page image, stamping its checksum in place first.
    ///
    /// Callers uphold the WAL rule: the log must be durable past the
    /// page's LSN before calling this.
    pub fn write_page(&self, pid: PageId, buf: &mut PageBuf) -> Result<()> {
        let bytes = buf.as_bytes_mut();
        page::write_u32(bytes, off::PID, pid);
        let sum = Self::checksum(bytes);
        page::write_u32(bytes, off::CHECKSUM, sum);
        let offset = u64::from(pid) * PAGE_SIZE as u64;
        self.file.write_all_at(bytes, offset)?;
        trace!(pid, "wrote page");
        Ok(())
    }

    /// fsync the volume file.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Page checksum: xxh3 over the image with the checksum field itself
    /// zeroed, truncated to 32 bits.
    fn checksum(bytes: &[u8]) -> u32 {
        let mut h = xxh3_64(&bytes[..off::CHECKSUM]);
        h ^= xxh3_64(&bytes[off::CHECKSUM + 4..]).rotate_left(17);
        h as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shale_types::page::PageHeader;
    use shale_types::Lsn;
    use tempfile::TempDir;

    fn formatted_page(pid: PageId) -> PageBuf {
        let mut buf = PageBuf::zeroed();
        PageHeader {
            pid,
            lsn: Lsn::new(1, 64),
            page_type: PageType::Btree,
            level: 0,
            flags: 0,
            store: 1,
            checksum: 0,
            fence_low_off: 0,
            fence_high_off: 0,
            foster_off: 0,
            nrecs: 0,
            record_area_end: PAGE_SIZE as u16,
            pid0_off: 0,
        }
        .write_to(buf.as_bytes_mut());
        buf
    }

    #[test]
    fn write_then_read_verifies() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::create(dir.path().join("data.shale")).unwrap();
        let mut page = formatted_page(3);
        page.as_bytes_mut()[100] = 0xAB;
        vol.write_page(3, &mut page).unwrap();

        let mut back = PageBuf::zeroed();
        vol.read_page(3, &mut back).unwrap();
        assert_eq!(back.as_bytes()[100], 0xAB);
        assert_eq!(back.header().pid, 3);
    }

    #[test]
    fn unwritten_page_reads_as_virgin() {
        let dir = TempDir::new().unwrap();
        let vol = Volume::create(dir.path().join("data.shale")).unwrap();
        let mut page = PageBuf::zeroed();
        vol.read_page(17, &mut page).unwrap();
        assert_eq!(page.header().page_type, PageType::Unknown);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.shale");
        let vol = Volume::create(&path).unwrap();
        let mut page = formatted_page(2);
        vol.write_page(2, &mut page).unwrap();

        // Flip a payload byte behind the volume's back.
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all_at(&[0xFF], 2 * PAGE_SIZE as u64 + 4000).unwrap();

        let mut back = PageBuf::zeroed();
        let err = vol.read_page(2, &mut back);
        assert!(matches!(err, Err(ShaleError::PageCorrupt { pid: 2, .. })));
    }

    #[test]
    fn missing_volume_is_not_a_volume() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Volume::open(dir.path().join("absent")),
            Err(ShaleError::NotAVolume { .. })
        ));
    }
}
