//! Low-level paged file I/O.
//!
//! [`PageFile`] handles direct file operations for the buffer manager:
//! reading and writing fixed-size pages and extending the file. Pages
//! past the current end of file read back as zeros, which lets the store
//! grow without a separate allocation step.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::common::Result;

/// Manages page I/O for a single database file.
///
/// # File Layout
/// Pages are laid out sequentially; page N is at file offset
/// `N × page_size`.
///
/// # Thread Safety
/// `PageFile` is single-threaded. The buffer manager serializes access.
///
/// # Durability
/// Writes are *not* individually fsynced; the buffer manager calls
/// [`PageFile::sync`] at checkpoint boundaries according to the
/// configured io safety level.
pub struct PageFile {
    file: File,
    page_size: usize,
    page_count: u64,
}

impl PageFile {
    /// Create a new database file.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            file,
            page_size,
            page_count: 0,
        })
    }

    /// Open an existing database file.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        let page_count = file_size.div_ceil(page_size as u64);
        Ok(Self {
            file,
            page_size,
            page_count,
        })
    }

    /// Open an existing database file, or create if it doesn't exist.
    pub fn open_or_create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, page_size)
        } else {
            Self::create(path, page_size)
        }
    }

    /// Read a page into `buf`.
    ///
    /// Pages beyond the end of the file read back as zeros.
    pub fn read_page(&mut self, page_no: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if page_no >= self.page_count {
            buf.fill(0);
            return Ok(());
        }
        let offset = page_no * self.page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;

        // The final page may be short if the file ends mid-page.
        let available = (self.file.metadata()?.len()).saturating_sub(offset);
        if available >= self.page_size as u64 {
            self.file.read_exact(buf)?;
        } else {
            buf.fill(0);
            self.file.read_exact(&mut buf[..available as usize])?;
        }
        Ok(())
    }

    /// Write a page, extending the file if necessary.
    pub fn write_page(&mut self, page_no: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let offset = page_no * self.page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        if page_no >= self.page_count {
            self.page_count = page_no + 1;
        }
        Ok(())
    }

    /// Flush file contents to the device.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Number of pages in the file.
    #[inline]
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// The configured page size.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }
}
