//! Buffer Manager - the paged caching layer between the file store and
//! the page file.
//!
//! The [`BufferManager`] provides:
//! - Byte-addressed reads and writes segmented over fixed-size pages
//! - Read-through caching with FIFO eviction
//! - Write-behind dirty tracking with journaled checkpoints
//!
//! # Checkpoint protocol
//! On `checkpoint()` the manager (1) appends all dirty pages plus a CRC'd
//! checkpoint record to the redo journal and fsyncs it, (2) applies the
//! pages to the page file, (3) truncates the journal. A crash between
//! (1) and (3) is repaired on open by [`RedoJournal::recover`]. Below the
//! journaling safety level no journal is kept and the manager behaves as
//! a write-through cache with deferred sync.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::Ordering;

use log::debug;
use parking_lot::Mutex;

use crate::buffer::journal::RedoJournal;
use crate::buffer::stats::BufferStats;
use crate::common::Result;
use crate::store::PageFile;

struct Frame {
    data: Vec<u8>,
    dirty: bool,
}

struct BufferInner {
    file: PageFile,
    journal: Option<RedoJournal>,
    frames: HashMap<u64, Frame>,
    /// Page load order; front is the oldest (first eviction candidate).
    fifo: VecDeque<u64>,
}

/// Paged, logged, read-through/write-behind cache over a page file.
pub struct BufferManager {
    inner: Mutex<BufferInner>,
    stats: BufferStats,
    page_size: usize,
    max_pages: usize,
}

impl BufferManager {
    /// Create a new paged file (and journal, when enabled).
    pub fn create(
        data_path: &Path,
        journal_path: &Path,
        page_size: usize,
        max_pages: usize,
        journal_enabled: bool,
    ) -> Result<Self> {
        let file = PageFile::create(data_path, page_size)?;
        let journal = if journal_enabled {
            Some(RedoJournal::open_or_create(journal_path)?)
        } else {
            None
        };
        Ok(Self::with_parts(file, journal, page_size, max_pages))
    }

    /// Open an existing paged file, replaying the journal tail first.
    pub fn open(
        data_path: &Path,
        journal_path: &Path,
        page_size: usize,
        max_pages: usize,
        journal_enabled: bool,
    ) -> Result<Self> {
        let mut file = PageFile::open(data_path, page_size)?;
        let journal = if journal_enabled {
            RedoJournal::recover(journal_path, &mut file)?;
            Some(RedoJournal::open_or_create(journal_path)?)
        } else {
            None
        };
        Ok(Self::with_parts(file, journal, page_size, max_pages))
    }

    fn with_parts(
        file: PageFile,
        journal: Option<RedoJournal>,
        page_size: usize,
        max_pages: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                file,
                journal,
                frames: HashMap::new(),
                fifo: VecDeque::new(),
            }),
            stats: BufferStats::new(),
            page_size,
            max_pages,
        }
    }

    /// The configured page size.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Buffer statistics.
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Read `out.len()` bytes starting at byte `offset`.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut pos = 0usize;
        while pos < out.len() {
            let at = offset + pos as u64;
            let page_no = at / self.page_size as u64;
            let in_page = (at % self.page_size as u64) as usize;
            let span = (self.page_size - in_page).min(out.len() - pos);

            self.ensure_frame(&mut inner, page_no)?;
            let frame = &inner.frames[&page_no];
            out[pos..pos + span].copy_from_slice(&frame.data[in_page..in_page + span]);
            pos += span;
        }
        Ok(())
    }

    /// Write `data` starting at byte `offset`, marking pages dirty.
    ///
    /// Nothing reaches the page file until the next checkpoint.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut pos = 0usize;
        while pos < data.len() {
            let at = offset + pos as u64;
            let page_no = at / self.page_size as u64;
            let in_page = (at % self.page_size as u64) as usize;
            let span = (self.page_size - in_page).min(data.len() - pos);

            self.ensure_frame(&mut inner, page_no)?;
            let frame = inner.frames.get_mut(&page_no).unwrap();
            frame.data[in_page..in_page + span].copy_from_slice(&data[pos..pos + span]);
            frame.dirty = true;
            pos += span;
        }
        Ok(())
    }

    /// Flush all dirty pages through the journal to the page file.
    pub fn checkpoint(&self, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        self.checkpoint_locked(&mut inner, sync)
    }

    // ========================================================================
    // Internal: frame loading and eviction
    // ========================================================================

    /// Make sure `page_no` is cached, loading and evicting as needed.
    fn ensure_frame(&self, inner: &mut BufferInner, page_no: u64) -> Result<()> {
        if inner.frames.contains_key(&page_no) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        if inner.frames.len() >= self.max_pages {
            self.evict_one(inner)?;
        }

        let mut data = vec![0u8; self.page_size];
        inner.file.read_page(page_no, &mut data)?;
        self.stats.pages_read.fetch_add(1, Ordering::Relaxed);
        inner.frames.insert(page_no, Frame { data, dirty: false });
        inner.fifo.push_back(page_no);
        Ok(())
    }

    /// Evict the oldest clean frame, checkpointing first if every frame
    /// is dirty.
    fn evict_one(&self, inner: &mut BufferInner) -> Result<()> {
        let victim = inner
            .fifo
            .iter()
            .position(|page_no| !inner.frames[page_no].dirty);
        let position = match victim {
            Some(p) => p,
            None => {
                // All frames dirty: flush the lot, then the front is clean.
                self.checkpoint_locked(inner, false)?;
                0
            }
        };
        if let Some(page_no) = inner.fifo.remove(position) {
            inner.frames.remove(&page_no);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn checkpoint_locked(&self, inner: &mut BufferInner, sync: bool) -> Result<()> {
        let mut dirty: Vec<u64> = inner
            .frames
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(&p, _)| p)
            .collect();
        dirty.sort_unstable();

        if dirty.is_empty() {
            if sync {
                inner.file.sync()?;
            }
            return Ok(());
        }
        debug!("checkpoint: {} dirty pages", dirty.len());

        // (1) Journal the batch before touching the page file.
        if inner.journal.is_some() {
            let batch: Vec<(u64, &[u8])> = dirty
                .iter()
                .map(|p| (*p, inner.frames[p].data.as_slice()))
                .collect();
            inner.journal.as_mut().unwrap().write_checkpoint(&batch, true)?;
        }

        // (2) Apply to the page file.
        for page_no in &dirty {
            let frame = inner.frames.get_mut(page_no).unwrap();
            inner.file.write_page(*page_no, &frame.data)?;
            frame.dirty = false;
            self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
        }
        if sync {
            inner.file.sync()?;
        }

        // (3) The batch is durable in the page file; drop the journal tail.
        if let Some(journal) = inner.journal.as_mut() {
            journal.truncate()?;
        }
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_bm(max_pages: usize) -> (BufferManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let data = dir.path().join("test.mvc");
        let journal = dir.path().join("test.mvj");
        let bm = BufferManager::create(&data, &journal, 128, max_pages, true).unwrap();
        (bm, dir)
    }

    #[test]
    fn test_write_then_read() {
        let (bm, _dir) = create_test_bm(8);
        bm.write(100, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        bm.read(100, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_write_spanning_pages() {
        let (bm, _dir) = create_test_bm(8);
        let data: Vec<u8> = (0..=255).collect();
        // Starts mid-page and crosses two page boundaries.
        bm.write(100, &data).unwrap();
        let mut out = vec![0u8; 256];
        bm.read(100, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_checkpoint_persists() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("test.mvc");
        let journal = dir.path().join("test.mvj");
        {
            let bm = BufferManager::create(&data, &journal, 128, 8, true).unwrap();
            bm.write(0, &[0xAA; 64]).unwrap();
            bm.checkpoint(true).unwrap();
        }
        {
            let bm = BufferManager::open(&data, &journal, 128, 8, true).unwrap();
            let mut out = [0u8; 64];
            bm.read(0, &mut out).unwrap();
            assert!(out.iter().all(|&b| b == 0xAA));
        }
    }

    #[test]
    fn test_eviction_under_pressure() {
        let (bm, _dir) = create_test_bm(2);
        // Touch four distinct pages with a two-frame pool.
        for page in 0..4u64 {
            bm.write(page * 128, &[page as u8]).unwrap();
        }
        let mut out = [0u8; 1];
        for page in 0..4u64 {
            bm.read(page * 128, &mut out).unwrap();
            assert_eq!(out[0], page as u8);
        }
        assert!(bm.stats().snapshot().evictions > 0);
    }

    #[test]
    fn test_cache_hit_tracking() {
        let (bm, _dir) = create_test_bm(8);
        bm.write(0, &[1]).unwrap();
        let mut out = [0u8; 1];
        bm.read(0, &mut out).unwrap();
        bm.read(0, &mut out).unwrap();
        assert!(bm.stats().snapshot().cache_hits >= 2);
    }

    #[test]
    fn test_unjournaled_checkpoint() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("test.mvc");
        let journal = dir.path().join("test.mvj");
        let bm = BufferManager::create(&data, &journal, 128, 8, false).unwrap();
        bm.write(0, &[5; 16]).unwrap();
        bm.checkpoint(true).unwrap();
        // No journal file should have been created.
        assert!(!journal.exists());
    }
}
