//! Redo journal for the buffer manager.
//!
//! The journal makes checkpoints atomic: dirty pages are appended to the
//! journal and fsynced *before* being applied to the page file, so a
//! crash mid-apply replays the completed batch on recovery. Records:
//!
//! ```text
//! PAGE record:       [0x01][page_no: u64 BE][len: u32 BE][data]
//! CHECKPOINT record: [0x02][page count: u32 BE][crc32 of batch payloads]
//! ```
//!
//! A batch is only applied during recovery if its checkpoint record is
//! present, the page count matches, and the CRC verifies.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::common::{Error, Result};
use crate::store::PageFile;

const PAGE_RECORD: u8 = 1;
const CHECKPOINT_RECORD: u8 = 2;

/// Append-only redo journal backing checkpoint atomicity.
pub struct RedoJournal {
    file: File,
    path: PathBuf,
}

impl RedoJournal {
    /// Open the journal file, creating it if absent.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Append a batch of dirty pages followed by its checkpoint record.
    ///
    /// The journal is fsynced before returning when `sync` is set, which
    /// is what makes the subsequent page-file apply safe.
    pub fn write_checkpoint(&mut self, pages: &[(u64, &[u8])], sync: bool) -> Result<()> {
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = Vec::new();
        for (page_no, data) in pages {
            buf.push(PAGE_RECORD);
            buf.extend_from_slice(&page_no.to_be_bytes());
            buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
            buf.extend_from_slice(data);
            hasher.update(data);
        }
        buf.push(CHECKPOINT_RECORD);
        buf.extend_from_slice(&(pages.len() as u32).to_be_bytes());
        buf.extend_from_slice(&hasher.finalize().to_be_bytes());

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Discard all journal contents after a successful apply.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// The journal's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the journal tail against `page_file` up to the last
    /// complete checkpoint record, then truncate the journal.
    ///
    /// Returns the number of pages applied. An incomplete trailing batch
    /// (torn write at crash) is discarded with a warning.
    pub fn recover<P: AsRef<Path>>(path: P, page_file: &mut PageFile) -> Result<usize> {
        if !path.as_ref().exists() {
            return Ok(0);
        }
        let mut file = File::open(&path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        if raw.is_empty() {
            return Ok(0);
        }

        let mut applied = 0usize;
        let mut pos = 0usize;
        // Pages of the batch currently being scanned.
        let mut batch: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut hasher = crc32fast::Hasher::new();

        loop {
            let Some(&tag) = raw.get(pos) else { break };
            pos += 1;
            match tag {
                PAGE_RECORD => {
                    let Some(header) = raw.get(pos..pos + 12) else { break };
                    let page_no = u64::from_be_bytes(header[0..8].try_into().unwrap());
                    let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
                    pos += 12;
                    let Some(data) = raw.get(pos..pos + len) else { break };
                    pos += len;
                    hasher.update(data);
                    batch.push((page_no, data.to_vec()));
                }
                CHECKPOINT_RECORD => {
                    let Some(rec) = raw.get(pos..pos + 8) else { break };
                    let count = u32::from_be_bytes(rec[0..4].try_into().unwrap()) as usize;
                    let crc = u32::from_be_bytes(rec[4..8].try_into().unwrap());
                    pos += 8;
                    let computed = std::mem::take(&mut hasher).finalize();
                    if count != batch.len() || crc != computed {
                        return Err(Error::Corruption(format!(
                            "journal checkpoint mismatch: {} pages recorded, {} found, crc {:08x} vs {:08x}",
                            count,
                            batch.len(),
                            crc,
                            computed
                        )));
                    }
                    for (page_no, data) in batch.drain(..) {
                        page_file.write_page(page_no, &data)?;
                        applied += 1;
                    }
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown journal record tag {}",
                        other
                    )));
                }
            }
        }

        if !batch.is_empty() {
            warn!(
                "discarding incomplete journal batch of {} pages (torn checkpoint)",
                batch.len()
            );
        }
        if applied > 0 {
            page_file.sync()?;
            info!("journal recovery applied {} pages", applied);
        }

        // The tail is consumed either way; start the journal fresh.
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(0)?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_checkpoint_and_recover() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("test.mvc");
        let journal_path = dir.path().join("test.mvj");

        {
            let mut journal = RedoJournal::open_or_create(&journal_path).unwrap();
            let page = vec![7u8; 128];
            journal.write_checkpoint(&[(2, &page)], true).unwrap();
            // Crash before the page file apply: data file never written.
        }

        let mut pf = PageFile::create(&data_path, 128).unwrap();
        let applied = RedoJournal::recover(&journal_path, &mut pf).unwrap();
        assert_eq!(applied, 1);

        let mut buf = vec![0u8; 128];
        pf.read_page(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_torn_batch_is_discarded() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("test.mvc");
        let journal_path = dir.path().join("test.mvj");

        {
            let mut journal = RedoJournal::open_or_create(&journal_path).unwrap();
            let page = vec![9u8; 128];
            journal.write_checkpoint(&[(0, &page)], true).unwrap();
        }
        // Chop off the checkpoint record to simulate a torn write.
        let raw = std::fs::read(&journal_path).unwrap();
        std::fs::write(&journal_path, &raw[..raw.len() - 9]).unwrap();

        let mut pf = PageFile::create(&data_path, 128).unwrap();
        let applied = RedoJournal::recover(&journal_path, &mut pf).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(pf.page_count(), 0);
    }

    #[test]
    fn test_empty_journal_recovers_nothing() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("test.mvc");
        let journal_path = dir.path().join("missing.mvj");
        let mut pf = PageFile::create(&data_path, 128).unwrap();
        assert_eq!(RedoJournal::recover(&journal_path, &mut pf).unwrap(), 0);
    }

    #[test]
    fn test_truncate_clears_journal() {
        let dir = tempdir().unwrap();
        let journal_path = dir.path().join("test.mvj");
        let mut journal = RedoJournal::open_or_create(&journal_path).unwrap();
        let page = vec![1u8; 64];
        journal.write_checkpoint(&[(0, &page)], false).unwrap();
        journal.truncate().unwrap();
        assert_eq!(std::fs::metadata(&journal_path).unwrap().len(), 0);
    }
}
