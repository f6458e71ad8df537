//! Configuration for the storage core.

use std::path::PathBuf;

use crate::common::{Error, Result};

/// Default size of a buffer page in bytes (8 KiB).
///
/// Pages are the unit of I/O between the buffer manager and the page
/// file. 8 KiB matches the common database default; memory-mapped
/// configurations may raise it up to [`MAX_PAGE_SIZE`].
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Largest accepted page size (1 MiB).
pub const MAX_PAGE_SIZE: usize = 1024 * 1024;

/// Default number of integers held by one index block.
pub const DEFAULT_INDEX_BLOCK_SIZE: usize = 1024;

/// Safety level at or above which the buffer manager keeps a redo journal.
pub const JOURNAL_SAFETY_LEVEL: u8 = 2;

/// Safety level at or above which commit publication is followed by fsync.
pub const SYNC_SAFETY_LEVEL: u8 = 3;

/// Which store implementation backs the conglomerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageSystem {
    /// Areas persisted in a single database file under `database_path`.
    FileBacked,
    /// Areas held in process memory. Nothing survives shutdown.
    HeapOnly,
}

/// Recognized configuration options and their defaults.
///
/// This is a plain value struct: the frontend that parses configuration
/// text lives outside the core and hands one of these in.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Selects the [`Store`](crate::store::Store) implementation.
    pub storage_system: StorageSystem,
    /// Directory for file-backed stores.
    pub database_path: PathBuf,
    /// Size of a buffer page in bytes.
    pub page_size: usize,
    /// Maximum number of pages held by the buffer manager.
    pub max_cache_pages: usize,
    /// DataCellCache budget in bytes.
    pub data_cache_size: usize,
    /// Cells larger than this are never cached.
    pub max_cache_entry_size: usize,
    /// If true, all write paths fail with READ_ONLY.
    pub read_only: bool,
    /// Controls journaling and fsync frequency. Range 1..=10.
    pub io_safety_level: u8,
    /// Enables strict dirty-select conflict detection at commit.
    pub transaction_error_on_dirty_select: bool,
    /// Case folding of identifiers in name lookups.
    pub ignore_case_for_identifiers: bool,
    /// Number of integers per index block.
    pub index_block_size: usize,
    /// Strings at or above this many bytes are stored out-of-line.
    pub string_blob_threshold: usize,
    /// Binary values at or above this many bytes are stored out-of-line.
    pub binary_blob_threshold: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            storage_system: StorageSystem::FileBacked,
            database_path: PathBuf::from("."),
            page_size: DEFAULT_PAGE_SIZE,
            max_cache_pages: 256,
            data_cache_size: 4 * 1024 * 1024,
            max_cache_entry_size: 8192,
            read_only: false,
            io_safety_level: 10,
            transaction_error_on_dirty_select: true,
            ignore_case_for_identifiers: false,
            index_block_size: DEFAULT_INDEX_BLOCK_SIZE,
            string_blob_threshold: 4096,
            binary_blob_threshold: 8192,
        }
    }
}

impl DbConfig {
    /// A heap-only configuration rooted nowhere, for tests and ephemeral
    /// databases.
    pub fn heap() -> Self {
        Self {
            storage_system: StorageSystem::HeapOnly,
            ..Self::default()
        }
    }

    /// Validate option ranges.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.io_safety_level) {
            return Err(Error::Usage(format!(
                "io_safety_level must be in 1..=10, got {}",
                self.io_safety_level
            )));
        }
        if !self.page_size.is_power_of_two() || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::Usage(format!(
                "page_size must be a power of two <= {}, got {}",
                MAX_PAGE_SIZE, self.page_size
            )));
        }
        if self.index_block_size < 16 {
            return Err(Error::Usage(format!(
                "index_block_size must be at least 16, got {}",
                self.index_block_size
            )));
        }
        if self.max_cache_pages == 0 {
            return Err(Error::Usage("max_cache_pages must be > 0".into()));
        }
        Ok(())
    }

    /// Whether the redo journal is active at this safety level.
    #[inline]
    pub fn journal_enabled(&self) -> bool {
        self.io_safety_level >= JOURNAL_SAFETY_LEVEL
    }

    /// Whether commit publication must be followed by fsync.
    #[inline]
    pub fn sync_on_commit(&self) -> bool {
        self.io_safety_level >= SYNC_SAFETY_LEVEL
    }

    /// Fold an identifier according to `ignore_case_for_identifiers`.
    pub fn fold_identifier(&self, name: &str) -> String {
        if self.ignore_case_for_identifiers {
            name.to_ascii_lowercase()
        } else {
            name.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DbConfig::default().validate().is_ok());
        assert!(DbConfig::heap().validate().is_ok());
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
        let cfg = DbConfig {
            page_size: 3000,
            ..DbConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_safety_level_range() {
        let mut cfg = DbConfig::default();
        cfg.io_safety_level = 0;
        assert!(cfg.validate().is_err());
        cfg.io_safety_level = 11;
        assert!(cfg.validate().is_err());
        cfg.io_safety_level = 1;
        assert!(cfg.validate().is_ok());
        assert!(!cfg.journal_enabled());
        assert!(!cfg.sync_on_commit());
        cfg.io_safety_level = 3;
        assert!(cfg.journal_enabled());
        assert!(cfg.sync_on_commit());
    }

    #[test]
    fn test_identifier_folding() {
        let mut cfg = DbConfig::default();
        assert_eq!(cfg.fold_identifier("Person"), "Person");
        cfg.ignore_case_for_identifiers = true;
        assert_eq!(cfg.fold_identifier("Person"), "person");
    }
}
