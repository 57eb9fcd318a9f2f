//! Storage layer for pagestore
//!
//! This crate provides the lowest storage primitives: fixed-size page I/O
//! against a single data file, a checksummed page format, and slotted pages
//! for variable-length records.
//!
//! # Access discipline
//!
//! Nothing in this crate locks internally. Every mutating operation takes
//! `&mut self`, so a caller that shares a [`DiskManager`] or a
//! [`SlottedPage`] across threads has to serialize access itself (for
//! example behind a mutex). A read-modify-write cycle on a page id must
//! hold that exclusive access from the read until the write.
//!
//! # Example
//!
//! ```no_run
//! use pagestore_storage::{DiskManager, SlottedPage, PAGE_SIZE};
//!
//! # fn main() -> pagestore_storage::Result<()> {
//! let mut disk = DiskManager::open("data.db", PAGE_SIZE)?;
//! let pid = disk.allocate_page()?;
//!
//! let mut page = SlottedPage::new(pid);
//! let slot = page.insert(b"hello")?.slot_id;
//! disk.write_page(pid, &page.serialize()?)?;
//! disk.sync()?;
//!
//! let mut buf = vec![0u8; PAGE_SIZE];
//! disk.read_page(pid, &mut buf)?;
//! let page = SlottedPage::deserialize_as(&buf, pid)?;
//! assert_eq!(page.get(slot)?, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod file;
pub mod page;

pub use config::DiskOptions;
pub use file::DiskManager;
pub use page::slotted::{
    Compaction, Insertion, PageLayout, Slot, SlotId, SlottedPage, MAX_RECORD_SIZE, SLOT_SIZE,
};
pub use page::{
    Page, PageHeader, PageId, PAGE_HEADER_SIZE, PAGE_MAGIC, PAGE_SIZE, PAGE_VERSION, PAYLOAD_SIZE,
};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid page size: expected {expected} bytes, got {actual}")]
    InvalidPageSize { expected: usize, actual: usize },

    #[error("Buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid page magic {0:#010x}")]
    InvalidMagic(u32),

    #[error("Checksum mismatch for page {page_id}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        page_id: PageId,
        stored: u32,
        computed: u32,
    },

    #[error("Unsupported page version {0}")]
    UnsupportedVersion(u16),

    #[error("Page id mismatch: expected {expected}, header says {found}")]
    PageIdMismatch { expected: PageId, found: PageId },

    #[error("Invalid page id {0}")]
    InvalidPageId(PageId),

    #[error("Corrupt page {page_id}: short read of {read} bytes")]
    CorruptPage { page_id: PageId, read: usize },

    #[error("Invalid data file size {size}: not a multiple of page size {page_size}")]
    InvalidFileSize { size: u64, page_size: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid slot index {slot_id} for page {page_id}")]
    InvalidSlot { page_id: PageId, slot_id: SlotId },

    #[error("Record in slot {slot_id} of page {page_id} was deleted")]
    DeletedRecord { page_id: PageId, slot_id: SlotId },

    #[error("Page {page_id} is full: need {needed} bytes, {available} available")]
    PageFull {
        page_id: PageId,
        needed: usize,
        available: usize,
    },

    #[error("Empty records cannot be stored")]
    EmptyRecord,

    #[error("Corrupt layout in page {page_id}: {reason}")]
    CorruptLayout { page_id: PageId, reason: String },

    #[error("Data file {} is locked by another handle", .0.display())]
    FileLocked(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad magic, checksum, version, size or layout. Caller bug or on-disk corruption.
    Format,
    /// A page or slot identifier that never existed.
    Range,
    /// A slot that existed and was deleted.
    Deleted,
    /// Not enough room in the page. Route the record elsewhere.
    Capacity,
    /// Filesystem errors, including lock contention.
    Io,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::InvalidPageSize { .. }
            | StorageError::BufferSizeMismatch { .. }
            | StorageError::InvalidMagic(_)
            | StorageError::ChecksumMismatch { .. }
            | StorageError::UnsupportedVersion(_)
            | StorageError::PageIdMismatch { .. }
            | StorageError::CorruptPage { .. }
            | StorageError::InvalidFileSize { .. }
            | StorageError::InvalidConfig(_)
            | StorageError::EmptyRecord
            | StorageError::CorruptLayout { .. } => ErrorKind::Format,
            StorageError::InvalidPageId(_) | StorageError::InvalidSlot { .. } => ErrorKind::Range,
            StorageError::DeletedRecord { .. } => ErrorKind::Deleted,
            StorageError::PageFull { .. } => ErrorKind::Capacity,
            StorageError::FileLocked(_) | StorageError::Io(_) => ErrorKind::Io,
        }
    }

    /// True for errors an ordinary caller is expected to handle and move on
    /// from: a full page or a tombstoned slot.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Capacity | ErrorKind::Deleted)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
