// storage/src/page/mod.rs

pub mod codec;
pub mod slotted;

use crate::{Result, StorageError};

pub const PAGE_SIZE: usize = 8192;

/// Serialized size of [`PageHeader`], reserved padding included.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Bytes available after the header.
pub const PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Format tag at offset 0 of every page.
pub const PAGE_MAGIC: u32 = 0xDBDB_DBDB;

pub const PAGE_VERSION: u16 = 1;

/// Logical page number. `page_id * page_size` is the page's offset in the data file.
pub type PageId = u64;

/// Logical view of the 32-byte page header.
///
/// The on-disk layout (little-endian) is:
///
/// ```text
/// 0  magic      u32
/// 4  version    u16
/// 6  flags      u16
/// 8  page_id    u64
/// 16 free_start u16
/// 18 free_end   u16
/// 20 slot_count u16
/// 22 checksum   u32
/// 26 reserved   6 bytes
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,        // page type tag, opaque to this crate
    pub page_id: PageId,
    pub free_start: u16,   // payload-relative end of the slot directory
    pub free_end: u16,     // payload-relative start of the lowest record
    pub slot_count: u16,   // directory entries, tombstones included
    pub checksum: u32,     // CRC-32 of the serialized page
}

impl PageHeader {
    pub fn new(page_id: PageId, flags: u16) -> Self {
        Self {
            magic: PAGE_MAGIC,
            version: PAGE_VERSION,
            flags,
            page_id,
            free_start: 0,
            free_end: PAYLOAD_SIZE as u16,
            slot_count: 0,
            checksum: 0,
        }
    }
}

/// A page header plus exactly [`PAYLOAD_SIZE`] bytes of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub header: PageHeader,
    data: Vec<u8>,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self::with_flags(page_id, 0)
    }

    pub fn with_flags(page_id: PageId, flags: u16) -> Self {
        Self {
            header: PageHeader::new(page_id, flags),
            data: vec![0; PAYLOAD_SIZE],
        }
    }

    /// Builds a page from an existing header and payload. The payload must be
    /// exactly [`PAYLOAD_SIZE`] bytes; it is never padded or truncated.
    pub fn from_parts(header: PageHeader, data: Vec<u8>) -> Result<Self> {
        if data.len() != PAYLOAD_SIZE {
            return Err(StorageError::InvalidPageSize {
                expected: PAYLOAD_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self { header, data })
    }

    pub fn page_id(&self) -> PageId {
        self.header.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_parts(self) -> (PageHeader, Vec<u8>) {
        (self.header, self.data)
    }

    /// Serializes the page into a `PAGE_SIZE` buffer with a fresh checksum.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        codec::encode(&self.header, &self.data)
    }

    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        codec::decode(raw)
    }
}
