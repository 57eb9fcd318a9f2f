//! Slotted page format for variable-length records.
//!
//! The payload of a [`Page`] is split into a slot directory that grows up
//! from payload offset 0 and a record region that grows down from the end
//! of the payload:
//!
//! ```text
//! payload offset 0                                             PAYLOAD_SIZE
//! +---------+---------+-----+----------------+----------+----------+
//! | slot 0  | slot 1  | ... |   free space   | record 1 | record 0 |
//! +---------+---------+-----+----------------+----------+----------+
//!                           ^ free_start     ^ free_end
//! ```
//!
//! Each slot is 4 bytes: a little-endian `u16` offset and a `u16` length,
//! both relative to the payload. A length of 0 marks a deleted slot; its
//! offset and bytes stay in place until the slot is reused or the page is
//! compacted.
//!
//! # Slot ids and compaction
//!
//! A [`SlotId`] is an index into the directory. Deletion never renumbers
//! slots, but compaction does: it drops deleted slots and assigns the live
//! ones new dense ids in their old order. Any [`SlottedPage::insert`] may
//! compact, so a slot id is only valid until the next insert on the same
//! page. The [`Compaction`] returned with an [`Insertion`] maps old ids to
//! new ones for callers that need to follow their records.

use std::fmt;

use super::codec;
use super::{Page, PageId, PAGE_HEADER_SIZE, PAGE_SIZE, PAYLOAD_SIZE};
use crate::{Result, StorageError};

/// Size of each slot in bytes (offset: 2, length: 2).
pub const SLOT_SIZE: usize = 4;

/// Largest record that fits in an empty page, directory entry included.
pub const MAX_RECORD_SIZE: usize = PAYLOAD_SIZE - SLOT_SIZE;

/// Index into a page's slot directory.
pub type SlotId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: u16, // payload-relative start of the record
    pub length: u16, // 0 = deleted
}

impl Slot {
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.length == 0
    }

    #[inline]
    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            offset: u16::from_le_bytes([bytes[0], bytes[1]]),
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    #[inline]
    fn to_bytes(self) -> [u8; SLOT_SIZE] {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[0..2].copy_from_slice(&self.offset.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }
}

/// Result of a successful [`SlottedPage::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    /// Id of the new record, valid until the next insert on this page.
    pub slot_id: SlotId,
    /// Set when the insert had to compact the page first. Every slot id
    /// obtained before this call must be translated through it.
    pub compaction: Option<Compaction>,
}

/// Outcome of compacting a page: how old slot ids map to new ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compaction {
    remap: Vec<Option<SlotId>>, // indexed by old slot id
    reclaimed: usize,
}

impl Compaction {
    /// New id of the record that lived at `old`, or `None` if that slot was
    /// deleted (or never existed) before compaction.
    pub fn new_id(&self, old: SlotId) -> Option<SlotId> {
        self.remap.get(old as usize).copied().flatten()
    }

    /// Contiguous free bytes gained by compaction.
    pub fn reclaimed(&self) -> usize {
        self.reclaimed
    }

    /// Number of records kept.
    pub fn live_slots(&self) -> usize {
        self.remap.iter().filter(|id| id.is_some()).count()
    }

    /// True when every old id maps to itself (no slot was dropped).
    pub fn is_identity(&self) -> bool {
        self.remap
            .iter()
            .enumerate()
            .all(|(old, new)| *new == Some(old as SlotId))
    }
}

/// Snapshot of a slotted page's space accounting.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PageLayout {
    pub page_id: PageId,
    pub flags: u16,
    pub slot_count: u16,
    pub live_count: u16,
    pub free_start: u16,
    pub free_end: u16,
    pub free_space: usize,
    pub reclaimable_space: usize,
    pub fill_percentage: f32,
}

impl fmt::Display for PageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Page {} Layout:", self.page_id)?;
        writeln!(f, "  Flags: {:#06x}", self.flags)?;
        writeln!(f, "  Slots: {} ({} live)", self.slot_count, self.live_count)?;
        writeln!(f, "  Free space: {} bytes", self.free_space)?;
        writeln!(f, "  Reclaimable: {} bytes", self.reclaimable_space)?;
        writeln!(f, "  Free range: {}..{}", self.free_start, self.free_end)?;
        write!(f, "  Fill: {:.1}%", self.fill_percentage)
    }
}

/// A page whose payload holds variable-length records behind slot ids.
///
/// ```rust
/// use pagestore_storage::{SlottedPage, StorageError};
///
/// let mut page = SlottedPage::new(1);
/// let id = page.insert(b"hello").unwrap().slot_id;
/// assert_eq!(page.get(id).unwrap(), b"hello");
///
/// page.delete(id).unwrap();
/// assert!(matches!(page.get(id), Err(StorageError::DeletedRecord { .. })));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlottedPage {
    page: Page,
}

impl SlottedPage {
    pub fn new(page_id: PageId) -> Self {
        Self::with_flags(page_id, 0)
    }

    pub fn with_flags(page_id: PageId, flags: u16) -> Self {
        Self {
            page: Page::with_flags(page_id, flags),
        }
    }

    /// Interprets an existing page as a slotted page, checking that its
    /// header and directory describe a consistent layout.
    pub fn from_page(page: Page) -> Result<Self> {
        validate_layout(&page)?;
        Ok(Self { page })
    }

    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        Self::from_page(codec::decode(raw)?)
    }

    /// Deserializes a buffer read from `page_id`, rejecting pages whose
    /// header names a different id.
    pub fn deserialize_as(raw: &[u8], page_id: PageId) -> Result<Self> {
        Self::from_page(codec::decode_as(raw, page_id)?)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.page.serialize()
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn into_page(self) -> Page {
        self.page
    }

    pub fn page_id(&self) -> PageId {
        self.page.header.page_id
    }

    /// Directory entries, deleted ones included.
    pub fn slot_count(&self) -> u16 {
        self.page.header.slot_count
    }

    pub fn live_count(&self) -> u16 {
        self.slots().filter(|(_, slot)| !slot.is_deleted()).count() as u16
    }

    /// Contiguous bytes between the directory and the record region.
    pub fn free_space(&self) -> usize {
        let header = &self.page.header;
        (header.free_end - header.free_start) as usize
    }

    /// Contiguous bytes that would be free after [`compact`](Self::compact).
    pub fn reclaimable_space(&self) -> usize {
        let (live, bytes) = self
            .slots()
            .filter(|(_, slot)| !slot.is_deleted())
            .fold((0usize, 0usize), |(n, bytes), (_, slot)| {
                (n + 1, bytes + slot.length as usize)
            });
        PAYLOAD_SIZE - bytes - live * SLOT_SIZE
    }

    /// Bytes of the whole page in use: header, directory and record region.
    pub fn used_space(&self) -> usize {
        let header = &self.page.header;
        PAGE_HEADER_SIZE + header.free_start as usize + (PAYLOAD_SIZE - header.free_end as usize)
    }

    pub fn fill_percentage(&self) -> f32 {
        (self.used_space() as f32 / PAGE_SIZE as f32) * 100.0
    }

    pub fn slot(&self, slot_id: SlotId) -> Result<Slot> {
        self.check_slot(slot_id)?;
        Ok(self.read_slot(slot_id))
    }

    /// Stores `record` and returns its slot id.
    ///
    /// Placement, in order:
    /// 1. the first deleted slot (in id order) whose old span can hold the
    ///    record is reused in place, keeping its id;
    /// 2. otherwise the record is appended below the record region with a
    ///    new directory entry;
    /// 3. otherwise, if compaction would free enough room, the page is
    ///    compacted and the record appended. This renumbers slots, see
    ///    [`Insertion::compaction`].
    ///
    /// Fails with [`StorageError::PageFull`] when even a compacted page
    /// cannot hold the record; the page is left unchanged in that case.
    pub fn insert(&mut self, record: &[u8]) -> Result<Insertion> {
        if record.is_empty() {
            return Err(StorageError::EmptyRecord);
        }

        if let Some(slot_id) = self.reuse_slot(record) {
            return Ok(Insertion {
                slot_id,
                compaction: None,
            });
        }

        let needed = record.len() + SLOT_SIZE;
        if needed <= self.free_space() {
            return Ok(Insertion {
                slot_id: self.append(record),
                compaction: None,
            });
        }

        let reclaimable = self.reclaimable_space();
        if record.len() > MAX_RECORD_SIZE || needed > reclaimable {
            return Err(StorageError::PageFull {
                page_id: self.page_id(),
                needed,
                available: reclaimable,
            });
        }

        let compaction = self.compact();
        if needed > self.free_space() {
            return Err(StorageError::PageFull {
                page_id: self.page_id(),
                needed,
                available: self.free_space(),
            });
        }

        Ok(Insertion {
            slot_id: self.append(record),
            compaction: Some(compaction),
        })
    }

    /// Returns a copy of the record stored at `slot_id`.
    pub fn get(&self, slot_id: SlotId) -> Result<Vec<u8>> {
        self.check_slot(slot_id)?;

        let slot = self.read_slot(slot_id);
        if slot.is_deleted() {
            return Err(StorageError::DeletedRecord {
                page_id: self.page_id(),
                slot_id,
            });
        }

        Ok(self.record_bytes(slot).to_vec())
    }

    /// Marks `slot_id` deleted. The record bytes stay until reuse or
    /// compaction. Deleting a deleted slot is a no-op.
    pub fn delete(&mut self, slot_id: SlotId) -> Result<()> {
        self.check_slot(slot_id)?;

        let mut slot = self.read_slot(slot_id);
        slot.length = 0;
        self.write_slot(slot_id, slot);
        Ok(())
    }

    /// Packs live records against the end of the payload and drops deleted
    /// slots from the directory.
    ///
    /// Live records keep their relative order and receive new ids
    /// `0..live_count`. Ids held by callers must be translated through the
    /// returned [`Compaction`].
    pub fn compact(&mut self) -> Compaction {
        let free_before = self.free_space();
        let slot_count = self.slot_count();

        let mut packed = vec![0u8; PAYLOAD_SIZE];
        let mut remap = Vec::with_capacity(slot_count as usize);
        let mut top = PAYLOAD_SIZE;
        let mut next_id: SlotId = 0;

        for (_, slot) in self.slots() {
            if slot.is_deleted() {
                remap.push(None);
                continue;
            }

            let start = top - slot.length as usize;
            packed[start..top].copy_from_slice(self.record_bytes(slot));

            let moved = Slot {
                offset: start as u16,
                length: slot.length,
            };
            let pos = next_id as usize * SLOT_SIZE;
            packed[pos..pos + SLOT_SIZE].copy_from_slice(&moved.to_bytes());

            remap.push(Some(next_id));
            next_id += 1;
            top = start;
        }

        self.page.data = packed;
        let header = &mut self.page.header;
        header.slot_count = next_id;
        header.free_start = (next_id as usize * SLOT_SIZE) as u16;
        header.free_end = top as u16;

        let reclaimed = self.free_space() - free_before;
        log::debug!(
            "compacted page {}: {} -> {} slots, {} bytes reclaimed",
            self.page_id(),
            slot_count,
            next_id,
            reclaimed
        );

        Compaction { remap, reclaimed }
    }

    /// Live records in slot id order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &[u8])> + '_ {
        self.slots()
            .filter(|(_, slot)| !slot.is_deleted())
            .map(move |(id, slot)| (id, self.record_bytes(slot)))
    }

    pub fn layout(&self) -> PageLayout {
        let header = &self.page.header;
        PageLayout {
            page_id: header.page_id,
            flags: header.flags,
            slot_count: header.slot_count,
            live_count: self.live_count(),
            free_start: header.free_start,
            free_end: header.free_end,
            free_space: self.free_space(),
            reclaimable_space: self.reclaimable_space(),
            fill_percentage: self.fill_percentage(),
        }
    }

    /// First-fit scan over deleted slots. A deleted slot's span runs from
    /// its offset up to the offset of the slot before it (or the end of the
    /// payload for slot 0).
    fn reuse_slot(&mut self, record: &[u8]) -> Option<SlotId> {
        let mut prev_offset = PAYLOAD_SIZE;

        for slot_id in 0..self.slot_count() {
            let slot = self.read_slot(slot_id);
            let span = prev_offset.saturating_sub(slot.offset as usize);

            if slot.is_deleted() && span >= record.len() {
                let start = slot.offset as usize;
                self.page.data[start..start + record.len()].copy_from_slice(record);
                self.write_slot(
                    slot_id,
                    Slot {
                        offset: slot.offset,
                        length: record.len() as u16,
                    },
                );
                log::trace!(
                    "page {}: reused slot {} ({} of {} bytes)",
                    self.page_id(),
                    slot_id,
                    record.len(),
                    span
                );
                return Some(slot_id);
            }

            prev_offset = slot.offset as usize;
        }

        None
    }

    /// Caller guarantees `record.len() + SLOT_SIZE <= free_space()`.
    fn append(&mut self, record: &[u8]) -> SlotId {
        let header = self.page.header;
        let slot_id = header.slot_count;

        let end = header.free_end as usize;
        let start = end - record.len();
        self.page.data[start..end].copy_from_slice(record);

        self.write_slot(
            slot_id,
            Slot {
                offset: start as u16,
                length: record.len() as u16,
            },
        );

        let header = &mut self.page.header;
        header.free_end = start as u16;
        header.free_start += SLOT_SIZE as u16;
        header.slot_count += 1;

        slot_id
    }

    fn check_slot(&self, slot_id: SlotId) -> Result<()> {
        if slot_id >= self.slot_count() {
            return Err(StorageError::InvalidSlot {
                page_id: self.page_id(),
                slot_id,
            });
        }
        Ok(())
    }

    fn slots(&self) -> impl Iterator<Item = (SlotId, Slot)> + '_ {
        (0..self.slot_count()).map(move |id| (id, self.read_slot(id)))
    }

    fn read_slot(&self, slot_id: SlotId) -> Slot {
        let pos = slot_id as usize * SLOT_SIZE;
        Slot::from_bytes(&self.page.data[pos..pos + SLOT_SIZE])
    }

    fn write_slot(&mut self, slot_id: SlotId, slot: Slot) {
        let pos = slot_id as usize * SLOT_SIZE;
        self.page.data[pos..pos + SLOT_SIZE].copy_from_slice(&slot.to_bytes());
    }

    fn record_bytes(&self, slot: Slot) -> &[u8] {
        let start = slot.offset as usize;
        &self.page.data[start..start + slot.length as usize]
    }
}

/// Checks the invariants every slotted page maintains: the directory ends
/// at `free_start`, `free_start <= free_end <= PAYLOAD_SIZE`, and slot
/// spans lie in the record region in strictly descending order without
/// overlapping.
fn validate_layout(page: &Page) -> Result<()> {
    let header = &page.header;
    let corrupt = |reason: String| StorageError::CorruptLayout {
        page_id: header.page_id,
        reason,
    };

    let free_start = header.free_start as usize;
    let free_end = header.free_end as usize;
    let slot_count = header.slot_count as usize;

    if free_start != slot_count * SLOT_SIZE {
        return Err(corrupt(format!(
            "free_start {} does not match {} slots",
            free_start, slot_count
        )));
    }
    if free_start > free_end || free_end > PAYLOAD_SIZE {
        return Err(corrupt(format!(
            "free range {}..{} outside payload of {} bytes",
            free_start, free_end, PAYLOAD_SIZE
        )));
    }

    let mut prev_offset = PAYLOAD_SIZE;
    for slot_id in 0..slot_count {
        let pos = slot_id * SLOT_SIZE;
        let slot = Slot::from_bytes(&page.data[pos..pos + SLOT_SIZE]);
        let start = slot.offset as usize;
        let end = start + slot.length as usize;

        if start < free_end || end > prev_offset {
            return Err(corrupt(format!(
                "slot {} spans {}..{}, expected within {}..{}",
                slot_id, start, end, free_end, prev_offset
            )));
        }
        prev_offset = start;
    }

    Ok(())
}
