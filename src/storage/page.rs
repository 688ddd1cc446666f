use super::error::{StorageError, StorageResult};
use super::{random_id, PageId, PAGE_SIZE};

/// Byte cost of the page header: id (8) + lower (2) + upper (2).
pub const HEADER_SIZE: usize = 12;

/// Byte cost of one slot: offset (2) + length (2) + free flag (1).
pub const SLOT_SIZE: usize = 5;

/// One entry in a page's slot array, locating one row's bytes in the heap.
///
/// Slots are append-only; a freed slot is marked, never removed, so
/// offsets inside the page stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: u16,
    pub length: u16,
    pub free: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub id: PageId,
    /// First free byte after the slot array.
    pub lower: u16,
    /// Last used byte of the heap growing downward.
    pub upper: u16,
}

/// A fixed-size slotted page: header, slot array growing up from the low
/// end, heap of row bytes growing down from the high end.
#[derive(Debug, Clone)]
pub struct Page {
    pub header: PageHeader,
    pub slots: Vec<Slot>,
    pub data: Vec<u8>,
}

impl Page {
    /// Fresh empty page with a random id.
    pub fn new() -> Self {
        Self::with_id(random_id())
    }

    pub fn with_id(id: PageId) -> Self {
        Self {
            header: PageHeader {
                id,
                lower: HEADER_SIZE as u16,
                upper: PAGE_SIZE as u16,
            },
            slots: Vec::new(),
            data: vec![0u8; PAGE_SIZE],
        }
    }

    /// Free gap between the slot array and the heap.
    pub fn free_gap(&self) -> usize {
        (self.header.upper - self.header.lower) as usize
    }

    /// Whether a tuple of `n` bytes (plus its slot) fits in the gap.
    pub fn can_hold(&self, n: usize) -> bool {
        self.free_gap() >= n + SLOT_SIZE
    }

    /// Append a tuple to the heap and record its slot.
    ///
    /// Rejects the tuple without mutating the page when the gap is too
    /// small.
    pub fn insert_tuple(&mut self, bytes: &[u8]) -> StorageResult<Slot> {
        if !self.can_hold(bytes.len()) {
            return Err(StorageError::PageFull {
                page_id: self.header.id,
                free: self.free_gap(),
                needed: bytes.len() + SLOT_SIZE,
            });
        }

        let new_upper = self.header.upper - bytes.len() as u16;
        self.data[new_upper as usize..self.header.upper as usize].copy_from_slice(bytes);

        let slot = Slot {
            offset: new_upper,
            length: bytes.len() as u16,
            free: false,
        };
        self.slots.push(slot);
        self.header.upper = new_upper;
        self.header.lower += SLOT_SIZE as u16;
        Ok(slot)
    }

    /// Tombstone the slot at `index`. The heap bytes stay in place.
    pub fn free_slot(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.free = true;
        }
    }

    /// The heap bytes a slot points at.
    pub fn slot_bytes(&self, slot: &Slot) -> &[u8] {
        &self.data[slot.offset as usize..(slot.offset + slot.length) as usize]
    }

    pub fn live_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.free).count()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}
