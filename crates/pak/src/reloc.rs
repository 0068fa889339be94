//! Load-time fixup records.
//!
//! The runtime walks these tables sequentially and rewrites each recorded
//! location, either into a resolved address or into an asset handle.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::segment::Segment;

/// Location inside the container: segment index and byte offset within it.
///
/// This is the on-disk form of an intra-container pointer.
/// Resolving it to an address is the job of the runtime loader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PagePtr {
    pub index: u32,
    pub offset: u32,
}

impl PagePtr {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Marks absent pointer in asset records.
    pub const NULL: PagePtr = PagePtr {
        index: u32::MAX,
        offset: 0,
    };

    pub const fn new(index: u32, offset: u32) -> Self {
        PagePtr { index, offset }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX
    }

    pub fn write<W: Write>(&self, mut out: W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.index)?;
        out.write_u32::<LittleEndian>(self.offset)
    }

    pub fn read<R: Read>(mut input: R) -> io::Result<Self> {
        let index = input.read_u32::<LittleEndian>()?;
        let offset = input.read_u32::<LittleEndian>()?;
        Ok(PagePtr { index, offset })
    }

    /// Stores the pointer into `buf` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if pointer does not fit into `buf` at `offset`.
    pub fn encode_at(&self, buf: &mut [u8], offset: usize) {
        let field = &mut buf[offset..][..Self::SIZE];
        field[..4].copy_from_slice(&self.index.to_le_bytes());
        field[4..].copy_from_slice(&self.offset.to_le_bytes());
    }
}

fn check_field(segment: &Segment, offset: u32, what: &str) {
    assert!(
        segment.contains(u64::from(offset), PagePtr::SIZE as u64),
        "{what} at offset {offset} does not fit into segment {} of {} bytes",
        segment.index(),
        segment.padded_size(),
    );
}

/// Pak-wide list of pointer descriptors in registration order.
#[derive(Debug, Default)]
pub struct RelocationTable {
    pointers: Vec<PagePtr>,
}

impl RelocationTable {
    pub fn new() -> Self {
        RelocationTable::default()
    }

    /// Records that `segment` holds an intra-container pointer at `offset`.
    ///
    /// The pointed-to value is not inspected.
    ///
    /// # Panics
    ///
    /// Panics if the 8-byte field at `offset` is not inside the segment.
    pub fn add_pointer(&mut self, segment: &Segment, offset: u32) {
        check_field(segment, offset, "Pointer");
        self.pointers.push(PagePtr::new(segment.index(), offset));
    }

    pub fn pointers(&self) -> &[PagePtr] {
        &self.pointers
    }

    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }
}

/// GUID descriptors of a single asset.
///
/// Encoders fill this list while building an asset and hand it over
/// on registration. Lists are merged into the pak-wide table on write,
/// in asset order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuidRefs {
    descriptors: Vec<PagePtr>,
}

impl GuidRefs {
    pub fn new() -> Self {
        GuidRefs::default()
    }

    /// Records that `segment` holds 64-bit GUID of another asset at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the 8-byte field at `offset` is not inside the segment.
    pub fn add_descriptor(&mut self, segment: &Segment, offset: u32) {
        check_field(segment, offset, "GUID");
        self.descriptors.push(PagePtr::new(segment.index(), offset));
    }

    pub fn as_slice(&self) -> &[PagePtr] {
        &self.descriptors
    }

    pub fn iter(&self) -> impl Iterator<Item = &PagePtr> + '_ {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Highest segment index any descriptor points into.
    pub fn highest_segment(&self) -> Option<u32> {
        self.descriptors.iter().map(|d| d.index).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{MemoryClass, SegmentAllocator};

    #[test]
    fn pointers_keep_registration_order() {
        let mut alloc = SegmentAllocator::new();
        let head = alloc.create(64, MemoryClass::HEAD, 8, 8).unwrap();
        let cpu = alloc.create(32, MemoryClass::CPU, 16, 16).unwrap();

        let mut table = RelocationTable::new();
        table.add_pointer(&cpu, 8);
        table.add_pointer(&head, 0);
        table.add_pointer(&head, 56);

        assert_eq!(
            table.pointers(),
            [
                PagePtr::new(cpu.index(), 8),
                PagePtr::new(head.index(), 0),
                PagePtr::new(head.index(), 56)
            ]
        );
    }

    #[test]
    fn descriptors_stay_within_segment() {
        let mut alloc = SegmentAllocator::new();
        let head = alloc.create(20, MemoryClass::HEAD, 8, 8).unwrap();

        let mut refs = GuidRefs::new();
        refs.add_descriptor(&head, 16);

        for d in refs.iter() {
            assert!(u64::from(d.offset) < head.padded_size());
            assert_eq!(d.index, head.index());
        }
        assert_eq!(refs.highest_segment(), Some(head.index()));
    }

    #[test]
    #[should_panic]
    fn pointer_past_segment_end_panics() {
        let mut alloc = SegmentAllocator::new();
        let head = alloc.create(16, MemoryClass::HEAD, 8, 8).unwrap();

        let mut table = RelocationTable::new();
        table.add_pointer(&head, 12);
    }

    #[test]
    #[should_panic]
    fn guid_past_segment_end_panics() {
        let mut alloc = SegmentAllocator::new();
        let head = alloc.create(8, MemoryClass::HEAD, 8, 8).unwrap();

        let mut refs = GuidRefs::new();
        refs.add_descriptor(&head, 8);
    }

    #[test]
    fn encode_in_place() {
        let mut buf = [0u8; 16];
        PagePtr::new(3, 0x20).encode_at(&mut buf, 4);
        assert_eq!(buf[4..12], [3, 0, 0, 0, 0x20, 0, 0, 0]);

        let ptr = PagePtr::read(&buf[4..]).unwrap();
        assert_eq!(ptr, PagePtr::new(3, 0x20));
    }
}
