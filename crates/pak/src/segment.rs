//! Segment allocation.
//!
//! Every block of asset data lives in its own segment.
//! Segments are numbered in creation order and never change afterwards.

use crate::reloc::PagePtr;

/// Maximum number of segments in one container.
/// Segment count is stored as 16-bit value in the header.
pub const MAX_SEGMENTS: usize = u16::MAX as usize;

/// Maximum number of memory pools in one container.
pub const MAX_POOLS: usize = u16::MAX as usize;

bitflags::bitflags! {
    /// Memory pool the runtime places a segment in.
    ///
    /// Header data lives in the pool with no flags set, see [`MemoryClass::HEAD`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryClass: u32 {
        /// Memory is released once the asset is loaded.
        const TEMP = 0x1;

        /// Memory is kept for CPU access.
        const CPU = 0x2;

        /// Memory is only allocated on client builds.
        const CLIENT = 0x4;
    }
}

impl MemoryClass {
    /// Asset headers.
    pub const HEAD: MemoryClass = MemoryClass::empty();
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("Segment alignment must be non-zero")]
    ZeroAlignment,

    #[error("Segment of {size} bytes aligned to {alignment} does not fit into the container")]
    SizeOverflow { size: u64, alignment: u32 },

    #[error("Too many segments, at most {max} are allowed")]
    IndexOverflow { max: usize },

    #[error("Too many memory pools, at most {max} are allowed")]
    PoolOverflow { max: usize },
}

/// Addressable block of container data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Segment {
    index: u32,
    size: u64,
    padded_size: u64,
    alignment: u32,
    class: MemoryClass,
    pool: u32,
}

impl Segment {
    /// Index of the segment. Indices are dense and follow creation order.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Size requested on creation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size rounded up to the alignment.
    /// Raw data block of the segment has exactly this size.
    pub fn padded_size(&self) -> u64 {
        self.padded_size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn class(&self) -> MemoryClass {
        self.class
    }

    /// Index of the memory pool this segment is accounted in.
    pub fn pool(&self) -> u32 {
        self.pool
    }

    /// Checks that `width` bytes starting at `offset` are inside the segment.
    pub fn contains(&self, offset: u64, width: u64) -> bool {
        match offset.checked_add(width) {
            None => false,
            Some(end) => end <= self.padded_size,
        }
    }

    /// Returns pointer to the `offset` within this segment.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is outside the segment.
    pub fn ptr(&self, offset: u32) -> PagePtr {
        assert!(
            u64::from(offset) < self.padded_size,
            "Offset {offset} is outside of segment {} of {} bytes",
            self.index,
            self.padded_size
        );
        PagePtr::new(self.index, offset)
    }
}

/// Total size of segments sharing memory class and alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryPool {
    pub class: MemoryClass,
    pub alignment: u32,
    pub size: u64,
}

/// Creates segments and accounts them into memory pools.
#[derive(Debug, Default)]
pub struct SegmentAllocator {
    segments: Vec<Segment>,
    pools: Vec<MemoryPool>,
}

impl SegmentAllocator {
    pub fn new() -> Self {
        SegmentAllocator::default()
    }

    /// Creates new segment of at least `size` bytes.
    ///
    /// Size is rounded up to `alignment`.
    /// The segment is accounted in the pool with the same `class` and `pool_alignment`.
    pub fn create(
        &mut self,
        size: u64,
        class: MemoryClass,
        alignment: u32,
        pool_alignment: u32,
    ) -> Result<Segment, SegmentError> {
        if alignment == 0 || pool_alignment == 0 {
            return Err(SegmentError::ZeroAlignment);
        }

        let padded_size = align_up(size, u64::from(alignment))
            .filter(|&padded| padded <= u64::from(u32::MAX))
            .ok_or(SegmentError::SizeOverflow { size, alignment })?;

        if self.segments.len() >= MAX_SEGMENTS {
            return Err(SegmentError::IndexOverflow { max: MAX_SEGMENTS });
        }

        let pool = match self
            .pools
            .iter()
            .position(|p| p.class == class && p.alignment == pool_alignment)
        {
            Some(pool) => pool,
            None => {
                if self.pools.len() >= MAX_POOLS {
                    return Err(SegmentError::PoolOverflow { max: MAX_POOLS });
                }
                self.pools.push(MemoryPool {
                    class,
                    alignment: pool_alignment,
                    size: 0,
                });
                self.pools.len() - 1
            }
        };

        let pool_size = self.pools[pool]
            .size
            .checked_add(padded_size)
            .ok_or(SegmentError::SizeOverflow { size, alignment })?;
        self.pools[pool].size = pool_size;

        let segment = Segment {
            index: self.segments.len() as u32,
            size,
            padded_size,
            alignment,
            class,
            pool: pool as u32,
        };

        self.segments.push(segment);
        Ok(segment)
    }

    pub fn get(&self, index: u32) -> Option<&Segment> {
        self.segments.get(index as usize)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn pools(&self) -> &[MemoryPool] {
        &self.pools
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Rounds `value` up to the nearest multiple of `alignment`.
/// Returns `None` on overflow.
///
/// `alignment` must be non-zero.
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert_ne!(alignment, 0);
    match value % alignment {
        0 => Some(value),
        rem => value.checked_add(alignment - rem),
    }
}

/// Appends zero bytes to `buf` until its length is a multiple of `alignment`.
pub fn pad_to_alignment(buf: &mut Vec<u8>, alignment: usize) {
    debug_assert_ne!(alignment, 0);
    let rem = buf.len() % alignment;
    if rem != 0 {
        buf.resize(buf.len() + alignment - rem, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_size_is_aligned() {
        let mut alloc = SegmentAllocator::new();

        for (size, alignment) in [(0, 8), (1, 8), (8, 8), (9, 16), (100, 64), (4097, 4096), (7, 3)] {
            let segment = alloc.create(size, MemoryClass::CPU, alignment, alignment).unwrap();
            assert_eq!(segment.padded_size() % u64::from(alignment), 0);
            assert!(segment.padded_size() >= segment.size());
            assert!(segment.padded_size() - segment.size() < u64::from(alignment));
        }
    }

    #[test]
    fn indices_follow_creation_order() {
        let mut alloc = SegmentAllocator::new();
        let indices: Vec<u32> = (0..10)
            .map(|i| {
                let class = if i % 2 == 0 {
                    MemoryClass::HEAD
                } else {
                    MemoryClass::CPU
                };
                alloc.create(i * 3, class, 8, 8).unwrap().index()
            })
            .collect();

        assert_eq!(indices, (0..10).collect::<Vec<u32>>());
        assert_eq!(alloc.len(), 10);
    }

    #[test]
    fn zero_alignment_is_rejected() {
        let mut alloc = SegmentAllocator::new();
        assert!(matches!(
            alloc.create(16, MemoryClass::HEAD, 0, 8),
            Err(SegmentError::ZeroAlignment)
        ));
        assert!(matches!(
            alloc.create(16, MemoryClass::HEAD, 8, 0),
            Err(SegmentError::ZeroAlignment)
        ));
        assert!(alloc.is_empty());
    }

    #[test]
    fn size_overflow_is_rejected() {
        let mut alloc = SegmentAllocator::new();
        assert!(matches!(
            alloc.create(u64::MAX, MemoryClass::HEAD, 16, 16),
            Err(SegmentError::SizeOverflow { .. })
        ));
        assert!(matches!(
            alloc.create(u64::from(u32::MAX) + 1, MemoryClass::HEAD, 1, 1),
            Err(SegmentError::SizeOverflow { .. })
        ));
        assert!(alloc.is_empty());
        assert!(alloc.pools().is_empty());
    }

    #[test]
    fn index_space_is_bounded() {
        let mut alloc = SegmentAllocator::new();
        for _ in 0..MAX_SEGMENTS {
            alloc.create(0, MemoryClass::TEMP, 1, 1).unwrap();
        }
        assert!(matches!(
            alloc.create(0, MemoryClass::TEMP, 1, 1),
            Err(SegmentError::IndexOverflow { .. })
        ));
    }

    #[test]
    fn pools_group_by_class_and_alignment() {
        let mut alloc = SegmentAllocator::new();
        let a = alloc.create(10, MemoryClass::HEAD, 8, 8).unwrap();
        let b = alloc.create(20, MemoryClass::CPU, 16, 16).unwrap();
        let c = alloc.create(30, MemoryClass::HEAD, 8, 8).unwrap();
        let d = alloc.create(1, MemoryClass::HEAD, 4, 8).unwrap();
        let e = alloc.create(1, MemoryClass::CPU, 16, 64).unwrap();

        assert_eq!(a.pool(), c.pool());
        assert_eq!(a.pool(), d.pool());
        assert_ne!(a.pool(), b.pool());
        assert_ne!(b.pool(), e.pool());

        let pools = alloc.pools();
        assert_eq!(pools.len(), 3);
        assert_eq!(pools[a.pool() as usize].size, 16 + 32 + 4);
        assert_eq!(pools[b.pool() as usize].size, 32);
        assert_eq!(pools[e.pool() as usize].alignment, 64);
    }

    #[test]
    fn padding_helper() {
        let mut buf = vec![1u8; 5];
        pad_to_alignment(&mut buf, 4);
        assert_eq!(buf, [1, 1, 1, 1, 1, 0, 0, 0]);

        pad_to_alignment(&mut buf, 4);
        assert_eq!(buf.len(), 8);

        let mut empty = Vec::new();
        pad_to_alignment(&mut empty, 4096);
        assert!(empty.is_empty());

        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(1, 4096), Some(4096));
        assert_eq!(align_up(u64::MAX, 2), None);
    }

    #[test]
    #[should_panic]
    fn ptr_outside_segment_panics() {
        let mut alloc = SegmentAllocator::new();
        let segment = alloc.create(8, MemoryClass::HEAD, 8, 8).unwrap();
        segment.ptr(8);
    }
}
