//! Raw data store.
//!
//! Holds the bytes of every segment until the container is written.

use crate::segment::{pad_to_alignment, Segment};

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Data block of {len} bytes does not fit into segment {segment} of {size} bytes")]
    Oversized { segment: u32, len: usize, size: u64 },

    #[error("Segment {segment} already has a data block")]
    Duplicate { segment: u32 },

    #[error("Segment {segment} has no data block")]
    Missing { segment: u32 },

    #[error("Data block for unknown segment {segment}")]
    UnknownSegment { segment: u32 },
}

/// One data block per segment, indexed by segment index.
#[derive(Debug, Default)]
pub struct RawDataStore {
    blocks: Vec<Option<Box<[u8]>>>,
}

impl RawDataStore {
    pub fn new() -> Self {
        RawDataStore::default()
    }

    /// Stores data of `segment`.
    ///
    /// Bytes shorter than the segment are zero-padded to its padded size.
    pub fn add_block(&mut self, segment: &Segment, mut bytes: Vec<u8>) -> Result<(), DataError> {
        let index = segment.index() as usize;

        if bytes.len() as u64 > segment.padded_size() {
            return Err(DataError::Oversized {
                segment: segment.index(),
                len: bytes.len(),
                size: segment.padded_size(),
            });
        }

        if self.blocks.len() <= index {
            self.blocks.resize(index + 1, None);
        }

        if self.blocks[index].is_some() {
            return Err(DataError::Duplicate {
                segment: segment.index(),
            });
        }

        pad_to_alignment(&mut bytes, segment.alignment() as usize);
        bytes.resize(segment.padded_size() as usize, 0);

        self.blocks[index] = Some(bytes.into_boxed_slice());
        Ok(())
    }

    pub fn get(&self, segment: u32) -> Option<&[u8]> {
        self.blocks.get(segment as usize)?.as_deref()
    }

    /// Total size of stored data.
    pub fn total_size(&self) -> u64 {
        self.blocks
            .iter()
            .flatten()
            .map(|block| block.len() as u64)
            .sum()
    }

    /// Releases blocks in segment order.
    ///
    /// Fails unless every one of `segments` has exactly one block.
    pub fn into_blocks(self, segments: &[Segment]) -> Result<Vec<Box<[u8]>>, DataError> {
        if self.blocks.len() > segments.len() {
            return Err(DataError::UnknownSegment {
                segment: segments.len() as u32,
            });
        }

        let mut blocks = self.blocks;
        blocks.resize(segments.len(), None);

        blocks
            .into_iter()
            .zip(segments)
            .map(|(block, segment)| match block {
                Some(block) if block.len() as u64 == segment.padded_size() => Ok(block),
                Some(block) => Err(DataError::Oversized {
                    segment: segment.index(),
                    len: block.len(),
                    size: segment.padded_size(),
                }),
                None => Err(DataError::Missing {
                    segment: segment.index(),
                }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{MemoryClass, SegmentAllocator};

    #[test]
    fn blocks_are_padded_to_segment_size() {
        let mut alloc = SegmentAllocator::new();
        let head = alloc.create(10, MemoryClass::HEAD, 8, 8).unwrap();
        let cpu = alloc.create(3, MemoryClass::CPU, 64, 64).unwrap();

        let mut store = RawDataStore::new();
        store.add_block(&cpu, vec![1, 2, 3]).unwrap();
        store.add_block(&head, vec![9; 10]).unwrap();

        assert_eq!(store.get(head.index()).unwrap().len(), 16);
        assert_eq!(store.total_size(), 16 + 64);

        let blocks = store.into_blocks(alloc.segments()).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(&blocks[0][..10], &[9; 10]);
        assert_eq!(&blocks[0][10..], &[0; 6]);
        assert_eq!(&blocks[1][..3], &[1, 2, 3]);
        assert!(blocks[1][3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn one_block_per_segment() {
        let mut alloc = SegmentAllocator::new();
        let head = alloc.create(8, MemoryClass::HEAD, 8, 8).unwrap();

        let mut store = RawDataStore::new();
        store.add_block(&head, vec![0; 8]).unwrap();
        assert!(matches!(
            store.add_block(&head, vec![0; 8]),
            Err(DataError::Duplicate { segment: 0 })
        ));
    }

    #[test]
    fn oversized_block_is_rejected() {
        let mut alloc = SegmentAllocator::new();
        let head = alloc.create(8, MemoryClass::HEAD, 8, 8).unwrap();

        let mut store = RawDataStore::new();
        assert!(matches!(
            store.add_block(&head, vec![0; 9]),
            Err(DataError::Oversized { .. })
        ));
    }

    #[test]
    fn missing_block_is_reported() {
        let mut alloc = SegmentAllocator::new();
        let head = alloc.create(8, MemoryClass::HEAD, 8, 8).unwrap();
        alloc.create(8, MemoryClass::CPU, 8, 8).unwrap();

        let mut store = RawDataStore::new();
        store.add_block(&head, vec![0; 8]).unwrap();
        assert!(matches!(
            store.into_blocks(alloc.segments()),
            Err(DataError::Missing { segment: 1 })
        ));
    }
}
