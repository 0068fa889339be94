//! Container serialization.
//!
//! File order:
//! header, streaming file paths, optional streaming file paths,
//! pools, segments, pointers, asset records, GUID descriptors, relations,
//! and finally raw data of every segment in segment order.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    layout::{
        AssetRecord, FileTime, HeaderError, PakHeader, PoolRecord, SegmentRecord, PAK_VERSION,
    },
    reloc::PagePtr,
};

/// Fully resolved container contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PakImage {
    pub starpak_paths: Vec<String>,
    pub opt_starpak_paths: Vec<String>,
    pub pools: Vec<PoolRecord>,
    pub segments: Vec<SegmentRecord>,
    pub pointers: Vec<PagePtr>,
    pub assets: Vec<AssetRecord>,
    pub uses: Vec<PagePtr>,
    pub relations: Vec<u32>,

    /// Raw data of each segment, padded to segment size.
    pub data: Vec<Box<[u8]>>,
}

#[derive(Debug, thiserror::Error)]
pub enum PakReadError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("Failed to read pak tables. {0}")]
    Io(#[from] io::Error),

    #[error("Pak is corrupt. {reason}")]
    Corrupt { reason: String },
}

/// Size of the NUL-terminated path table.
pub fn path_table_size(paths: &[String]) -> usize {
    paths.iter().map(|path| path.len() + 1).sum()
}

fn count<T>(len: usize, what: &str) -> io::Result<T>
where
    T: TryFrom<usize>,
{
    T::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Too many {what} for the pak header: {len}"),
        )
    })
}

fn write_paths<W: Write>(out: &mut W, paths: &[String]) -> io::Result<()> {
    for path in paths {
        out.write_all(path.as_bytes())?;
        out.write_u8(0)?;
    }
    Ok(())
}

impl PakImage {
    /// Builds the header describing this image.
    /// Sizes and timestamp are left zeroed.
    pub fn header(&self) -> io::Result<PakHeader> {
        Ok(PakHeader {
            version: PAK_VERSION,
            starpak_paths_size: count(path_table_size(&self.starpak_paths), "streaming path bytes")?,
            opt_starpak_paths_size: count(
                path_table_size(&self.opt_starpak_paths),
                "optional streaming path bytes",
            )?,
            pool_count: count(self.pools.len(), "pools")?,
            segment_count: count(self.segments.len(), "segments")?,
            pointer_count: count(self.pointers.len(), "pointers")?,
            asset_count: count(self.assets.len(), "assets")?,
            guid_descriptor_count: count(self.uses.len(), "GUID descriptors")?,
            relation_count: count(self.relations.len(), "relations")?,
            ..PakHeader::default()
        })
    }

    /// Writes the container and patches sizes and timestamp into the header.
    ///
    /// Writing starts at the current position of `out`.
    pub fn write<W>(&self, mut out: W, file_time: FileTime) -> io::Result<PakHeader>
    where
        W: Write + Seek,
    {
        let mut header = self.header()?;
        let start = out.stream_position()?;
        header.write(&mut out)?;

        write_paths(&mut out, &self.starpak_paths)?;
        write_paths(&mut out, &self.opt_starpak_paths)?;

        for pool in &self.pools {
            pool.write(&mut out)?;
        }
        for segment in &self.segments {
            segment.write(&mut out)?;
        }
        for ptr in &self.pointers {
            ptr.write(&mut out)?;
        }
        for asset in &self.assets {
            asset.write(&mut out)?;
        }
        for ptr in &self.uses {
            ptr.write(&mut out)?;
        }
        for &relation in &self.relations {
            out.write_u32::<LittleEndian>(relation)?;
        }
        for block in &self.data {
            out.write_all(block)?;
        }

        let end = out.stream_position()?;
        header.compressed_size = end - start;
        header.decompressed_size = end - start;
        header.file_time = file_time;

        out.seek(SeekFrom::Start(start))?;
        header.write(&mut out)?;
        out.seek(SeekFrom::Start(end))?;
        out.flush()?;

        Ok(header)
    }

    /// Parses container written by [`PakImage::write`].
    pub fn read<R>(mut input: R) -> Result<(PakHeader, PakImage), PakReadError>
    where
        R: Read + Seek,
    {
        let start = input.stream_position()?;
        let len = input.seek(SeekFrom::End(0))?;
        input.seek(SeekFrom::Start(start))?;

        let header = PakHeader::read(&mut input)?;
        if header.decompressed_size > len.saturating_sub(start) {
            return Err(PakReadError::Corrupt {
                reason: format!(
                    "header declares {} bytes but only {} are available",
                    header.decompressed_size,
                    len.saturating_sub(start)
                ),
            });
        }

        let starpak_paths = read_paths(&mut input, header.starpak_paths_size)?;
        let opt_starpak_paths = read_paths(&mut input, header.opt_starpak_paths_size)?;

        let pools = (0..header.pool_count)
            .map(|_| PoolRecord::read(&mut input))
            .collect::<io::Result<Vec<_>>>()?;
        let segments = (0..header.segment_count)
            .map(|_| SegmentRecord::read(&mut input))
            .collect::<io::Result<Vec<_>>>()?;
        let pointers = (0..header.pointer_count)
            .map(|_| PagePtr::read(&mut input))
            .collect::<io::Result<Vec<_>>>()?;
        let assets = (0..header.asset_count)
            .map(|_| AssetRecord::read(&mut input))
            .collect::<io::Result<Vec<_>>>()?;
        let uses = (0..header.guid_descriptor_count)
            .map(|_| PagePtr::read(&mut input))
            .collect::<io::Result<Vec<_>>>()?;
        let relations = (0..header.relation_count)
            .map(|_| input.read_u32::<LittleEndian>())
            .collect::<io::Result<Vec<_>>>()?;

        let data_size: u64 = segments.iter().map(|segment| u64::from(segment.size)).sum();
        let remaining = len.saturating_sub(input.stream_position()?);
        if data_size > remaining {
            return Err(PakReadError::Corrupt {
                reason: format!(
                    "segments declare {data_size} bytes of data but only {remaining} remain"
                ),
            });
        }

        let mut data = Vec::with_capacity(segments.len());
        for segment in &segments {
            let mut block = vec![0; segment.size as usize];
            input.read_exact(&mut block)?;
            data.push(block.into_boxed_slice());
        }

        let end = input.stream_position()?;
        if end - start != header.decompressed_size {
            return Err(PakReadError::Corrupt {
                reason: format!(
                    "header declares {} bytes but tables and data take {}",
                    header.decompressed_size,
                    end - start
                ),
            });
        }

        let image = PakImage {
            starpak_paths,
            opt_starpak_paths,
            pools,
            segments,
            pointers,
            assets,
            uses,
            relations,
            data,
        };
        image.validate()?;

        Ok((header, image))
    }

    /// Checks cross-table references.
    fn validate(&self) -> Result<(), PakReadError> {
        let segment_count = self.segments.len() as u32;
        let corrupt = |reason: String| Err(PakReadError::Corrupt { reason });

        for segment in &self.segments {
            if segment.pool as usize >= self.pools.len() {
                return corrupt(format!("segment refers to missing pool {}", segment.pool));
            }
        }

        for ptr in self.pointers.iter().chain(&self.uses) {
            let fits = self
                .segments
                .get(ptr.index as usize)
                .map_or(false, |segment| u64::from(ptr.offset) + 8 <= u64::from(segment.size));
            if !fits {
                return corrupt(format!(
                    "descriptor {}:{:#x} is outside its segment",
                    ptr.index, ptr.offset
                ));
            }
        }

        for asset in &self.assets {
            let head_ok = asset.head.index < segment_count;
            let cpu_ok = asset.cpu.is_null() || asset.cpu.index < segment_count;
            let uses_ok = u64::from(asset.uses_start) + u64::from(asset.uses_count)
                <= self.uses.len() as u64;
            let relations_ok = u64::from(asset.relations_start)
                + u64::from(asset.relations_count)
                <= self.relations.len() as u64;

            if !(head_ok && cpu_ok && uses_ok && relations_ok) {
                return corrupt(format!("asset {} has out of range references", asset.guid));
            }
        }

        if let Some(&relation) = self
            .relations
            .iter()
            .find(|&&relation| relation as usize >= self.assets.len())
        {
            return corrupt(format!("relation names missing asset {relation}"));
        }

        Ok(())
    }
}

fn read_paths<R: Read>(input: &mut R, size: u16) -> Result<Vec<String>, PakReadError> {
    let mut buf = vec![0; size as usize];
    input.read_exact(&mut buf)?;

    let mut paths = Vec::new();
    let mut rest = &buf[..];
    while let Some(end) = rest.iter().position(|&b| b == 0) {
        let path = std::str::from_utf8(&rest[..end]).map_err(|_| PakReadError::Corrupt {
            reason: "path table is not UTF-8".to_owned(),
        })?;
        paths.push(path.to_owned());
        rest = &rest[end + 1..];
    }

    if !rest.is_empty() {
        return Err(PakReadError::Corrupt {
            reason: "path table is not NUL-terminated".to_owned(),
        });
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{guid::Guid, layout::POOL_RECORD_SIZE, segment::MemoryClass};

    fn image() -> PakImage {
        PakImage {
            starpak_paths: vec!["paks/Win64/common.starpak".to_owned()],
            opt_starpak_paths: vec![],
            pools: vec![PoolRecord {
                class: MemoryClass::HEAD,
                alignment: 8,
                size: 24,
            }],
            segments: vec![
                SegmentRecord {
                    pool: 0,
                    alignment: 8,
                    size: 16,
                },
                SegmentRecord {
                    pool: 0,
                    alignment: 8,
                    size: 8,
                },
            ],
            pointers: vec![PagePtr::new(0, 0)],
            assets: vec![
                AssetRecord {
                    guid: Guid(1),
                    head: PagePtr::new(0, 0),
                    cpu: PagePtr::NULL,
                    starpak_offset: 0x1000,
                    opt_starpak_offset: -1,
                    page_end: 1,
                    dependency_count: 0,
                    relations_start: 0,
                    uses_start: 0,
                    relations_count: 1,
                    uses_count: 0,
                    header_size: 16,
                    version: 1,
                    ty: u32::from_le_bytes(*b"blob"),
                },
                AssetRecord {
                    guid: Guid(2),
                    head: PagePtr::new(1, 0),
                    cpu: PagePtr::NULL,
                    starpak_offset: -1,
                    opt_starpak_offset: -1,
                    page_end: 2,
                    dependency_count: 1,
                    relations_start: 1,
                    uses_start: 0,
                    relations_count: 0,
                    uses_count: 1,
                    header_size: 8,
                    version: 1,
                    ty: u32::from_le_bytes(*b"blob"),
                },
            ],
            uses: vec![PagePtr::new(1, 0)],
            relations: vec![1],
            data: vec![
                vec![0x11; 16].into_boxed_slice(),
                vec![1, 0, 0, 0, 0, 0, 0, 0].into_boxed_slice(),
            ],
        }
    }

    #[test]
    fn header_is_patched() {
        let image = image();
        let mut out = Cursor::new(Vec::new());
        let header = image.write(&mut out, FileTime::UNIX_EPOCH).unwrap();
        let bytes = out.into_inner();

        assert_eq!(header.compressed_size, bytes.len() as u64);
        assert_eq!(header.decompressed_size, bytes.len() as u64);
        assert_eq!(&bytes[..4], b"RPak");
        assert_eq!(
            u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            116_444_736_000_000_000
        );
        assert_eq!(
            u64::from_le_bytes(bytes[0x18..0x20].try_into().unwrap()),
            bytes.len() as u64
        );
        assert_eq!(
            u64::from_le_bytes(bytes[0x30..0x38].try_into().unwrap()),
            bytes.len() as u64
        );

        // Path table right after the header.
        assert_eq!(&bytes[0x80..0x80 + 26], b"paks/Win64/common.starpak\0");

        // Raw data is last.
        assert_eq!(&bytes[bytes.len() - 24..bytes.len() - 8], &[0x11; 16]);
    }

    #[test]
    fn tables_read_back() {
        let image = image();
        let mut out = Cursor::new(Vec::new());
        let written = image.write(&mut out, FileTime(42)).unwrap();

        out.set_position(0);
        let (header, read) = PakImage::read(out).unwrap();
        assert_eq!(header, written);
        assert_eq!(read, image);
    }

    #[test]
    fn truncated_pak_is_rejected() {
        let mut out = Cursor::new(Vec::new());
        image().write(&mut out, FileTime(0)).unwrap();

        let mut bytes = out.into_inner();
        bytes.truncate(bytes.len() - 1);
        assert!(PakImage::read(Cursor::new(bytes)).is_err());
    }

    #[test]
    fn oversized_declarations_are_rejected() {
        let mut out = Cursor::new(Vec::new());
        image().write(&mut out, FileTime(0)).unwrap();
        let bytes = out.into_inner();

        // Size field of the first segment record.
        let size_at = 0x80 + 26 + POOL_RECORD_SIZE + 8;
        assert_eq!(&bytes[size_at..size_at + 4], &16u32.to_le_bytes());

        let mut huge_segment = bytes.clone();
        huge_segment[size_at..size_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            PakImage::read(Cursor::new(huge_segment)),
            Err(PakReadError::Corrupt { .. })
        ));

        let mut huge_file = bytes;
        huge_file[0x30..0x38].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            PakImage::read(Cursor::new(huge_file)),
            Err(PakReadError::Corrupt { .. })
        ));
    }

    #[test]
    fn path_table_sizes() {
        assert_eq!(path_table_size(&[]), 0);
        assert_eq!(path_table_size(&["a".to_owned(), "bc".to_owned()]), 5);
    }
}
