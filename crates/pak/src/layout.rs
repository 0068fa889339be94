//! On-disk records of the container.
//!
//! All integers are little-endian. Every record is written field by field,
//! reserved bytes included, so the layout never depends on struct padding.

use std::{
    io::{self, Read, Write},
    time::{SystemTime, UNIX_EPOCH},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{guid::Guid, reloc::PagePtr, segment::MemoryClass};

pub const PAK_MAGIC: u32 = u32::from_le_bytes(*b"RPak");
pub const PAK_VERSION: u16 = 8;

pub const HEADER_SIZE: usize = 0x80;
pub const POOL_RECORD_SIZE: usize = 16;
pub const SEGMENT_RECORD_SIZE: usize = 12;
pub const ASSET_RECORD_SIZE: usize = 0x50;
pub const RELATION_SIZE: usize = 4;

const HEADER_RESERVED: usize = 0x1c;

/// 100-nanosecond intervals since 1601-01-01 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileTime(pub u64);

impl FileTime {
    /// `UNIX_EPOCH` expressed as [`FileTime`].
    pub const UNIX_EPOCH: FileTime = FileTime(116_444_736_000_000_000);

    pub fn now() -> Self {
        FileTime::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let epoch = Self::UNIX_EPOCH.0;
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => FileTime(epoch + (since.as_nanos() / 100) as u64),
            Err(err) => FileTime(epoch.saturating_sub((err.duration().as_nanos() / 100) as u64)),
        }
    }
}

/// Fixed-size container header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PakHeader {
    pub version: u16,
    pub flags: u16,
    pub file_time: FileTime,
    pub checksum: u64,
    pub compressed_size: u64,
    pub embedded_starpak_offset: u64,
    pub decompressed_size: u64,
    pub embedded_starpak_size: u64,
    pub starpak_paths_size: u16,
    pub opt_starpak_paths_size: u16,
    pub pool_count: u16,
    pub segment_count: u16,
    pub patch_index: u16,
    pub alignment: u16,
    pub pointer_count: u32,
    pub asset_count: u32,
    pub guid_descriptor_count: u32,
    pub relation_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Not a pak file, magic is {found:#010x}")]
    BadMagic { found: u32 },

    #[error("Unsupported pak version {found}, expected {PAK_VERSION}")]
    BadVersion { found: u16 },
}

impl PakHeader {
    pub fn write<W: Write>(&self, mut out: W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(PAK_MAGIC)?;
        out.write_u16::<LittleEndian>(self.version)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u64::<LittleEndian>(self.file_time.0)?;
        out.write_u64::<LittleEndian>(self.checksum)?;
        out.write_u64::<LittleEndian>(self.compressed_size)?;
        out.write_u64::<LittleEndian>(self.embedded_starpak_offset)?;
        out.write_u64::<LittleEndian>(0)?;
        out.write_u64::<LittleEndian>(self.decompressed_size)?;
        out.write_u64::<LittleEndian>(self.embedded_starpak_size)?;
        out.write_u64::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(self.starpak_paths_size)?;
        out.write_u16::<LittleEndian>(self.opt_starpak_paths_size)?;
        out.write_u16::<LittleEndian>(self.pool_count)?;
        out.write_u16::<LittleEndian>(self.segment_count)?;
        out.write_u16::<LittleEndian>(self.patch_index)?;
        out.write_u16::<LittleEndian>(self.alignment)?;
        out.write_u32::<LittleEndian>(self.pointer_count)?;
        out.write_u32::<LittleEndian>(self.asset_count)?;
        out.write_u32::<LittleEndian>(self.guid_descriptor_count)?;
        out.write_u32::<LittleEndian>(self.relation_count)?;
        out.write_all(&[0; HEADER_RESERVED])
    }

    pub fn read<R: Read>(mut input: R) -> Result<Self, HeaderError> {
        let magic = input.read_u32::<LittleEndian>()?;
        if magic != PAK_MAGIC {
            return Err(HeaderError::BadMagic { found: magic });
        }

        let version = input.read_u16::<LittleEndian>()?;
        if version != PAK_VERSION {
            return Err(HeaderError::BadVersion { found: version });
        }

        let flags = input.read_u16::<LittleEndian>()?;
        let file_time = FileTime(input.read_u64::<LittleEndian>()?);
        let checksum = input.read_u64::<LittleEndian>()?;
        let compressed_size = input.read_u64::<LittleEndian>()?;
        let embedded_starpak_offset = input.read_u64::<LittleEndian>()?;
        let _reserved = input.read_u64::<LittleEndian>()?;
        let decompressed_size = input.read_u64::<LittleEndian>()?;
        let embedded_starpak_size = input.read_u64::<LittleEndian>()?;
        let _reserved = input.read_u64::<LittleEndian>()?;
        let starpak_paths_size = input.read_u16::<LittleEndian>()?;
        let opt_starpak_paths_size = input.read_u16::<LittleEndian>()?;
        let pool_count = input.read_u16::<LittleEndian>()?;
        let segment_count = input.read_u16::<LittleEndian>()?;
        let patch_index = input.read_u16::<LittleEndian>()?;
        let alignment = input.read_u16::<LittleEndian>()?;
        let pointer_count = input.read_u32::<LittleEndian>()?;
        let asset_count = input.read_u32::<LittleEndian>()?;
        let guid_descriptor_count = input.read_u32::<LittleEndian>()?;
        let relation_count = input.read_u32::<LittleEndian>()?;

        let mut reserved = [0; HEADER_RESERVED];
        input.read_exact(&mut reserved)?;

        Ok(PakHeader {
            version,
            flags,
            file_time,
            checksum,
            compressed_size,
            embedded_starpak_offset,
            decompressed_size,
            embedded_starpak_size,
            starpak_paths_size,
            opt_starpak_paths_size,
            pool_count,
            segment_count,
            patch_index,
            alignment,
            pointer_count,
            asset_count,
            guid_descriptor_count,
            relation_count,
        })
    }
}

/// Memory pool record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolRecord {
    pub class: MemoryClass,
    pub alignment: u32,
    pub size: u64,
}

impl PoolRecord {
    pub fn write<W: Write>(&self, mut out: W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.class.bits())?;
        out.write_u32::<LittleEndian>(self.alignment)?;
        out.write_u64::<LittleEndian>(self.size)
    }

    pub fn read<R: Read>(mut input: R) -> io::Result<Self> {
        let class = MemoryClass::from_bits_retain(input.read_u32::<LittleEndian>()?);
        let alignment = input.read_u32::<LittleEndian>()?;
        let size = input.read_u64::<LittleEndian>()?;
        Ok(PoolRecord {
            class,
            alignment,
            size,
        })
    }
}

/// Per-segment record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentRecord {
    pub pool: u32,
    pub alignment: u32,
    pub size: u32,
}

impl SegmentRecord {
    pub fn write<W: Write>(&self, mut out: W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.pool)?;
        out.write_u32::<LittleEndian>(self.alignment)?;
        out.write_u32::<LittleEndian>(self.size)
    }

    pub fn read<R: Read>(mut input: R) -> io::Result<Self> {
        let pool = input.read_u32::<LittleEndian>()?;
        let alignment = input.read_u32::<LittleEndian>()?;
        let size = input.read_u32::<LittleEndian>()?;
        Ok(SegmentRecord {
            pool,
            alignment,
            size,
        })
    }
}

/// Per-asset record of the asset table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssetRecord {
    pub guid: Guid,
    pub head: PagePtr,
    pub cpu: PagePtr,
    pub starpak_offset: i64,
    pub opt_starpak_offset: i64,

    /// Highest segment index the asset touches, plus one.
    pub page_end: u16,

    /// Number of in-container assets this asset depends on.
    pub dependency_count: u16,

    pub relations_start: u32,
    pub uses_start: u32,
    pub relations_count: u32,
    pub uses_count: u32,
    pub header_size: u32,
    pub version: u32,
    pub ty: u32,
}

impl AssetRecord {
    pub fn write<W: Write>(&self, mut out: W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.guid.value())?;
        out.write_u64::<LittleEndian>(0)?;
        self.head.write(&mut out)?;
        self.cpu.write(&mut out)?;
        out.write_i64::<LittleEndian>(self.starpak_offset)?;
        out.write_i64::<LittleEndian>(self.opt_starpak_offset)?;
        out.write_u16::<LittleEndian>(self.page_end)?;
        out.write_u16::<LittleEndian>(self.dependency_count)?;
        out.write_u32::<LittleEndian>(self.relations_start)?;
        out.write_u32::<LittleEndian>(self.uses_start)?;
        out.write_u32::<LittleEndian>(self.relations_count)?;
        out.write_u32::<LittleEndian>(self.uses_count)?;
        out.write_u32::<LittleEndian>(self.header_size)?;
        out.write_u32::<LittleEndian>(self.version)?;
        out.write_u32::<LittleEndian>(self.ty)
    }

    pub fn read<R: Read>(mut input: R) -> io::Result<Self> {
        let guid = Guid(input.read_u64::<LittleEndian>()?);
        let _reserved = input.read_u64::<LittleEndian>()?;
        let head = PagePtr::read(&mut input)?;
        let cpu = PagePtr::read(&mut input)?;
        let starpak_offset = input.read_i64::<LittleEndian>()?;
        let opt_starpak_offset = input.read_i64::<LittleEndian>()?;
        let page_end = input.read_u16::<LittleEndian>()?;
        let dependency_count = input.read_u16::<LittleEndian>()?;
        let relations_start = input.read_u32::<LittleEndian>()?;
        let uses_start = input.read_u32::<LittleEndian>()?;
        let relations_count = input.read_u32::<LittleEndian>()?;
        let uses_count = input.read_u32::<LittleEndian>()?;
        let header_size = input.read_u32::<LittleEndian>()?;
        let version = input.read_u32::<LittleEndian>()?;
        let ty = input.read_u32::<LittleEndian>()?;

        Ok(AssetRecord {
            guid,
            head,
            cpu,
            starpak_offset,
            opt_starpak_offset,
            page_end,
            dependency_count,
            relations_start,
            uses_start,
            relations_count,
            uses_count,
            header_size,
            version,
            ty,
        })
    }
}
