//! Streaming files.
//!
//! Layout:
//!
//! | offset      | content                                        |
//! |-------------|------------------------------------------------|
//! | 0           | magic `SRPk`                                   |
//! | 4           | version, always 1                              |
//! | 8           | 4088 bytes of `0xCB`                           |
//! | 4096        | payloads, each zero-padded to 4096 bytes       |
//! | end - 8 - N | N = count * 16 bytes of `{offset u64, size u64}` |
//! | end - 8     | entry count u64                                |

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::segment::align_up;

pub const STARPAK_MAGIC: u32 = u32::from_le_bytes(*b"SRPk");
pub const STARPAK_VERSION: u32 = 1;

/// Alignment of every payload in the file.
pub const STARPAK_ALIGNMENT: u64 = 4096;

/// Offset of the first payload.
pub const STARPAK_DATA_START: u64 = 4096;

const FILLER: u8 = 0xCB;
const TRAILER_RECORD_SIZE: u64 = 16;

/// Maximum number of streaming files one container may reference.
/// Path index is stored in the low bits of 4096-aligned offsets.
pub const MAX_STREAMING_FILES: usize = STARPAK_ALIGNMENT as usize;

#[derive(Debug, thiserror::Error)]
pub enum StarpakError {
    #[error("Streaming file I/O failed. {0}")]
    Io(#[from] io::Error),

    #[error("Not a streaming file, magic is {found:#010x}")]
    BadMagic { found: u32 },

    #[error("Unsupported streaming file version {found}")]
    BadVersion { found: u32 },

    #[error("Streaming file is corrupt. {reason}")]
    Corrupt { reason: String },
}

/// Payload placement inside a streaming file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StarpakEntry {
    /// Offset from the file start. Multiple of [`STARPAK_ALIGNMENT`].
    pub offset: u64,

    /// Padded size. Multiple of [`STARPAK_ALIGNMENT`].
    pub size: u64,
}

/// Reference from an asset to a payload in one of the container's streaming files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamRef {
    /// Index of the streaming file in the container's path table.
    pub file: u16,

    /// Payload offset in that file.
    pub offset: u64,
}

impl StreamRef {
    /// Encoded value of an absent reference.
    pub const NONE: i64 = -1;

    /// Packs file index into the low bits of the aligned offset.
    pub fn encode(&self) -> i64 {
        debug_assert_eq!(self.offset % STARPAK_ALIGNMENT, 0);
        debug_assert!((self.file as usize) < MAX_STREAMING_FILES);
        (self.offset | u64::from(self.file)) as i64
    }

    pub fn encode_opt(stream: Option<StreamRef>) -> i64 {
        match stream {
            None => Self::NONE,
            Some(stream) => stream.encode(),
        }
    }

    pub fn decode(value: i64) -> Option<StreamRef> {
        if value < 0 {
            return None;
        }
        let value = value as u64;
        Some(StreamRef {
            file: (value % STARPAK_ALIGNMENT) as u16,
            offset: value - value % STARPAK_ALIGNMENT,
        })
    }
}

/// Space a payload of `len` bytes takes in a streaming file.
/// Empty payloads still take one block so offsets stay distinct.
pub fn padded_payload_size(len: u64) -> Option<u64> {
    align_up(len.max(1), STARPAK_ALIGNMENT)
}

/// Writes payloads into a streaming file.
pub struct StarpakWriter<W: Write> {
    out: W,
    cursor: u64,
    entries: Vec<StarpakEntry>,
}

impl<W: Write> StarpakWriter<W> {
    /// Writes the reserved header and prepares for payloads.
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_u32::<LittleEndian>(STARPAK_MAGIC)?;
        out.write_u32::<LittleEndian>(STARPAK_VERSION)?;
        io::copy(&mut io::repeat(FILLER).take(STARPAK_DATA_START - 8), &mut out)?;

        Ok(StarpakWriter {
            out,
            cursor: STARPAK_DATA_START,
            entries: Vec::new(),
        })
    }

    /// Appends payload padded to [`STARPAK_ALIGNMENT`].
    /// Returns the offset of the payload.
    pub fn add_payload(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let len = bytes.len() as u64;
        let size = padded_payload_size(len)
            .filter(|size| self.cursor.checked_add(*size).is_some())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Streaming file overflow"))?;

        let offset = self.cursor;
        self.out.write_all(bytes)?;
        io::copy(&mut io::repeat(0).take(size - len), &mut self.out)?;

        self.cursor += size;
        self.entries.push(StarpakEntry { offset, size });
        Ok(offset)
    }

    /// Offset the next payload will be placed at.
    pub fn next_offset(&self) -> u64 {
        self.cursor
    }

    pub fn entries(&self) -> &[StarpakEntry] {
        &self.entries
    }

    /// Writes the trailer and returns the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        for entry in &self.entries {
            self.out.write_u64::<LittleEndian>(entry.offset)?;
            self.out.write_u64::<LittleEndian>(entry.size)?;
        }
        self.out
            .write_u64::<LittleEndian>(self.entries.len() as u64)?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads streaming file back through its trailer.
pub struct StarpakReader<R> {
    input: R,
    len: u64,
}

impl<R> StarpakReader<R>
where
    R: Read + Seek,
{
    /// Validates the file header.
    pub fn new(mut input: R) -> Result<Self, StarpakError> {
        let len = input.seek(SeekFrom::End(0))?;
        if len < STARPAK_DATA_START + 8 {
            return Err(StarpakError::Corrupt {
                reason: format!("file of {len} bytes is too short"),
            });
        }

        input.seek(SeekFrom::Start(0))?;
        let magic = input.read_u32::<LittleEndian>()?;
        if magic != STARPAK_MAGIC {
            return Err(StarpakError::BadMagic { found: magic });
        }
        let version = input.read_u32::<LittleEndian>()?;
        if version != STARPAK_VERSION {
            return Err(StarpakError::BadVersion { found: version });
        }

        Ok(StarpakReader { input, len })
    }

    /// Reads the trailer.
    pub fn entries(&mut self) -> Result<Vec<StarpakEntry>, StarpakError> {
        self.input.seek(SeekFrom::Start(self.len - 8))?;
        let count = self.input.read_u64::<LittleEndian>()?;

        let data_end = count
            .checked_mul(TRAILER_RECORD_SIZE)
            .and_then(|table| (self.len - 8).checked_sub(table))
            .filter(|&end| end >= STARPAK_DATA_START)
            .ok_or_else(|| StarpakError::Corrupt {
                reason: format!("trailer of {count} entries does not fit"),
            })?;

        self.input.seek(SeekFrom::Start(data_end))?;

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = self.input.read_u64::<LittleEndian>()?;
            let size = self.input.read_u64::<LittleEndian>()?;

            let valid = offset >= STARPAK_DATA_START
                && offset % STARPAK_ALIGNMENT == 0
                && offset.checked_add(size).map_or(false, |end| end <= data_end);

            if !valid {
                return Err(StarpakError::Corrupt {
                    reason: format!("entry at {offset:#x} of {size} bytes is out of bounds"),
                });
            }

            entries.push(StarpakEntry { offset, size });
        }

        Ok(entries)
    }

    /// Reads payload bytes, including padding.
    pub fn read_payload(&mut self, entry: &StarpakEntry) -> Result<Vec<u8>, StarpakError> {
        self.input.seek(SeekFrom::Start(entry.offset))?;
        let mut bytes = vec![0; entry.size as usize];
        self.input.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    pub fn into_inner(self) -> R {
        self.input
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rand::{Rng, RngCore};

    use super::*;

    #[test]
    fn reserved_header_layout() {
        let out = StarpakWriter::new(Vec::new()).unwrap().finish().unwrap();

        assert_eq!(out.len(), 4096 + 8);
        assert_eq!(&out[0..4], b"SRPk");
        assert_eq!(&out[4..8], &[1, 0, 0, 0]);
        assert!(out[8..4096].iter().all(|&b| b == 0xCB));
        assert_eq!(&out[4096..], &[0; 8]);
    }

    #[test]
    fn small_payloads_take_one_block_each() {
        let mut writer = StarpakWriter::new(Vec::new()).unwrap();

        assert_eq!(writer.add_payload(&[7]).unwrap(), 4096);
        assert_eq!(writer.add_payload(&[9]).unwrap(), 8192);
        assert_eq!(
            writer.entries(),
            [
                StarpakEntry {
                    offset: 4096,
                    size: 4096
                },
                StarpakEntry {
                    offset: 8192,
                    size: 4096
                }
            ]
        );

        let out = writer.finish().unwrap();
        assert_eq!(out.len(), 3 * 4096 + 2 * 16 + 8);
        assert_eq!(out[4096], 7);
        assert!(out[4097..8192].iter().all(|&b| b == 0));
        assert_eq!(out[8192], 9);
    }

    #[test]
    fn empty_payload_takes_a_block() {
        let mut writer = StarpakWriter::new(Cursor::new(Vec::new())).unwrap();

        assert_eq!(writer.add_payload(&[]).unwrap(), 4096);
        assert_eq!(writer.add_payload(&[1]).unwrap(), 8192);
        assert_eq!(writer.next_offset(), 12288);

        let mut reader = StarpakReader::new(writer.finish().unwrap()).unwrap();
        let entries = reader.entries().unwrap();
        assert_eq!(entries[0].size, 4096);
        assert!(reader.read_payload(&entries[0]).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn read_back_through_trailer() {
        let mut rng = rand::thread_rng();
        let payloads: Vec<Vec<u8>> = (0..20)
            .map(|_| {
                let mut payload = vec![0; rng.gen_range(0..20000)];
                rng.fill_bytes(&mut payload);
                payload
            })
            .collect();

        let mut writer = StarpakWriter::new(Cursor::new(Vec::new())).unwrap();
        let offsets: Vec<u64> = payloads
            .iter()
            .map(|p| writer.add_payload(p).unwrap())
            .collect();
        let out = writer.finish().unwrap();

        let mut reader = StarpakReader::new(out).unwrap();
        let entries = reader.entries().unwrap();
        assert_eq!(entries.len(), payloads.len());

        let mut last = 0;
        for ((entry, payload), offset) in entries.iter().zip(&payloads).zip(&offsets) {
            assert_eq!(entry.offset, *offset);
            assert_eq!(entry.offset % 4096, 0);
            assert!(entry.offset > last);
            last = entry.offset;

            let bytes = reader.read_payload(entry).unwrap();
            assert_eq!(bytes.len() as u64, entry.size);
            assert_eq!(&bytes[..payload.len()], &payload[..]);
            assert!(bytes[payload.len()..].iter().all(|&b| b == 0));
        }
        assert_eq!(entries[0].offset, 4096);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut out = StarpakWriter::new(Vec::new()).unwrap().finish().unwrap();
        out[0] = b'X';
        assert!(matches!(
            StarpakReader::new(Cursor::new(out)),
            Err(StarpakError::BadMagic { .. })
        ));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let mut writer = StarpakWriter::new(Vec::new()).unwrap();
        writer.add_payload(&[1; 5000]).unwrap();
        let mut out = writer.finish().unwrap();

        // Drop the tail of the trailer, count now reads garbage.
        out.truncate(out.len() - 4);
        out.extend_from_slice(&[0xFF; 4]);

        let mut reader = StarpakReader::new(Cursor::new(out)).unwrap();
        assert!(matches!(
            reader.entries(),
            Err(StarpakError::Corrupt { .. })
        ));
    }

    #[test]
    fn stream_ref_packs_file_index() {
        let stream = StreamRef {
            file: 3,
            offset: 0x3000,
        };
        assert_eq!(stream.encode(), 0x3003);
        assert_eq!(StreamRef::decode(0x3003), Some(stream));
        assert_eq!(StreamRef::decode(-1), None);
        assert_eq!(StreamRef::encode_opt(None), -1);
    }
}
