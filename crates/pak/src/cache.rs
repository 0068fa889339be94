//! Content-addressed index of previously written streaming payloads.
//!
//! Cache file layout, little-endian:
//!
//! | offset             | content                                             |
//! |--------------------|-----------------------------------------------------|
//! | 0                  | path buffer size u64                                |
//! | 8                  | entry count u64                                     |
//! | 16                 | entry table offset u64                              |
//! | 24                 | NUL-terminated relative paths of streaming files    |
//! | entry table offset | entries of 0x30 bytes, aligned to 4                 |
//!
//! Entry: `{source offset u64, source size u64, hash [u8; 16], path offset u64, reserved u64}`.

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::{
    hash::{content_hash, Hash128},
    output::OutputFile,
    segment::align_up,
    starpak::{StarpakError, StarpakReader, STARPAK_ALIGNMENT, STARPAK_DATA_START},
};

pub const CACHE_HEADER_SIZE: u64 = 0x18;
pub const CACHE_ENTRY_SIZE: u64 = 0x30;

/// Extension of streaming files picked up by the scan.
pub const STARPAK_EXTENSION: &str = "starpak";

/// Conventional name of the cache file inside the scanned directory.
pub const CACHE_FILE_NAME: &str = "streaming.starpak_cache";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Failed to scan directory '{path}'. {error}")]
    ScanDir { error: io::Error, path: PathBuf },

    #[error("Failed to access cache file '{path}'. {error}")]
    Io { error: io::Error, path: PathBuf },

    #[error("Cache file is corrupt. {reason}")]
    Corrupt { reason: String },

    #[error("Failed to read cache. {0}")]
    Stream(#[from] io::Error),
}

/// Payload found in a streaming file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// Offset of the streaming file path in the path buffer.
    pub path_offset: u64,

    /// Offset of the payload in the streaming file.
    pub source_offset: u64,

    /// Padded payload size.
    pub source_size: u64,

    pub hash: Hash128,
}

/// Cached location of a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheHit<'a> {
    /// Path of the streaming file relative to the scanned directory.
    pub path: &'a str,
    pub offset: u64,
}

/// In-memory cache index.
#[derive(Debug, Default)]
pub struct StreamCache {
    /// Relative paths with their offsets in the path buffer.
    paths: Vec<(u64, String)>,
    path_buf_size: u64,
    entries: Vec<CacheEntry>,
    index: HashMap<(Hash128, u64), usize>,
}

impl StreamCache {
    pub fn new() -> Self {
        StreamCache::default()
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.paths.iter().map(|(_, path)| path.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds payloads of one streaming file.
    ///
    /// `blocks` yields `(offset, padded size, hash)` in trailer order.
    pub fn add_file<I>(&mut self, path: &str, blocks: I)
    where
        I: IntoIterator<Item = (u64, u64, Hash128)>,
    {
        let path_offset = self.path_buf_size;
        self.path_buf_size += path.len() as u64 + 1;
        self.paths.push((path_offset, path.to_owned()));

        for (source_offset, source_size, hash) in blocks {
            self.push_entry(CacheEntry {
                path_offset,
                source_offset,
                source_size,
                hash,
            });
        }
    }

    fn push_entry(&mut self, entry: CacheEntry) {
        self.index
            .entry((entry.hash, entry.source_size))
            .or_insert(self.entries.len());
        self.entries.push(entry);
    }

    /// Returns the first cached payload with the same hash and padded size.
    pub fn find(&self, hash: Hash128, size: u64) -> Option<CacheHit<'_>> {
        let entry = &self.entries[*self.index.get(&(hash, size))?];
        let path = self.path_at(entry.path_offset)?;
        Some(CacheHit {
            path,
            offset: entry.source_offset,
        })
    }

    pub fn path_at(&self, offset: u64) -> Option<&str> {
        let idx = self
            .paths
            .binary_search_by_key(&offset, |(offset, _)| *offset)
            .ok()?;
        Some(&self.paths[idx].1)
    }

    fn entry_table_offset(&self) -> u64 {
        CACHE_HEADER_SIZE + align_up(self.path_buf_size, 4).unwrap_or(self.path_buf_size)
    }

    pub fn write<W: Write>(&self, mut out: W) -> io::Result<()> {
        let table_offset = self.entry_table_offset();

        out.write_u64::<LittleEndian>(self.path_buf_size)?;
        out.write_u64::<LittleEndian>(self.entries.len() as u64)?;
        out.write_u64::<LittleEndian>(table_offset)?;

        for (_, path) in &self.paths {
            out.write_all(path.as_bytes())?;
            out.write_u8(0)?;
        }
        for _ in CACHE_HEADER_SIZE + self.path_buf_size..table_offset {
            out.write_u8(0)?;
        }

        for entry in &self.entries {
            out.write_u64::<LittleEndian>(entry.source_offset)?;
            out.write_u64::<LittleEndian>(entry.source_size)?;
            out.write_all(&entry.hash.0)?;
            out.write_u64::<LittleEndian>(entry.path_offset)?;
            out.write_u64::<LittleEndian>(0)?;
        }

        out.flush()
    }

    pub fn read<R: Read>(mut input: R) -> Result<Self, CacheError> {
        let path_buf_size = input.read_u64::<LittleEndian>()?;
        let entry_count = input.read_u64::<LittleEndian>()?;
        let table_offset = input.read_u64::<LittleEndian>()?;

        let padding = table_offset
            .checked_sub(CACHE_HEADER_SIZE)
            .and_then(|rest| rest.checked_sub(path_buf_size))
            .filter(|&padding| padding < 4)
            .ok_or_else(|| CacheError::Corrupt {
                reason: format!(
                    "entry table at {table_offset:#x} does not follow {path_buf_size} bytes of paths"
                ),
            })?;

        let mut buf = Vec::new();
        (&mut input).take(path_buf_size).read_to_end(&mut buf)?;
        if buf.len() as u64 != path_buf_size {
            return Err(CacheError::Corrupt {
                reason: "path buffer is truncated".to_owned(),
            });
        }
        io::copy(&mut (&mut input).take(padding), &mut io::sink())?;

        let mut cache = StreamCache::new();

        let mut offset = 0;
        for path in buf.split_inclusive(|&b| b == 0) {
            let Some((&0, path)) = path.split_last() else {
                return Err(CacheError::Corrupt {
                    reason: "path buffer is not NUL-terminated".to_owned(),
                });
            };
            let path = std::str::from_utf8(path).map_err(|_| CacheError::Corrupt {
                reason: "path buffer is not UTF-8".to_owned(),
            })?;
            cache.paths.push((offset, path.to_owned()));
            offset += path.len() as u64 + 1;
        }
        cache.path_buf_size = path_buf_size;

        for _ in 0..entry_count {
            let source_offset = input.read_u64::<LittleEndian>()?;
            let source_size = input.read_u64::<LittleEndian>()?;
            let mut hash = [0; 16];
            input.read_exact(&mut hash)?;
            let path_offset = input.read_u64::<LittleEndian>()?;
            let _reserved = input.read_u64::<LittleEndian>()?;

            if source_offset < STARPAK_DATA_START || source_offset % STARPAK_ALIGNMENT != 0 {
                return Err(CacheError::Corrupt {
                    reason: format!("entry refers to unaligned payload offset {source_offset:#x}"),
                });
            }

            if cache.path_at(path_offset).is_none() {
                return Err(CacheError::Corrupt {
                    reason: format!("entry refers to path offset {path_offset} with no path"),
                });
            }

            cache.push_entry(CacheEntry {
                path_offset,
                source_offset,
                source_size,
                hash: Hash128(hash),
            });
        }

        Ok(cache)
    }

    /// Writes the cache file atomically.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let io_error = |error| CacheError::Io {
            error,
            path: path.to_owned(),
        };

        let mut out = OutputFile::create(path).map_err(io_error)?;
        self.write(&mut out).map_err(io_error)?;
        out.commit().map_err(io_error)
    }

    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let file = File::open(path).map_err(|error| CacheError::Io {
            error,
            path: path.to_owned(),
        })?;
        StreamCache::read(BufReader::new(file))
    }
}

/// Hashes every payload of one streaming file in trailer order.
pub fn scan_starpak(path: &Path) -> Result<Vec<(u64, u64, Hash128)>, StarpakError> {
    let file = File::open(path)?;
    let mut reader = StarpakReader::new(BufReader::new(file))?;

    let entries = reader.entries()?;
    let mut blocks = Vec::with_capacity(entries.len());
    for entry in &entries {
        let bytes = reader.read_payload(entry)?;
        blocks.push((entry.offset, entry.size, content_hash(&bytes)));
    }
    Ok(blocks)
}

/// Scans `dir` recursively for streaming files and indexes their payloads.
///
/// Files are scanned in parallel. Paths are sorted so the result does not
/// depend on scheduling. Unreadable or corrupt files are skipped.
#[tracing::instrument]
pub fn build_stream_cache(dir: &Path) -> Result<StreamCache, CacheError> {
    let files = find_starpaks(dir)?;
    tracing::info!("Found {} streaming files", files.len());

    let scanned = Mutex::new(Vec::with_capacity(files.len()));

    files.par_iter().enumerate().for_each(|(idx, (path, rel))| {
        match scan_starpak(path) {
            Err(err) => {
                tracing::warn!("Skipping streaming file '{}'. {:#}", path.display(), err);
            }
            Ok(blocks) => {
                tracing::debug!("Hashed {} payloads of '{}'", blocks.len(), rel);
                scanned.lock().push((idx, blocks));
            }
        }
    });

    let mut scanned = scanned.into_inner();
    scanned.sort_by_key(|(idx, _)| *idx);

    let mut cache = StreamCache::new();
    for (idx, blocks) in scanned {
        cache.add_file(&files[idx].1, blocks);
    }

    tracing::info!(
        "Indexed {} payloads from {} streaming files",
        cache.entries.len(),
        cache.paths.len()
    );
    Ok(cache)
}

/// Collects streaming files under `dir` with their `/`-separated relative paths.
fn find_starpaks(dir: &Path) -> Result<Vec<(PathBuf, String)>, CacheError> {
    // Fail only if the root itself is unreadable.
    std::fs::read_dir(dir).map_err(|error| CacheError::ScanDir {
        error,
        path: dir.to_owned(),
    })?;

    let mut files = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(dir.to_owned());

    while let Some(dir_path) = queue.pop_front() {
        let entries = match std::fs::read_dir(&dir_path) {
            Err(err) => {
                tracing::error!(
                    "Failed to scan directory '{}'. {:#}",
                    dir_path.display(),
                    err
                );
                continue;
            }
            Ok(entries) => entries,
        };

        for e in entries {
            let e = match e {
                Err(err) => {
                    tracing::error!(
                        "Failed to read entry in directory '{}'. {:#}",
                        dir_path.display(),
                        err,
                    );
                    continue;
                }
                Ok(e) => e,
            };
            let path = dir_path.join(e.file_name());
            let ft = match e.file_type() {
                Err(err) => {
                    tracing::error!("Failed to check '{}'. {:#}", path.display(), err);
                    continue;
                }
                Ok(ft) => ft,
            };

            if ft.is_dir() {
                queue.push_back(path);
            } else if ft.is_file()
                && path.extension().map_or(false, |ext| ext == STARPAK_EXTENSION)
            {
                match relative_path(dir, &path) {
                    None => {
                        tracing::warn!("Skipping non UTF-8 path '{}'", path.display());
                    }
                    Some(rel) => files.push((path, rel)),
                }
            }
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn relative_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        parts.push(component.as_os_str().to_str()?);
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use std::io::{BufWriter, Cursor};

    use rand::RngCore;

    use super::*;
    use crate::starpak::StarpakWriter;

    fn to_bytes(cache: &StreamCache) -> Vec<u8> {
        let mut buf = Vec::new();
        cache.write(&mut buf).unwrap();
        buf
    }

    fn write_starpak(path: &Path, payloads: &[Vec<u8>]) -> Vec<u64> {
        let file = File::create(path).unwrap();
        let mut writer = StarpakWriter::new(BufWriter::new(file)).unwrap();
        let offsets = payloads
            .iter()
            .map(|p| writer.add_payload(p).unwrap())
            .collect();
        writer.finish().unwrap();
        offsets
    }

    fn random_payload(len: usize) -> Vec<u8> {
        let mut payload = vec![0; len];
        rand::thread_rng().fill_bytes(&mut payload);
        payload
    }

    #[test]
    fn scan_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let shared = random_payload(5000);
        let a = vec![random_payload(100), shared.clone()];
        let b = vec![shared.clone()];

        let a_offsets = write_starpak(&dir.path().join("a.starpak"), &a);
        write_starpak(&dir.path().join("sub/b.starpak"), &b);
        std::fs::write(dir.path().join("broken.starpak"), b"SRPk\x01\0\0\0").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let cache = build_stream_cache(dir.path()).unwrap();
        assert_eq!(cache.paths().collect::<Vec<_>>(), ["a.starpak", "sub/b.starpak"]);
        assert_eq!(cache.entries().len(), 3);

        let mut padded = shared.clone();
        padded.resize(8192, 0);
        let hit = cache.find(content_hash(&padded), 8192).unwrap();
        assert_eq!(hit.path, "a.starpak");
        assert_eq!(hit.offset, a_offsets[1]);

        assert!(cache.find(content_hash(&padded), 4096).is_none());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            build_stream_cache(&dir.path().join("nope")),
            Err(CacheError::ScanDir { .. })
        ));
    }

    #[test]
    fn cache_file_layout() {
        let mut cache = StreamCache::new();
        cache.add_file("ab.starpak", [(4096, 4096, Hash128::from_u128(1))]);
        cache.add_file(
            "c.starpak",
            [
                (4096, 8192, Hash128::from_u128(2)),
                (12288, 4096, Hash128::from_u128(3)),
            ],
        );

        let bytes = to_bytes(&cache);

        // 11 + 10 bytes of paths, padded to 24.
        assert_eq!(&bytes[0..8], &21u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &(0x18u64 + 24).to_le_bytes());
        assert_eq!(&bytes[24..35], b"ab.starpak\0");
        assert_eq!(bytes.len(), 0x18 + 24 + 3 * 0x30);

        let third = &bytes[0x18 + 24 + 2 * 0x30..];
        assert_eq!(&third[0..8], &12288u64.to_le_bytes());
        assert_eq!(&third[16..32], &Hash128::from_u128(3).0);
        assert_eq!(&third[32..40], &11u64.to_le_bytes());

        let read = StreamCache::read(Cursor::new(bytes)).unwrap();
        assert_eq!(read.entries(), cache.entries());
        assert_eq!(
            read.find(Hash128::from_u128(3), 4096),
            Some(CacheHit {
                path: "c.starpak",
                offset: 12288
            })
        );
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE_NAME);

        let mut cache = StreamCache::new();
        cache.add_file("x.starpak", [(4096, 4096, Hash128::from_u128(7))]);
        cache.save(&path).unwrap();

        let loaded = StreamCache::load(&path).unwrap();
        assert_eq!(loaded.entries(), cache.entries());
        assert_eq!(loaded.paths().collect::<Vec<_>>(), ["x.starpak"]);
    }

    #[test]
    fn unaligned_payload_offset_is_rejected() {
        let mut cache = StreamCache::new();
        cache.add_file("x.starpak", [(4096, 4096, Hash128::from_u128(7))]);
        let mut bytes = to_bytes(&cache);

        // Offset of the only entry, after 10 bytes of paths padded to 12.
        let entry = 0x18 + 12;
        assert_eq!(&bytes[entry..entry + 8], &4096u64.to_le_bytes());
        bytes[entry..entry + 8].copy_from_slice(&4097u64.to_le_bytes());

        assert!(matches!(
            StreamCache::read(Cursor::new(bytes)),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn bad_table_offset_is_rejected() {
        let mut bytes = to_bytes(&StreamCache::new());
        bytes[16] = 0x40;
        assert!(matches!(
            StreamCache::read(Cursor::new(bytes)),
            Err(CacheError::Corrupt { .. })
        ));
    }
}
