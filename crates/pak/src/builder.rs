//! Build context handed to asset encoders.
//!
//! Encoders run one after another. Each one creates segments, fills their
//! data, records pointer and GUID fields, resolves references to assets
//! registered before it and finally registers its own asset.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use camino::{Utf8Path, Utf8PathBuf};

use crate::{
    asset::{AssetDesc, AssetEntry, AssetError, AssetIndex, AssetRegistry},
    cache::StreamCache,
    container::{path_table_size, PakImage},
    data::{DataError, RawDataStore},
    guid::Guid,
    hash::content_hash,
    layout::{FileTime, PakHeader, PoolRecord, SegmentRecord},
    output::OutputFile,
    reloc::RelocationTable,
    segment::{MemoryClass, Segment, SegmentAllocator, SegmentError},
    starpak::{padded_payload_size, StarpakWriter, StreamRef, MAX_STREAMING_FILES},
};

/// Path tables sizes are stored as 16-bit values.
pub const MAX_PATH_TABLE_SIZE: usize = u16::MAX as usize;

/// Which of the two streaming files a payload goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Loaded with the container.
    Mandatory,

    /// May be absent at runtime.
    Optional,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Mandatory => f.write_str("mandatory"),
            StreamKind::Optional => f.write_str("optional"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PakError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error("Adding streaming file '{path}' makes path table exceed {max} bytes")]
    PathTableOverflow { path: String, max: usize },

    #[error("Too many {kind} streaming files, at most {max} are allowed")]
    TooManyStreamingFiles { kind: StreamKind, max: usize },

    #[error("No {kind} streaming file is open")]
    NoStreamingFile { kind: StreamKind },

    #[error("The {kind} streaming file is already open as '{path}'")]
    StreamingFileOpen { kind: StreamKind, path: Utf8PathBuf },

    #[error("Failed to write '{path}'. {error}")]
    Write { error: io::Error, path: PathBuf },
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> PakError + '_ {
    move |error| PakError::Write {
        error,
        path: path.to_owned(),
    }
}

struct StreamingFile {
    /// Path the runtime opens the file by.
    runtime_path: Utf8PathBuf,

    /// Index in the path table.
    index: u16,

    writer: StarpakWriter<OutputFile>,
    output: PathBuf,
}

/// Result of a successful build.
#[derive(Clone, Debug)]
pub struct PakSummary {
    pub path: PathBuf,
    pub header: PakHeader,

    /// Payloads written into streaming files.
    pub streamed: usize,

    /// Payloads referenced from the stream cache instead of being written.
    pub reused: usize,
}

/// Explicit build context.
///
/// Owns every pak-wide table. Nothing is written to the container path
/// until [`PakBuilder::write`] succeeds.
#[derive(Default)]
pub struct PakBuilder {
    segments: SegmentAllocator,
    pointers: RelocationTable,
    assets: AssetRegistry,
    data: RawDataStore,

    starpak_paths: Vec<String>,
    opt_starpak_paths: Vec<String>,

    stream: Option<StreamingFile>,
    opt_stream: Option<StreamingFile>,

    cache: Option<(StreamCache, Utf8PathBuf)>,
    streamed: usize,
    reused: usize,
}

impl PakBuilder {
    pub fn new() -> Self {
        PakBuilder::default()
    }

    /// Creates a segment accounted in the pool with the same alignment.
    pub fn create_segment(
        &mut self,
        size: u64,
        class: MemoryClass,
        alignment: u32,
    ) -> Result<Segment, PakError> {
        self.create_segment_with_pool_alignment(size, class, alignment, alignment)
    }

    pub fn create_segment_with_pool_alignment(
        &mut self,
        size: u64,
        class: MemoryClass,
        alignment: u32,
        pool_alignment: u32,
    ) -> Result<Segment, PakError> {
        let segment = self
            .segments
            .create(size, class, alignment, pool_alignment)?;
        tracing::trace!(
            "Segment {} of {} bytes in {:?}",
            segment.index(),
            segment.padded_size(),
            class
        );
        Ok(segment)
    }

    /// Records a pointer field at `offset` in `segment`.
    ///
    /// # Panics
    ///
    /// Panics if the field is not inside the segment.
    pub fn add_pointer(&mut self, segment: &Segment, offset: u32) {
        self.pointers.add_pointer(segment, offset);
    }

    /// Stores the bytes of `segment`, zero-padded to its padded size.
    pub fn add_raw_data_block(&mut self, segment: &Segment, bytes: Vec<u8>) -> Result<(), PakError> {
        self.data.add_block(segment, bytes)?;
        Ok(())
    }

    pub fn segments(&self) -> &[Segment] {
        self.segments.segments()
    }

    pub fn pointer_count(&self) -> usize {
        self.pointers.len()
    }

    pub fn lookup_asset(&self, guid: Guid) -> Option<AssetIndex> {
        self.assets.lookup(guid)
    }

    pub fn asset(&self, index: AssetIndex) -> Option<&AssetEntry> {
        self.assets.get(index)
    }

    pub fn assets(&self) -> &[AssetEntry] {
        self.assets.entries()
    }

    /// Index the asset currently being built will get.
    pub fn next_asset_index(&self) -> AssetIndex {
        self.assets.next_index()
    }

    /// Records that the asset currently being built references `target`.
    ///
    /// # Panics
    ///
    /// Panics if `target` is not registered.
    pub fn add_relation(&mut self, target: AssetIndex) {
        let dependent = self.assets.next_index();
        self.assets.add_relation(target, dependent);
    }

    /// Looks up `guid` and, when found, records the relation.
    ///
    /// `None` means the asset lives in another container and is resolved at runtime.
    pub fn resolve_reference(&mut self, guid: Guid) -> Option<AssetIndex> {
        let target = self.assets.lookup(guid)?;
        self.add_relation(target);
        Some(target)
    }

    pub fn register_asset(&mut self, desc: AssetDesc) -> Result<AssetIndex, PakError> {
        Ok(self.assets.register(desc)?)
    }

    /// Enables reuse of payloads found in `cache`.
    ///
    /// Cached streaming file paths are relative. They are referenced as
    /// `prefix/relative` at runtime.
    pub fn set_stream_cache(&mut self, cache: StreamCache, prefix: &Utf8Path) {
        tracing::info!(
            "Using stream cache with {} payloads under '{}'",
            cache.entries().len(),
            prefix
        );
        self.cache = Some((cache, prefix.to_owned()));
    }

    pub fn starpak_paths(&self, kind: StreamKind) -> &[String] {
        match kind {
            StreamKind::Mandatory => &self.starpak_paths,
            StreamKind::Optional => &self.opt_starpak_paths,
        }
    }

    /// Adds `path` to the streaming file path table unless already present.
    /// Returns the index of the path.
    pub fn add_streaming_file_reference(
        &mut self,
        kind: StreamKind,
        path: &str,
    ) -> Result<u16, PakError> {
        let paths = match kind {
            StreamKind::Mandatory => &mut self.starpak_paths,
            StreamKind::Optional => &mut self.opt_starpak_paths,
        };

        if let Some(index) = paths.iter().position(|p| p == path) {
            return Ok(index as u16);
        }

        if paths.len() >= MAX_STREAMING_FILES {
            return Err(PakError::TooManyStreamingFiles {
                kind,
                max: MAX_STREAMING_FILES,
            });
        }

        if path_table_size(paths) + path.len() + 1 > MAX_PATH_TABLE_SIZE {
            return Err(PakError::PathTableOverflow {
                path: path.to_owned(),
                max: MAX_PATH_TABLE_SIZE,
            });
        }

        paths.push(path.to_owned());
        Ok((paths.len() - 1) as u16)
    }

    /// Starts writing the `kind` streaming file into `output`.
    ///
    /// The runtime opens the file as `runtime_path`.
    /// The file appears at `output` only when the container is written.
    #[tracing::instrument(skip(self))]
    pub fn open_streaming_file(
        &mut self,
        kind: StreamKind,
        runtime_path: &Utf8Path,
        output: &Path,
    ) -> Result<u16, PakError> {
        if let Some(file) = self.streaming_file(kind) {
            return Err(PakError::StreamingFileOpen {
                kind,
                path: file.runtime_path.clone(),
            });
        }

        let index = self.add_streaming_file_reference(kind, runtime_path.as_str())?;

        let out = OutputFile::create(output).map_err(write_error(output))?;
        let writer = StarpakWriter::new(out).map_err(write_error(output))?;

        let file = StreamingFile {
            runtime_path: runtime_path.to_owned(),
            index,
            writer,
            output: output.to_owned(),
        };

        match kind {
            StreamKind::Mandatory => self.stream = Some(file),
            StreamKind::Optional => self.opt_stream = Some(file),
        }
        Ok(index)
    }

    fn streaming_file(&self, kind: StreamKind) -> Option<&StreamingFile> {
        match kind {
            StreamKind::Mandatory => self.stream.as_ref(),
            StreamKind::Optional => self.opt_stream.as_ref(),
        }
    }

    /// Places a payload into the `kind` streaming file.
    ///
    /// With a stream cache set, a payload already present in a cached
    /// streaming file is referenced there instead of being written again.
    pub fn add_streaming_payload(
        &mut self,
        kind: StreamKind,
        bytes: &[u8],
    ) -> Result<StreamRef, PakError> {
        if self.streaming_file(kind).is_none() {
            return Err(PakError::NoStreamingFile { kind });
        }

        if let Some(cached) = self.find_cached(bytes) {
            let (path, offset) = cached;
            let file = self.add_streaming_file_reference(kind, &path)?;
            self.reused += 1;
            tracing::debug!("Reusing payload at {offset:#x} of '{path}'");
            return Ok(StreamRef { file, offset });
        }

        let file = match kind {
            StreamKind::Mandatory => self.stream.as_mut(),
            StreamKind::Optional => self.opt_stream.as_mut(),
        }
        .ok_or(PakError::NoStreamingFile { kind })?;

        let offset = file
            .writer
            .add_payload(bytes)
            .map_err(write_error(&file.output))?;
        self.streamed += 1;

        Ok(StreamRef {
            file: file.index,
            offset,
        })
    }

    fn find_cached(&self, bytes: &[u8]) -> Option<(String, u64)> {
        let (cache, prefix) = self.cache.as_ref()?;

        let size = padded_payload_size(bytes.len() as u64)?;
        let mut padded = bytes.to_vec();
        padded.resize(usize::try_from(size).ok()?, 0);

        let hit = cache.find(content_hash(&padded), padded.len() as u64)?;
        let path = match prefix.as_str() {
            "" => hit.path.to_owned(),
            prefix => format!("{}/{}", prefix.trim_end_matches('/'), hit.path),
        };

        // Both streaming files of this build are truncated on open.
        let rewritten = [self.stream.as_ref(), self.opt_stream.as_ref()]
            .into_iter()
            .flatten()
            .any(|file| file.runtime_path.as_str() == path);

        if rewritten {
            tracing::warn!(
                "Cached payload points into '{}' which is being rewritten, writing it again",
                path
            );
            return None;
        }

        Some((path, hit.offset))
    }

    fn image(&mut self) -> Result<PakImage, PakError> {
        let tables = self.assets.flatten()?;
        let data = std::mem::take(&mut self.data).into_blocks(self.segments.segments())?;

        Ok(PakImage {
            starpak_paths: self.starpak_paths.clone(),
            opt_starpak_paths: self.opt_starpak_paths.clone(),
            pools: self
                .segments
                .pools()
                .iter()
                .map(|pool| PoolRecord {
                    class: pool.class,
                    alignment: pool.alignment,
                    size: pool.size,
                })
                .collect(),
            segments: self
                .segments
                .segments()
                .iter()
                .map(|segment| SegmentRecord {
                    pool: segment.pool(),
                    alignment: segment.alignment(),
                    size: segment.padded_size() as u32,
                })
                .collect(),
            pointers: self.pointers.pointers().to_vec(),
            assets: tables.records,
            uses: tables.uses,
            relations: tables.relations,
            data,
        })
    }

    /// Writes the container to `path` and finishes the streaming files.
    ///
    /// On failure no output file is left behind.
    #[tracing::instrument(skip(self))]
    pub fn write(mut self, path: &Path) -> Result<PakSummary, PakError> {
        let image = self.image()?;

        let mut out = OutputFile::create(path).map_err(write_error(path))?;
        let header = image
            .write(&mut out, FileTime::now())
            .map_err(write_error(path))?;

        // Streaming files are committed before the container.
        for file in [self.stream.take(), self.opt_stream.take()].into_iter().flatten() {
            let count = file.writer.entries().len();
            let starpak = file
                .writer
                .finish()
                .map_err(write_error(&file.output))?;
            starpak.commit().map_err(write_error(&file.output))?;
            tracing::info!(
                "Wrote {} payloads to '{}'",
                count,
                file.output.display()
            );
        }

        out.commit().map_err(write_error(path))?;

        tracing::info!(
            "Wrote {} assets in {} segments to '{}', {} bytes",
            header.asset_count,
            header.segment_count,
            path.display(),
            header.decompressed_size
        );

        Ok(PakSummary {
            path: path.to_owned(),
            header,
            streamed: self.streamed,
            reused: self.reused,
        })
    }
}
