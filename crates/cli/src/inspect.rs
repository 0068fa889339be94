use std::{fmt, fs::File, io::BufReader, path::Path};

use arcana_pak::{layout::PakHeader, AssetType, PakImage, StreamRef};
use miette::{Context, IntoDiagnostic};

/// Human-readable listing of pak tables.
pub struct PakReport {
    pub header: PakHeader,
    pub image: PakImage,
}

/// Reads the pak at `path`.
pub fn inspect_pak(path: &Path) -> miette::Result<PakReport> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            miette::bail!("Cannot open pak '{}': {err}", path.display());
        }
    };

    let (header, image) = PakImage::read(BufReader::new(file))
        .into_diagnostic()
        .wrap_err_with(|| format!("Cannot read pak '{}'", path.display()))?;

    Ok(PakReport { header, image })
}

impl fmt::Display for PakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let PakReport { header, image } = self;

        writeln!(f, "version: {}", header.version)?;
        writeln!(f, "size: {} bytes", header.decompressed_size)?;
        writeln!(f, "file time: {}", header.file_time.0)?;

        for (index, path) in image.starpak_paths.iter().enumerate() {
            writeln!(f, "starpak {index}: {path}")?;
        }
        for (index, path) in image.opt_starpak_paths.iter().enumerate() {
            writeln!(f, "optional starpak {index}: {path}")?;
        }

        for (index, pool) in image.pools.iter().enumerate() {
            writeln!(
                f,
                "pool {index}: class {:#x}, align {}, {} bytes",
                pool.class.bits(),
                pool.alignment,
                pool.size
            )?;
        }
        for (index, segment) in image.segments.iter().enumerate() {
            writeln!(
                f,
                "segment {index}: pool {}, align {}, {} bytes",
                segment.pool, segment.alignment, segment.size
            )?;
        }
        writeln!(f, "pointers: {}", image.pointers.len())?;
        writeln!(f, "guid descriptors: {}", image.uses.len())?;

        for (index, asset) in image.assets.iter().enumerate() {
            let start = asset.relations_start as usize;
            let relations = &image.relations[start..][..asset.relations_count as usize];

            writeln!(
                f,
                "asset {index}: {} '{}' v{} head {}:{:#x} ({} bytes)",
                asset.guid,
                AssetType(asset.ty),
                asset.version,
                asset.head.index,
                asset.head.offset,
                asset.header_size
            )?;
            if !asset.cpu.is_null() {
                writeln!(f, "  cpu {}:{:#x}", asset.cpu.index, asset.cpu.offset)?;
            }
            if let Some(stream) = StreamRef::decode(asset.starpak_offset) {
                writeln!(f, "  stream {}@{:#x}", stream.file, stream.offset)?;
            }
            if let Some(stream) = StreamRef::decode(asset.opt_starpak_offset) {
                writeln!(f, "  optional stream {}@{:#x}", stream.file, stream.offset)?;
            }
            writeln!(
                f,
                "  uses {}, depends on {}, used by {:?}",
                asset.uses_count, asset.dependency_count, relations
            )?;
        }

        Ok(())
    }
}
