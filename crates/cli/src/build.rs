use std::path::{Path, PathBuf};

use arcana_pak::{PakBuilder, PakSummary, StreamCache, StreamKind};
use camino::Utf8Path;
use miette::{Context, IntoDiagnostic};

use crate::{
    encoder::add_blob_asset,
    manifest::{PakManifest, MANIFEST_NAME},
};

/// Resolves `path` to the manifest file.
/// `path` may point to the manifest itself or to the directory containing it.
fn manifest_path(path: &Path) -> miette::Result<PathBuf> {
    let path = match dunce::canonicalize(path) {
        Ok(path) => path,
        Err(err) => {
            miette::bail!("Cannot open pak manifest at '{}': {err}", path.display());
        }
    };

    if path.is_dir() {
        Ok(path.join(MANIFEST_NAME))
    } else {
        Ok(path)
    }
}

/// Builds the pak described by the manifest at `path`.
#[tracing::instrument]
pub fn build_pak(path: &Path) -> miette::Result<PakSummary> {
    let manifest_path = manifest_path(path)?;
    let Some(root) = manifest_path.parent() else {
        miette::bail!(
            "Cannot resolve parent directory of '{}'",
            manifest_path.display()
        );
    };

    let manifest = PakManifest::read(&manifest_path)?;

    let assets_root = match &manifest.assets_root {
        None => root.to_owned(),
        Some(assets_root) => root.join(assets_root.as_std_path()),
    };

    let output_dir = root.join(manifest.output.as_std_path());
    if let Err(err) = std::fs::create_dir_all(&output_dir) {
        miette::bail!(
            "Failed to create output directory '{}': {err}",
            output_dir.display()
        );
    }

    let mut builder = PakBuilder::new();

    if let Some(cache_path) = &manifest.stream_cache {
        let cache_path = root.join(cache_path.as_std_path());
        match StreamCache::load(&cache_path) {
            Ok(cache) => {
                let prefix = manifest
                    .starpak
                    .as_deref()
                    .and_then(Utf8Path::parent)
                    .unwrap_or(Utf8Path::new(""));
                builder.set_stream_cache(cache, prefix);
            }
            Err(err) => {
                tracing::warn!("Building without stream cache. {err}");
            }
        }
    }

    for (kind, runtime_path) in [
        (StreamKind::Mandatory, &manifest.starpak),
        (StreamKind::Optional, &manifest.opt_starpak),
    ] {
        let Some(runtime_path) = runtime_path else {
            continue;
        };
        let Some(file_name) = runtime_path.file_name() else {
            miette::bail!("Streaming file path '{runtime_path}' has no file name");
        };

        builder
            .open_streaming_file(kind, runtime_path, &output_dir.join(file_name))
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to open {kind} streaming file '{runtime_path}'"))?;
    }

    for asset in &manifest.assets {
        add_blob_asset(&mut builder, &assets_root, asset)?;
    }

    let pak_path = output_dir.join(format!("{}.rpak", manifest.name));
    builder
        .write(&pak_path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to build pak '{}'", manifest.name))
}
