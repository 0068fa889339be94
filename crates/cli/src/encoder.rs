//! Encoder for assets described entirely by the manifest.

use std::path::Path;

use arcana_pak::{
    AssetDesc, AssetIndex, GuidRefs, MemoryClass, PakBuilder, Segment, StreamKind, StreamRef,
};
use camino::Utf8Path;
use miette::{Context, IntoDiagnostic};

use crate::manifest::{AssetManifest, PointerTarget};

fn read_source(root: &Path, path: &Utf8Path, asset: &str, field: &str) -> miette::Result<Vec<u8>> {
    let full = root.join(path.as_std_path());
    match std::fs::read(&full) {
        Ok(bytes) => Ok(bytes),
        Err(err) => {
            miette::bail!(
                "Failed to read '{field}' file '{}' of asset '{asset}': {err}",
                full.display()
            );
        }
    }
}

fn check_field(header: &[u8], offset: u32, width: usize, asset: &str, field: &str) -> miette::Result<usize> {
    let offset = offset as usize;
    if offset.checked_add(width).map_or(true, |end| end > header.len()) {
        miette::bail!(
            "Field '{field}' at offset {offset} of asset '{asset}' does not fit into its {} byte header",
            header.len()
        );
    }
    Ok(offset)
}

/// Adds one manifest asset to the pak.
///
/// Header bytes are patched with pointers, GUIDs and streaming references
/// listed in the manifest before they are stored.
pub fn add_blob_asset(
    builder: &mut PakBuilder,
    root: &Path,
    asset: &AssetManifest,
) -> miette::Result<AssetIndex> {
    let name = asset.name();

    let Some(guid) = asset.guid() else {
        miette::bail!("Asset '{name}' has neither 'path' nor 'guid'");
    };

    let mut header = read_source(root, &asset.header, &name, "header")?;
    if header.is_empty() {
        miette::bail!("Header file '{}' of asset '{name}' is empty", asset.header);
    }
    let Ok(head_size) = u32::try_from(header.len()) else {
        miette::bail!("Header of asset '{name}' is too large");
    };

    let head = builder
        .create_segment(header.len() as u64, MemoryClass::HEAD, asset.header_align)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to allocate header of asset '{name}'"))?;

    let cpu = match &asset.cpu {
        None => None,
        Some(path) => {
            let bytes = read_source(root, path, &name, "cpu")?;
            if bytes.is_empty() {
                miette::bail!("CPU data file '{path}' of asset '{name}' is empty");
            }
            let segment = builder
                .create_segment(bytes.len() as u64, MemoryClass::CPU, asset.cpu_align)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to allocate CPU data of asset '{name}'"))?;
            Some((segment, bytes))
        }
    };

    for pointer in &asset.pointers {
        let offset = check_field(&header, pointer.offset, 8, &name, "pointers")?;

        let target: &Segment = match (pointer.target, &cpu) {
            (PointerTarget::Header, _) => &head,
            (PointerTarget::Cpu, Some((segment, _))) => segment,
            (PointerTarget::Cpu, None) => {
                miette::bail!(
                    "Pointer at offset {offset} of asset '{name}' targets CPU data but 'cpu' is not set"
                );
            }
        };

        if u64::from(pointer.target_offset) >= target.padded_size() {
            miette::bail!(
                "Pointer at offset {offset} of asset '{name}' targets offset {} outside of {} bytes",
                pointer.target_offset,
                target.padded_size()
            );
        }

        target.ptr(pointer.target_offset).encode_at(&mut header, offset);
        builder.add_pointer(&head, pointer.offset);
    }

    let mut guid_refs = GuidRefs::new();
    for reference in &asset.references {
        let offset = check_field(&header, reference.offset, 8, &name, "references")?;

        let Some(target) = reference.guid() else {
            miette::bail!(
                "Reference at offset {offset} of asset '{name}' has neither 'path' nor 'guid'"
            );
        };

        target.encode_at(&mut header, offset);
        guid_refs.add_descriptor(&head, reference.offset);

        if builder.resolve_reference(target).is_none() {
            tracing::warn!(
                "Asset '{name}' references {target} which is not in this pak, leaving it to runtime"
            );
        }
    }

    let streams = [
        (StreamKind::Mandatory, &asset.stream, asset.stream_field, "stream"),
        (StreamKind::Optional, &asset.opt_stream, asset.opt_stream_field, "opt_stream"),
    ];

    let mut stream_refs = [None, None];
    for ((kind, path, field, field_name), stream_ref) in streams.into_iter().zip(&mut stream_refs) {
        let Some(path) = path else {
            if field.is_some() {
                miette::bail!("Asset '{name}' sets '{field_name}_field' without '{field_name}'");
            }
            continue;
        };

        let bytes = read_source(root, path, &name, field_name)?;
        let stream = builder
            .add_streaming_payload(kind, &bytes)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to stream '{field_name}' of asset '{name}'"))?;

        match field {
            None => {
                tracing::warn!("Asset '{name}' streams '{path}' but has no '{field_name}_field'");
            }
            Some(field) => {
                let offset = check_field(&header, field, 8, &name, field_name)?;
                header[offset..][..8].copy_from_slice(&stream.encode().to_le_bytes());
            }
        }

        *stream_ref = Some(stream);
    }
    let [stream, opt_stream]: [Option<StreamRef>; 2] = stream_refs;

    builder
        .add_raw_data_block(&head, header)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to store header of asset '{name}'"))?;

    let cpu = match cpu {
        None => None,
        Some((segment, bytes)) => {
            builder
                .add_raw_data_block(&segment, bytes)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to store CPU data of asset '{name}'"))?;
            Some(segment.ptr(0))
        }
    };

    builder
        .register_asset(AssetDesc {
            guid,
            ty: asset.ty,
            version: asset.version,
            head: head.ptr(0),
            head_size,
            cpu,
            stream,
            opt_stream,
            guid_refs,
        })
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to register asset '{name}'"))
}
