use std::path::Path;

use arcana_pak::{AssetType, Guid};
use camino::Utf8PathBuf;

/// Name of the build manifest file.
pub const MANIFEST_NAME: &str = "Pak.toml";

fn default_output() -> Utf8PathBuf {
    Utf8PathBuf::from("build")
}

fn default_header_align() -> u32 {
    8
}

fn default_cpu_align() -> u32 {
    16
}

/// Pak build manifest.
/// Usually put into `Pak.toml` file.
///
/// Relative paths are resolved against the manifest directory.
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PakManifest {
    /// Name of the container. Output file is `<name>.rpak`.
    pub name: String,

    /// Output directory.
    #[serde(default = "default_output")]
    pub output: Utf8PathBuf,

    /// Directory asset source files are relative to.
    /// Defaults to the manifest directory.
    #[serde(default)]
    pub assets_root: Option<Utf8PathBuf>,

    /// Path the runtime opens the streaming file by.
    /// The file is written into the output directory under its file name.
    #[serde(default)]
    pub starpak: Option<Utf8PathBuf>,

    /// Same as `starpak`, for the optional streaming file.
    #[serde(default)]
    pub opt_starpak: Option<Utf8PathBuf>,

    /// Cache file produced by `arcpak cache`.
    #[serde(default)]
    pub stream_cache: Option<Utf8PathBuf>,

    /// Assets in registration order.
    /// An asset may only resolve references to assets listed before it.
    #[serde(default)]
    pub assets: Vec<AssetManifest>,
}

/// Asset made of raw header bytes and optional data files.
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetManifest {
    /// Logical path. GUID is derived from it unless `guid` is set.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub guid: Option<Guid>,

    #[serde(rename = "type")]
    pub ty: AssetType,

    pub version: u32,

    /// File with header bytes.
    pub header: Utf8PathBuf,

    #[serde(default = "default_header_align")]
    pub header_align: u32,

    /// File with CPU data.
    #[serde(default)]
    pub cpu: Option<Utf8PathBuf>,

    #[serde(default = "default_cpu_align")]
    pub cpu_align: u32,

    /// File with payload for the streaming file.
    #[serde(default)]
    pub stream: Option<Utf8PathBuf>,

    /// File with payload for the optional streaming file.
    #[serde(default)]
    pub opt_stream: Option<Utf8PathBuf>,

    /// Header offset receiving encoded reference to `stream` payload.
    #[serde(default)]
    pub stream_field: Option<u32>,

    /// Header offset receiving encoded reference to `opt_stream` payload.
    #[serde(default)]
    pub opt_stream_field: Option<u32>,

    #[serde(default)]
    pub pointers: Vec<PointerField>,

    #[serde(default)]
    pub references: Vec<ReferenceField>,
}

impl AssetManifest {
    pub fn guid(&self) -> Option<Guid> {
        self.guid
            .or_else(|| self.path.as_deref().map(Guid::from_path))
    }

    /// Name for messages.
    pub fn name(&self) -> String {
        match (&self.path, self.guid) {
            (Some(path), _) => path.clone(),
            (None, Some(guid)) => guid.to_string(),
            (None, None) => self.header.to_string(),
        }
    }
}

/// Segment a pointer field points into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerTarget {
    #[default]
    Header,
    Cpu,
}

/// Intra-container pointer stored in the header.
#[derive(Clone, Copy, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PointerField {
    /// Offset of the field in the header.
    pub offset: u32,

    #[serde(default)]
    pub target: PointerTarget,

    /// Offset inside the target segment.
    #[serde(default)]
    pub target_offset: u32,
}

/// GUID of another asset stored in the header.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceField {
    pub offset: u32,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub guid: Option<Guid>,
}

impl ReferenceField {
    pub fn guid(&self) -> Option<Guid> {
        self.guid
            .or_else(|| self.path.as_deref().map(Guid::from_path))
    }
}

impl PakManifest {
    pub fn read(path: &Path) -> miette::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                miette::bail!("Failed to read pak manifest '{}': {err}", path.display());
            }
        };

        match toml::from_str(&content) {
            Ok(manifest) => Ok(manifest),
            Err(err) => {
                miette::bail!(
                    "Cannot deserialize pak manifest from '{}': {err}",
                    path.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_manifest() {
        let manifest: PakManifest = toml::from_str(
            r#"
            name = "common"
            starpak = "paks/Win64/common.starpak"

            [[assets]]
            path = "texture/white.rpak"
            type = "txtr"
            version = 8
            header = "white.hdr"
            stream = "white.mips"
            stream_field = 16

            [[assets]]
            guid = "0x1234"
            type = "matl"
            version = 12
            header = "mat.hdr"
            cpu = "mat.cpu"
            pointers = [{ offset = 0, target = "cpu", target_offset = 4 }]
            references = [{ offset = 8, path = "texture/white.rpak" }, { offset = 16, guid = 99 }]
            "#,
        )
        .unwrap();

        assert_eq!(manifest.output.as_str(), "build");
        assert_eq!(manifest.assets.len(), 2);

        let texture = &manifest.assets[0];
        assert_eq!(texture.guid(), Some(Guid::from_path("texture/white.rpak")));
        assert_eq!(texture.header_align, 8);
        assert_eq!(texture.stream_field, Some(16));

        let material = &manifest.assets[1];
        assert_eq!(material.guid(), Some(Guid(0x1234)));
        assert_eq!(material.ty.code(), *b"matl");
        assert_eq!(material.pointers[0].target, PointerTarget::Cpu);
        assert_eq!(
            material.references[0].guid(),
            Some(Guid::from_path("texture/white.rpak"))
        );
        assert_eq!(material.references[1].guid(), Some(Guid(99)));
    }

    #[test]
    fn invalid_field_type_is_rejected() {
        let result = toml::from_str::<PakManifest>(
            r#"
            name = "common"

            [[assets]]
            path = "a"
            type = "texture"
            version = 1
            header = "a.hdr"
            "#,
        );
        assert!(result.is_err());

        let result = toml::from_str::<PakManifest>(
            r#"
            name = "common"
            output = 5
            "#,
        );
        assert!(result.is_err());
    }
}
