//! Builder of relocatable asset containers.
//!
//! A container holds asset data split into segments, tables of pointer and
//! GUID fields to fix up at load time, per-asset records and the relations
//! between assets. Large payloads go into companion streaming files.
//!
//! [`PakBuilder`] is the entry point for encoders.

pub mod asset;
pub mod builder;
pub mod cache;
pub mod container;
pub mod data;
pub mod guid;
pub mod hash;
pub mod layout;
pub mod output;
pub mod reloc;
pub mod segment;
pub mod starpak;

pub use self::{
    asset::{AssetDesc, AssetEntry, AssetIndex},
    builder::{PakBuilder, PakError, PakSummary, StreamKind},
    cache::{build_stream_cache, CacheError, StreamCache},
    container::PakImage,
    guid::{AssetType, Guid},
    hash::{content_hash, Hash128},
    reloc::{GuidRefs, PagePtr},
    segment::{MemoryClass, Segment},
    starpak::StreamRef,
};
