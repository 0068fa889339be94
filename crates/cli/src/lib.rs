//! Manifest driven pak building.

mod build;
mod encoder;
mod inspect;
pub mod manifest;

pub use self::{
    build::build_pak,
    encoder::add_blob_asset,
    inspect::{inspect_pak, PakReport},
};
