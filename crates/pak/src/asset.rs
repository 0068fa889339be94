//! GUID registry and relation graph.
//!
//! Assets become visible to lookups only once registered, so an asset can
//! depend on assets registered before it and never on assets after it.

use hashbrown::HashMap;

use crate::{
    guid::{AssetType, Guid},
    layout::AssetRecord,
    reloc::{GuidRefs, PagePtr},
    starpak::StreamRef,
};

/// Position of an asset in the container's asset table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AssetIndex(pub u32);

impl AssetIndex {
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// Everything an encoder knows about an asset when it registers it.
#[derive(Clone, Debug)]
pub struct AssetDesc {
    pub guid: Guid,
    pub ty: AssetType,
    pub version: u32,

    /// Start of the asset header.
    pub head: PagePtr,
    pub head_size: u32,

    /// Start of the optional CPU data.
    pub cpu: Option<PagePtr>,

    pub stream: Option<StreamRef>,
    pub opt_stream: Option<StreamRef>,

    /// GUID fields of the asset, in registration order.
    pub guid_refs: GuidRefs,
}

/// Registered asset.
#[derive(Clone, Debug)]
pub struct AssetEntry {
    desc: AssetDesc,
    relations: Vec<AssetIndex>,
    use_count: u32,
    highest_segment: u32,
}

impl AssetEntry {
    pub fn guid(&self) -> Guid {
        self.desc.guid
    }

    pub fn ty(&self) -> AssetType {
        self.desc.ty
    }

    pub fn desc(&self) -> &AssetDesc {
        &self.desc
    }

    /// Assets that reference this one, in the order they were added.
    pub fn relations(&self) -> &[AssetIndex] {
        &self.relations
    }

    /// Number of registered assets this one references.
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Highest segment index the asset header, data or GUID fields live in.
    pub fn highest_segment(&self) -> u32 {
        self.highest_segment
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Asset with GUID {guid} is already registered at index {index}")]
    DuplicateGuid { guid: Guid, index: u32 },

    #[error("Too many assets, at most {max} are allowed")]
    TooManyAssets { max: usize },

    #[error("Asset {guid} depends on {count} assets, at most {max} are allowed")]
    TooManyDependencies { guid: Guid, count: u32, max: u32 },

    #[error("Combined relation or GUID tables exceed {max} entries")]
    TableOverflow { max: usize },
}

/// Flat tables ready for serialization.
#[derive(Clone, Debug, Default)]
pub struct AssetTables {
    pub records: Vec<AssetRecord>,
    pub uses: Vec<PagePtr>,
    pub relations: Vec<u32>,
}

/// Ordered asset list with GUID index.
#[derive(Debug, Default)]
pub struct AssetRegistry {
    assets: Vec<AssetEntry>,
    by_guid: HashMap<Guid, AssetIndex>,

    /// Relations already added for the asset being built.
    pending_use_count: u32,
}

impl AssetRegistry {
    pub fn new() -> Self {
        AssetRegistry::default()
    }

    /// Index the next registered asset will get.
    /// Relations naming this index belong to the asset currently being built.
    pub fn next_index(&self) -> AssetIndex {
        AssetIndex(self.assets.len() as u32)
    }

    pub fn lookup(&self, guid: Guid) -> Option<AssetIndex> {
        self.by_guid.get(&guid).copied()
    }

    pub fn get(&self, index: AssetIndex) -> Option<&AssetEntry> {
        self.assets.get(index.as_usize())
    }

    pub fn entries(&self) -> &[AssetEntry] {
        &self.assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Records that `dependent` references `target`.
    ///
    /// Repeated calls with the same pair record the relation once.
    ///
    /// # Panics
    ///
    /// Panics if `target` is not registered or `dependent` is neither
    /// registered after `target` nor the asset currently being built.
    pub fn add_relation(&mut self, target: AssetIndex, dependent: AssetIndex) {
        assert!(
            target.as_usize() < self.assets.len(),
            "Relation target {} is not registered",
            target.0
        );
        assert!(
            dependent > target && dependent <= self.next_index(),
            "Asset {} cannot depend on asset {}",
            dependent.0,
            target.0
        );

        let relations = &mut self.assets[target.as_usize()].relations;
        if relations.contains(&dependent) {
            return;
        }
        relations.push(dependent);

        if dependent == self.next_index() {
            self.pending_use_count += 1;
        } else {
            self.assets[dependent.as_usize()].use_count += 1;
        }
    }

    /// Appends the asset and makes its GUID visible to lookups.
    pub fn register(&mut self, desc: AssetDesc) -> Result<AssetIndex, AssetError> {
        if let Some(index) = self.lookup(desc.guid) {
            return Err(AssetError::DuplicateGuid {
                guid: desc.guid,
                index: index.0,
            });
        }

        if self.assets.len() >= u32::MAX as usize {
            return Err(AssetError::TooManyAssets {
                max: u32::MAX as usize,
            });
        }

        let highest_segment = std::iter::once(desc.head.index)
            .chain(desc.cpu.map(|cpu| cpu.index))
            .chain(desc.guid_refs.highest_segment())
            .max()
            .unwrap_or(0);

        let index = self.next_index();
        tracing::debug!("Registered asset {} '{}' at {}", desc.guid, desc.ty, index.0);

        self.by_guid.insert(desc.guid, index);
        self.assets.push(AssetEntry {
            desc,
            relations: Vec::new(),
            use_count: std::mem::take(&mut self.pending_use_count),
            highest_segment,
        });

        Ok(index)
    }

    /// Flattens per-asset GUID lists and relation lists into pak-wide tables.
    ///
    /// Each record keeps start and count of its slices.
    pub fn flatten(&self) -> Result<AssetTables, AssetError> {
        let mut tables = AssetTables {
            records: Vec::with_capacity(self.assets.len()),
            uses: Vec::new(),
            relations: Vec::new(),
        };

        for entry in &self.assets {
            let desc = &entry.desc;

            let dependency_count =
                u16::try_from(entry.use_count).map_err(|_| AssetError::TooManyDependencies {
                    guid: desc.guid,
                    count: entry.use_count,
                    max: u16::MAX.into(),
                })?;

            let uses_start = table_offset(tables.uses.len())?;
            tables.uses.extend(desc.guid_refs.iter().copied());

            let relations_start = table_offset(tables.relations.len())?;
            tables
                .relations
                .extend(entry.relations.iter().map(|index| index.0));

            tables.records.push(AssetRecord {
                guid: desc.guid,
                head: desc.head,
                cpu: desc.cpu.unwrap_or(PagePtr::NULL),
                starpak_offset: StreamRef::encode_opt(desc.stream),
                opt_starpak_offset: StreamRef::encode_opt(desc.opt_stream),
                page_end: (entry.highest_segment + 1) as u16,
                dependency_count,
                relations_start,
                uses_start,
                relations_count: entry.relations.len() as u32,
                uses_count: desc.guid_refs.len() as u32,
                header_size: desc.head_size,
                version: desc.version,
                ty: desc.ty.0,
            });
        }

        table_offset(tables.uses.len())?;
        table_offset(tables.relations.len())?;
        Ok(tables)
    }
}

fn table_offset(len: usize) -> Result<u32, AssetError> {
    u32::try_from(len).map_err(|_| AssetError::TableOverflow {
        max: u32::MAX as usize,
    })
}
