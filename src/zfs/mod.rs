//! Dataset side of the control layer: properties, handles, changelists and the lifecycle
//! operations built on top of them.
use bitflags::bitflags;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::nv::{NvList, NvTypeOp};

mod errors;
pub use errors::{Error, ErrorKind, Result};

pub mod properties;
pub use properties::{AclInheritMode, AclMode, Checksum, Compression, Copies, FailMode, IndexProp,
                     PropKind, SnapDir, ZfsProp};

pub mod pathext;
pub use pathext::PathExt;

pub mod validate;
pub use validate::{validate_pool_properties, validate_properties, ValidateContext};

pub mod proplist;
pub use proplist::{PropList, PropListEntry, PropListItem};

pub mod handle;
pub use handle::{PropSource, PropVal, ZfsHandle};

pub mod iter;

pub mod changelist;
pub use changelist::Changelist;

pub mod mount;

pub mod dataset;

pub mod sendrecv;
pub use sendrecv::{DrrBegin, ReceiveRequest};

pub static DATASET_NAME_MAX_LENGTH: usize = 255;
pub const MIN_BLOCK_SIZE: u64 = 512;
pub const MAX_BLOCK_SIZE: u64 = 128 * 1024;
pub const DEFAULT_VOLBLOCKSIZE: u64 = 8 * 1024;
pub const USER_PROP_MAX_LEN: usize = 256;
/// Longest value accepted for a string property.
pub const MAX_PROP_LEN: usize = 1024;

bitflags! {
    /// Mask of dataset types a property or an open call accepts.
    #[derive(Default)]
    pub struct ZfsType: u32 {
        const FILESYSTEM = 1 << 0;
        const SNAPSHOT = 1 << 1;
        const VOLUME = 1 << 2;
        const POOL = 1 << 3;
        const DATASET = Self::FILESYSTEM.bits | Self::SNAPSHOT.bits | Self::VOLUME.bits;
    }
}

/// Concrete type of a dataset. Discriminant is what the storage engine reports.
#[derive(AsRefStr, EnumString, Display, Eq, PartialEq, Debug, Clone, Copy, Hash)]
#[repr(u64)]
pub enum DatasetType {
    #[strum(serialize = "filesystem")]
    Filesystem = 1,
    #[strum(serialize = "snapshot")]
    Snapshot = 2,
    #[strum(serialize = "volume")]
    Volume = 3,
}

impl DatasetType {
    pub fn as_mask(self) -> ZfsType {
        match self {
            DatasetType::Filesystem => ZfsType::FILESYSTEM,
            DatasetType::Snapshot => ZfsType::SNAPSHOT,
            DatasetType::Volume => ZfsType::VOLUME,
        }
    }

    pub fn from_raw(raw: u64) -> Option<DatasetType> {
        match raw {
            1 => Some(DatasetType::Filesystem),
            2 => Some(DatasetType::Snapshot),
            3 => Some(DatasetType::Volume),
            _ => None,
        }
    }
}

impl Default for DatasetType {
    fn default() -> Self { DatasetType::Filesystem }
}

#[derive(Default, Builder, Debug, Clone, Getters)]
#[builder(setter(into))]
#[get = "pub"]
/// Consumer friendly builder for dataset creation. Properties are given in their user-facing form
/// (`"10M"`, `"on"`, `true`, `4096`) and are validated and coerced before the engine sees them.
pub struct CreateDatasetRequest {
    /// Name of the dataset. First crumb of path is name of zpool.
    name:       String,
    /// Filesystem or Volume.
    kind:       DatasetType,
    /// Native and user properties to set at creation time.
    #[builder(default)]
    properties: NvList,
    /// Volumes only. Sparse volumes don't get a reservation matching their size.
    #[builder(default)]
    sparse:     bool,
}

impl CreateDatasetRequest {
    pub fn builder() -> CreateDatasetRequestBuilder { CreateDatasetRequestBuilder::default() }
}

impl CreateDatasetRequestBuilder {
    /// Add a single property.
    pub fn property<K: Into<String>, V: NvTypeOp>(&mut self, name: K, value: V) -> &mut Self {
        self.properties.get_or_insert_with(NvList::new).insert(name, value);
        self
    }
}
