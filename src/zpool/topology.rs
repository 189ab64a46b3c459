//! Topology is a structure that describes zpool vdev structure.
//! Use to create and grow pools.
use crate::{nv::{NvList, NvTypeOp},
            zpool::vdev::{Disk, Vdev}};

/// Structure representing what zpool consist of.
/// This structure is used in zpool creation and when new drives are added.
///
/// ### Examples
///
/// Let's create simple topology: 2 drives in mirror and a hot spare.
///
/// ```rust
/// use zetta_admin::zpool::{Disk, TopologyBuilder, Vdev};
///
/// let drives = vec![Disk::disk("/dev/dsk/c0t0d0"), Disk::disk("/dev/dsk/c0t1d0")];
/// let topo = TopologyBuilder::default()
///             .vdevs(vec![Vdev::Mirror(drives)])
///             .spare(Disk::disk("/dev/dsk/c0t2d0"))
///             .build()
///             .unwrap();
/// assert!(topo.is_suitable_for_create());
/// ```
#[derive(Default, Builder, Debug, Clone, PartialEq, Getters)]
#[builder(setter(into))]
#[get = "pub"]
pub struct Topology {
    #[builder(default)]
    vdevs:  Vec<Vdev>,
    #[builder(default)]
    spares: Vec<Disk>,
}

impl Topology {
    /// A pool needs at least one valid vdev.
    pub fn is_suitable_for_create(&self) -> bool { !self.vdevs.is_empty() && self.vdevs.iter().all(Vdev::is_valid) }

    /// Vdevs and spares are valid and there is at least one of them.
    pub fn is_suitable_for_update(&self) -> bool {
        (!self.vdevs.is_empty() || !self.spares.is_empty()) && self.vdevs.iter().all(Vdev::is_valid)
    }

    /// Root of the vdev tree the engine expects.
    pub fn to_nvlist(&self) -> NvList {
        let mut root = NvList::new().with("type", "root");
        if !self.vdevs.is_empty() {
            root.insert("children", self.vdevs.iter().map(Vdev::to_nvlist).collect::<Vec<_>>());
        }
        if !self.spares.is_empty() {
            root.insert("spares", self.spares.iter().map(Disk::to_nvlist).collect::<Vec<_>>());
        }
        root
    }
}

impl TopologyBuilder {
    pub fn vdev(&mut self, vdev: Vdev) -> &mut TopologyBuilder {
        self.vdevs.get_or_insert_with(Vec::new).push(vdev);
        self
    }

    pub fn spare(&mut self, disk: Disk) -> &mut TopologyBuilder {
        self.spares.get_or_insert_with(Vec::new).push(disk);
        self
    }
}

/// Everything needed to create a pool.
#[derive(Default, Builder, Debug, Clone, Getters)]
#[builder(setter(into))]
#[get = "pub"]
pub struct CreateZpoolRequest {
    name:       String,
    topology:   Topology,
    /// Pool properties to set at creation time.
    #[builder(default)]
    properties: NvList,
    /// Alternate root. The root dataset of such a pool is mounted on `/` under it.
    #[builder(default)]
    altroot:    Option<String>,
    /// On-disk version. Newest one if not set.
    #[builder(default)]
    version:    Option<u64>,
}

impl CreateZpoolRequest {
    pub fn builder() -> CreateZpoolRequestBuilder { CreateZpoolRequestBuilder::default() }
}

impl CreateZpoolRequestBuilder {
    /// Add a single pool property.
    pub fn property<K: Into<String>, V: NvTypeOp>(&mut self, name: K, value: V) -> &mut Self {
        self.properties.get_or_insert_with(NvList::new).insert(name, value);
        self
    }
}
