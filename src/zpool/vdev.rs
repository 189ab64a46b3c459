//! Vdev data types: what a caller asks for when creating or growing a pool, and what the engine
//! reports back in the pool configuration.
use std::path::PathBuf;

use crate::{nv::NvList,
            zpool::properties::{Health, VdevState}};

/// Every vdev can be backed either by block device or sparse file.
#[derive(Debug, Clone, PartialEq)]
pub enum Disk {
    /// Sparse file based device.
    File(PathBuf),
    /// Block device.
    Disk(PathBuf),
}

impl Disk {
    /// Make a reference to a block device.
    pub fn disk<O: Into<PathBuf>>(value: O) -> Disk { Disk::Disk(value.into()) }

    /// Make a reference to a sparse file.
    pub fn file<O: Into<PathBuf>>(value: O) -> Disk { Disk::File(value.into()) }

    pub fn path(&self) -> String {
        match self {
            Disk::File(path) | Disk::Disk(path) => path.to_string_lossy().into_owned(),
        }
    }

    /// Leaf description in the form the engine expects.
    pub fn to_nvlist(&self) -> NvList {
        let kind = match self {
            Disk::File(_) => "file",
            Disk::Disk(_) => "disk",
        };
        NvList::new().with("type", kind).with("path", self.path())
    }
}

/// Basic building block of
/// [Zpool](https://www.freebsd.org/doc/handbook/zfs-term.html).
#[derive(Debug, Clone, PartialEq)]
pub enum Vdev {
    /// Just a single disk or file.
    Naked(Disk),
    /// A mirror of multiple vdevs
    Mirror(Vec<Disk>),
    /// ZFS implements [RAID-Z](https://blogs.oracle.com/ahl/what-is-raid-z), a
    /// variation on standard RAID-5 that offers better distribution of
    /// parity and eliminates the “RAID-5 write hole”.
    RaidZ(Vec<Disk>),
    /// The same as RAID-Z, but with 2 parity drives.
    RaidZ2(Vec<Disk>),
}

impl Vdev {
    /// Check if given Vdev has enough disks: two for a mirror, one more than the parity for
    /// RAID-Z. Whether the disks exist is up to the engine.
    pub fn is_valid(&self) -> bool {
        match self {
            Vdev::Naked(_) => true,
            Vdev::Mirror(disks) => disks.len() >= 2,
            Vdev::RaidZ(disks) => disks.len() >= 2,
            Vdev::RaidZ2(disks) => disks.len() >= 3,
        }
    }

    fn group(kind: &str, disks: &[Disk]) -> NvList {
        NvList::new().with("type", kind).with("children", disks.iter().map(Disk::to_nvlist).collect::<Vec<_>>())
    }

    /// Description in the form the engine expects.
    pub fn to_nvlist(&self) -> NvList {
        match self {
            Vdev::Naked(disk) => disk.to_nvlist(),
            Vdev::Mirror(disks) => Vdev::group("mirror", disks),
            Vdev::RaidZ(disks) => Vdev::group("raidz", disks).with("nparity", 1_u64),
            Vdev::RaidZ2(disks) => Vdev::group("raidz", disks).with("nparity", 2_u64),
        }
    }

    /// Short-cut to Vdev::Naked(Disk::Disk(disk))
    pub fn disk<O: Into<PathBuf>>(value: O) -> Vdev { Vdev::Naked(Disk::Disk(value.into())) }

    /// Short-cut to Vdev::Naked(Disk::File(disk))
    pub fn file<O: Into<PathBuf>>(value: O) -> Vdev { Vdev::Naked(Disk::File(value.into())) }
}

/// One node of the vdev tree in a pool configuration.
#[derive(Debug, Clone, PartialEq, Getters)]
#[get = "pub"]
pub struct VdevInfo {
    /// `root`, `mirror`, `raidz`, `disk` or `file`.
    kind:     String,
    guid:     u64,
    /// Leaves only.
    path:     Option<String>,
    state:    VdevState,
    nparity:  u64,
    children: Vec<VdevInfo>,
}

impl VdevInfo {
    pub fn from_nvlist(nv: &NvList) -> VdevInfo {
        let children = nv
            .get_nvlist_array("children")
            .map(|children| children.iter().map(VdevInfo::from_nvlist).collect())
            .unwrap_or_default();
        VdevInfo {
            kind: nv.get_string("type").unwrap_or_default().to_string(),
            guid: nv.get_number("guid").unwrap_or(0),
            path: nv.get_string("path").ok().map(String::from),
            state: VdevState::from_raw(nv.get_number("state").unwrap_or(0)),
            nparity: nv.get_number("nparity").unwrap_or(0),
            children,
        }
    }

    pub fn is_leaf(&self) -> bool { self.children.is_empty() && self.path.is_some() }

    pub fn health(&self) -> Health { self.state.health() }

    /// Depth first search by guid or by path.
    pub fn find(&self, guid: Option<u64>, path: &str) -> Option<&VdevInfo> {
        let hit = match guid {
            Some(guid) => self.guid == guid,
            None => self.path.as_deref() == Some(path),
        };
        if hit {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(guid, path))
    }

    /// Every leaf below this node.
    pub fn leaves(&self) -> Vec<&VdevInfo> {
        if self.is_leaf() {
            return vec![self];
        }
        self.children.iter().flat_map(VdevInfo::leaves).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn get_disks(num: usize) -> Vec<Disk> { (0..num).map(|i| Disk::disk(format!("/dev/dsk/c0t{}d0", i))).collect() }

    #[test]
    fn raid_validation() {
        assert!(Vdev::disk("/dev/dsk/c0t0d0").is_valid());
        assert!(Vdev::Mirror(get_disks(2)).is_valid());
        assert!(!Vdev::Mirror(get_disks(1)).is_valid());
        assert!(Vdev::RaidZ(get_disks(3)).is_valid());
        assert!(!Vdev::RaidZ(get_disks(1)).is_valid());
        assert!(Vdev::RaidZ2(get_disks(3)).is_valid());
        assert!(!Vdev::RaidZ2(get_disks(2)).is_valid());
    }

    #[test]
    fn vdev_to_nvlist() {
        let naked = Vdev::file("/var/tmp/a").to_nvlist();
        assert_eq!("file", naked.get_string("type").unwrap());
        assert_eq!("/var/tmp/a", naked.get_string("path").unwrap());

        let raidz2 = Vdev::RaidZ2(get_disks(4)).to_nvlist();
        assert_eq!("raidz", raidz2.get_string("type").unwrap());
        assert_eq!(2, raidz2.get_number("nparity").unwrap());
        assert_eq!(4, raidz2.get_nvlist_array("children").unwrap().len());
    }

    #[test]
    fn short_versions() {
        assert_eq!(Vdev::Naked(Disk::Disk(PathBuf::from("wat"))), Vdev::disk("wat"));
        assert_eq!(Vdev::Naked(Disk::File(PathBuf::from("wat"))), Vdev::file("wat"));
    }

    #[test]
    fn config_tree_search() {
        let tree = NvList::new().with("type", "root").with("guid", 1_u64).with("state", 7_u64).with(
            "children",
            vec![NvList::new().with("type", "mirror").with("guid", 2_u64).with("state", 6_u64).with(
                "children",
                vec![
                    NvList::new().with("type", "disk").with("guid", 3_u64).with("path", "/dev/dsk/a").with("state", 7_u64),
                    NvList::new().with("type", "disk").with("guid", 4_u64).with("path", "/dev/dsk/b").with("state", 2_u64),
                ],
            )],
        );
        let root = VdevInfo::from_nvlist(&tree);
        assert_eq!(Health::Online, root.health());
        assert_eq!(2, root.leaves().len());
        assert_eq!(&4, root.find(None, "/dev/dsk/b").unwrap().guid());
        assert_eq!(Health::Offline, root.find(Some(4), "").unwrap().health());
        assert_eq!("mirror", root.find(Some(2), "").unwrap().kind());
        assert!(root.find(None, "/dev/dsk/c").is_none());
    }
}
