//! Storage engine that keeps everything in memory. It models what the control layer can observe
//! through the command interface: names, types, properties, transaction groups, guids, clones,
//! device minors and vdev trees. It stores no file data.
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    convert::TryFrom,
    fs::File,
    io::{self, Read, Write},
    mem::ManuallyDrop,
    os::unix::io::{FromRawFd, RawFd},
    sync::{Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use strum::IntoEnumIterator;

use crate::{
    ioctl::{Errno, ObjsetStats, Opcode, ZfsCmd, ZfsIoctl},
    nv::{NvList, NvValue},
    zfs::{properties::lookup_by_name, DatasetType, DrrBegin, PathExt, PropKind, ZfsProp, ZfsType,
          DEFAULT_VOLBLOCKSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE},
    zpool::properties::{VdevState, SPA_VERSION, VERSION_BOOTFS, VERSION_DITTO_BLOCKS, VERSION_GZIP,
                        VERSION_RAID6, VERSION_SPARES},
};

/// Smallest device a pool accepts.
pub const MIN_DEVICE_SIZE: u64 = 64 << 20;
const DEFAULT_ASHIFT: u64 = 9;

type Ret = Result<(), Errno>;

fn errno(code: i32) -> Errno { Errno(code) }

#[derive(Debug, Clone)]
struct Device {
    size:   u64,
    ashift: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct VdevNode {
    kind:     String,
    guid:     u64,
    path:     Option<String>,
    nparity:  u64,
    offline:  bool,
    faulted:  bool,
    size:     u64,
    ashift:   u64,
    children: Vec<VdevNode>,
}

impl VdevNode {
    fn is_leaf(&self) -> bool { self.kind == "disk" || self.kind == "file" }

    fn state(&self) -> VdevState {
        if self.is_leaf() {
            return if self.offline {
                VdevState::Offline
            } else if self.faulted {
                VdevState::Faulted
            } else {
                VdevState::Healthy
            };
        }
        let states: Vec<VdevState> = self.children.iter().map(VdevNode::state).collect();
        let healthy = states.iter().filter(|s| **s == VdevState::Healthy).count();
        let usable = states.iter().filter(|s| **s >= VdevState::Degraded).count();
        match self.kind.as_str() {
            "raidz" => {
                let bad = states.len() - usable;
                if bad as u64 > self.nparity {
                    VdevState::CantOpen
                } else if healthy == states.len() {
                    VdevState::Healthy
                } else {
                    VdevState::Degraded
                }
            },
            "root" => {
                if usable < states.len() {
                    VdevState::CantOpen
                } else if healthy == states.len() {
                    VdevState::Healthy
                } else {
                    VdevState::Degraded
                }
            },
            _ => {
                if healthy == states.len() {
                    VdevState::Healthy
                } else if usable > 0 {
                    VdevState::Degraded
                } else {
                    VdevState::CantOpen
                }
            },
        }
    }

    fn capacity(&self) -> u64 {
        if self.is_leaf() {
            return self.size;
        }
        let smallest = self.children.iter().map(VdevNode::capacity).min().unwrap_or(0);
        match self.kind.as_str() {
            "root" => self.children.iter().map(VdevNode::capacity).sum(),
            "raidz" => smallest * (self.children.len() as u64).saturating_sub(self.nparity),
            _ => smallest,
        }
    }

    fn leaves(&self) -> Vec<&VdevNode> {
        if self.is_leaf() {
            return vec![self];
        }
        self.children.iter().flat_map(VdevNode::leaves).collect()
    }

    /// Index path from `self` to the vdev with `guid`.
    fn path_to(&self, guid: u64) -> Option<Vec<usize>> {
        if self.guid == guid {
            return Some(Vec::new());
        }
        for (idx, child) in self.children.iter().enumerate() {
            if let Some(mut path) = child.path_to(guid) {
                path.insert(0, idx);
                return Some(path);
            }
        }
        None
    }

    fn at_mut(&mut self, path: &[usize]) -> &mut VdevNode {
        match path.split_first() {
            None => self,
            Some((idx, rest)) => self.children[*idx].at_mut(rest),
        }
    }

    fn at(&self, path: &[usize]) -> &VdevNode {
        match path.split_first() {
            None => self,
            Some((idx, rest)) => self.children[*idx].at(rest),
        }
    }

    fn to_nvlist(&self) -> NvList {
        let mut nv = NvList::new()
            .with("type", self.kind.as_str())
            .with("guid", self.guid)
            .with("state", self.state() as u64);
        if let Some(path) = &self.path {
            nv.insert("path", path.as_str());
            nv.insert("asize", self.size);
            nv.insert("ashift", self.ashift);
        }
        if self.kind == "raidz" {
            nv.insert("nparity", self.nparity);
        }
        if !self.children.is_empty() {
            nv.insert("children", self.children.iter().map(VdevNode::to_nvlist).collect::<Vec<_>>());
        }
        nv
    }
}

#[derive(Debug, Clone)]
struct MemDataset {
    kind:         DatasetType,
    is_snapshot:  bool,
    guid:         u64,
    create_txg:   u64,
    creation:     u64,
    props:        NvList,
    quota:        u64,
    reservation:  u64,
    volsize:      u64,
    volblocksize: u64,
    data:         u64,
    origin:       String,
    inconsistent: bool,
    minor:        bool,
    dirty:        bool,
}

impl MemDataset {
    fn mask(&self) -> ZfsType {
        if self.is_snapshot {
            ZfsType::SNAPSHOT
        } else {
            self.kind.as_mask()
        }
    }
}

#[derive(Debug, Clone)]
struct MemPool {
    guid:    u64,
    version: u64,
    root:    VdevNode,
    spares:  Vec<VdevNode>,
    props:   NvList,
    altroot: String,
    faulted: bool,
    scrub:   u64,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, MemDataset>,
    pools:    BTreeMap<String, MemPool>,
    exported: Vec<(String, MemPool, BTreeMap<String, MemDataset>)>,
    devices:  BTreeMap<String, Device>,
    txg:      u64,
    guid:     u64,
    inject:   HashMap<Opcode, VecDeque<i32>>,
    calls:    Vec<(Opcode, String)>,
}

/// In-memory engine. Cheap to create; every instance is an independent "kernel".
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
}

fn now() -> u64 { SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0) }

fn reply(cmd: &mut ZfsCmd, doc: &NvList) -> Ret {
    let packed = doc.pack();
    let needed = packed.len() as u64;
    if needed > cmd.dst_size {
        cmd.dst_size = needed;
        return Err(errno(libc::ENOMEM));
    }
    cmd.dst = packed;
    Ok(())
}

fn unpack(buf: &Option<Vec<u8>>) -> Result<NvList, Errno> {
    match buf {
        None => Ok(NvList::new()),
        Some(buf) => NvList::unpack(buf).map_err(|_| errno(libc::EINVAL)),
    }
}

/// Run `f` on the caller's descriptor without taking ownership of it.
fn with_fd<T, F: FnOnce(&mut File) -> io::Result<T>>(fd: u64, f: F) -> Result<T, Errno> {
    let raw = RawFd::try_from(fd).map_err(|_| errno(libc::EBADF))?;
    if raw < 0 {
        return Err(errno(libc::EBADF));
    }
    // SAFETY: the descriptor stays owned by the caller; ManuallyDrop keeps it open.
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(raw) });
    f(&mut file).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => errno(libc::EINVAL),
        _ => errno(e.raw_os_error().unwrap_or(libc::EIO)),
    })
}

impl State {
    fn next_txg(&mut self) -> u64 {
        self.txg += 1;
        self.txg
    }

    fn next_guid(&mut self) -> u64 {
        self.guid = self.guid.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        (self.guid >> 1) | 1
    }

    fn dataset(&self, name: &str) -> Result<&MemDataset, Errno> {
        self.datasets.get(name).ok_or_else(|| errno(libc::ENOENT))
    }

    fn dataset_mut(&mut self, name: &str) -> Result<&mut MemDataset, Errno> {
        self.datasets.get_mut(name).ok_or_else(|| errno(libc::ENOENT))
    }

    fn pool(&self, name: &str) -> Result<&MemPool, Errno> {
        self.pools.get(name.get_pool()).ok_or_else(|| errno(libc::ENOENT))
    }

    fn children(&self, parent: &str) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(name, ds)| !ds.is_snapshot && name.parent_name() == Some(parent))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn snapshots(&self, head: &str) -> Vec<String> {
        let mut snaps: Vec<(u64, String)> = self
            .datasets
            .iter()
            .filter(|(name, ds)| ds.is_snapshot && name.head_name() == head)
            .map(|(name, ds)| (ds.create_txg, name.clone()))
            .collect();
        snaps.sort();
        snaps.into_iter().map(|(_, name)| name).collect()
    }

    fn clones_of(&self, snap: &str) -> Vec<String> {
        self.datasets.iter().filter(|(_, ds)| ds.origin == snap).map(|(name, _)| name.clone()).collect()
    }

    fn subtree(&self, root: &str) -> Vec<String> {
        self.datasets.keys().filter(|name| name.is_child_of(root)).cloned().collect()
    }

    fn used(&self, name: &str) -> u64 {
        self.datasets
            .iter()
            .filter(|(key, ds)| !ds.is_snapshot && (key.as_str() == name || key.is_descendant_of(name)))
            .map(|(_, ds)| ds.data.max(ds.reservation))
            .sum()
    }

    fn available(&self, name: &str) -> u64 {
        let pool = name.get_pool();
        let capacity = self.pools.get(pool).map_or(0, |p| p.root.capacity());
        let mut avail = capacity.saturating_sub(self.used(pool));
        let mut cur = Some(name.head_name());
        while let Some(ds_name) = cur {
            if let Some(ds) = self.datasets.get(ds_name) {
                if ds.quota > 0 {
                    avail = avail.min(ds.quota.saturating_sub(self.used(ds_name)));
                }
            }
            cur = ds_name.parent_name();
        }
        avail
    }

    fn pool_version(&self, name: &str) -> u64 { self.pool(name).map_or(SPA_VERSION, |p| p.version) }

    /// Nearest node carrying `prop`, starting at `name`.
    fn lookup_prop<'s>(&'s self, name: &'s str, prop: &str, inherit: bool) -> Option<(&'s NvValue, &'s str)> {
        let mut cur = Some(name);
        while let Some(node) = cur {
            if let Some(value) = self.datasets.get(node).and_then(|ds| ds.props.get(prop)) {
                return Some((value, node));
            }
            cur = if inherit { node.parent_name() } else { None };
        }
        None
    }

    fn objset_stats(&self, name: &str) -> Result<ObjsetStats, Errno> {
        let ds = self.dataset(name)?;
        let clone_of = if ds.is_snapshot { String::new() } else { ds.origin.clone() };
        Ok(ObjsetStats {
            objset_type:  ds.kind as u64,
            is_snapshot:  ds.is_snapshot,
            inconsistent: ds.inconsistent,
            create_txg:   ds.create_txg,
            guid:         ds.guid,
            creation:     ds.creation,
            clone_of,
            num_clones:   self.clones_of(name).len() as u64,
        })
    }

    /// `{prop: {value, source}}` for everything visible on `name`. Statistics carry no source.
    fn props_doc(&self, name: &str) -> Result<NvList, Errno> {
        let ds = self.dataset(name)?;
        let mask = ds.mask();
        let mut doc = NvList::new();
        let stat = |value: u64| NvList::new().with("value", value);

        for prop in ZfsProp::iter() {
            if !prop.applies_to(mask) || prop.types() == ZfsType::POOL {
                continue;
            }
            match prop {
                ZfsProp::Creation => doc.insert(prop.name(), stat(ds.creation)),
                ZfsProp::Createtxg => doc.insert(prop.name(), stat(ds.create_txg)),
                ZfsProp::Used => doc.insert(prop.name(), stat(if ds.is_snapshot { 0 } else { self.used(name) })),
                ZfsProp::Referenced => doc.insert(prop.name(), stat(ds.data)),
                ZfsProp::Available => doc.insert(prop.name(), stat(self.available(name))),
                ZfsProp::CompressRatio => doc.insert(prop.name(), stat(100)),
                ZfsProp::Quota => doc.insert(prop.name(), stat(ds.quota)),
                ZfsProp::Reservation => doc.insert(prop.name(), stat(ds.reservation)),
                ZfsProp::Volsize => doc.insert(prop.name(), stat(ds.volsize)),
                ZfsProp::Volblocksize => doc.insert(prop.name(), stat(ds.volblocksize)),
                ZfsProp::Numclones => doc.insert(prop.name(), stat(self.clones_of(name).len() as u64)),
                _ if prop.is_readonly() => {},
                _ => {
                    if let Some((value, source)) = self.lookup_prop(name, prop.name(), prop.is_inheritable()) {
                        doc.insert(prop.name(), NvList::new().with("value", value.clone()).with("source", source));
                    }
                },
            }
        }
        if ds.kind == DatasetType::Volume && ds.is_snapshot {
            doc.insert("volsize", stat(ds.volsize));
            doc.insert("volblocksize", stat(ds.volblocksize));
        }

        let mut cur = Some(name);
        while let Some(node) = cur {
            if let Some(node_ds) = self.datasets.get(node) {
                for (key, value) in node_ds.props.iter().filter(|(key, _)| key.contains(':')) {
                    if !doc.contains_key(key) {
                        doc.insert(key, NvList::new().with("value", value.clone()).with("source", node));
                    }
                }
            }
            cur = node.parent_name();
        }
        Ok(doc)
    }

    /// Check a property document against what the engine accepts. `create` allows create-only
    /// properties.
    fn check_props(&self, name: &str, mask: ZfsType, props: &NvList, create: bool) -> Ret {
        let version = self.pool_version(name);
        for (key, value) in props.iter() {
            if key.contains(':') {
                if value.as_str().is_none() {
                    return Err(errno(libc::EINVAL));
                }
                continue;
            }
            let prop = lookup_by_name(key, ZfsType::DATASET).ok_or_else(|| errno(libc::EINVAL))?;
            if mask == ZfsType::SNAPSHOT || !prop.applies_to(mask) || prop.name() != key {
                return Err(errno(libc::EINVAL));
            }
            if prop.is_readonly() && !(create && prop.is_create_only()) {
                return Err(errno(libc::EINVAL));
            }
            let number = match (prop.kind(), value) {
                (PropKind::String, NvValue::String(_)) => None,
                (PropKind::String, _) => return Err(errno(libc::EINVAL)),
                (_, NvValue::Number(val)) => Some(*val),
                _ => return Err(errno(libc::EINVAL)),
            };
            let number = number.unwrap_or(0);
            match prop {
                ZfsProp::Compression if (5..=13).contains(&number) && version < VERSION_GZIP => {
                    return Err(errno(libc::ENOTSUP));
                },
                ZfsProp::Copies if number > 1 && version < VERSION_DITTO_BLOCKS => {
                    return Err(errno(libc::ENOTSUP));
                },
                ZfsProp::Volblocksize
                    if !number.is_power_of_two() || number < MIN_BLOCK_SIZE || number > MAX_BLOCK_SIZE =>
                {
                    return Err(errno(libc::EDOM));
                },
                ZfsProp::Quota if !create && number > 0 && number < self.used(name) => {
                    return Err(errno(libc::ENOSPC));
                },
                ZfsProp::Reservation if !create => {
                    let current = self.datasets.get(name).map_or(0, |ds| ds.reservation);
                    if number > current + self.available(name) {
                        return Err(errno(libc::ENOSPC));
                    }
                },
                ZfsProp::Volsize if !create => {
                    let blocksize = self.datasets.get(name).map_or(DEFAULT_VOLBLOCKSIZE, |ds| ds.volblocksize);
                    if number == 0 || number % blocksize != 0 {
                        return Err(errno(libc::EINVAL));
                    }
                },
                _ => {},
            }
        }
        Ok(())
    }

    fn store_props(&mut self, name: &str, props: &NvList) -> Ret {
        let ds = self.dataset_mut(name)?;
        for (key, value) in props.iter() {
            match (key, value) {
                ("quota", NvValue::Number(val)) => ds.quota = *val,
                ("reservation", NvValue::Number(val)) => ds.reservation = *val,
                ("volsize", NvValue::Number(val)) => ds.volsize = *val,
                ("volblocksize", NvValue::Number(val)) => ds.volblocksize = *val,
                _ => ds.props.insert(key, value.clone()),
            }
        }
        Ok(())
    }

    fn new_dataset(&mut self, kind: DatasetType, is_snapshot: bool) -> MemDataset {
        MemDataset {
            kind,
            is_snapshot,
            guid: self.next_guid(),
            create_txg: self.next_txg(),
            creation: now(),
            props: NvList::new(),
            quota: 0,
            reservation: 0,
            volsize: 0,
            volblocksize: DEFAULT_VOLBLOCKSIZE,
            data: 0,
            origin: String::new(),
            inconsistent: false,
            minor: false,
            dirty: false,
        }
    }

    fn check_parent(&self, name: &str) -> Ret {
        let parent = name.parent_name().ok_or_else(|| errno(libc::EINVAL))?;
        let parent = self.dataset(parent)?;
        if parent.is_snapshot || parent.kind != DatasetType::Filesystem {
            return Err(errno(libc::EINVAL));
        }
        Ok(())
    }

    fn create(&mut self, cmd: &ZfsCmd) -> Ret {
        let name = cmd.name.as_str();
        self.pool(name)?;
        if self.datasets.contains_key(name) {
            return Err(errno(libc::EEXIST));
        }
        self.check_parent(name)?;
        let props = unpack(&cmd.src)?;

        let mut ds = if cmd.value.is_empty() {
            let kind = DatasetType::from_raw(cmd.objset_type)
                .filter(|kind| *kind != DatasetType::Snapshot)
                .ok_or_else(|| errno(libc::EINVAL))?;
            self.check_props(name, kind.as_mask(), &props, true)?;
            let mut ds = self.new_dataset(kind, false);
            if kind == DatasetType::Volume {
                let volsize = props.get("volsize").and_then(NvValue::as_number).unwrap_or(0);
                let blocksize =
                    props.get("volblocksize").and_then(NvValue::as_number).unwrap_or(DEFAULT_VOLBLOCKSIZE);
                if volsize == 0 || volsize % blocksize != 0 {
                    return Err(errno(libc::EINVAL));
                }
            }
            ds.dirty = true;
            ds
        } else {
            let origin = self.dataset(&cmd.value)?.clone();
            if !origin.is_snapshot {
                return Err(errno(libc::EINVAL));
            }
            if cmd.value.get_pool() != name.get_pool() {
                return Err(errno(libc::EXDEV));
            }
            self.check_props(name, origin.kind.as_mask(), &props, false)?;
            let mut ds = self.new_dataset(origin.kind, false);
            ds.data = origin.data;
            ds.volsize = origin.volsize;
            ds.volblocksize = origin.volblocksize;
            ds.origin = cmd.value.clone();
            ds
        };
        ds.props = NvList::new();
        self.datasets.insert(name.to_string(), ds);
        self.store_props(name, &props)
    }

    fn destroy(&mut self, name: &str) -> Ret {
        let ds = self.dataset(name)?;
        if !ds.is_snapshot && name == name.get_pool() {
            return Err(errno(libc::EINVAL));
        }
        if ds.minor {
            return Err(errno(libc::EBUSY));
        }
        if ds.is_snapshot {
            if !self.clones_of(name).is_empty() {
                return Err(errno(libc::EBUSY));
            }
        } else if self.subtree(name).len() > 1 {
            return Err(errno(libc::EBUSY));
        }
        self.datasets.remove(name);
        Ok(())
    }

    fn destroy_snaps(&mut self, name: &str, snap: &str) -> Ret {
        self.dataset(name)?;
        let victims: Vec<String> = self
            .subtree(name)
            .into_iter()
            .filter(|ds| ds.get_snapshot() == Some(snap))
            .collect();
        if victims.is_empty() {
            return Err(errno(libc::ENOENT));
        }
        for victim in &victims {
            if !self.clones_of(victim).is_empty() || self.dataset(victim)?.minor {
                return Err(errno(libc::EBUSY));
            }
        }
        for victim in victims {
            self.datasets.remove(&victim);
        }
        Ok(())
    }

    fn snapshot(&mut self, name: &str, snap: &str, recursive: bool) -> Ret {
        let head = self.dataset(name)?;
        if head.is_snapshot {
            return Err(errno(libc::EINVAL));
        }
        let mut targets = vec![name.to_string()];
        if recursive {
            targets.extend(
                self.subtree(name)
                    .into_iter()
                    .filter(|ds| !ds.is_snapshot() && ds.as_str() != name),
            );
        }
        if targets.iter().any(|target| self.datasets.contains_key(&format!("{}@{}", target, snap))) {
            return Err(errno(libc::EEXIST));
        }
        let txg = self.next_txg();
        let creation = now();
        for target in targets {
            let head = self.dataset(&target)?.clone();
            let mut ds = self.new_dataset(head.kind, true);
            ds.create_txg = txg;
            ds.creation = creation;
            ds.data = head.data;
            ds.volsize = head.volsize;
            ds.volblocksize = head.volblocksize;
            self.datasets.insert(format!("{}@{}", target, snap), ds);
            self.dataset_mut(&target)?.dirty = false;
        }
        Ok(())
    }

    fn rollback(&mut self, name: &str) -> Ret {
        let head = self.dataset(name)?;
        if head.is_snapshot {
            return Err(errno(libc::EINVAL));
        }
        let latest = self.snapshots(name).pop().ok_or_else(|| errno(libc::ESRCH))?;
        let snap = self.dataset(&latest)?.clone();
        let ds = self.dataset_mut(name)?;
        ds.data = snap.data;
        ds.volsize = snap.volsize;
        ds.dirty = false;
        ds.inconsistent = false;
        Ok(())
    }

    fn move_tree(&mut self, renames: &[(String, String)]) {
        let moved: Vec<(String, MemDataset)> = renames
            .iter()
            .filter_map(|(from, to)| self.datasets.remove(from).map(|ds| (to.clone(), ds)))
            .collect();
        self.datasets.extend(moved);
        for ds in self.datasets.values_mut() {
            if let Some((_, to)) = renames.iter().find(|(from, _)| *from == ds.origin) {
                ds.origin = to.clone();
            }
        }
    }

    fn rename(&mut self, from: &str, to: &str, recursive: bool) -> Ret {
        let ds = self.dataset(from)?;
        if self.datasets.contains_key(to) {
            return Err(errno(libc::EEXIST));
        }
        if ds.is_snapshot {
            if from.head_name() != to.head_name() {
                return Err(errno(libc::EXDEV));
            }
            let old_snap = from.get_snapshot().unwrap_or_default();
            let new_snap = to.get_snapshot().ok_or_else(|| errno(libc::EINVAL))?;
            let heads = if recursive {
                self.subtree(from.head_name()).into_iter().filter(|ds| !ds.is_snapshot()).collect()
            } else {
                vec![from.head_name().to_string()]
            };
            let mut renames = Vec::new();
            for head in heads {
                let old = format!("{}@{}", head, old_snap);
                let new = format!("{}@{}", head, new_snap);
                if let Some(snap) = self.datasets.get(&old) {
                    if self.datasets.contains_key(&new) {
                        return Err(errno(libc::EEXIST));
                    }
                    if snap.minor {
                        return Err(errno(libc::EBUSY));
                    }
                    renames.push((old, new));
                }
            }
            self.move_tree(&renames);
            return Ok(());
        }

        if from.get_pool() != to.get_pool() {
            return Err(errno(libc::EXDEV));
        }
        if from == from.get_pool() || to.is_descendant_of(from) {
            return Err(errno(libc::EINVAL));
        }
        self.check_parent(to)?;
        let affected = self.subtree(from);
        if affected.iter().any(|name| self.datasets.get(name).map_or(false, |ds| ds.minor)) {
            return Err(errno(libc::EBUSY));
        }
        let renames: Vec<(String, String)> =
            affected.into_iter().map(|name| (name.clone(), format!("{}{}", to, &name[from.len()..]))).collect();
        self.move_tree(&renames);
        Ok(())
    }

    fn promote(&mut self, cmd: &mut ZfsCmd) -> Ret {
        let clone_name = cmd.name.clone();
        let clone = self.dataset(&clone_name)?;
        if clone.is_snapshot || clone.origin.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        let origin_snap = clone.origin.clone();
        let origin_fs = origin_snap.head_name().to_string();
        let pivot = self.dataset(&origin_snap)?.create_txg;
        let moving: Vec<String> = self
            .snapshots(&origin_fs)
            .into_iter()
            .filter(|snap| self.datasets.get(snap).map_or(false, |ds| ds.create_txg <= pivot))
            .collect();
        let mut renames = Vec::new();
        for snap in &moving {
            let short = snap.get_snapshot().unwrap_or_default();
            let target = format!("{}@{}", clone_name, short);
            if self.datasets.contains_key(&target) {
                cmd.value = short.to_string();
                return Err(errno(libc::EEXIST));
            }
            if self.dataset(snap)?.minor {
                return Err(errno(libc::EBUSY));
            }
            renames.push((snap.clone(), target));
        }
        let old_origin = self.dataset(&origin_fs)?.origin.clone();
        let new_origin = format!("{}@{}", clone_name, origin_snap.get_snapshot().unwrap_or_default());
        self.move_tree(&renames);
        self.dataset_mut(&clone_name)?.origin = old_origin;
        self.dataset_mut(&origin_fs)?.origin = new_origin;
        Ok(())
    }

    fn set_minor(&mut self, name: &str, create: bool) -> Ret {
        let ds = self.dataset_mut(name)?;
        if ds.kind != DatasetType::Volume {
            return Err(errno(libc::EINVAL));
        }
        match (create, ds.minor) {
            (true, true) => Err(errno(libc::EEXIST)),
            (false, false) => Err(errno(libc::ENXIO)),
            _ => {
                ds.minor = create;
                Ok(())
            },
        }
    }

    fn list_next(&self, cmd: &mut ZfsCmd, snapshots: bool) -> Ret {
        let parent = self.dataset(&cmd.name)?;
        if parent.is_snapshot {
            return Err(errno(libc::ESRCH));
        }
        let names = if snapshots { self.snapshots(&cmd.name) } else { self.children(&cmd.name) };
        let idx = usize::try_from(cmd.cookie).map_err(|_| errno(libc::ESRCH))?;
        let next = names.get(idx).ok_or_else(|| errno(libc::ESRCH))?;
        let doc = self.props_doc(next)?;
        let stats = self.objset_stats(next)?;
        reply(cmd, &doc)?;
        cmd.name = next.clone();
        cmd.cookie += 1;
        cmd.stats = stats;
        Ok(())
    }

    fn send(&self, cmd: &ZfsCmd) -> Ret {
        let snap = self.dataset(&cmd.name)?;
        if !snap.is_snapshot {
            return Err(errno(libc::EINVAL));
        }
        let fromguid = if cmd.value.is_empty() {
            0
        } else {
            let from = self.dataset(&cmd.value)?;
            if !from.is_snapshot || cmd.value.head_name() != cmd.name.head_name() || from.create_txg >= snap.create_txg
            {
                return Err(errno(libc::EXDEV));
            }
            from.guid
        };
        let payload = NvList::new()
            .with("data", snap.data)
            .with("volsize", snap.volsize)
            .with("volblocksize", snap.volblocksize)
            .pack();
        let mut begin = DrrBegin::new(cmd.name.as_str(), snap.guid, fromguid);
        begin.creation_time = snap.creation;
        begin.objset_type = u32::try_from(snap.kind as u64).unwrap_or(0);
        begin.payload_len = u32::try_from(payload.len()).map_err(|_| errno(libc::EOVERFLOW))?;
        with_fd(cmd.cookie, |file| {
            file.write_all(&begin.encode(false))?;
            file.write_all(&payload)?;
            file.flush()
        })
    }

    fn receive(&mut self, cmd: &ZfsCmd) -> Ret {
        let begin = cmd.begin_record.clone().ok_or_else(|| errno(libc::EINVAL))?;
        let mut payload = vec![0_u8; begin.payload_size()];
        with_fd(cmd.cookie, |file| file.read_exact(&mut payload))?;
        let payload = NvList::unpack(&payload).map_err(|_| errno(libc::EINVAL))?;
        let tosnap = cmd.value.as_str();
        let snap_name = tosnap.get_snapshot().ok_or_else(|| errno(libc::EINVAL))?.to_string();
        let fs = tosnap.head_name().to_string();
        self.pool(&fs)?;
        let force = cmd.guid != 0;

        if begin.is_incremental() {
            let head = self.dataset(&fs)?;
            let latest = self.snapshots(&fs).pop().ok_or_else(|| errno(libc::ENODEV))?;
            if self.dataset(&latest)?.guid != begin.fromguid {
                return Err(errno(libc::ENODEV));
            }
            if head.dirty && !force {
                return Err(errno(libc::ETXTBSY));
            }
            if self.datasets.contains_key(tosnap) {
                return Err(errno(libc::EEXIST));
            }
        } else {
            if self.datasets.contains_key(&fs) {
                return Err(errno(libc::EEXIST));
            }
            self.check_parent(&fs)?;
            let kind = DatasetType::from_raw(u64::from(begin.objset_type))
                .filter(|kind| *kind != DatasetType::Snapshot)
                .ok_or_else(|| errno(libc::EINVAL))?;
            let ds = self.new_dataset(kind, false);
            self.datasets.insert(fs.clone(), ds);
        }

        let head = self.dataset_mut(&fs)?;
        head.data = payload.get_number("data").unwrap_or(0);
        head.volsize = payload.get_number("volsize").unwrap_or(head.volsize);
        head.volblocksize = payload.get_number("volblocksize").unwrap_or(head.volblocksize);
        head.dirty = false;
        let head = head.clone();
        let mut snap = self.new_dataset(head.kind, true);
        snap.guid = begin.toguid;
        snap.creation = begin.creation_time;
        snap.data = head.data;
        snap.volsize = head.volsize;
        snap.volblocksize = head.volblocksize;
        self.datasets.insert(format!("{}@{}", fs, snap_name), snap);
        Ok(())
    }
}

const POOL_STATE_ACTIVE: u64 = 0;
const POOL_STATE_EXPORTED: u64 = 1;

fn prop_entry<V: crate::nv::NvTypeOp>(value: V, source: Option<&str>) -> NvList {
    let entry = NvList::new().with("value", value);
    match source {
        Some(source) => entry.with("source", source),
        None => entry,
    }
}

impl State {
    fn in_use(&self, path: &str) -> bool {
        self.pools
            .values()
            .any(|pool| pool.root.leaves().into_iter().chain(pool.spares.iter()).any(|leaf| leaf.path.as_deref() == Some(path)))
    }

    /// Turn a requested vdev description into a tree, claiming devices into `claimed`.
    fn build_vdev(&mut self, nv: &NvList, version: u64, claimed: &mut Vec<String>) -> Result<VdevNode, Errno> {
        let kind = nv.get_string("type").map_err(|_| errno(libc::EINVAL))?.to_string();
        let mut node = VdevNode {
            kind,
            guid: self.next_guid(),
            path: None,
            nparity: 0,
            offline: false,
            faulted: false,
            size: 0,
            ashift: DEFAULT_ASHIFT,
            children: Vec::new(),
        };
        if node.is_leaf() {
            let path = nv.get_string("path").map_err(|_| errno(libc::EINVAL))?.to_string();
            let device = self.devices.get(&path).cloned().ok_or_else(|| errno(libc::ENXIO))?;
            if self.in_use(&path) || claimed.contains(&path) {
                return Err(errno(libc::EBUSY));
            }
            if device.size < MIN_DEVICE_SIZE {
                return Err(errno(libc::EOVERFLOW));
            }
            claimed.push(path.clone());
            node.path = Some(path);
            node.size = device.size;
            node.ashift = device.ashift;
            return Ok(node);
        }
        let children = nv.get_nvlist_array("children").map_err(|_| errno(libc::EINVAL))?.to_vec();
        for child in &children {
            let child = self.build_vdev(child, version, claimed)?;
            node.children.push(child);
        }
        match node.kind.as_str() {
            "mirror" if node.children.len() < 2 => return Err(errno(libc::EINVAL)),
            "mirror" => {},
            "raidz" => {
                node.nparity = nv.get_number("nparity").unwrap_or(1);
                if node.nparity > 1 && version < VERSION_RAID6 {
                    return Err(errno(libc::ENOTSUP));
                }
                if node.nparity == 0 || node.nparity > 2 || node.children.len() as u64 <= node.nparity {
                    return Err(errno(libc::EINVAL));
                }
            },
            "root" if !node.children.is_empty() => {},
            _ => return Err(errno(libc::EINVAL)),
        }
        let nested = if node.kind == "root" {
            node.children.iter().any(|child| child.kind == "root")
        } else {
            node.children.iter().any(|child| !child.is_leaf())
        };
        if nested {
            return Err(errno(libc::EINVAL));
        }
        Ok(node)
    }

    fn build_spares(&mut self, nv: &NvList, version: u64, claimed: &mut Vec<String>) -> Result<Vec<VdevNode>, Errno> {
        let spares = match nv.get_nvlist_array("spares") {
            Ok(spares) => spares.to_vec(),
            Err(_) => return Ok(Vec::new()),
        };
        if version < VERSION_SPARES {
            return Err(errno(libc::ENOTSUP));
        }
        let mut built = Vec::new();
        for spare in &spares {
            let spare = self.build_vdev(spare, version, claimed)?;
            if !spare.is_leaf() {
                return Err(errno(libc::EINVAL));
            }
            built.push(spare);
        }
        Ok(built)
    }

    fn pool_config(&self, name: &str, pool: &MemPool, state: u64) -> NvList {
        let mut config = NvList::new()
            .with("name", name)
            .with("pool_guid", pool.guid)
            .with("version", pool.version)
            .with("state", state)
            .with("scrub", pool.scrub)
            .with("vdev_tree", pool.root.to_nvlist());
        if !pool.spares.is_empty() {
            config.insert("spares", pool.spares.iter().map(VdevNode::to_nvlist).collect::<Vec<_>>());
        }
        config
    }

    fn pool_health(pool: &MemPool) -> &'static str {
        if pool.faulted {
            "FAULTED"
        } else {
            pool.root.state().health().into()
        }
    }

    fn pool_mut(&mut self, name: &str) -> Result<&mut MemPool, Errno> {
        self.pools.get_mut(name).ok_or_else(|| errno(libc::ENOENT))
    }

    fn pool_create(&mut self, cmd: &ZfsCmd) -> Ret {
        let name = cmd.name.as_str();
        if self.pools.contains_key(name) {
            return Err(errno(libc::EEXIST));
        }
        let props = unpack(&cmd.src)?;
        let version = props.get_number("version").unwrap_or(SPA_VERSION);
        if version == 0 || version > SPA_VERSION {
            return Err(errno(libc::EINVAL));
        }
        let conf = unpack(&cmd.conf)?;
        let mut claimed = Vec::new();
        let root = self.build_vdev(&conf, version, &mut claimed)?;
        if root.kind != "root" {
            return Err(errno(libc::EINVAL));
        }
        let spares = self.build_spares(&conf, version, &mut claimed)?;
        let pool = MemPool {
            guid: self.next_guid(),
            version,
            root,
            spares,
            props: NvList::new(),
            altroot: props.get_string("altroot").unwrap_or_default().to_string(),
            faulted: false,
            scrub: 0,
        };
        self.pools.insert(name.to_string(), pool);
        let mut root_ds = self.new_dataset(DatasetType::Filesystem, false);
        root_ds.dirty = true;
        self.datasets.insert(name.to_string(), root_ds);
        Ok(())
    }

    fn take_pool_datasets(&mut self, name: &str) -> BTreeMap<String, MemDataset> {
        let names: Vec<String> = self.datasets.keys().filter(|ds| ds.get_pool() == name).cloned().collect();
        names.into_iter().filter_map(|ds| self.datasets.remove(&ds).map(|v| (ds, v))).collect()
    }

    fn pool_destroy(&mut self, name: &str) -> Ret {
        self.pool_destroy_check(name)?;
        self.take_pool_datasets(name);
        self.pools.remove(name);
        Ok(())
    }

    fn pool_export(&mut self, name: &str) -> Ret {
        self.pool_destroy_check(name)?;
        let mut pool = self.pools.remove(name).ok_or_else(|| errno(libc::ENOENT))?;
        pool.altroot.clear();
        let datasets = self.take_pool_datasets(name);
        self.exported.push((name.to_string(), pool, datasets));
        Ok(())
    }

    fn pool_destroy_check(&self, name: &str) -> Ret {
        self.pools.get(name).ok_or_else(|| errno(libc::ENOENT))?;
        if self.datasets.iter().any(|(ds_name, ds)| ds_name.get_pool() == name && ds.minor) {
            return Err(errno(libc::EBUSY));
        }
        Ok(())
    }

    fn pool_import(&mut self, cmd: &ZfsCmd) -> Ret {
        let newname = cmd.name.as_str();
        let idx = self
            .exported
            .iter()
            .position(|(_, pool, _)| pool.guid == cmd.guid)
            .ok_or_else(|| errno(libc::ENOENT))?;
        if self.pools.contains_key(newname) {
            return Err(errno(libc::EEXIST));
        }
        let claimed = self.exported[idx].1.root.leaves().iter().any(|leaf| {
            leaf.path.as_deref().map_or(false, |path| self.in_use(path))
        });
        if claimed {
            return Err(errno(libc::EBUSY));
        }
        let props = unpack(&cmd.src)?;
        let (oldname, mut pool, datasets) = self.exported.remove(idx);
        pool.altroot = props.get_string("altroot").unwrap_or_default().to_string();
        for (ds_name, mut ds) in datasets {
            let renamed = format!("{}{}", newname, &ds_name[oldname.len()..]);
            if ds.origin.get_pool() == oldname && !ds.origin.is_empty() {
                ds.origin = format!("{}{}", newname, &ds.origin[oldname.len()..]);
            }
            self.datasets.insert(renamed, ds);
        }
        self.pools.insert(newname.to_string(), pool);
        Ok(())
    }

    fn pool_props(&self, name: &str) -> Result<NvList, Errno> {
        let pool = self.pools.get(name).ok_or_else(|| errno(libc::ENOENT))?;
        let local = |prop: &str| pool.props.get(prop).map(|value| (value.clone(), Some(name)));
        let (bootfs, bootfs_src) = local("bootfs").unwrap_or((NvValue::String(String::new()), None));
        let (autoreplace, autoreplace_src) = local("autoreplace").unwrap_or((NvValue::Number(0), None));
        let (failmode, failmode_src) = local("failmode").unwrap_or((NvValue::Number(0), None));
        let size = if pool.faulted { 0 } else { pool.root.capacity() };
        Ok(NvList::new()
            .with("name", prop_entry(name, None))
            .with("bootfs", prop_entry(bootfs, bootfs_src))
            .with("autoreplace", prop_entry(autoreplace, autoreplace_src))
            .with("failmode", prop_entry(failmode, failmode_src))
            .with("version", prop_entry(pool.version, None))
            .with("health", prop_entry(Self::pool_health(pool), None))
            .with("guid", prop_entry(pool.guid, None))
            .with("size", prop_entry(size, None))
            .with("altroot", prop_entry(pool.altroot.as_str(), None)))
    }

    fn pool_set_props(&mut self, cmd: &ZfsCmd) -> Ret {
        let name = cmd.name.as_str();
        let version = self.pools.get(name).ok_or_else(|| errno(libc::ENOENT))?.version;
        let props = unpack(&cmd.src)?;
        for (key, value) in props.iter() {
            match (key, value) {
                ("bootfs", NvValue::String(_)) if version < VERSION_BOOTFS => return Err(errno(libc::ENOTSUP)),
                ("bootfs", NvValue::String(fs)) if fs.is_empty() => {},
                ("bootfs", NvValue::String(fs)) => {
                    let ds = self.dataset(fs)?;
                    if fs.get_pool() != name || ds.is_snapshot || ds.kind != DatasetType::Filesystem {
                        return Err(errno(libc::EINVAL));
                    }
                },
                ("autoreplace", NvValue::Number(val)) if *val <= 1 => {},
                ("failmode", NvValue::Number(val)) if *val <= 2 => {},
                _ => return Err(errno(libc::EINVAL)),
            }
        }
        let pool = self.pool_mut(name)?;
        for (key, value) in props.iter() {
            pool.props.insert(key, value.clone());
        }
        Ok(())
    }

    fn vdev_add(&mut self, cmd: &ZfsCmd) -> Ret {
        let name = cmd.name.as_str();
        let version = self.pools.get(name).ok_or_else(|| errno(libc::ENOENT))?.version;
        let conf = unpack(&cmd.conf)?;
        let mut claimed = Vec::new();
        let mut added = Vec::new();
        if conf.contains_key("children") {
            let root = self.build_vdev(&conf, version, &mut claimed)?;
            added = root.children;
        }
        let spares = self.build_spares(&conf, version, &mut claimed)?;
        if added.is_empty() && spares.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        let pool = self.pool_mut(name)?;
        pool.root.children.extend(added);
        pool.spares.extend(spares);
        Ok(())
    }

    fn vdev_remove(&mut self, cmd: &ZfsCmd) -> Ret {
        let pool = self.pool_mut(&cmd.name)?;
        if let Some(idx) = pool.spares.iter().position(|spare| spare.guid == cmd.guid) {
            pool.spares.remove(idx);
            return Ok(());
        }
        match pool.root.path_to(cmd.guid) {
            Some(_) => Err(errno(libc::ENOTSUP)),
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn leaf_path(pool: &MemPool, guid: u64) -> Result<Vec<usize>, Errno> {
        let path = pool.root.path_to(guid).ok_or_else(|| errno(libc::ENODEV))?;
        if !pool.root.at(&path).is_leaf() {
            return Err(errno(libc::ENOTSUP));
        }
        Ok(path)
    }

    fn vdev_set_offline(&mut self, cmd: &ZfsCmd, offline: bool) -> Ret {
        let pool = self.pool_mut(&cmd.name)?;
        let path = Self::leaf_path(pool, cmd.guid)?;
        let mut candidate = pool.root.clone();
        candidate.at_mut(&path).offline = offline;
        if offline && candidate.state() < VdevState::Degraded {
            return Err(errno(libc::EBUSY));
        }
        pool.root = candidate;
        Ok(())
    }

    fn vdev_attach(&mut self, cmd: &ZfsCmd) -> Ret {
        let name = cmd.name.clone();
        let version = self.pools.get(&name).ok_or_else(|| errno(libc::ENOENT))?.version;
        let replacing = cmd.cookie != 0;
        let conf = unpack(&cmd.conf)?;
        let children = conf.get_nvlist_array("children").map_err(|_| errno(libc::EINVAL))?.to_vec();
        if children.len() != 1 {
            return Err(errno(libc::EINVAL));
        }
        let (path, target) = {
            let pool = self.pool(&name)?;
            let path = Self::leaf_path(pool, cmd.guid)?;
            (path.clone(), pool.root.at(&path).clone())
        };
        let spare_idx = children[0]
            .get_string("path")
            .ok()
            .and_then(|dev| self.pool(&name).ok()?.spares.iter().position(|s| s.path.as_deref() == Some(dev)));
        let new_leaf = match spare_idx {
            Some(idx) if replacing => self.pool_mut(&name)?.spares.remove(idx),
            _ => self.build_vdev(&children[0], version, &mut Vec::new())?,
        };
        if !new_leaf.is_leaf() {
            return Err(errno(libc::EINVAL));
        }
        if new_leaf.size < target.size {
            return Err(errno(libc::EOVERFLOW));
        }
        if new_leaf.ashift > target.ashift {
            return Err(errno(libc::EDOM));
        }
        let (parent_path, idx) = path.split_at(path.len() - 1);
        let pool = self.pool_mut(&name)?;
        let parent = pool.root.at_mut(parent_path);
        if parent.kind == "raidz" && !replacing {
            return Err(errno(libc::ENOTSUP));
        }
        if replacing {
            parent.children[idx[0]] = new_leaf;
        } else if parent.kind == "mirror" {
            parent.children.push(new_leaf);
        } else {
            let mirror = VdevNode {
                kind: String::from("mirror"),
                guid: new_leaf.guid ^ target.guid,
                path: None,
                nparity: 0,
                offline: false,
                faulted: false,
                size: 0,
                ashift: target.ashift,
                children: vec![target, new_leaf],
            };
            parent.children[idx[0]] = mirror;
        }
        Ok(())
    }

    fn vdev_detach(&mut self, cmd: &ZfsCmd) -> Ret {
        let pool = self.pool_mut(&cmd.name)?;
        let path = Self::leaf_path(pool, cmd.guid)?;
        let (parent_path, idx) = path.split_at(path.len() - 1);
        let mut candidate = pool.root.clone();
        let parent = candidate.at_mut(parent_path);
        if parent.kind != "mirror" {
            return Err(errno(libc::ENOTSUP));
        }
        parent.children.remove(idx[0]);
        if parent.children.len() == 1 {
            let survivor = parent.children.remove(0);
            *parent = survivor;
        }
        if candidate.state() < VdevState::Degraded {
            return Err(errno(libc::EBUSY));
        }
        pool.root = candidate;
        Ok(())
    }

    fn dispatch(&mut self, op: Opcode, cmd: &mut ZfsCmd) -> Ret {
        match op {
            Opcode::PoolCreate => self.pool_create(cmd),
            Opcode::PoolDestroy => self.pool_destroy(&cmd.name),
            Opcode::PoolImport => self.pool_import(cmd),
            Opcode::PoolExport => self.pool_export(&cmd.name),
            Opcode::PoolConfigs => {
                let mut doc = NvList::new();
                for (name, pool) in &self.pools {
                    doc.insert(name.as_str(), self.pool_config(name, pool, POOL_STATE_ACTIVE));
                }
                reply(cmd, &doc)
            },
            Opcode::PoolStats => {
                let pool = self.pools.get(&cmd.name).ok_or_else(|| errno(libc::ENOENT))?;
                let doc = self.pool_config(&cmd.name, pool, POOL_STATE_ACTIVE);
                let faulted = pool.faulted || pool.root.state() < VdevState::Degraded;
                reply(cmd, &doc)?;
                cmd.cookie = if faulted { libc::EIO as u64 } else { 0 };
                Ok(())
            },
            Opcode::PoolSearchImport => {
                let mut doc = NvList::new();
                for (name, pool, _) in &self.exported {
                    doc.insert(pool.guid.to_string(), self.pool_config(name, pool, POOL_STATE_EXPORTED));
                }
                reply(cmd, &doc)
            },
            Opcode::PoolScrub => {
                let pool = self.pool_mut(&cmd.name)?;
                if pool.faulted {
                    return Err(errno(libc::EIO));
                }
                pool.scrub = cmd.cookie;
                Ok(())
            },
            Opcode::PoolUpgrade => {
                let pool = self.pool_mut(&cmd.name)?;
                pool.version = SPA_VERSION;
                Ok(())
            },
            Opcode::PoolGetProps => {
                let doc = self.pool_props(&cmd.name)?;
                reply(cmd, &doc)
            },
            Opcode::PoolSetProps => self.pool_set_props(cmd),
            Opcode::VdevAdd => self.vdev_add(cmd),
            Opcode::VdevRemove => self.vdev_remove(cmd),
            Opcode::VdevOnline => self.vdev_set_offline(cmd, false),
            Opcode::VdevOffline => self.vdev_set_offline(cmd, true),
            Opcode::VdevAttach => self.vdev_attach(cmd),
            Opcode::VdevDetach => self.vdev_detach(cmd),
            Opcode::ObjsetStats => {
                let doc = self.props_doc(&cmd.name)?;
                let stats = self.objset_stats(&cmd.name)?;
                reply(cmd, &doc)?;
                cmd.stats = stats;
                Ok(())
            },
            Opcode::DatasetListNext => self.list_next(cmd, false),
            Opcode::SnapshotListNext => self.list_next(cmd, true),
            Opcode::SetProp => {
                let mask = self.dataset(&cmd.name)?.mask();
                let props = unpack(&cmd.src)?;
                self.check_props(&cmd.name, mask, &props, false)?;
                self.store_props(&cmd.name, &props)
            },
            Opcode::InheritProp => {
                let ds = self.dataset_mut(&cmd.name)?;
                if !cmd.value.contains(':') {
                    let prop = lookup_by_name(&cmd.value, ZfsType::DATASET).ok_or_else(|| errno(libc::EINVAL))?;
                    if !prop.is_inheritable() {
                        return Err(errno(libc::EINVAL));
                    }
                }
                ds.props.remove(&cmd.value);
                Ok(())
            },
            Opcode::Create => self.create(cmd),
            Opcode::Destroy => self.destroy(&cmd.name),
            Opcode::DestroySnaps => {
                let (name, snap) = (cmd.name.clone(), cmd.value.clone());
                self.destroy_snaps(&name, &snap)
            },
            Opcode::Rollback => self.rollback(&cmd.name),
            Opcode::Rename => {
                let (from, to) = (cmd.name.clone(), cmd.value.clone());
                self.rename(&from, &to, cmd.cookie != 0)
            },
            Opcode::Snapshot => {
                let (name, snap) = (cmd.name.clone(), cmd.value.clone());
                self.snapshot(&name, &snap, cmd.cookie != 0)
            },
            Opcode::Promote => self.promote(cmd),
            Opcode::SendBackup => self.send(cmd),
            Opcode::RecvBackup => self.receive(cmd),
            Opcode::CreateMinor => self.set_minor(&cmd.name, true),
            Opcode::RemoveMinor => self.set_minor(&cmd.name, false),
        }
    }
}

impl MemoryEngine {
    pub fn new() -> MemoryEngine { MemoryEngine::default() }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make a block device of `size` bytes available at `path`.
    pub fn add_device<P: Into<String>>(&self, path: P, size: u64) { self.add_device_with_ashift(path, size, DEFAULT_ASHIFT) }

    pub fn add_device_with_ashift<P: Into<String>>(&self, path: P, size: u64, ashift: u64) {
        self.state().devices.insert(path.into(), Device { size, ashift });
    }

    /// Mark a dataset as left behind by an interrupted receive.
    pub fn set_inconsistent(&self, name: &str) {
        if let Some(ds) = self.state().datasets.get_mut(name) {
            ds.inconsistent = true;
        }
    }

    /// Pretend `bytes` were written to a dataset.
    pub fn set_used(&self, name: &str, bytes: u64) {
        if let Some(ds) = self.state().datasets.get_mut(name) {
            ds.data = bytes;
            ds.dirty = true;
        }
    }

    pub fn set_pool_faulted(&self, pool: &str, faulted: bool) {
        if let Some(pool) = self.state().pools.get_mut(pool) {
            pool.faulted = faulted;
        }
    }

    /// Fault every leaf backed by `path`.
    pub fn set_device_faulted(&self, path: &str, faulted: bool) {
        fn walk(node: &mut VdevNode, path: &str, faulted: bool) {
            if node.path.as_deref() == Some(path) {
                node.faulted = faulted;
            }
            for child in &mut node.children {
                walk(child, path, faulted);
            }
        }
        for pool in self.state().pools.values_mut() {
            walk(&mut pool.root, path, faulted);
        }
    }

    /// Fail the next `op` with `code` instead of running it.
    pub fn fail_next(&self, op: Opcode, code: i32) { self.state().inject.entry(op).or_default().push_back(code); }

    /// Every command issued so far with the name it was addressed to.
    pub fn calls(&self) -> Vec<(Opcode, String)> { self.state().calls.clone() }

    pub fn clear_calls(&self) { self.state().calls.clear(); }
}

impl ZfsIoctl for MemoryEngine {
    fn ioctl(&self, op: Opcode, cmd: &mut ZfsCmd) -> Result<(), Errno> {
        let mut state = self.state();
        state.calls.push((op, cmd.name.clone()));
        if let Some(code) = state.inject.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(errno(code));
        }
        state.dispatch(op, cmd)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const GB: u64 = 1 << 30;

    fn engine_with_pool() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.add_device("/dev/dsk/c0t0d0", GB);
        engine.add_device("/dev/dsk/c0t1d0", GB);
        let conf = NvList::new().with(
            "children",
            vec![NvList::new().with("type", "mirror").with(
                "children",
                vec![
                    NvList::new().with("type", "disk").with("path", "/dev/dsk/c0t0d0"),
                    NvList::new().with("type", "disk").with("path", "/dev/dsk/c0t1d0"),
                ],
            )],
        );
        let mut cmd = ZfsCmd::new("tank").with_conf(&conf.with("type", "root"));
        engine.ioctl(Opcode::PoolCreate, &mut cmd).unwrap();
        engine
    }

    fn run(engine: &MemoryEngine, op: Opcode, cmd: ZfsCmd) -> Result<ZfsCmd, Errno> {
        let mut cmd = cmd;
        cmd.dst_size = 1 << 20;
        engine.ioctl(op, &mut cmd).map(|_| cmd)
    }

    fn create_fs(engine: &MemoryEngine, name: &str) {
        let mut cmd = ZfsCmd::new(name);
        cmd.objset_type = DatasetType::Filesystem as u64;
        run(engine, Opcode::Create, cmd).unwrap();
    }

    #[test]
    fn reply_too_small_reports_needed_size() {
        let engine = engine_with_pool();
        let mut cmd = ZfsCmd::new("tank");
        cmd.dst_size = 8;
        assert_eq!(Err(Errno(libc::ENOMEM)), engine.ioctl(Opcode::ObjsetStats, &mut cmd));
        assert!(cmd.dst_size > 8);
        assert!(cmd.dst.is_empty());
    }

    #[test]
    fn inherited_property_reports_setpoint() {
        let engine = engine_with_pool();
        create_fs(&engine, "tank/a");
        create_fs(&engine, "tank/a/b");
        let props = NvList::new().with("compression", 2_u64).with("com.example:owner", "ops");
        run(&engine, Opcode::SetProp, ZfsCmd::new("tank/a").with_src(&props)).unwrap();

        let cmd = run(&engine, Opcode::ObjsetStats, ZfsCmd::new("tank/a/b")).unwrap();
        let doc = NvList::unpack(&cmd.dst).unwrap();
        let compression = doc.get_nvlist("compression").unwrap();
        assert_eq!(2, compression.get_number("value").unwrap());
        assert_eq!("tank/a", compression.get_string("source").unwrap());
        assert_eq!("tank/a", doc.get_nvlist("com.example:owner").unwrap().get_string("source").unwrap());
        assert!(!doc.get_nvlist("used").unwrap().contains_key("source"));
    }

    #[test]
    fn destroy_refuses_busy_datasets() {
        let engine = engine_with_pool();
        create_fs(&engine, "tank/a");
        create_fs(&engine, "tank/a/b");
        assert_eq!(Err(Errno(libc::EBUSY)), run(&engine, Opcode::Destroy, ZfsCmd::new("tank/a")).map(|_| ()));
        run(&engine, Opcode::Snapshot, ZfsCmd::new("tank/a/b").with_value("s1")).unwrap();
        let mut clone = ZfsCmd::new("tank/c").with_value("tank/a/b@s1");
        clone.objset_type = DatasetType::Filesystem as u64;
        run(&engine, Opcode::Create, clone).unwrap();
        assert_eq!(
            Err(Errno(libc::EBUSY)),
            run(&engine, Opcode::Destroy, ZfsCmd::new("tank/a/b@s1")).map(|_| ())
        );
    }

    #[test]
    fn promote_swaps_origin() {
        let engine = engine_with_pool();
        create_fs(&engine, "tank/fs");
        run(&engine, Opcode::Snapshot, ZfsCmd::new("tank/fs").with_value("s1")).unwrap();
        run(&engine, Opcode::Snapshot, ZfsCmd::new("tank/fs").with_value("s2")).unwrap();
        let mut clone = ZfsCmd::new("tank/clone").with_value("tank/fs@s1");
        clone.objset_type = DatasetType::Filesystem as u64;
        run(&engine, Opcode::Create, clone).unwrap();

        run(&engine, Opcode::Promote, ZfsCmd::new("tank/clone")).unwrap();
        let state = engine.state();
        assert!(state.datasets.contains_key("tank/clone@s1"));
        assert!(state.datasets.contains_key("tank/fs@s2"));
        assert_eq!("tank/clone@s1", state.datasets["tank/fs"].origin);
        assert_eq!("", state.datasets["tank/clone"].origin);
    }

    #[test]
    fn promote_names_conflicting_snapshot() {
        let engine = engine_with_pool();
        create_fs(&engine, "tank/fs");
        run(&engine, Opcode::Snapshot, ZfsCmd::new("tank/fs").with_value("s1")).unwrap();
        let mut clone = ZfsCmd::new("tank/clone").with_value("tank/fs@s1");
        clone.objset_type = DatasetType::Filesystem as u64;
        run(&engine, Opcode::Create, clone).unwrap();
        run(&engine, Opcode::Snapshot, ZfsCmd::new("tank/clone").with_value("s1")).unwrap();

        let mut cmd = ZfsCmd::new("tank/clone");
        assert_eq!(Err(Errno(libc::EEXIST)), engine.ioctl(Opcode::Promote, &mut cmd));
        assert_eq!("s1", cmd.value);
    }

    #[test]
    fn listing_walks_children_with_cookie() {
        let engine = engine_with_pool();
        create_fs(&engine, "tank/a");
        create_fs(&engine, "tank/b");
        let mut names = Vec::new();
        let mut cookie = 0;
        loop {
            match run(&engine, Opcode::DatasetListNext, ZfsCmd::new("tank").with_cookie(cookie)) {
                Ok(cmd) => {
                    names.push(cmd.name.clone());
                    cookie = cmd.cookie;
                },
                Err(e) => {
                    assert_eq!(Errno(libc::ESRCH), e);
                    break;
                },
            }
        }
        assert_eq!(vec!["tank/a", "tank/b"], names);
    }

    #[test]
    fn offline_refuses_last_replica() {
        let engine = engine_with_pool();
        let guids: Vec<u64> = {
            let state = engine.state();
            state.pools["tank"].root.leaves().iter().map(|leaf| leaf.guid).collect()
        };
        run(&engine, Opcode::VdevOffline, ZfsCmd::new("tank").with_guid(guids[0])).unwrap();
        assert_eq!(
            Err(Errno(libc::EBUSY)),
            run(&engine, Opcode::VdevOffline, ZfsCmd::new("tank").with_guid(guids[1])).map(|_| ())
        );
        let props = NvList::unpack(&run(&engine, Opcode::PoolGetProps, ZfsCmd::new("tank")).unwrap().dst).unwrap();
        assert_eq!("DEGRADED", props.get_nvlist("health").unwrap().get_string("value").unwrap());
    }

    #[test]
    fn attach_checks_device_geometry() {
        let engine = engine_with_pool();
        engine.add_device("/dev/dsk/c1t0d0", 128 << 20);
        engine.add_device_with_ashift("/dev/dsk/c1t1d0", GB, 12);
        let target = engine.state().pools["tank"].root.leaves()[0].guid;
        let attach = |path: &str| {
            let conf = NvList::new()
                .with("type", "root")
                .with("children", vec![NvList::new().with("type", "disk").with("path", path)]);
            run(&engine, Opcode::VdevAttach, ZfsCmd::new("tank").with_guid(target).with_conf(&conf)).map(|_| ())
        };
        assert_eq!(Err(Errno(libc::EOVERFLOW)), attach("/dev/dsk/c1t0d0"));
        assert_eq!(Err(Errno(libc::EDOM)), attach("/dev/dsk/c1t1d0"));
        assert_eq!(Err(Errno(libc::ENXIO)), attach("/dev/dsk/c9t9d0"));
        assert_eq!(Err(Errno(libc::EBUSY)), attach("/dev/dsk/c0t1d0"));
    }

    #[test]
    fn old_pools_refuse_new_features() {
        let engine = MemoryEngine::new();
        engine.add_device("/dev/dsk/c0t0d0", GB);
        let conf = NvList::new()
            .with("type", "root")
            .with("children", vec![NvList::new().with("type", "disk").with("path", "/dev/dsk/c0t0d0")]);
        let props = NvList::new().with("version", 1_u64);
        run(&engine, Opcode::PoolCreate, ZfsCmd::new("old").with_conf(&conf).with_src(&props)).unwrap();
        let gzip = NvList::new().with("compression", 10_u64);
        assert_eq!(
            Err(Errno(libc::ENOTSUP)),
            run(&engine, Opcode::SetProp, ZfsCmd::new("old").with_src(&gzip)).map(|_| ())
        );
        let bootfs = NvList::new().with("bootfs", "old");
        assert_eq!(
            Err(Errno(libc::ENOTSUP)),
            run(&engine, Opcode::PoolSetProps, ZfsCmd::new("old").with_src(&bootfs)).map(|_| ())
        );
    }

    #[test]
    fn export_and_import_under_new_name() {
        let engine = engine_with_pool();
        create_fs(&engine, "tank/a");
        run(&engine, Opcode::PoolExport, ZfsCmd::new("tank")).unwrap();
        let found = NvList::unpack(&run(&engine, Opcode::PoolSearchImport, ZfsCmd::new("")).unwrap().dst).unwrap();
        let (_, config) = found.iter().next().unwrap();
        let guid = config.as_nvlist().unwrap().get_number("pool_guid").unwrap();
        run(&engine, Opcode::PoolImport, ZfsCmd::new("dozer").with_guid(guid)).unwrap();
        assert!(engine.state().datasets.contains_key("dozer/a"));
    }

    #[test]
    fn injected_failures_fire_once() {
        let engine = engine_with_pool();
        engine.fail_next(Opcode::Snapshot, libc::EIO);
        assert_eq!(
            Err(Errno(libc::EIO)),
            run(&engine, Opcode::Snapshot, ZfsCmd::new("tank").with_value("s")).map(|_| ())
        );
        run(&engine, Opcode::Snapshot, ZfsCmd::new("tank").with_value("s")).unwrap();
        let calls = engine.calls();
        assert_eq!(3, calls.len());
        assert_eq!((Opcode::Snapshot, String::from("tank")), calls[2]);
    }
}
