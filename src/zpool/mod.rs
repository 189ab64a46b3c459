//! Everything you need to work with zpools: creating, importing and exporting them, changing
//! their vdev layout and pool properties.
//!
//! A [ZpoolHandle](struct.ZpoolHandle.html) caches the pool configuration as of the last
//! [refresh_stats](struct.ZpoolHandle.html#method.refresh_stats); the configuration before that is
//! kept too, so callers can tell what an operation changed.
use std::fmt;

use slog::Logger;

use crate::{ioctl::{Errno, Opcode, ZfsCmd},
            nv::{NvList, NvTypeOp, NvValue},
            session::Session,
            utils::nicenum,
            zfs::{handle::{PropSource, ZfsHandle},
                  pathext::validate_pool_name,
                  validate_pool_properties, Error, Result, ZfsProp, ZfsType}};

pub mod mount;
pub mod properties;
pub mod topology;
pub mod vdev;

pub use properties::{Health, PoolState, VdevState, ZpoolProperties};
pub use topology::{CreateZpoolRequest, CreateZpoolRequestBuilder, Topology, TopologyBuilder};
pub use vdev::{Disk, Vdev, VdevInfo};

use properties::{SPA_VERSION, VERSION_BOOTFS, VERSION_RAID6, VERSION_SPARES};

/// What a scrub request should do.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u64)]
pub enum ScrubType {
    Stop = 0,
    Everything = 1,
}

/// An exported pool that can be imported.
#[derive(Debug, Clone, PartialEq, Getters)]
#[get = "pub"]
pub struct ImportablePool {
    name:   String,
    guid:   u64,
    health: Health,
    config: NvList,
}

/// Device names without a directory are looked up under the default device directory.
fn device_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/dev/dsk/{}", path)
    }
}

fn has_raidz2(topology: &Topology) -> bool { topology.vdevs().iter().any(|vdev| matches!(vdev, Vdev::RaidZ2(_))) }

/// Open pool.
pub struct ZpoolHandle<'a> {
    session:    &'a Session,
    name:       String,
    config:     NvList,
    old_config: Option<NvList>,
    state:      PoolState,
    logger:     Logger,
}

impl fmt::Debug for ZpoolHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZpoolHandle").field("name", &self.name).field("state", &self.state).finish()
    }
}

impl<'a> ZpoolHandle<'a> {
    /// Open a pool that may be faulted. Fails only if it doesn't exist.
    pub fn open_canfail(session: &'a Session, name: &str) -> Result<ZpoolHandle<'a>> {
        let context = format!("cannot open '{}'", name);
        validate_pool_name(name, false).map_err(|e| Error::InvalidName(context.clone(), e.to_string()))?;
        let mut zhp = ZpoolHandle {
            session,
            name: name.to_string(),
            config: NvList::new(),
            old_config: None,
            state: PoolState::Active,
            logger: session.logger().new(o!("zetta_module" => "zpool", "pool" => name.to_string())),
        };
        zhp.refresh_stats().map_err(|e| match e {
            Error::NotFound(..) => Error::NotFound(context, "no such pool".into()),
            e => e,
        })?;
        Ok(zhp)
    }

    /// Open a pool that must be usable.
    pub fn open(session: &'a Session, name: &str) -> Result<ZpoolHandle<'a>> {
        let zhp = ZpoolHandle::open_canfail(session, name)?;
        if zhp.state == PoolState::Unavailable {
            return Err(Error::PoolUnavailable(
                format!("cannot open '{}'", name),
                "pool is currently unavailable".into(),
            ));
        }
        Ok(zhp)
    }

    /// Fetch the configuration again. The previous one is kept as `old_config`.
    pub fn refresh_stats(&mut self) -> Result<()> {
        let mut cmd = ZfsCmd::new(self.name.as_str());
        let config = self
            .session
            .transport()
            .call_with_reply(Opcode::PoolStats, &mut cmd)
            .map_err(|Errno(errno)| Error::from_pool_errno(errno, format!("cannot refresh '{}'", self.name)))?;
        self.state = if cmd.cookie != 0 { PoolState::Unavailable } else { PoolState::Active };
        let old = std::mem::replace(&mut self.config, config);
        if !old.is_empty() {
            self.old_config = Some(old);
        }
        trace!(self.logger, "stats refreshed"; "state" => ?self.state);
        Ok(())
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn session(&self) -> &'a Session { self.session }

    pub fn logger(&self) -> &Logger { &self.logger }

    pub fn config(&self) -> &NvList { &self.config }

    /// Configuration before the last refresh.
    pub fn old_config(&self) -> Option<&NvList> { self.old_config.as_ref() }

    pub fn state(&self) -> PoolState { self.state }

    pub fn guid(&self) -> u64 { self.config.get_number("pool_guid").unwrap_or(0) }

    pub fn version(&self) -> u64 { self.config.get_number("version").unwrap_or(0) }

    /// Root of the vdev tree.
    pub fn vdevs(&self) -> VdevInfo {
        match self.config.get_nvlist("vdev_tree") {
            Ok(tree) => VdevInfo::from_nvlist(tree),
            Err(_) => VdevInfo::from_nvlist(&NvList::new()),
        }
    }

    /// Hot spares, in use or not.
    pub fn spares(&self) -> Vec<VdevInfo> {
        self.config
            .get_nvlist_array("spares")
            .map(|spares| spares.iter().map(VdevInfo::from_nvlist).collect())
            .unwrap_or_default()
    }

    pub fn health(&self) -> Health {
        if self.state == PoolState::Unavailable {
            return Health::Faulted;
        }
        self.vdevs().health()
    }

    /// Find a vdev by path (`c0t0d0` means `/dev/dsk/c0t0d0`) or by numeric guid, searching the
    /// vdev tree and then the spares. Returns the vdev and whether it is a spare that isn't in
    /// use.
    pub fn find_vdev(&self, search: &str) -> Option<(VdevInfo, bool)> {
        let (guid, path) = match search.parse::<u64>() {
            Ok(guid) => (Some(guid), String::new()),
            Err(_) => (None, device_path(search)),
        };
        if let Some(found) = self.vdevs().find(guid, &path) {
            return Some((found.clone(), false));
        }
        self.spares().into_iter().find_map(|spare| spare.find(guid, &path).cloned()).map(|found| (found, true))
    }

    /// Look up a vdev for an operation that doesn't accept idle spares.
    fn target(&self, search: &str, context: &str) -> Result<VdevInfo> {
        match self.find_vdev(search) {
            None => Err(Error::NoSuchDevice(context.into(), "no such device in pool".into())),
            Some((_, true)) => Err(Error::IsSpare(context.into(), "device is reserved as a hot spare".into())),
            Some((vdev, false)) => Ok(vdev),
        }
    }

    fn props_doc(&self) -> Result<NvList> {
        let mut cmd = ZfsCmd::new(self.name.as_str());
        self.session
            .transport()
            .call_with_reply(Opcode::PoolGetProps, &mut cmd)
            .map_err(|Errno(errno)| Error::from_pool_errno(errno, format!("cannot get properties of '{}'", self.name)))
    }

    /// Every pool property at once.
    pub fn properties(&self) -> Result<ZpoolProperties> { Ok(ZpoolProperties::from_nvlist(&self.props_doc()?)) }

    /// Formatted value and source of a pool property.
    pub fn get_prop(&self, prop: ZfsProp, literal: bool) -> Result<(String, PropSource)> {
        let context = format!("cannot get property '{}' of '{}'", prop, self.name);
        if prop.types() != ZfsType::POOL {
            return Err(Error::InvalidProperty(context, format!("'{}' is not a pool property", prop)));
        }
        let doc = self.props_doc()?;
        let entry = doc.get_nvlist(prop.name()).map_err(Error::Nv)?;
        let source = match entry.get_string("source") {
            Ok(_) => PropSource::Local,
            Err(_) if prop.is_readonly() => PropSource::None,
            Err(_) => PropSource::Default,
        };
        let value = match (prop, entry.get("value")) {
            (ZfsProp::Size, Some(NvValue::Number(size))) if !literal => nicenum(*size),
            (ZfsProp::Autoreplace, Some(NvValue::Number(on))) => String::from(if *on != 0 { "on" } else { "off" }),
            (ZfsProp::Failmode, Some(NvValue::Number(idx))) => prop.index_to_string(*idx).unwrap_or("-").to_string(),
            (_, Some(NvValue::String(val))) if val.is_empty() => String::from("-"),
            (_, Some(NvValue::String(val))) => val.clone(),
            (_, Some(NvValue::Number(val))) => val.to_string(),
            _ => String::from("-"),
        };
        Ok((value, source))
    }

    /// Set one pool property.
    pub fn set_prop<V: NvTypeOp>(&mut self, name: &str, value: V) -> Result<()> {
        let context = format!("cannot set property for '{}'", self.name);
        let props = validate_pool_properties(&self.name, &NvList::new().with(name, value), false)?;
        if props.contains_key("bootfs") && self.version() < VERSION_BOOTFS {
            return Err(Error::VersionTooOld(context, "pool must be upgraded to support 'bootfs' property".into()));
        }
        let mut cmd = ZfsCmd::new(self.name.as_str()).with_src(&props);
        self.session.call(Opcode::PoolSetProps, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::ENOTSUP => Error::VersionTooOld(context.clone(), "pool must be upgraded to support this property".into()),
            libc::EINVAL | libc::ENOENT => Error::bad_value(&context, format!("invalid value for '{}'", name)),
            _ => Error::from_pool_errno(errno, context.clone()),
        })?;
        info!(self.logger, "property set"; "property" => name);
        self.refresh_stats()
    }

    /// Unmount everything, then destroy the pool.
    pub fn destroy(self, force: bool) -> Result<()> {
        let context = format!("cannot destroy '{}'", self.name);
        self.disable_datasets(force)?;
        let root = ZfsHandle::open(self.session, &self.name, ZfsType::FILESYSTEM).ok();
        self.session.call(Opcode::PoolDestroy, &mut ZfsCmd::new(self.name.as_str())).map_err(|Errno(errno)| {
            match errno {
                libc::EROFS => Error::PermissionDenied(context.clone(), "one or more devices is read only".into()),
                _ => Error::from_pool_errno(errno, context.clone()),
            }
        })?;
        if let Some(root) = root {
            root.remove_mountpoint();
        }
        self.session.forget_pool(&self.name);
        info!(self.logger, "destroyed");
        Ok(())
    }

    /// Unmount everything, then export the pool.
    pub fn export(self, force: bool) -> Result<()> {
        let context = format!("cannot export '{}'", self.name);
        self.disable_datasets(force)?;
        self.session
            .call(Opcode::PoolExport, &mut ZfsCmd::new(self.name.as_str()))
            .map_err(|Errno(errno)| Error::from_pool_errno(errno, context))?;
        self.session.forget_pool(&self.name);
        info!(self.logger, "exported");
        Ok(())
    }

    /// Grow the pool by the vdevs and spares of `topology`.
    pub fn add(&mut self, topology: &Topology) -> Result<()> {
        let context = format!("cannot add to '{}'", self.name);
        if !topology.is_suitable_for_update() {
            return Err(Error::InvalidConfig(context, "invalid vdev specification".into()));
        }
        if !topology.spares().is_empty() && self.version() < VERSION_SPARES {
            return Err(Error::VersionTooOld(context, "pool must be upgraded to add hot spares".into()));
        }
        if has_raidz2(topology) && self.version() < VERSION_RAID6 {
            return Err(Error::VersionTooOld(context, "pool must be upgraded to add raidz2 vdevs".into()));
        }
        let mut cmd = ZfsCmd::new(self.name.as_str()).with_conf(&topology.to_nvlist());
        self.session.call(Opcode::VdevAdd, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::EBUSY => Error::Busy(context.clone(), "one or more vdevs refer to the same device".into()),
            libc::EOVERFLOW => Error::DeviceTooSmall(context.clone(), "device is less than the minimum size".into()),
            libc::ENOTSUP => Error::VersionTooOld(context.clone(), "pool must be upgraded to add these vdevs".into()),
            _ => Error::from_pool_errno(errno, context.clone()),
        })?;
        info!(self.logger, "vdevs added"; "vdevs" => topology.vdevs().len(), "spares" => topology.spares().len());
        self.refresh_stats()
    }

    /// Start or stop a scrub.
    pub fn scrub(&mut self, kind: ScrubType) -> Result<()> {
        let context = format!("cannot scrub '{}'", self.name);
        let mut cmd = ZfsCmd::new(self.name.as_str()).with_cookie(kind as u64);
        self.session.call(Opcode::PoolScrub, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::EBUSY => Error::Busy(context.clone(), "currently resilvering".into()),
            _ => Error::from_pool_errno(errno, context.clone()),
        })?;
        debug!(self.logger, "scrub"; "kind" => ?kind);
        self.refresh_stats()
    }

    /// Bring the on-disk format to the newest version.
    pub fn upgrade(&mut self) -> Result<()> {
        let context = format!("cannot upgrade '{}'", self.name);
        self.session
            .call(Opcode::PoolUpgrade, &mut ZfsCmd::new(self.name.as_str()))
            .map_err(|Errno(errno)| Error::from_pool_errno(errno, context))?;
        info!(self.logger, "upgraded"; "from" => self.version(), "to" => SPA_VERSION);
        self.refresh_stats()
    }

    pub fn online(&mut self, device: &str) -> Result<()> {
        let context = format!("cannot online {}", device);
        let vdev = self.target(device, &context)?;
        let mut cmd = ZfsCmd::new(self.name.as_str()).with_guid(*vdev.guid());
        self.session
            .call(Opcode::VdevOnline, &mut cmd)
            .map_err(|Errno(errno)| Error::from_pool_errno(errno, context))?;
        info!(self.logger, "online"; "device" => device);
        self.refresh_stats()
    }

    /// Take a device offline. Refused if that would leave data without a replica.
    pub fn offline(&mut self, device: &str) -> Result<()> {
        let context = format!("cannot offline {}", device);
        let vdev = self.target(device, &context)?;
        let mut cmd = ZfsCmd::new(self.name.as_str()).with_guid(*vdev.guid());
        self.session.call(Opcode::VdevOffline, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::EBUSY => Error::Busy(context.clone(), "no valid replicas".into()),
            _ => Error::from_pool_errno(errno, context.clone()),
        })?;
        info!(self.logger, "offline"; "device" => device);
        self.refresh_stats()
    }

    fn attach_inner(&mut self, device: &str, new_disk: &Disk, replacing: bool) -> Result<()> {
        let context = if replacing {
            format!("cannot replace {} with {}", device, new_disk.path())
        } else {
            format!("cannot attach {} to {}", new_disk.path(), device)
        };
        let vdev = self.target(device, &context)?;
        let conf = TopologyBuilder::default()
            .vdev(Vdev::Naked(new_disk.clone()))
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?
            .to_nvlist();
        let mut cmd = ZfsCmd::new(self.name.as_str())
            .with_guid(*vdev.guid())
            .with_cookie(u64::from(replacing))
            .with_conf(&conf);
        self.session.call(Opcode::VdevAttach, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::ENOTSUP if replacing => Error::NotSupported(context.clone(), "cannot replace a replacing device".into()),
            libc::ENOTSUP => {
                Error::NotSupported(context.clone(), "can only attach to mirrors and top-level disks".into())
            },
            libc::EINVAL => Error::InvalidConfig(context.clone(), "new device must be a single disk".into()),
            libc::EBUSY => Error::Busy(context.clone(), format!("{} is busy", new_disk.path())),
            libc::EOVERFLOW => Error::DeviceTooSmall(context.clone(), "device is too small".into()),
            libc::EDOM => Error::AlignmentMismatch(context.clone(), "devices have different sector alignment".into()),
            _ => Error::from_pool_errno(errno, context.clone()),
        })?;
        info!(self.logger, "{}", if replacing { "replaced" } else { "attached" }; "device" => device, "new" => new_disk.path());
        self.refresh_stats()
    }

    /// Mirror `device` onto `new_disk`.
    pub fn attach(&mut self, device: &str, new_disk: &Disk) -> Result<()> { self.attach_inner(device, new_disk, false) }

    /// Replace `device` with `new_disk`, which may be one of the pool's spares.
    pub fn replace(&mut self, device: &str, new_disk: &Disk) -> Result<()> { self.attach_inner(device, new_disk, true) }

    /// Detach a device from a mirror.
    pub fn detach(&mut self, device: &str) -> Result<()> {
        let context = format!("cannot detach {}", device);
        let vdev = self.target(device, &context)?;
        let mut cmd = ZfsCmd::new(self.name.as_str()).with_guid(*vdev.guid());
        self.session.call(Opcode::VdevDetach, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::ENOTSUP => {
                Error::NotSupported(context.clone(), "only applicable to mirror and replacing vdevs".into())
            },
            libc::EBUSY => Error::Busy(context.clone(), "there are no valid replicas".into()),
            _ => Error::from_pool_errno(errno, context.clone()),
        })?;
        info!(self.logger, "detached"; "device" => device);
        self.refresh_stats()
    }

    /// Remove an idle hot spare.
    pub fn remove_spare(&mut self, device: &str) -> Result<()> {
        let context = format!("cannot remove {}", device);
        let vdev = match self.find_vdev(device) {
            Some((vdev, true)) => vdev,
            Some((_, false)) => {
                return Err(Error::NotSupported(context, "only inactive hot spares can be removed".into()))
            },
            None => return Err(Error::NoSuchDevice(context, "no such device in pool".into())),
        };
        let mut cmd = ZfsCmd::new(self.name.as_str()).with_guid(*vdev.guid());
        self.session
            .call(Opcode::VdevRemove, &mut cmd)
            .map_err(|Errno(errno)| Error::from_pool_errno(errno, context))?;
        info!(self.logger, "spare removed"; "device" => device);
        self.refresh_stats()
    }
}

impl Session {
    /// Create a pool. With an alternate root the root dataset is mounted on `/` under it.
    pub fn create_pool(&self, request: &CreateZpoolRequest) -> Result<ZpoolHandle<'_>> {
        let name = request.name().as_str();
        let context = format!("cannot create '{}'", name);
        validate_pool_name(name, true).map_err(|e| Error::InvalidName(context.clone(), e.to_string()))?;
        let topology = request.topology();
        if !topology.is_suitable_for_create() {
            return Err(Error::InvalidConfig(context, "invalid vdev specification".into()));
        }
        let version = request.version().unwrap_or(SPA_VERSION);
        if !topology.spares().is_empty() && version < VERSION_SPARES {
            return Err(Error::VersionTooOld(context, "pool version does not support hot spares".into()));
        }
        if has_raidz2(topology) && version < VERSION_RAID6 {
            return Err(Error::VersionTooOld(context, "pool version does not support raidz2".into()));
        }

        let mut props = request.properties().clone();
        if let Some(altroot) = request.altroot() {
            props.insert("altroot", altroot.as_str());
        }
        let mut props = validate_pool_properties(name, &props, true)?;
        if props.contains_key("bootfs") && version < VERSION_BOOTFS {
            return Err(Error::VersionTooOld(context, "pool version does not support 'bootfs'".into()));
        }
        if let Some(version) = request.version() {
            props.insert("version", *version);
        }

        let mut cmd = ZfsCmd::new(name).with_conf(&topology.to_nvlist()).with_src(&props);
        self.call(Opcode::PoolCreate, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::EBUSY => Error::Busy(context.clone(), "one or more vdevs refer to the same device".into()),
            libc::EOVERFLOW => {
                Error::DeviceTooSmall(context.clone(), "one or more devices is less than the minimum size".into())
            },
            libc::ENOSPC => Error::SpaceExceeded(context.clone(), "one or more devices is out of space".into()),
            libc::ENOTSUP => Error::VersionTooOld(context.clone(), "pool version does not support this layout".into()),
            _ => Error::from_pool_errno(errno, context.clone()),
        })?;
        self.refresh_namespace()?;
        info!(self.logger(), "pool created"; "pool" => name);

        if request.altroot().is_some() {
            let mut root = ZfsHandle::open(self, name, ZfsType::FILESYSTEM)?;
            root.set_property("mountpoint", "/")?;
        }
        ZpoolHandle::open(self, name)
    }

    /// Exported pools the engine can see.
    pub fn importable_pools(&self) -> Result<Vec<ImportablePool>> {
        let doc = self
            .transport()
            .call_with_reply(Opcode::PoolSearchImport, &mut ZfsCmd::new(""))
            .map_err(|Errno(errno)| Error::from_pool_errno(errno, "cannot discover pools"))?;
        let mut found = Vec::new();
        for (_, config) in doc.iter() {
            let config = match config.as_nvlist() {
                Some(config) => config,
                None => continue,
            };
            let state = config
                .get_nvlist("vdev_tree")
                .map(|tree| VdevState::from_raw(tree.get_number("state").unwrap_or(0)))
                .unwrap_or(VdevState::Unknown);
            found.push(ImportablePool {
                name:   config.get_string("name").unwrap_or_default().to_string(),
                guid:   config.get_number("pool_guid").unwrap_or(0),
                health: state.health(),
                config: config.clone(),
            });
        }
        Ok(found)
    }

    /// Import the exported pool with `guid`, optionally under a new name and alternate root.
    /// Datasets are not mounted; see [enable_datasets](struct.ZpoolHandle.html#method.enable_datasets).
    pub fn import_pool(&self, guid: u64, newname: Option<&str>, altroot: Option<&str>) -> Result<ZpoolHandle<'_>> {
        let pool = self
            .importable_pools()?
            .into_iter()
            .find(|pool| pool.guid == guid)
            .ok_or_else(|| Error::NotFound(format!("cannot import '{}'", guid), "no such pool available".into()))?;
        let name = newname.unwrap_or(&pool.name);
        let context = match newname {
            Some(newname) => format!("cannot import '{}' as '{}'", pool.name, newname),
            None => format!("cannot import '{}'", pool.name),
        };
        validate_pool_name(name, false).map_err(|e| Error::InvalidName(context.clone(), e.to_string()))?;
        let mut props = NvList::new();
        if let Some(altroot) = altroot {
            props = validate_pool_properties(name, &props.with("altroot", altroot), true)?;
        }

        let mut cmd = ZfsCmd::new(name).with_guid(guid).with_src(&props);
        self.call(Opcode::PoolImport, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::ENOTSUP => Error::VersionTooOld(context.clone(), "pool uses a newer on-disk version".into()),
            libc::EINVAL => Error::InvalidConfig(context.clone(), "invalid vdev configuration".into()),
            libc::EEXIST => Error::AlreadyExists(context.clone(), "a pool with that name already exists".into()),
            libc::EBUSY => Error::Busy(context.clone(), "one or more devices are in use by another pool".into()),
            _ => Error::from_pool_errno(errno, context.clone()),
        })?;
        self.refresh_namespace()?;
        info!(self.logger(), "pool imported"; "pool" => name, "guid" => guid);
        ZpoolHandle::open_canfail(self, name)
    }
}
