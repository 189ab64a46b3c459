//! Mounting, unmounting and NFS sharing of filesystems, and device links of volumes.
use std::io;

use crate::{ioctl::{Errno, Opcode, ZfsCmd},
            os::find_mount,
            session::Session,
            zfs::{changelist::Changelist,
                  handle::{PropSource, ZfsHandle},
                  DatasetType, Error, Result, ZfsProp}};

fn describe(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(libc::EBUSY) => "mountpoint or dataset is busy".into(),
        Some(libc::EPERM) | Some(libc::EACCES) => "Insufficient privileges".into(),
        _ => err.to_string(),
    }
}

impl<'a> ZfsHandle<'a> {
    /// Whether the dataset shows up in the mount table right now.
    pub fn is_mounted(&self) -> bool { self.live_mountpoint().is_some() }

    /// A filesystem with a real mountpoint that is allowed to be mounted in this zone.
    pub fn is_mountable(&self) -> bool {
        if self.kind() != DatasetType::Filesystem {
            return false;
        }
        let mountpoint = self.mountpoint().0;
        if mountpoint == "none" || mountpoint == "legacy" {
            return false;
        }
        if self.get_prop_int(ZfsProp::Canmount).unwrap_or(1) == 0 {
            return false;
        }
        let zoned = self.get_prop_int(ZfsProp::Zoned).unwrap_or(0) != 0;
        !(zoned && self.session().global_zone())
    }

    /// Mount on the effective mountpoint, creating it first. Does nothing for datasets that
    /// can't be mounted. Refuses a non-empty directory unless `overlay` or `remount` is among
    /// `options`.
    pub fn mount(&self, options: Option<&str>) -> Result<()> {
        let options = options.unwrap_or_default();
        if !self.is_mountable() {
            return Ok(());
        }
        let context = format!("cannot mount '{}'", self.name());
        let mountpoint = self.mountpoint().0;
        let os = self.session().os();
        os.mkdirp(&mountpoint)
            .map_err(|e| Error::MountFailed(context.clone(), format!("failed to create mountpoint: {}", e)))?;

        let overlay = options.split(',').any(|o| o == "overlay");
        let remount = options.split(',').any(|o| o == "remount");
        if !overlay && !remount && !os.dir_is_empty(&mountpoint).unwrap_or(true) {
            return Err(Error::MountFailed(context, "directory is not empty".into()));
        }
        let options: Vec<&str> = options.split(',').filter(|o| !o.is_empty() && *o != "overlay").collect();
        os.mount(self.name(), &mountpoint, &options.join(","))
            .map_err(|e| Error::MountFailed(context, describe(&e)))?;
        info!(self.logger(), "mounted"; "mountpoint" => &mountpoint);
        Ok(())
    }

    /// Unshare and unmount. `mountpoint` picks one mount when the dataset is mounted in more
    /// than one place. Not being mounted is not an error.
    pub fn unmount(&self, mountpoint: Option<&str>, force: bool) -> Result<()> {
        let context = format!("cannot unmount '{}'", self.name());
        let table = self.session().os().mnttab().map_err(|e| Error::Io(context.clone(), e))?;
        let target = match mountpoint {
            Some(mp) => table.iter().find(|line| line.mountp() == mp),
            None => find_mount(&table, self.name()),
        };
        let target = match target {
            Some(line) => line.mountp().clone(),
            None => return Ok(()),
        };
        self.unshare_at(&target)?;
        self.session()
            .os()
            .unmount(&target, force)
            .map_err(|e| Error::UnmountFailed(context, describe(&e)))?;
        info!(self.logger(), "unmounted"; "mountpoint" => &target);
        Ok(())
    }

    /// Whether the current mountpoint is exported over NFS.
    pub fn is_shared(&self) -> bool {
        match (self.live_mountpoint(), self.session().os().sharetab()) {
            (Some(mountpoint), Ok(shares)) => shares.iter().any(|share| *share == mountpoint),
            _ => false,
        }
    }

    /// Share according to `sharenfs`. Filesystems that are unmounted, unmountable, zoned or have
    /// sharing turned off are left alone.
    pub fn share_nfs(&self) -> Result<()> {
        if !self.is_mountable() {
            return Ok(());
        }
        let (options, _) = self.get_string(ZfsProp::Sharenfs)?;
        if options == "off" || self.get_prop_int(ZfsProp::Zoned).unwrap_or(0) != 0 {
            return Ok(());
        }
        let mountpoint = match self.live_mountpoint() {
            Some(mp) => mp,
            None => return Ok(()),
        };
        self.session()
            .os()
            .share(&mountpoint, &options)
            .map_err(|e| Error::ShareFailed(format!("cannot share '{}'", self.name()), e.to_string()))?;
        debug!(self.logger(), "shared"; "mountpoint" => &mountpoint, "options" => &options);
        Ok(())
    }

    /// Stop sharing the current mountpoint, if it is shared.
    pub fn unshare_nfs(&self) -> Result<()> {
        match self.live_mountpoint() {
            Some(mountpoint) => self.unshare_at(&mountpoint),
            None => Ok(()),
        }
    }

    fn unshare_at(&self, mountpoint: &str) -> Result<()> {
        let os = self.session().os();
        let shared = os.sharetab().map(|shares| shares.iter().any(|s| s == mountpoint)).unwrap_or(false);
        if !shared {
            return Ok(());
        }
        os.unshare(mountpoint)
            .map_err(|e| Error::ShareFailed(format!("cannot unshare '{}'", self.name()), e.to_string()))?;
        debug!(self.logger(), "unshared"; "mountpoint" => mountpoint);
        Ok(())
    }

    /// Unmount this filesystem and everything mounted below it, children first.
    pub fn unmount_all(&self, force: bool) -> Result<()> {
        let mut changelist = Changelist::gather(self, ZfsProp::Mountpoint, force)?;
        changelist.prefix()
    }

    /// Unshare this filesystem and everything below it that inherits `sharenfs`.
    pub fn unshare_all(&self) -> Result<()> {
        let mut changelist = Changelist::gather(self, ZfsProp::Sharenfs, false)?;
        changelist.unshare()
    }

    /// Remove the directory the dataset was mounted on, if it was put there automatically.
    /// Failures are logged and otherwise ignored.
    pub fn remove_mountpoint(&self) {
        if self.kind() != DatasetType::Filesystem {
            return;
        }
        let (mountpoint, source) = self.mountpoint();
        if !matches!(source, PropSource::Default | PropSource::Inherited(_)) || !mountpoint.starts_with('/') {
            return;
        }
        if let Err(e) = self.session().os().rmdir(&mountpoint) {
            debug!(self.logger(), "mountpoint left behind"; "mountpoint" => &mountpoint, "error" => %e);
        }
    }
}

impl Session {
    /// Create the device node of a volume. An existing link is fine.
    pub fn create_device_link(&self, name: &str) -> Result<()> {
        match self.call(Opcode::CreateMinor, &mut ZfsCmd::new(name)) {
            Ok(()) | Err(Errno(libc::EEXIST)) => Ok(()),
            Err(Errno(errno)) => Err(Error::DeviceLinks(
                format!("cannot create device links for '{}'", name),
                io::Error::from_raw_os_error(errno).to_string(),
            )),
        }
    }

    /// Remove the device node of a volume. A missing link is fine.
    pub fn remove_device_link(&self, name: &str) -> Result<()> {
        let context = format!("cannot remove device links for '{}'", name);
        match self.call(Opcode::RemoveMinor, &mut ZfsCmd::new(name)) {
            Ok(()) | Err(Errno(libc::ENXIO)) => Ok(()),
            Err(Errno(libc::EBUSY)) => Err(Error::Busy(context, "volume is busy".into())),
            Err(Errno(errno)) => Err(Error::DeviceLinks(context, io::Error::from_raw_os_error(errno).to_string())),
        }
    }
}
