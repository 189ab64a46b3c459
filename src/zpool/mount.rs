//! Mounting and sharing every dataset of a pool at once, as import and export need.
use crate::{os::MNTTYPE_ZFS,
            zfs::{handle::ZfsHandle, DatasetType, Error, Result, ZfsType},
            zpool::ZpoolHandle};

impl<'a> ZpoolHandle<'a> {
    /// Mount every filesystem of the pool, parents before children, then share them. Volumes get
    /// their device links. Every dataset is attempted; the first failure is returned.
    pub fn enable_datasets(&self, mntopts: Option<&str>) -> Result<()> {
        let root = ZfsHandle::open(self.session(), self.name(), ZfsType::FILESYSTEM)?;
        let mut datasets: Vec<ZfsHandle<'a>> = root
            .descendants()?
            .into_iter()
            .filter(|zhp| zhp.kind() != DatasetType::Snapshot)
            .collect();
        datasets.push(root);
        // filesystems by mountpoint so parents come first, volumes after them
        datasets.sort_by_cached_key(|zhp| match zhp.kind() {
            DatasetType::Filesystem => (false, zhp.mountpoint().0),
            _ => (true, zhp.name().to_string()),
        });

        let mut first_err = None;
        let mut mounted = Vec::new();
        for zhp in &datasets {
            let ret = match zhp.kind() {
                DatasetType::Volume => self.session().create_device_link(zhp.name()),
                _ => zhp.mount(mntopts),
            };
            match ret {
                Ok(()) => mounted.push(zhp),
                Err(e) => {
                    warn!(self.logger(), "dataset not enabled"; "dataset" => zhp.name(), "error" => %e);
                    first_err.get_or_insert(e);
                },
            }
        }
        for zhp in mounted.into_iter().filter(|zhp| zhp.kind() == DatasetType::Filesystem) {
            if let Err(e) = zhp.share_nfs() {
                warn!(self.logger(), "dataset not shared"; "dataset" => zhp.name(), "error" => %e);
                first_err.get_or_insert(e);
            }
        }
        debug!(self.logger(), "datasets enabled"; "count" => datasets.len());
        first_err.map_or(Ok(()), Err)
    }

    /// Unshare and unmount everything the pool has mounted, deepest mountpoint first, and remove
    /// the mountpoint directories that were created automatically.
    pub fn disable_datasets(&self, force: bool) -> Result<()> {
        let context = format!("cannot unmount datasets of '{}'", self.name());
        let os = self.session().os();
        let prefix = format!("{}/", self.name());
        let table = os.mnttab().map_err(|e| Error::Io(context.clone(), e))?;
        let mut mounts: Vec<(String, String)> = table
            .iter()
            .filter(|line| line.fstype() == MNTTYPE_ZFS)
            .filter(|line| line.special() == self.name() || line.special().starts_with(&prefix))
            .map(|line| (line.mountp().to_string(), line.special().to_string()))
            .collect();
        mounts.sort();
        mounts.reverse();

        let shares = os.sharetab().unwrap_or_default();
        for (mountpoint, dataset) in &mounts {
            if shares.iter().any(|share| share == mountpoint) {
                os.unshare(mountpoint)
                    .map_err(|e| Error::ShareFailed(format!("cannot unshare '{}'", dataset), e.to_string()))?;
            }
        }
        for (mountpoint, dataset) in &mounts {
            os.unmount(mountpoint, force).map_err(|e| {
                Error::UnmountFailed(format!("cannot unmount '{}'", dataset), format!("{}: {}", mountpoint, e))
            })?;
            debug!(self.logger(), "unmounted"; "dataset" => dataset, "mountpoint" => mountpoint);
        }
        for (_, dataset) in &mounts {
            if let Ok(zhp) = ZfsHandle::make(self.session(), dataset) {
                zhp.remove_mountpoint();
            }
        }
        info!(self.logger(), "datasets disabled"; "count" => mounts.len());
        Ok(())
    }
}
