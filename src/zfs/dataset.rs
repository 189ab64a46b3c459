//! Dataset lifecycle: create, destroy, snapshot, clone, promote, rollback and rename.
use crate::{ioctl::{Errno, Opcode, ZfsCmd},
            nv::{NvList, NvValue},
            session::Session,
            zfs::{changelist::Changelist,
                  handle::ZfsHandle,
                  pathext::validate_dataset_name,
                  validate_properties, CreateDatasetRequest, DatasetType, Error, PathExt, Result,
                  ValidateContext, ZfsProp, ZfsType, DEFAULT_VOLBLOCKSIZE}};

impl Session {
    /// Whether `name` exists, whatever its type.
    pub fn dataset_exists(&self, name: &str) -> bool {
        self.transport().call_with_reply(Opcode::ObjsetStats, &mut ZfsCmd::new(name)).is_ok()
    }

    /// Make sure the parent of `path` is an existing filesystem this zone may create under.
    /// Returns whether the parent is zoned.
    fn check_parents(&self, path: &str, context: &str) -> Result<bool> {
        let parent = path
            .parent_name()
            .ok_or_else(|| Error::InvalidName(context.into(), "missing dataset name".into()))?;
        let pool = path.get_pool();
        if !self.pool_exists(pool)? {
            return Err(Error::NotFound(context.into(), format!("no such pool '{}'", pool)));
        }
        let zhp = match ZfsHandle::open(self, parent, ZfsType::FILESYSTEM | ZfsType::VOLUME) {
            Ok(zhp) => zhp,
            Err(Error::NotFound(..)) => return Err(Error::NotFound(context.into(), "parent does not exist".into())),
            Err(e) => return Err(e),
        };
        if zhp.kind() != DatasetType::Filesystem {
            return Err(Error::WrongType(context.into(), "parent is not a filesystem".into()));
        }
        let zoned = zhp.get_prop_int(ZfsProp::Zoned)? != 0;
        if !self.global_zone() && !zoned {
            return Err(Error::PermissionDenied(context.into(), "permission denied".into()));
        }
        Ok(zoned)
    }

    /// Create a filesystem or volume. A volume that was created but didn't get its device link
    /// is reported as `DeviceLinks`, not as a failed create.
    pub fn create(&self, request: CreateDatasetRequest) -> Result<()> {
        let name = request.name().as_str();
        let kind = *request.kind();
        let context = format!("cannot create '{}'", name);
        if kind == DatasetType::Snapshot {
            return Err(Error::WrongType(context, "use snapshot to create snapshots".into()));
        }
        validate_dataset_name(name, kind.as_mask()).map_err(|e| Error::InvalidName(context.clone(), e.to_string()))?;
        let zoned = self.check_parents(name, &context)?;
        if self.dataset_exists(name) {
            return Err(Error::AlreadyExists(context, "dataset already exists".into()));
        }

        let ctx = ValidateContext::new(kind.as_mask(), context.clone()).creating().zoned(zoned, self.global_zone());
        let mut props = validate_properties(&ctx, request.properties())?;
        if kind == DatasetType::Volume {
            let volsize = props
                .get("volsize")
                .and_then(NvValue::as_number)
                .ok_or_else(|| Error::bad_value(&context, "missing volume size"))?;
            let blocksize = props.get("volblocksize").and_then(NvValue::as_number).unwrap_or(DEFAULT_VOLBLOCKSIZE);
            if volsize == 0 {
                return Err(Error::bad_value(&context, "volume size cannot be zero"));
            }
            if volsize % blocksize != 0 {
                return Err(Error::bad_value(&context, "volume size must be a multiple of volume block size"));
            }
            if !*request.sparse() && !props.contains_key("reservation") {
                props.insert("reservation", volsize);
            }
        }

        let mut cmd = ZfsCmd::new(name).with_src(&props);
        cmd.objset_type = kind as u64;
        self.call(Opcode::Create, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::ENOENT => Error::NotFound(context.clone(), "no such parent".into()),
            libc::EDOM => Error::bad_value(&context, "volume block size must be power of 2 from 512 to 128k"),
            libc::EINVAL => Error::bad_value(&context, "invalid property value"),
            _ => Error::from_errno(errno, context.clone()),
        })?;
        info!(self.logger(), "created"; "dataset" => name, "kind" => kind.as_ref());

        if kind == DatasetType::Volume {
            self.create_device_link(name).map_err(|e| {
                Error::DeviceLinks(format!("'{}' was created", name), format!("device links failed: {}", e))
            })?;
        }
        Ok(())
    }

    /// Snapshot `path` (`dataset@snap`). `recursive` snapshots every descendant under the same
    /// name; volume snapshots get device links, one failure not stopping the others.
    pub fn snapshot(&self, path: &str, recursive: bool) -> Result<()> {
        let context = format!("cannot create snapshot '{}'", path);
        validate_dataset_name(path, ZfsType::SNAPSHOT).map_err(|e| Error::InvalidName(context.clone(), e.to_string()))?;
        let snapname = path.get_snapshot().unwrap_or_default();
        let zhp = ZfsHandle::open(self, path.head_name(), ZfsType::FILESYSTEM | ZfsType::VOLUME)?;

        let mut cmd = ZfsCmd::new(zhp.name()).with_value(snapname).with_cookie(u64::from(recursive));
        self.call(Opcode::Snapshot, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::EEXIST if recursive => {
                Error::AlreadyExists(context.clone(), "a descendant already has a snapshot with this name".into())
            },
            _ => Error::from_errno(errno, context.clone()),
        })?;
        info!(self.logger(), "snapshot created"; "snapshot" => path, "recursive" => recursive);

        if recursive {
            for child in zhp.descendants()?.iter().filter(|c| c.kind() == DatasetType::Volume) {
                let snap = format!("{}@{}", child.name(), snapname);
                if let Err(e) = self.create_device_link(&snap) {
                    warn!(self.logger(), "no device link for snapshot"; "snapshot" => &snap, "error" => %e);
                }
            }
        }
        if zhp.kind() == DatasetType::Volume {
            if let Err(e) = self.create_device_link(path) {
                if let Err(Errno(errno)) = self.call(Opcode::Destroy, &mut ZfsCmd::new(path)) {
                    warn!(self.logger(), "unlinked snapshot left behind"; "snapshot" => path, "errno" => errno);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

impl<'a> ZfsHandle<'a> {
    /// Destroy this dataset. Filesystems are unmounted first; a volume loses its device link.
    /// The mountpoint directory goes too, unless somebody chose it explicitly.
    pub fn destroy(self) -> Result<()> {
        let context = format!("cannot destroy '{}'", self.name());
        match self.kind() {
            DatasetType::Filesystem => self.unmount(None, false)?,
            DatasetType::Volume => {
                if let Err(e) = self.session().remove_device_link(self.name()) {
                    warn!(self.logger(), "failed to remove device link"; "error" => %e);
                }
            },
            DatasetType::Snapshot if self.head_type() == DatasetType::Volume => {
                if let Err(e) = self.session().remove_device_link(self.name()) {
                    warn!(self.logger(), "failed to remove device link"; "error" => %e);
                }
            },
            DatasetType::Snapshot => {},
        }
        let mut cmd = ZfsCmd::new(self.name());
        cmd.objset_type = self.head_type() as u64;
        self.session().call(Opcode::Destroy, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::EINVAL if self.name() == self.pool_name() => {
                Error::WrongType(context.clone(), "operation does not apply to pools".into())
            },
            _ => Error::from_errno(errno, context.clone()),
        })?;
        info!(self.logger(), "destroyed");
        self.remove_mountpoint();
        Ok(())
    }

    /// Destroy `snapname` on this dataset and every descendant that has it.
    pub fn destroy_snaps(&self, snapname: &str) -> Result<()> {
        let context = format!("cannot destroy '{}@{}'", self.name(), snapname);
        let mut heads = vec![self.name().to_string()];
        heads.extend(self.descendants()?.iter().filter(|d| d.kind() == DatasetType::Volume).map(|d| d.name().to_string()));

        let mut unlinked = Vec::new();
        for head in heads {
            let snap = format!("{}@{}", head, snapname);
            if self.session().call(Opcode::RemoveMinor, &mut ZfsCmd::new(snap.as_str())).is_ok() {
                unlinked.push(snap);
            }
        }

        let mut cmd = ZfsCmd::new(self.name()).with_value(snapname);
        if let Err(Errno(errno)) = self.session().call(Opcode::DestroySnaps, &mut cmd) {
            for snap in &unlinked {
                if let Err(e) = self.session().create_device_link(snap) {
                    warn!(self.logger(), "failed to restore device link"; "snapshot" => snap, "error" => %e);
                }
            }
            return Err(match errno {
                libc::ENOENT => Error::NotFound(context, "no snapshots destroyed".into()),
                _ => Error::from_errno(errno, context),
            });
        }
        info!(self.logger(), "snapshots destroyed"; "snapshot" => snapname);
        Ok(())
    }

    /// Create `target` as a clone of this snapshot.
    pub fn clone_to(&self, target: &str, props: &NvList) -> Result<()> {
        let context = format!("cannot create '{}'", target);
        if self.kind() != DatasetType::Snapshot {
            return Err(Error::WrongType(context, "only snapshots can be cloned".into()));
        }
        validate_dataset_name(target, self.head_type().as_mask())
            .map_err(|e| Error::InvalidName(context.clone(), e.to_string()))?;
        if target.get_pool() != self.pool_name() {
            return Err(Error::CrossPoolOperation(context, "source and target pools differ".into()));
        }
        let zoned = self.session().check_parents(target, &context)?;

        let mut ctx = ValidateContext::new(self.head_type().as_mask(), context.clone()).zoned(zoned, self.session().global_zone());
        if self.head_type() == DatasetType::Volume {
            ctx = ctx.volume(
                self.get_prop_int(ZfsProp::Volsize)?,
                self.get_prop_int(ZfsProp::Volblocksize)?,
                0,
            );
        }
        let props = validate_properties(&ctx, props)?;

        let mut cmd = ZfsCmd::new(target).with_value(self.name()).with_src(&props);
        cmd.objset_type = self.head_type() as u64;
        self.session().call(Opcode::Create, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::ENOENT => Error::NotFound(context.clone(), format!("no such parent '{}'", target.parent_name().unwrap_or_default())),
            libc::EXDEV => Error::CrossPoolOperation(context.clone(), "source and target pools differ".into()),
            _ => Error::from_errno(errno, context.clone()),
        })?;
        info!(self.logger(), "cloned"; "clone" => target);
        if self.head_type() == DatasetType::Volume {
            self.session().create_device_link(target)?;
        }
        Ok(())
    }

    /// Make this clone independent of its origin. Snapshots of the origin up to the branch
    /// point move over to the clone, so none of their names may already be taken.
    pub fn promote(&mut self) -> Result<()> {
        let context = format!("cannot promote '{}'", self.name());
        if self.kind() == DatasetType::Snapshot {
            return Err(Error::WrongType(context, "snapshots can not be promoted".into()));
        }
        let origin = self.stats().clone_of.clone();
        if origin.is_empty() {
            return Err(Error::WrongType(context, "not a cloned filesystem".into()));
        }
        let session = self.session();
        let pivot = ZfsHandle::open(session, &origin, ZfsType::SNAPSHOT)?.stats().create_txg;
        let origin_fs = ZfsHandle::open(session, origin.head_name(), ZfsType::FILESYSTEM | ZfsType::VOLUME)?;
        let moving: Vec<ZfsHandle<'a>> =
            origin_fs.iter_snapshots()?.into_iter().filter(|snap| snap.stats().create_txg <= pivot).collect();

        for snap in &moving {
            let short = snap.name().get_snapshot().unwrap_or_default();
            let taken = format!("{}@{}", self.name(), short);
            if session.dataset_exists(&taken) {
                return Err(Error::AlreadyExists(
                    context,
                    format!("snapshot name '{}' from origin conflicts with '{}' from target", snap.name(), taken),
                ));
            }
        }
        let mut unlinked = Vec::new();
        for snap in moving.iter().filter(|snap| snap.head_type() == DatasetType::Volume) {
            if session.call(Opcode::RemoveMinor, &mut ZfsCmd::new(snap.name())).is_ok() {
                unlinked.push(snap.name().to_string());
            }
        }

        let mut cmd = ZfsCmd::new(self.name()).with_value(origin.as_str());
        if let Err(Errno(errno)) = session.call(Opcode::Promote, &mut cmd) {
            for snap in &unlinked {
                if let Err(e) = session.create_device_link(snap) {
                    warn!(self.logger(), "failed to restore device link"; "snapshot" => snap, "error" => %e);
                }
            }
            return Err(match errno {
                libc::EEXIST => Error::AlreadyExists(
                    context,
                    format!("conflicting snapshot name '{}' from parent '{}'", cmd.value, origin.head_name()),
                ),
                _ => Error::from_errno(errno, context),
            });
        }
        for snap in &unlinked {
            let short = snap.get_snapshot().unwrap_or_default();
            let moved = format!("{}@{}", self.name(), short);
            if let Err(e) = session.create_device_link(&moved) {
                warn!(self.logger(), "no device link for promoted snapshot"; "snapshot" => &moved, "error" => %e);
            }
        }
        info!(self.logger(), "promoted"; "origin" => &origin);
        self.refresh()
    }

    /// Roll back to `snap`, destroying every newer snapshot and whatever depends on those.
    /// Everything that depends on this dataset is unmounted for the duration.
    pub fn rollback(&mut self, snap: &ZfsHandle<'_>, force: bool) -> Result<()> {
        let context = format!("cannot rollback '{}'", self.name());
        if self.kind() == DatasetType::Snapshot {
            return Err(Error::WrongType(context, "snapshots can not be rolled back".into()));
        }
        if snap.kind() != DatasetType::Snapshot || snap.name().head_name() != self.name() {
            return Err(Error::InvalidName(context, format!("'{}' is not a snapshot of this dataset", snap.name())));
        }
        let target_txg = snap.stats().create_txg;

        let mut changelist = Changelist::gather(self, ZfsProp::Name, force)?;
        changelist.prefix()?;

        let mut failed: Option<Error> = None;
        for newer in self.iter_snapshots()?.into_iter().filter(|s| s.stats().create_txg > target_txg) {
            let dependents = match newer.dependents(false) {
                Ok(dependents) => dependents,
                Err(e) => {
                    failed.get_or_insert(e);
                    continue;
                },
            };
            for victim in dependents.into_iter().chain(std::iter::once(newer)) {
                let name = victim.name().to_string();
                match victim.destroy() {
                    Ok(()) => changelist.remove(&name),
                    Err(e) => {
                        failed.get_or_insert(e);
                    },
                }
            }
        }
        if let Some(e) = failed {
            let _ = changelist.postfix();
            return Err(e);
        }

        let mut cmd = ZfsCmd::new(self.name());
        cmd.objset_type = self.head_type() as u64;
        if let Err(Errno(errno)) = self.session().call(Opcode::Rollback, &mut cmd) {
            let _ = changelist.postfix();
            return Err(Error::from_errno(errno, context));
        }
        info!(self.logger(), "rolled back"; "snapshot" => snap.name());
        let restored = changelist.postfix();
        let refreshed = self.refresh();
        restored.and(refreshed)
    }

    /// Rename to `target`. Snapshots may be given just the new snapshot name. `recursive`
    /// renames a snapshot on every descendant at once and only applies to snapshots.
    pub fn rename(&mut self, target: &str, recursive: bool) -> Result<()> {
        if self.name() == target {
            return Ok(());
        }
        let mut context = format!("cannot rename to '{}'", target);
        let session = self.session();
        let target = if self.kind() == DatasetType::Snapshot {
            let target = match target.find('@') {
                None => format!("{}@{}", self.name().head_name(), target),
                Some(0) => format!("{}{}", self.name().head_name(), target),
                Some(_) if target.head_name() != self.name().head_name() => {
                    return Err(Error::CrossPoolOperation(context, "snapshots must be part of same dataset".into()));
                },
                Some(_) => target.to_string(),
            };
            validate_dataset_name(&target, ZfsType::SNAPSHOT)
                .map_err(|e| Error::InvalidName(context.clone(), e.to_string()))?;
            target
        } else {
            if recursive {
                return Err(Error::WrongType(context, "recursive rename must be a snapshot".into()));
            }
            validate_dataset_name(target, self.type_mask())
                .map_err(|e| Error::InvalidName(context.clone(), e.to_string()))?;
            if target.get_pool() != self.pool_name() {
                return Err(Error::CrossPoolOperation(context, "datasets must be within same pool".into()));
            }
            if target.is_descendant_of(self.name()) {
                return Err(Error::InvalidName(
                    context,
                    "new dataset name cannot be a descendant of current dataset name".into(),
                ));
            }
            session.check_parents(target, &context)?;
            if session.dataset_exists(target) {
                return Err(Error::AlreadyExists(context, "dataset already exists".into()));
            }
            target.to_string()
        };

        context = format!("cannot rename '{}'", self.name());
        if session.global_zone() && self.kind() == DatasetType::Filesystem && self.get_prop_int(ZfsProp::Zoned)? != 0 {
            return Err(Error::PermissionDenied(context, "dataset is used in a non-global zone".into()));
        }

        if recursive {
            self.rename_snapshots(&target, context)
        } else {
            self.rename_one(&target, context)
        }
    }

    fn rename_one(&mut self, target: &str, context: String) -> Result<()> {
        let session = self.session();
        let mut changelist = Changelist::gather(self, ZfsProp::Name, false)?;
        if changelist.has_zoned_child() {
            return Err(Error::PermissionDenied(
                context,
                "child dataset with inherited mountpoint is used in a non-global zone".into(),
            ));
        }
        changelist.prefix()?;

        let mut cmd = ZfsCmd::new(self.name()).with_value(target);
        cmd.objset_type = self.head_type() as u64;
        if let Err(Errno(errno)) = session.call(Opcode::Rename, &mut cmd) {
            let _ = changelist.postfix();
            return Err(Error::from_errno(errno, context));
        }
        info!(self.logger(), "renamed"; "to" => target);
        let from = self.name().to_string();
        changelist.rename(&from, target);
        self.rename_to(target);
        let restored = changelist.postfix();
        let refreshed = self.refresh();
        restored.and(refreshed)
    }

    /// Rename a snapshot on this dataset's head and every descendant. Device links of volume
    /// snapshots are dropped first and, on failure, recreated for exactly the ones that had one.
    fn rename_snapshots(&mut self, target: &str, context: String) -> Result<()> {
        let session = self.session();
        let head = ZfsHandle::open(session, self.name().head_name(), ZfsType::FILESYSTEM | ZfsType::VOLUME)?;
        let oldsnap = self.name().get_snapshot().unwrap_or_default().to_string();
        let newsnap = target.get_snapshot().unwrap_or_default().to_string();

        let mut volumes: Vec<String> = head
            .descendants()?
            .iter()
            .filter(|d| d.kind() == DatasetType::Volume)
            .map(|d| d.name().to_string())
            .collect();
        if head.kind() == DatasetType::Volume {
            volumes.push(head.name().to_string());
        }
        let mut linked = Vec::new();
        for volume in &volumes {
            let snap = format!("{}@{}", volume, oldsnap);
            if session.call(Opcode::RemoveMinor, &mut ZfsCmd::new(snap.as_str())).is_ok() {
                linked.push(volume.clone());
            }
        }

        let mut cmd = ZfsCmd::new(self.name()).with_value(target).with_cookie(1);
        if let Err(Errno(errno)) = session.call(Opcode::Rename, &mut cmd) {
            for volume in &linked {
                let snap = format!("{}@{}", volume, oldsnap);
                if let Err(e) = session.create_device_link(&snap) {
                    warn!(self.logger(), "failed to restore device link"; "snapshot" => &snap, "error" => %e);
                }
            }
            return Err(match errno {
                libc::EEXIST => Error::AlreadyExists(
                    format!("cannot rename to '{}'", target),
                    "a child dataset already has a snapshot with the new name".into(),
                ),
                _ => Error::from_errno(errno, context),
            });
        }
        info!(self.logger(), "renamed recursively"; "to" => target);
        for volume in &volumes {
            let snap = format!("{}@{}", volume, newsnap);
            if !session.dataset_exists(&snap) {
                continue;
            }
            if let Err(e) = session.create_device_link(&snap) {
                warn!(self.logger(), "no device link for renamed snapshot"; "snapshot" => &snap, "error" => %e);
            }
        }
        self.rename_to(target);
        self.refresh()
    }
}
