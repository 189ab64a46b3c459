//! Changelists keep datasets that depend on a property of an ancestor consistent while that
//! property changes.
//!
//! Gathering records which datasets inherit the property and how each one is mounted and shared.
//! [prefix](struct.Changelist.html#method.prefix) takes them down (deepest mountpoint first), the
//! caller does its thing, and [postfix](struct.Changelist.html#method.postfix) brings back whatever
//! was up before in the reverse order. Renames rewrite the recorded names in between.
use std::cmp::Ordering;

use slog::Logger;

use crate::{session::Session,
            zfs::{handle::{PropSource, ZfsHandle},
                  DatasetType, Error, PathExt, Result, ZfsProp}};

struct ChangeNode<'a> {
    handle:     ZfsHandle<'a>,
    mounted:    bool,
    shared:     bool,
    zoned:      bool,
    /// Cleared when the node could not be taken down, so it is left alone afterwards.
    needpost:   bool,
    /// Effective mountpoint when gathered. `None` for anything that is never mounted.
    mountpoint: Option<String>,
}

/// Datasets affected by a change of one property on one root.
pub struct Changelist<'a> {
    session:        &'a Session,
    /// The property the caller is changing.
    realprop:       Option<ZfsProp>,
    /// The property whose inheritance decides who is affected.
    prop:           Option<ZfsProp>,
    nodes:          Vec<ChangeNode<'a>>,
    force:          bool,
    sorted:         bool,
    alldependents:  bool,
    allchildren:    bool,
    waslegacy:      bool,
    haszonedchild:  bool,
    logger:         Logger,
}

/// Deepest mountpoint first, datasets without one last.
fn compare_mountpoints(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl<'a> Changelist<'a> {
    /// A list nothing depends on.
    pub fn empty(session: &'a Session) -> Changelist<'a> {
        Changelist {
            session,
            realprop: None,
            prop: None,
            nodes: Vec::new(),
            force: false,
            sorted: false,
            alldependents: false,
            allchildren: false,
            waslegacy: false,
            haszonedchild: false,
            logger: session.logger().new(o!("zetta_module" => "changelist")),
        }
    }

    /// Collect everything below `root` that changing `prop` on it would disturb. `name` stands
    /// for a rename and pulls in every dependent, clones included. `force` is passed on to
    /// unmount.
    pub fn gather(root: &ZfsHandle<'a>, prop: ZfsProp, force: bool) -> Result<Changelist<'a>> {
        let mut clp = Changelist::empty(root.session());
        clp.realprop = Some(prop);
        clp.force = force;
        clp.prop = Some(match prop {
            ZfsProp::Name => {
                clp.alldependents = true;
                ZfsProp::Mountpoint
            },
            ZfsProp::Zoned => {
                clp.allchildren = true;
                ZfsProp::Mountpoint
            },
            ZfsProp::Canmount | ZfsProp::Volsize => ZfsProp::Mountpoint,
            other => other,
        });
        if clp.prop != Some(ZfsProp::Mountpoint) && clp.prop != Some(ZfsProp::Sharenfs) {
            return Ok(clp);
        }
        clp.sorted = matches!(prop, ZfsProp::Name | ZfsProp::Zoned | ZfsProp::Mountpoint | ZfsProp::Sharenfs);

        if clp.alldependents {
            for dependent in root.dependents(false)? {
                clp.change_one(dependent)?;
            }
        } else {
            for child in root.iter_children()? {
                clp.change_one(child)?;
            }
        }

        // The root gets a fresh handle of its own: the caller keeps using theirs.
        let handle = ZfsHandle::make(root.session(), root.name())?;
        if prop == ZfsProp::Mountpoint {
            if let Ok((mountpoint, _)) = handle.get_string(ZfsProp::Mountpoint) {
                clp.waslegacy = mountpoint == "legacy" || mountpoint == "none";
            }
        }
        let node = clp.node(handle);
        clp.insert(node, true);
        debug!(clp.logger, "gathered"; "root" => root.name(), "property" => prop.name(), "entries" => clp.nodes.len());
        Ok(clp)
    }

    fn node(&self, handle: ZfsHandle<'a>) -> ChangeNode<'a> {
        let zoned = handle.kind() == DatasetType::Filesystem && handle.get_prop_int(ZfsProp::Zoned).unwrap_or(0) != 0;
        let mountpoint = match handle.kind() {
            DatasetType::Filesystem => handle.get_string(ZfsProp::Mountpoint).ok().map(|(mp, _)| mp),
            _ => None,
        };
        ChangeNode {
            mounted: handle.is_mounted(),
            shared: handle.is_shared(),
            zoned,
            needpost: true,
            mountpoint,
            handle,
        }
    }

    /// Unsorted lists put descendants in front, so they still go down before their parents,
    /// and the root at the very end.
    fn insert(&mut self, node: ChangeNode<'a>, root: bool) {
        if self.sorted {
            let idx = self
                .nodes
                .iter()
                .position(|n| compare_mountpoints(&node.mountpoint, &n.mountpoint) == Ordering::Less)
                .unwrap_or_else(|| self.nodes.len());
            self.nodes.insert(idx, node);
        } else if root {
            self.nodes.push(node);
        } else {
            self.nodes.insert(0, node);
        }
    }

    /// Add `zhp` if it inherits the property or must move with the root anyway, then carry on
    /// below it. A dataset that sets the property itself shields its children.
    fn change_one(&mut self, zhp: ZfsHandle<'a>) -> Result<()> {
        let rename = self.realprop == Some(ZfsProp::Name);
        let include = if zhp.kind() == DatasetType::Volume && rename {
            true
        } else {
            match self.prop.map(|prop| zhp.get_string(prop)) {
                Some(Ok((_, source))) => {
                    self.alldependents
                        || self.allchildren
                        || source == PropSource::Default
                        || matches!(source, PropSource::Inherited(_))
                },
                _ => false,
            }
        };
        if !include {
            return Ok(());
        }
        let node = self.node(zhp);
        if self.session.global_zone() && node.zoned {
            self.haszonedchild = true;
        }
        if self.alldependents {
            self.insert(node, false);
            return Ok(());
        }
        let children = node.handle.iter_children()?;
        self.insert(node, false);
        for child in children {
            self.change_one(child)?;
        }
        Ok(())
    }

    /// Whether a dataset that would change is delegated to a non-global zone.
    pub fn has_zoned_child(&self) -> bool { self.haszonedchild }

    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn len(&self) -> usize { self.nodes.len() }

    /// Names in unmount order.
    pub fn names(&self) -> Vec<String> { self.nodes.iter().map(|n| n.handle.name().to_string()).collect() }

    fn skip(&self, node: &ChangeNode<'a>) -> bool { self.session.global_zone() && node.zoned }

    /// Take everything down. Every entry is attempted; entries that failed are not brought back
    /// by postfix. If anything failed, the rest is brought back up and the first error returned.
    pub fn prefix(&mut self) -> Result<()> {
        if self.prop != Some(ZfsProp::Mountpoint) && self.prop != Some(ZfsProp::Sharenfs) {
            return Ok(());
        }
        let rename = self.realprop == Some(ZfsProp::Name);
        let mut first_err = None;
        for idx in 0..self.nodes.len() {
            if self.skip(&self.nodes[idx]) {
                continue;
            }
            let node = &mut self.nodes[idx];
            let ret = if node.handle.kind() == DatasetType::Volume {
                if rename {
                    self.session.remove_device_link(node.handle.name())
                } else {
                    Ok(())
                }
            } else if self.prop == Some(ZfsProp::Sharenfs) {
                if let Err(e) = node.handle.unshare_nfs() {
                    warn!(self.logger, "failed to unshare"; "dataset" => node.handle.name(), "error" => %e);
                }
                Ok(())
            } else {
                node.handle.unmount(None, self.force)
            };
            if let Err(e) = ret {
                warn!(self.logger, "failed to take down"; "dataset" => node.handle.name(), "error" => %e);
                node.needpost = false;
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => {
                let _ = self.postfix();
                Err(e)
            },
            None => Ok(()),
        }
    }

    /// Bring back whatever was mounted or shared before prefix, parents first. Failures are
    /// collected; the first one is returned once everything was attempted.
    pub fn postfix(&mut self) -> Result<()> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        if self.prop == Some(ZfsProp::Mountpoint) {
            if let Some(last) = self.nodes.last() {
                last.handle.remove_mountpoint();
            }
        }
        let rename = self.realprop == Some(ZfsProp::Name);
        let mut first_err: Option<Error> = None;
        for idx in (0..self.nodes.len()).rev() {
            if self.skip(&self.nodes[idx]) || !self.nodes[idx].needpost {
                continue;
            }
            let waslegacy = self.waslegacy;
            let sharenfs = self.prop == Some(ZfsProp::Sharenfs);
            let node = &mut self.nodes[idx];
            if let Err(e) = node.handle.refresh() {
                first_err.get_or_insert(e);
                continue;
            }
            if node.handle.kind() == DatasetType::Volume {
                if rename {
                    if let Err(e) = self.session.create_device_link(node.handle.name()) {
                        first_err.get_or_insert(e);
                    }
                }
                continue;
            }
            if (waslegacy || node.mounted) && !node.handle.is_mounted() {
                if let Err(e) = node.handle.mount(None) {
                    first_err.get_or_insert(e);
                }
            }
            if node.shared || sharenfs {
                let ret = match node.handle.get_string(ZfsProp::Sharenfs) {
                    Ok((opts, _)) if opts == "off" => node.handle.unshare_nfs(),
                    _ => node.handle.share_nfs(),
                };
                if let Err(e) = ret {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => {
                warn!(self.logger, "failed to restore dependents"; "error" => %e);
                Err(e)
            },
            None => Ok(()),
        }
    }

    /// Rewrite names under `src` to live under `dst`. Called after a rename, before postfix.
    /// Old mountpoint directories are removed on the way.
    pub fn rename(&mut self, src: &str, dst: &str) {
        for node in self.nodes.iter_mut() {
            if !node.handle.name().is_child_of(src) {
                continue;
            }
            node.handle.remove_mountpoint();
            let renamed = format!("{}{}", dst, &node.handle.name()[src.len()..]);
            trace!(self.logger, "renaming entry"; "from" => node.handle.name(), "to" => &renamed);
            node.handle.rename_to(&renamed);
        }
    }

    /// Forget about `name`, typically because it no longer exists.
    pub fn remove(&mut self, name: &str) { self.nodes.retain(|node| node.handle.name() != name); }

    /// Unshare every entry of a `sharenfs` list.
    pub fn unshare(&mut self) -> Result<()> {
        if self.prop != Some(ZfsProp::Sharenfs) {
            return Ok(());
        }
        let mut first_err = None;
        for node in self.nodes.iter() {
            if let Err(e) = node.handle.unshare_nfs() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Whether `mountpoint` belongs to one of the entries.
    pub fn contains_mountpoint(&self, mountpoint: &str) -> bool {
        self.nodes.iter().any(|node| node.mountpoint.as_deref() == Some(mountpoint))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deepest_mountpoint_first() {
        let mut mps = vec![
            None,
            Some("/tank".to_string()),
            Some("/tank/a/b".to_string()),
            Some("/tank/a".to_string()),
            Some("/export".to_string()),
        ];
        mps.sort_by(compare_mountpoints);
        assert_eq!(
            vec![
                Some("/tank/a/b".to_string()),
                Some("/tank/a".to_string()),
                Some("/tank".to_string()),
                Some("/export".to_string()),
                None
            ],
            mps
        );
    }
}
