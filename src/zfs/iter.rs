//! Walking the dataset tree: children, snapshots, descendants and everything that depends on a
//! dataset through clones.
use crate::{ioctl::{Errno, Opcode, ZfsCmd},
            zfs::{handle::ZfsHandle, DatasetType, Error, Result}};

/// Names the engine uses for its own bookkeeping.
fn is_hidden(name: &str) -> bool { name.contains('$') || name.contains('%') }

impl<'a> ZfsHandle<'a> {
    fn list(&self, op: Opcode) -> Result<Vec<ZfsHandle<'a>>> {
        let mut found = Vec::new();
        if self.kind() == DatasetType::Snapshot {
            return Ok(found);
        }
        let session = self.session();
        let mut cookie = 0;
        loop {
            let mut cmd = ZfsCmd::new(self.name()).with_cookie(cookie);
            let doc = match session.transport().call_with_reply(op, &mut cmd) {
                Ok(doc) => doc,
                Err(Errno(libc::ESRCH)) | Err(Errno(libc::ENOENT)) => break,
                Err(Errno(errno)) => {
                    return Err(Error::from_errno(errno, format!("cannot iterate over '{}'", self.name())))
                },
            };
            cookie = cmd.cookie;
            if is_hidden(&cmd.name) {
                continue;
            }
            let child = if cmd.stats.inconsistent {
                ZfsHandle::make(session, &cmd.name)
            } else {
                ZfsHandle::from_reply(session, &cmd.name, doc, cmd.stats.clone())
            };
            match child {
                Ok(child) => found.push(child),
                Err(e) => debug!(self.logger(), "skipping child"; "child" => &cmd.name, "error" => %e),
            }
        }
        Ok(found)
    }

    /// Direct child filesystems and volumes.
    pub fn iter_filesystems(&self) -> Result<Vec<ZfsHandle<'a>>> { self.list(Opcode::DatasetListNext) }

    /// Snapshots of this dataset, oldest first.
    pub fn iter_snapshots(&self) -> Result<Vec<ZfsHandle<'a>>> { self.list(Opcode::SnapshotListNext) }

    /// Child filesystems and volumes, then snapshots.
    pub fn iter_children(&self) -> Result<Vec<ZfsHandle<'a>>> {
        let mut children = self.iter_filesystems()?;
        children.extend(self.iter_snapshots()?);
        Ok(children)
    }

    /// Everything below this dataset, each child ahead of its own descendants.
    pub fn descendants(&self) -> Result<Vec<ZfsHandle<'a>>> {
        let mut found = Vec::new();
        for child in self.iter_children()? {
            let below = child.descendants()?;
            found.push(child);
            found.extend(below);
        }
        Ok(found)
    }

    /// Filesystems and volumes anywhere in the pool that were cloned from this snapshot.
    pub fn clones(&self) -> Result<Vec<ZfsHandle<'a>>> {
        let mut names = Vec::new();
        if self.kind() != DatasetType::Snapshot {
            return Ok(Vec::new());
        }
        let mut pending = vec![ZfsHandle::make(self.session(), self.pool_name())?];
        while let Some(zhp) = pending.pop() {
            for child in zhp.iter_filesystems()? {
                if child.stats().clone_of == self.name() {
                    names.push(child.name().to_string());
                }
                pending.push(child);
            }
        }
        names.sort();
        names.iter().map(|name| ZfsHandle::make(self.session(), name)).collect()
    }

    /// Everything that would have to go before this dataset could: descendants, plus clones of
    /// any snapshot on the way. Each dataset comes after everything that depends on it. With
    /// `allow_recursion` a dataset that depends on itself is skipped instead of failing the walk.
    pub fn dependents(&self, allow_recursion: bool) -> Result<Vec<ZfsHandle<'a>>> {
        let mut found = Vec::new();
        let mut stack = Vec::new();
        self.walk_dependents(allow_recursion, &mut stack, &mut found)?;
        Ok(found)
    }

    /// Returns `false` when this dataset was skipped as a repeat.
    fn walk_dependents(
        &self,
        allow_recursion: bool,
        stack: &mut Vec<String>,
        found: &mut Vec<ZfsHandle<'a>>,
    ) -> Result<bool> {
        let children = if self.kind() == DatasetType::Snapshot {
            self.clones()?
        } else {
            if stack.iter().any(|name| name == self.name()) {
                if allow_recursion {
                    return Ok(false);
                }
                return Err(Error::Internal(format!("recursive dependency at '{}'", self.name())));
            }
            self.iter_children()?
        };
        stack.push(self.name().to_string());
        for child in children {
            if child.walk_dependents(allow_recursion, stack, found)? {
                found.push(child);
            }
        }
        stack.pop();
        Ok(true)
    }
}
