//! Mount table, share table and directories kept in memory. Every successful call is appended to
//! a journal, so tests can assert on the exact order things happened in.
use std::{collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
          io,
          sync::{Mutex, MutexGuard}};

use crate::{os::{MountOps, MNTTYPE_ZFS},
            parsers::MnttabLine};

/// Kind of primitive, used to target failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountOp {
    Mount,
    Unmount,
    Share,
    Unshare,
}

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEvent {
    Mount { special: String, mountpoint: String, options: String },
    Unmount(String),
    Share(String),
    Unshare(String),
    Mkdir(String),
    Rmdir(String),
}

#[derive(Debug, Default)]
struct MountState {
    mounts:    Vec<MnttabLine>,
    shares:    BTreeMap<String, String>,
    dirs:      BTreeSet<String>,
    populated: BTreeSet<String>,
    journal:   Vec<MountEvent>,
    inject:    HashMap<MountOp, VecDeque<(Option<String>, i32)>>,
}

impl MountState {
    fn injected(&mut self, op: MountOp, path: &str) -> io::Result<()> {
        let queue = match self.inject.get_mut(&op) {
            Some(queue) => queue,
            None => return Ok(()),
        };
        let hit = queue.iter().position(|(target, _)| target.as_deref().map_or(true, |t| t == path));
        match hit.and_then(|idx| queue.remove(idx)) {
            Some((_, code)) => Err(io::Error::from_raw_os_error(code)),
            None => Ok(()),
        }
    }

    fn is_mounted(&self, mountpoint: &str) -> bool { self.mounts.iter().any(|line| line.mountp() == mountpoint) }
}

fn is_below(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// In-memory [MountOps](../trait.MountOps.html).
#[derive(Debug, Default)]
pub struct MemoryMounter {
    state: Mutex<MountState>,
}

impl MemoryMounter {
    pub fn new() -> Self { MemoryMounter::default() }

    fn state(&self) -> MutexGuard<'_, MountState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail the next `op` with `code`.
    pub fn fail_next(&self, op: MountOp, code: i32) {
        self.state().inject.entry(op).or_default().push_back((None, code));
    }

    /// Fail the next `op` on `path` with `code`. Calls on other paths go through.
    pub fn fail_next_at<P: Into<String>>(&self, op: MountOp, path: P, code: i32) {
        self.state().inject.entry(op).or_default().push_back((Some(path.into()), code));
    }

    /// Put something into `dir`, so it is no longer empty.
    pub fn populate<P: Into<String>>(&self, dir: P) {
        let dir = dir.into();
        let mut state = self.state();
        state.dirs.insert(dir.clone());
        state.populated.insert(dir);
    }

    /// Add a mount made behind the library's back.
    pub fn add_mount(&self, line: MnttabLine) { self.state().mounts.push(line); }

    pub fn journal(&self) -> Vec<MountEvent> { self.state().journal.clone() }

    pub fn clear_journal(&self) { self.state().journal.clear(); }

    pub fn is_mounted(&self, mountpoint: &str) -> bool { self.state().is_mounted(mountpoint) }

    pub fn is_shared(&self, mountpoint: &str) -> bool { self.state().shares.contains_key(mountpoint) }

    pub fn dir_exists(&self, path: &str) -> bool { self.state().dirs.contains(path) }

    /// Mountpoints in the order they were mounted.
    pub fn mounted(&self) -> Vec<String> { self.state().mounts.iter().map(|line| line.mountp().clone()).collect() }
}

impl MountOps for MemoryMounter {
    fn mount(&self, special: &str, mountpoint: &str, options: &str) -> io::Result<()> {
        let mut state = self.state();
        state.injected(MountOp::Mount, mountpoint)?;
        if !state.dirs.contains(mountpoint) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        if state.is_mounted(mountpoint) || state.mounts.iter().any(|line| line.special() == special) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state.mounts.push(MnttabLine::new(special, mountpoint, MNTTYPE_ZFS, options));
        state.journal.push(MountEvent::Mount {
            special:    special.to_string(),
            mountpoint: mountpoint.to_string(),
            options:    options.to_string(),
        });
        Ok(())
    }

    fn unmount(&self, mountpoint: &str, _force: bool) -> io::Result<()> {
        let mut state = self.state();
        state.injected(MountOp::Unmount, mountpoint)?;
        let idx = state
            .mounts
            .iter()
            .position(|line| line.mountp() == mountpoint)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        if state.mounts.iter().any(|line| is_below(line.mountp(), mountpoint)) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state.mounts.remove(idx);
        state.journal.push(MountEvent::Unmount(mountpoint.to_string()));
        Ok(())
    }

    fn share(&self, mountpoint: &str, options: &str) -> io::Result<()> {
        let mut state = self.state();
        state.injected(MountOp::Share, mountpoint)?;
        if !state.is_mounted(mountpoint) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        state.shares.insert(mountpoint.to_string(), options.to_string());
        state.journal.push(MountEvent::Share(mountpoint.to_string()));
        Ok(())
    }

    fn unshare(&self, mountpoint: &str) -> io::Result<()> {
        let mut state = self.state();
        state.injected(MountOp::Unshare, mountpoint)?;
        if state.shares.remove(mountpoint).is_none() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        state.journal.push(MountEvent::Unshare(mountpoint.to_string()));
        Ok(())
    }

    fn mnttab(&self) -> io::Result<Vec<MnttabLine>> { Ok(self.state().mounts.clone()) }

    fn sharetab(&self) -> io::Result<Vec<String>> { Ok(self.state().shares.keys().cloned().collect()) }

    fn mkdirp(&self, path: &str) -> io::Result<()> {
        if !path.starts_with('/') {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mut state = self.state();
        let mut prefix = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            prefix.push('/');
            prefix.push_str(component);
            if state.dirs.insert(prefix.clone()) {
                state.journal.push(MountEvent::Mkdir(prefix.clone()));
            }
        }
        Ok(())
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        let mut state = self.state();
        if !state.dirs.contains(path) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let busy = state.is_mounted(path)
            || state.populated.contains(path)
            || state.dirs.iter().any(|dir| is_below(dir, path));
        if busy {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        state.dirs.remove(path);
        state.journal.push(MountEvent::Rmdir(path.to_string()));
        Ok(())
    }

    fn dir_is_empty(&self, path: &str) -> io::Result<bool> { Ok(!self.state().populated.contains(path)) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parent_cannot_be_unmounted_under_child() {
        let os = MemoryMounter::new();
        os.mkdirp("/a/b").unwrap();
        os.mount("tank/a", "/a", "rw").unwrap();
        os.mount("tank/a/b", "/a/b", "rw").unwrap();
        assert_eq!(Some(libc::EBUSY), os.unmount("/a", false).unwrap_err().raw_os_error());
        os.unmount("/a/b", false).unwrap();
        os.unmount("/a", false).unwrap();
        assert!(os.mounted().is_empty());
    }

    #[test]
    fn sibling_prefix_is_not_a_child() {
        let os = MemoryMounter::new();
        os.mkdirp("/a").unwrap();
        os.mkdirp("/ab").unwrap();
        os.mount("tank/a", "/a", "").unwrap();
        os.mount("tank/ab", "/ab", "").unwrap();
        os.unmount("/a", false).unwrap();
    }

    #[test]
    fn injected_failure_targets_path() {
        let os = MemoryMounter::new();
        os.mkdirp("/a").unwrap();
        os.mkdirp("/b").unwrap();
        os.fail_next_at(MountOp::Mount, "/b", libc::EIO);
        os.mount("tank/a", "/a", "").unwrap();
        assert_eq!(Some(libc::EIO), os.mount("tank/b", "/b", "").unwrap_err().raw_os_error());
        os.mount("tank/b", "/b", "").unwrap();
    }

    #[test]
    fn journal_and_directories() {
        let os = MemoryMounter::new();
        os.mkdirp("/tank/fs").unwrap();
        os.populate("/tank/data");
        assert!(!os.dir_is_empty("/tank/data").unwrap());
        assert!(os.rmdir("/tank").is_err());
        os.rmdir("/tank/fs").unwrap();
        assert_eq!(
            vec![
                MountEvent::Mkdir("/tank".into()),
                MountEvent::Mkdir("/tank/fs".into()),
                MountEvent::Rmdir("/tank/fs".into())
            ],
            os.journal()
        );
    }
}
