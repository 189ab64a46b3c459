//! Host OS primitives the control layer needs: mounting, NFS sharing and mountpoint directories.
//!
//! [system](system/index.html) talks to the real host by spawning helper commands and reading the
//! mount and share tables. [memory](memory/index.html) keeps the same state in memory and records
//! every call, which is what the test suite runs against.
use std::io;

use crate::parsers::MnttabLine;

pub mod memory;
pub mod system;

/// Filesystem type every dataset is mounted with.
pub const MNTTYPE_ZFS: &str = "zfs";

/// Mount, share and directory primitives. Using trait here, so I can mock it in tests.
pub trait MountOps: Send + Sync {
    /// Mount `special` on `mountpoint` with comma separated `options`.
    fn mount(&self, special: &str, mountpoint: &str, options: &str) -> io::Result<()>;
    fn unmount(&self, mountpoint: &str, force: bool) -> io::Result<()>;
    /// Export `mountpoint` over NFS. `options` is the value of `sharenfs`; `on` means defaults.
    fn share(&self, mountpoint: &str, options: &str) -> io::Result<()>;
    fn unshare(&self, mountpoint: &str) -> io::Result<()>;
    /// Current mount table.
    fn mnttab(&self) -> io::Result<Vec<MnttabLine>>;
    /// Paths currently exported over NFS.
    fn sharetab(&self) -> io::Result<Vec<String>>;
    /// Create `path` and any missing parents.
    fn mkdirp(&self, path: &str) -> io::Result<()>;
    /// Remove `path` if it is an empty directory.
    fn rmdir(&self, path: &str) -> io::Result<()>;
    fn dir_is_empty(&self, path: &str) -> io::Result<bool>;
}

/// Find the mount table entry for a dataset.
pub fn find_mount<'a>(table: &'a [MnttabLine], special: &str) -> Option<&'a MnttabLine> {
    table.iter().find(|line| line.fstype() == MNTTYPE_ZFS && line.special() == special)
}
