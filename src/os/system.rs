//! Host implementation of [MountOps](../trait.MountOps.html). Mounting and sharing shell out to
//! the configured helpers; the tables are read straight from their files.
use std::{ffi::OsString,
          fs, io,
          path::{Path, PathBuf},
          process::{Command, Output, Stdio}};

use slog::Logger;

use crate::{os::{MountOps, MNTTYPE_ZFS},
            parsers::{parse_mnttab, parse_sharetab, MnttabLine},
            session::SessionConfig,
            GlobalLogger};

pub struct SystemMounter {
    mount_cmd:   OsString,
    umount_cmd:  OsString,
    share_cmd:   OsString,
    unshare_cmd: OsString,
    mnttab:      PathBuf,
    sharetab:    PathBuf,
    logger:      Logger,
}

impl SystemMounter {
    /// If `logger` is None, the global logger is used.
    pub fn new(config: &SessionConfig, logger: Option<&Logger>) -> Self {
        let logger = logger.map_or_else(|| GlobalLogger::get().new(o!()), |l| l.new(o!()));
        SystemMounter {
            mount_cmd:   config.mount_cmd().into(),
            umount_cmd:  config.umount_cmd().into(),
            share_cmd:   config.share_cmd().into(),
            unshare_cmd: config.unshare_cmd().into(),
            mnttab:      config.mnttab().into(),
            sharetab:    config.sharetab().into(),
            logger:      logger.new(o!("zetta_module" => "os", "os_impl" => "system")),
        }
    }

    pub fn logger(&self) -> &Logger { &self.logger }

    fn run(&self, mut cmd: Command) -> io::Result<()> {
        cmd.stdout(Stdio::null());
        debug!(self.logger, "executing"; "cmd" => format_args!("{:?}", cmd));
        let out: Output = cmd.output()?;
        if out.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            warn!(self.logger, "helper failed"; "cmd" => format_args!("{:?}", cmd), "stderr" => &stderr);
            Err(io::Error::new(io::ErrorKind::Other, stderr))
        }
    }
}

impl MountOps for SystemMounter {
    fn mount(&self, special: &str, mountpoint: &str, options: &str) -> io::Result<()> {
        let mut cmd = Command::new(&self.mount_cmd);
        cmd.args(&["-t", MNTTYPE_ZFS]);
        if !options.is_empty() {
            cmd.args(&["-o", options]);
        }
        cmd.arg(special).arg(mountpoint);
        self.run(cmd)
    }

    fn unmount(&self, mountpoint: &str, force: bool) -> io::Result<()> {
        let mut cmd = Command::new(&self.umount_cmd);
        if force {
            cmd.arg("-f");
        }
        cmd.arg(mountpoint);
        self.run(cmd)
    }

    fn share(&self, mountpoint: &str, options: &str) -> io::Result<()> {
        let mut cmd = Command::new(&self.share_cmd);
        cmd.args(&["-F", "nfs"]);
        if options != "on" {
            cmd.args(&["-o", options]);
        }
        cmd.arg(mountpoint);
        self.run(cmd)
    }

    fn unshare(&self, mountpoint: &str) -> io::Result<()> {
        let mut cmd = Command::new(&self.unshare_cmd);
        cmd.args(&["-F", "nfs"]).arg(mountpoint);
        self.run(cmd)
    }

    fn mnttab(&self) -> io::Result<Vec<MnttabLine>> { Ok(parse_mnttab(&fs::read_to_string(&self.mnttab)?)) }

    fn sharetab(&self) -> io::Result<Vec<String>> {
        match fs::read_to_string(&self.sharetab) {
            Ok(table) => Ok(parse_sharetab(&table)),
            // Nothing was ever shared.
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn mkdirp(&self, path: &str) -> io::Result<()> { fs::create_dir_all(path) }

    fn rmdir(&self, path: &str) -> io::Result<()> { fs::remove_dir(path) }

    fn dir_is_empty(&self, path: &str) -> io::Result<bool> {
        match fs::read_dir(Path::new(path)) {
            Ok(mut entries) => Ok(entries.next().is_none()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use tempdir::TempDir;

    fn mounter(dir: &Path) -> SystemMounter {
        let config = SessionConfig::builder()
            .mnttab(dir.join("mnttab").to_string_lossy().to_string())
            .sharetab(dir.join("sharetab").to_string_lossy().to_string())
            .mount_cmd("false")
            .build()
            .unwrap();
        SystemMounter::new(&config, None)
    }

    #[test]
    fn directories() {
        let tmp = TempDir::new("zetta-os").unwrap();
        let os = mounter(tmp.path());
        let nested = tmp.path().join("a/b/c");
        let nested = nested.to_str().unwrap();
        os.mkdirp(nested).unwrap();
        assert!(os.dir_is_empty(nested).unwrap());
        let parent = tmp.path().join("a/b");
        assert!(!os.dir_is_empty(parent.to_str().unwrap()).unwrap());
        assert!(os.rmdir(parent.to_str().unwrap()).is_err());
        os.rmdir(nested).unwrap();
        assert!(os.dir_is_empty(nested).unwrap());
    }

    #[test]
    fn tables_are_read_from_files() {
        let tmp = TempDir::new("zetta-os").unwrap();
        let os = mounter(tmp.path());
        assert!(os.sharetab().unwrap().is_empty());

        let mut mnttab = fs::File::create(tmp.path().join("mnttab")).unwrap();
        writeln!(mnttab, "tank /tank zfs rw,atime 0 0").unwrap();
        writeln!(mnttab, "tank/my\\040fs /tank/my\\040fs zfs rw 0 0").unwrap();
        let table = os.mnttab().unwrap();
        assert_eq!(2, table.len());
        assert_eq!("/tank/my fs", table[1].mountp());
    }

    #[test]
    fn failing_helper_is_an_error() {
        let tmp = TempDir::new("zetta-os").unwrap();
        let os = mounter(tmp.path());
        assert!(os.mount("tank", "/tank", "").is_err());
    }
}
