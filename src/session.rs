//! Context every operation runs in. A [Session](struct.Session.html) owns the command transport,
//! the mount layer and the pool namespace, so nothing in this library relies on process-global
//! state other than the logger.
use std::{collections::BTreeMap,
          env,
          fmt,
          sync::{Arc, Mutex, MutexGuard}};

use slog::Logger;

use crate::{ioctl::{Errno, Opcode, Transport, ZfsCmd, ZfsIoctl},
            logger_from_root_logger,
            os::MountOps,
            zfs::{Error, Result},
            GlobalLogger};

#[cfg(target_os = "linux")]
static DEFAULT_MNTTAB: &str = "/proc/self/mounts";
#[cfg(not(target_os = "linux"))]
static DEFAULT_MNTTAB: &str = "/etc/mnttab";

fn from_env(var: &str, default: &str) -> String { env::var(var).unwrap_or_else(|_| default.to_string()) }

/// Where to find host tables and helpers. Every field falls back to a `ZETTA_*` environment
/// variable and then to a platform default.
#[derive(Debug, Clone, Builder, Getters)]
#[builder(setter(into))]
#[get = "pub"]
pub struct SessionConfig {
    /// Mount table. `ZETTA_MNTTAB`.
    #[builder(default = "from_env(\"ZETTA_MNTTAB\", DEFAULT_MNTTAB)")]
    mnttab:      String,
    /// NFS share table. `ZETTA_SHARETAB`.
    #[builder(default = "from_env(\"ZETTA_SHARETAB\", \"/etc/dfs/sharetab\")")]
    sharetab:    String,
    #[builder(default = "from_env(\"ZETTA_MOUNT_CMD\", \"mount\")")]
    mount_cmd:   String,
    #[builder(default = "from_env(\"ZETTA_UMOUNT_CMD\", \"umount\")")]
    umount_cmd:  String,
    #[builder(default = "from_env(\"ZETTA_SHARE_CMD\", \"share\")")]
    share_cmd:   String,
    #[builder(default = "from_env(\"ZETTA_UNSHARE_CMD\", \"unshare\")")]
    unshare_cmd: String,
    /// Whether this process runs in the global zone. Setting `ZETTA_ZONED` to anything turns it
    /// off.
    #[builder(default = "env::var_os(\"ZETTA_ZONED\").is_none()")]
    global_zone: bool,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder { SessionConfigBuilder::default() }

    /// Configuration made of environment variables and defaults only.
    pub fn from_env() -> Self {
        SessionConfig {
            mnttab:      from_env("ZETTA_MNTTAB", DEFAULT_MNTTAB),
            sharetab:    from_env("ZETTA_SHARETAB", "/etc/dfs/sharetab"),
            mount_cmd:   from_env("ZETTA_MOUNT_CMD", "mount"),
            umount_cmd:  from_env("ZETTA_UMOUNT_CMD", "umount"),
            share_cmd:   from_env("ZETTA_SHARE_CMD", "share"),
            unshare_cmd: from_env("ZETTA_UNSHARE_CMD", "unshare"),
            global_zone: env::var_os("ZETTA_ZONED").is_none(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self { SessionConfig::from_env() }
}

/// Everything an operation needs to reach the engine and the host.
pub struct Session {
    transport: Transport,
    os:        Arc<dyn MountOps>,
    config:    SessionConfig,
    logger:    Logger,
    /// Pool name to pool guid, as of the last refresh.
    namespace: Mutex<BTreeMap<String, u64>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("config", &self.config).finish()
    }
}

impl Session {
    /// If `root_logger` is None, the global logger is used.
    pub fn new(
        engine: Arc<dyn ZfsIoctl>,
        os: Arc<dyn MountOps>,
        config: SessionConfig,
        root_logger: Option<Logger>,
    ) -> Session {
        let logger = match root_logger {
            Some(root) => logger_from_root_logger(&root),
            None => GlobalLogger::get().new(o!()),
        };
        Session {
            transport: Transport::new(engine, &logger),
            os,
            config,
            logger,
            namespace: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn transport(&self) -> &Transport { &self.transport }

    pub fn os(&self) -> &dyn MountOps { self.os.as_ref() }

    pub fn config(&self) -> &SessionConfig { &self.config }

    pub fn logger(&self) -> &Logger { &self.logger }

    pub fn global_zone(&self) -> bool { self.config.global_zone }

    /// Issue a command without a reply.
    pub fn call(&self, op: Opcode, cmd: &mut ZfsCmd) -> std::result::Result<(), Errno> {
        self.transport.call(op, cmd)
    }

    fn namespace(&self) -> MutexGuard<'_, BTreeMap<String, u64>> {
        match self.namespace.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reload the pool namespace from the engine.
    pub fn refresh_namespace(&self) -> Result<()> {
        let mut cmd = ZfsCmd::new("");
        let configs = self
            .transport
            .call_with_reply(Opcode::PoolConfigs, &mut cmd)
            .map_err(|Errno(errno)| Error::from_pool_errno(errno, "failed to read pool configuration"))?;
        let mut namespace = self.namespace();
        namespace.clear();
        for (name, config) in configs.iter() {
            let guid = config.as_nvlist().and_then(|c| c.get_number("pool_guid").ok()).unwrap_or(0);
            namespace.insert(name.to_string(), guid);
        }
        trace!(self.logger, "namespace refreshed"; "pools" => namespace.len());
        Ok(())
    }

    /// Names of every active pool.
    pub fn pools(&self) -> Result<Vec<String>> {
        self.refresh_namespace()?;
        Ok(self.namespace().keys().cloned().collect())
    }

    /// Whether `pool` is active. Uses the cached namespace and reloads it once on a miss.
    pub fn pool_exists(&self, pool: &str) -> Result<bool> {
        if self.namespace().contains_key(pool) {
            return Ok(true);
        }
        self.refresh_namespace()?;
        Ok(self.namespace().contains_key(pool))
    }

    /// Guid of an active pool, if known.
    pub fn pool_guid(&self, pool: &str) -> Option<u64> { self.namespace().get(pool).copied() }

    pub(crate) fn forget_pool(&self, pool: &str) { self.namespace().remove(pool); }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ioctl::memory::MemoryEngine, nv::NvList, os::memory::MemoryMounter};

    #[test]
    fn config_builder_defaults() {
        let config = SessionConfig::builder().mount_cmd("/sbin/mount").build().unwrap();
        assert_eq!("/sbin/mount", config.mount_cmd());
        assert!(!config.umount_cmd().is_empty());
        assert!(!config.mnttab().is_empty());
    }

    #[test]
    fn namespace_follows_engine() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_device("/dev/dsk/c0t0d0", 1 << 30);
        let session = Session::new(engine.clone(), Arc::new(MemoryMounter::new()), SessionConfig::default(), None);
        assert!(session.pools().unwrap().is_empty());

        let conf = NvList::new()
            .with("type", "root")
            .with("children", vec![NvList::new().with("type", "disk").with("path", "/dev/dsk/c0t0d0")]);
        let mut cmd = ZfsCmd::new("tank").with_conf(&conf);
        engine.ioctl(Opcode::PoolCreate, &mut cmd).unwrap();

        assert!(session.pool_exists("tank").unwrap());
        assert!(session.pool_guid("tank").is_some());
        assert_eq!(vec!["tank"], session.pools().unwrap());
    }
}
