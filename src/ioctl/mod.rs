//! Command interface to the storage engine. Every request is a [ZfsCmd](struct.ZfsCmd.html)
//! addressed by an [Opcode](enum.Opcode.html). Engines implement
//! [ZfsIoctl](trait.ZfsIoctl.html); the rest of the library talks to them through
//! [Transport](struct.Transport.html), which hides reply buffer negotiation.
use std::{fmt, sync::Arc};

use slog::Logger;
use strum_macros::{AsRefStr, Display, EnumIter};

use crate::{nv::NvList, zfs::DrrBegin};

pub mod memory;

/// Initial size of the reply buffer.
pub const DEFAULT_DST_SIZE: u64 = 1024;
/// Give up growing the reply buffer past this.
pub const MAX_DST_SIZE: u64 = 64 * 1024 * 1024;

#[derive(AsRefStr, Display, EnumIter, Eq, PartialEq, Debug, Clone, Copy, Hash)]
#[repr(u64)]
pub enum Opcode {
    PoolCreate = 0x5a00,
    PoolDestroy,
    PoolImport,
    PoolExport,
    PoolConfigs,
    PoolStats,
    PoolSearchImport,
    PoolScrub,
    PoolUpgrade,
    PoolGetProps,
    PoolSetProps,
    VdevAdd,
    VdevRemove,
    VdevOnline,
    VdevOffline,
    VdevAttach,
    VdevDetach,
    ObjsetStats,
    DatasetListNext,
    SnapshotListNext,
    SetProp,
    InheritProp,
    Create,
    Destroy,
    DestroySnaps,
    Rollback,
    Rename,
    Snapshot,
    Promote,
    SendBackup,
    RecvBackup,
    CreateMinor,
    RemoveMinor,
}

impl Opcode {
    /// Whether the engine hands back a document in `dst`.
    pub fn has_reply(self) -> bool {
        matches!(
            self,
            Opcode::PoolConfigs
                | Opcode::PoolStats
                | Opcode::PoolSearchImport
                | Opcode::PoolGetProps
                | Opcode::ObjsetStats
                | Opcode::DatasetListNext
                | Opcode::SnapshotListNext
        )
    }
}

/// Raw error code returned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

/// Stats every dataset lookup returns next to the property document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjsetStats {
    /// Raw [DatasetType](../zfs/enum.DatasetType.html) of the head dataset.
    pub objset_type:  u64,
    pub is_snapshot:  bool,
    /// Mid-receive or mid-destroy.
    pub inconsistent: bool,
    pub create_txg:   u64,
    pub guid:         u64,
    pub creation:     u64,
    /// Origin snapshot for clones, empty otherwise.
    pub clone_of:     String,
    pub num_clones:   u64,
}

/// Command and reply. The meaning of `value`, `cookie` and `guid` depends on the opcode.
#[derive(Debug, Clone, Default)]
pub struct ZfsCmd {
    pub name:         String,
    pub value:        String,
    pub cookie:       u64,
    pub guid:         u64,
    pub objset_type:  u64,
    /// Packed vdev configuration.
    pub conf:         Option<Vec<u8>>,
    /// Packed property document.
    pub src:          Option<Vec<u8>>,
    /// Packed reply. Engines fill this up to `dst_size` bytes.
    pub dst:          Vec<u8>,
    /// Capacity of `dst` on the way in; size the engine needs when it refuses with `ENOMEM`.
    pub dst_size:     u64,
    pub stats:        ObjsetStats,
    /// Already consumed begin record of a stream being received; the rest is read from `cookie`.
    pub begin_record: Option<DrrBegin>,
}

impl ZfsCmd {
    pub fn new<N: Into<String>>(name: N) -> Self { ZfsCmd { name: name.into(), ..ZfsCmd::default() } }

    pub fn with_value<V: Into<String>>(mut self, value: V) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_guid(mut self, guid: u64) -> Self {
        self.guid = guid;
        self
    }

    pub fn with_src(mut self, src: &NvList) -> Self {
        self.src = Some(src.pack());
        self
    }

    pub fn with_conf(mut self, conf: &NvList) -> Self {
        self.conf = Some(conf.pack());
        self
    }
}

/// Storage engine. Using trait here, so I can mock it in tests.
pub trait ZfsIoctl: Send + Sync {
    fn ioctl(&self, op: Opcode, cmd: &mut ZfsCmd) -> Result<(), Errno>;
}

/// Blocking request/reply channel to an engine.
#[derive(Clone)]
pub struct Transport {
    engine: Arc<dyn ZfsIoctl>,
    logger: Logger,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_struct("Transport").finish() }
}

impl Transport {
    pub fn new(engine: Arc<dyn ZfsIoctl>, logger: &Logger) -> Self {
        Transport { engine, logger: logger.new(o!("zetta_module" => "ioctl")) }
    }

    /// Issue a command. For opcodes with a reply the buffer is grown and the command retried until
    /// the reply fits, so callers always get a complete document in `cmd.dst`.
    pub fn call(&self, op: Opcode, cmd: &mut ZfsCmd) -> Result<(), Errno> {
        debug!(self.logger, "ioctl"; "op" => op.as_ref(), "name" => &cmd.name, "value" => &cmd.value);
        if !op.has_reply() {
            let ret = self.engine.ioctl(op, cmd);
            self.trace(op, &ret);
            return ret;
        }
        let mut size = DEFAULT_DST_SIZE.max(cmd.dst_size);
        loop {
            cmd.dst.clear();
            cmd.dst_size = size;
            match self.engine.ioctl(op, cmd) {
                Err(Errno(libc::ENOMEM)) if size < MAX_DST_SIZE => {
                    size = (size * 2).max(cmd.dst_size).min(MAX_DST_SIZE);
                    trace!(self.logger, "growing reply buffer"; "op" => op.as_ref(), "size" => size);
                },
                ret => {
                    self.trace(op, &ret);
                    return ret;
                },
            }
        }
    }

    /// Issue a command and decode the reply document.
    pub fn call_with_reply(&self, op: Opcode, cmd: &mut ZfsCmd) -> Result<NvList, Errno> {
        self.call(op, cmd)?;
        NvList::unpack(&cmd.dst).map_err(|e| {
            warn!(self.logger, "undecodable reply"; "op" => op.as_ref(), "error" => %e);
            Errno(libc::EINVAL)
        })
    }

    fn trace(&self, op: Opcode, ret: &Result<(), Errno>) {
        if let Err(errno) = ret {
            debug!(self.logger, "ioctl failed"; "op" => op.as_ref(), "errno" => errno.0);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    /// Pretends the reply is `needed` bytes long and records every buffer size it was offered.
    struct Greedy {
        needed:  u64,
        offered: Mutex<Vec<u64>>,
    }

    impl ZfsIoctl for Greedy {
        fn ioctl(&self, _op: Opcode, cmd: &mut ZfsCmd) -> Result<(), Errno> {
            self.offered.lock().unwrap().push(cmd.dst_size);
            if cmd.dst_size < self.needed {
                cmd.dst_size = self.needed;
                return Err(Errno(libc::ENOMEM));
            }
            cmd.dst = NvList::new().with("answer", 42_u64).pack();
            Ok(())
        }
    }

    fn logger() -> Logger { Logger::root(slog::Discard, o!()) }

    #[test]
    fn reply_buffer_grows_until_it_fits() {
        let engine = Arc::new(Greedy { needed: 5000, offered: Mutex::new(Vec::new()) });
        let transport = Transport::new(engine.clone(), &logger());
        let mut cmd = ZfsCmd::new("tank");
        let reply = transport.call_with_reply(Opcode::ObjsetStats, &mut cmd).unwrap();
        assert_eq!(42, reply.get_number("answer").unwrap());
        assert_eq!(vec![1024, 5000], *engine.offered.lock().unwrap());
    }

    #[test]
    fn reply_buffer_doubles_without_hint() {
        let engine = Arc::new(Greedy { needed: 1500, offered: Mutex::new(Vec::new()) });
        let transport = Transport::new(engine.clone(), &logger());
        let mut cmd = ZfsCmd::new("tank");
        transport.call(Opcode::PoolStats, &mut cmd).unwrap();
        assert_eq!(vec![1024, 2048], *engine.offered.lock().unwrap());
    }

    #[test]
    fn commands_without_reply_are_issued_once() {
        let engine = Arc::new(Greedy { needed: 5000, offered: Mutex::new(Vec::new()) });
        let transport = Transport::new(engine.clone(), &logger());
        let mut cmd = ZfsCmd::new("tank");
        assert_eq!(Err(Errno(libc::ENOMEM)), transport.call(Opcode::Destroy, &mut cmd));
        assert_eq!(vec![0], *engine.offered.lock().unwrap());
    }

    #[test]
    fn opcodes_are_numbered_from_base() {
        assert_eq!(0x5a00, Opcode::PoolCreate as u64);
        assert_eq!(0x5a01, Opcode::PoolDestroy as u64);
        assert!(Opcode::ObjsetStats.has_reply());
        assert!(!Opcode::SetProp.has_reply());
    }
}
