//! Replication streams. A stream starts with a fixed size begin record; everything after it is
//! opaque to this layer and handed to the engine as-is.
use std::{convert::TryFrom,
          io::{self, Read},
          os::unix::io::AsRawFd};

use crate::{ioctl::{Errno, Opcode, ZfsCmd},
            session::Session,
            zfs::{changelist::Changelist, handle::ZfsHandle, pathext::validate_dataset_name, CreateDatasetRequest,
                  DatasetType, Error, PathExt, Result, ZfsProp, ZfsType}};

pub const BACKUP_MAGIC: u64 = 0x2F5bacbac;
pub const BACKUP_VERSION: u64 = 1;
/// Size of the begin record on the wire.
pub const DRR_BEGIN_SIZE: usize = 312;
const DRR_BEGIN: u32 = 0;
const MAXNAMELEN: usize = 256;

quick_error! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    /// Reasons a begin record is refused.
    pub enum StreamError {
        Truncated {
            display("stream is truncated")
        }
        NotBegin(record_type: u32) {
            display("stream starts with record type {}", record_type)
        }
        BadMagic {
            display("invalid stream (bad magic number)")
        }
        BadVersion(version: u64) {
            display("stream has unsupported version {}", version)
        }
        BadName {
            display("stream has an invalid snapshot name")
        }
    }
}

/// First record of every stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrrBegin {
    /// Bytes of engine payload following this record.
    pub payload_len:   u32,
    pub magic:         u64,
    pub version:       u64,
    pub creation_time: u64,
    /// Raw head type of the dataset the stream was made from.
    pub objset_type:   u32,
    pub flags:         u32,
    pub toguid:        u64,
    /// Zero for full streams.
    pub fromguid:      u64,
    /// `pool/fs@snap` the stream was made from.
    pub toname:        String,
}

struct Cursor<'a> {
    buf:     &'a [u8],
    pos:     usize,
    swapped: bool,
}

impl<'a> Cursor<'a> {
    fn u32(&mut self) -> u32 {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        let val = u32::from_ne_bytes(raw);
        if self.swapped {
            val.swap_bytes()
        } else {
            val
        }
    }

    fn u64(&mut self) -> u64 {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        let val = u64::from_ne_bytes(raw);
        if self.swapped {
            val.swap_bytes()
        } else {
            val
        }
    }
}

impl DrrBegin {
    pub fn new<N: Into<String>>(toname: N, toguid: u64, fromguid: u64) -> DrrBegin {
        DrrBegin {
            magic: BACKUP_MAGIC,
            version: BACKUP_VERSION,
            toguid,
            fromguid,
            toname: toname.into(),
            ..DrrBegin::default()
        }
    }

    pub fn is_incremental(&self) -> bool { self.fromguid != 0 }

    /// Encode in host byte order, or in the opposite one when `swapped` is set.
    pub fn encode(&self, swapped: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DRR_BEGIN_SIZE);
        let put32 = |buf: &mut Vec<u8>, val: u32| {
            let val = if swapped { val.swap_bytes() } else { val };
            buf.extend_from_slice(&val.to_ne_bytes());
        };
        let put64 = |buf: &mut Vec<u8>, val: u64| {
            let val = if swapped { val.swap_bytes() } else { val };
            buf.extend_from_slice(&val.to_ne_bytes());
        };
        put32(&mut buf, DRR_BEGIN);
        put32(&mut buf, self.payload_len);
        put64(&mut buf, self.magic);
        put64(&mut buf, self.version);
        put64(&mut buf, self.creation_time);
        put32(&mut buf, self.objset_type);
        put32(&mut buf, self.flags);
        put64(&mut buf, self.toguid);
        put64(&mut buf, self.fromguid);
        let name = self.toname.as_bytes();
        let len = name.len().min(MAXNAMELEN - 1);
        buf.extend_from_slice(&name[..len]);
        buf.resize(DRR_BEGIN_SIZE, 0);
        buf
    }

    /// Decode a begin record. Records written on a host with the other byte order are accepted
    /// and every field is swapped back. Returns the record and whether it was swapped.
    pub fn decode(buf: &[u8]) -> Result<(DrrBegin, bool), StreamError> {
        if buf.len() < DRR_BEGIN_SIZE {
            return Err(StreamError::Truncated);
        }
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&buf[8..16]);
        let magic = u64::from_ne_bytes(raw);
        let swapped = if magic == BACKUP_MAGIC {
            false
        } else if magic == BACKUP_MAGIC.swap_bytes() {
            true
        } else {
            return Err(StreamError::BadMagic);
        };

        let mut cursor = Cursor { buf, pos: 0, swapped };
        let record_type = cursor.u32();
        if record_type != DRR_BEGIN {
            return Err(StreamError::NotBegin(record_type));
        }
        let payload_len = cursor.u32();
        let magic = cursor.u64();
        let version = cursor.u64();
        if version != BACKUP_VERSION {
            return Err(StreamError::BadVersion(version));
        }
        let creation_time = cursor.u64();
        let objset_type = cursor.u32();
        let flags = cursor.u32();
        let toguid = cursor.u64();
        let fromguid = cursor.u64();
        let name = &buf[cursor.pos..cursor.pos + MAXNAMELEN];
        let end = name.iter().position(|b| *b == 0).ok_or(StreamError::BadName)?;
        let toname = String::from_utf8(name[..end].to_vec()).map_err(|_| StreamError::BadName)?;

        let begin = DrrBegin {
            payload_len,
            magic,
            version,
            creation_time,
            objset_type,
            flags,
            toguid,
            fromguid,
            toname,
        };
        Ok((begin, swapped))
    }

    /// Payload length as a buffer size.
    pub fn payload_size(&self) -> usize { usize::try_from(self.payload_len).unwrap_or(usize::MAX) }
}

#[derive(Default, Builder, Debug, Clone, Getters)]
#[builder(setter(into))]
#[get = "pub"]
/// Where and how to receive a stream.
pub struct ReceiveRequest {
    /// Snapshot or filesystem to receive into. With `is_prefix` a filesystem under which the
    /// name embedded in the stream is recreated.
    target:    String,
    /// Work out the destination and check it, but leave everything untouched.
    #[builder(default)]
    dry_run:   bool,
    /// Roll back changes made to the destination since its latest snapshot.
    #[builder(default)]
    force:     bool,
    #[builder(default)]
    is_prefix: bool,
    /// Leading components of the embedded name dropped in prefix mode. One drops the pool name.
    #[builder(default = "1")]
    strip:     usize,
}

impl ReceiveRequest {
    pub fn builder() -> ReceiveRequestBuilder { ReceiveRequestBuilder::default() }

    /// Snapshot the stream lands in, given the name embedded in the stream.
    pub fn destination(&self, toname: &str) -> Result<String> {
        let context = format!("cannot receive '{}'", toname);
        let snap = toname
            .get_snapshot()
            .ok_or_else(|| Error::BadStream(context.clone(), "invalid stream (bad snapshot name)".into()))?;
        let dest = if self.is_prefix {
            if self.target.contains('@') {
                return Err(Error::WrongType(context, "destination must be a filesystem".into()));
            }
            let components: Vec<&str> = toname.head_name().split('/').collect();
            if self.strip > components.len() {
                return Err(Error::InvalidName(
                    context,
                    format!("cannot strip {} components from '{}'", self.strip, toname.head_name()),
                ));
            }
            let rest = components[self.strip..].join("/");
            if rest.is_empty() {
                format!("{}@{}", self.target, snap)
            } else {
                format!("{}/{}@{}", self.target, rest, snap)
            }
        } else if self.target.contains('@') {
            self.target.clone()
        } else {
            format!("{}@{}", self.target, snap)
        };
        validate_dataset_name(&dest, ZfsType::SNAPSHOT).map_err(|e| Error::InvalidName(context, e.to_string()))?;
        Ok(dest)
    }
}

fn raw_fd<F: AsRawFd>(fd: &F, context: &str) -> Result<u64> {
    u64::try_from(fd.as_raw_fd()).map_err(|_| Error::Io(context.into(), io::Error::from_raw_os_error(libc::EBADF)))
}

impl<'a> ZfsHandle<'a> {
    /// Write a stream of this snapshot to `output`. `from` makes it incremental; it may be given
    /// as `snap`, `@snap` or in full and must be an earlier snapshot of the same dataset.
    pub fn send<F: AsRawFd>(&self, from: Option<&str>, output: &F) -> Result<()> {
        let context = format!("cannot send '{}'", self.name());
        if self.kind() != DatasetType::Snapshot {
            return Err(Error::WrongType(context, "only snapshots can be sent".into()));
        }
        let head = self.name().head_name();
        let from = from.map(|from| match from.find('@') {
            None => format!("{}@{}", head, from),
            Some(0) => format!("{}{}", head, from),
            Some(_) => from.to_string(),
        });
        if let Some(from) = &from {
            if from.head_name() != head {
                return Err(Error::CrossPoolOperation(context, "not an earlier snapshot from the same fs".into()));
            }
        }
        let mut cmd = ZfsCmd::new(self.name())
            .with_value(from.clone().unwrap_or_default())
            .with_cookie(raw_fd(output, &context)?);
        self.session().call(Opcode::SendBackup, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::EXDEV => Error::CrossPoolOperation(context.clone(), "not an earlier snapshot from the same fs".into()),
            libc::EDQUOT | libc::EFBIG | libc::EIO | libc::ENOSPC | libc::ENXIO | libc::EPIPE | libc::ERANGE
            | libc::EROFS => Error::Io(context.clone(), io::Error::from_raw_os_error(errno)),
            _ => Error::from_errno(errno, context.clone()),
        })?;
        info!(self.logger(), "sent"; "from" => from.as_deref().unwrap_or("-"));
        Ok(())
    }
}

impl Session {
    /// Receive a stream from `input`. The begin record is read and checked before anything is
    /// touched. Returns the snapshot the stream went (or would go) into.
    ///
    /// An incremental stream needs the destination to exist; it and everything depending on it
    /// is taken down for the duration. A full stream needs it not to exist. Whatever was taken
    /// down comes back up whether or not the engine accepted the stream.
    pub fn receive<F: Read + AsRawFd>(&self, request: &ReceiveRequest, input: &mut F) -> Result<String> {
        let context = String::from("cannot receive");
        let mut header = vec![0_u8; DRR_BEGIN_SIZE];
        input.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                Error::BadStream(context.clone(), "invalid stream (failed to read first record)".into())
            },
            _ => Error::Io(context.clone(), e),
        })?;
        let (begin, swapped) = DrrBegin::decode(&header).map_err(|e| Error::BadStream(context.clone(), e.to_string()))?;

        let dest = request.destination(&begin.toname)?;
        let fs = dest.head_name();
        let context = format!("cannot receive '{}'", dest);
        let kind = if begin.is_incremental() { "incremental" } else { "full" };
        let logger = self.logger().new(o!("zetta_module" => "zfs", "dataset" => fs.to_string()));
        debug!(logger, "begin record"; "toname" => &begin.toname, "kind" => kind, "swapped" => swapped);

        let mut changelist = None;
        if begin.is_incremental() {
            let head = ZfsHandle::open(self, fs, ZfsType::FILESYSTEM | ZfsType::VOLUME)?;
            if !request.dry_run {
                if head.kind() == DatasetType::Filesystem {
                    let mut clp = Changelist::gather(&head, ZfsProp::Name, false)?;
                    clp.prefix()?;
                    changelist = Some(clp);
                } else {
                    self.remove_device_link(head.name())?;
                }
            }
        } else {
            let parent = fs
                .parent_name()
                .ok_or_else(|| Error::AlreadyExists(context.clone(), format!("destination '{}' exists", fs)))?;
            if request.is_prefix {
                ZfsHandle::open(self, &request.target, ZfsType::FILESYSTEM)?;
                if !request.dry_run {
                    self.create_ancestors(&request.target, fs)?;
                }
            }
            if self.dataset_exists(fs) {
                return Err(Error::AlreadyExists(context, format!("destination '{}' exists", fs)));
            }
            if !self.dataset_exists(parent) && !(request.dry_run && request.is_prefix) {
                return Err(Error::NotFound(context, format!("parent '{}' does not exist", parent)));
            }
        }

        if request.dry_run {
            info!(logger, "would receive"; "kind" => kind, "from" => &begin.toname, "into" => &dest);
            return Ok(dest);
        }
        info!(logger, "receiving"; "kind" => kind, "from" => &begin.toname, "into" => &dest);

        let mut cmd = ZfsCmd::new(fs)
            .with_value(dest.as_str())
            .with_cookie(raw_fd(input, &context)?)
            .with_guid(u64::from(request.force));
        cmd.begin_record = Some(begin.clone());
        let ret = self.call(Opcode::RecvBackup, &mut cmd).map_err(|Errno(errno)| match errno {
            libc::ENODEV => {
                Error::BadStream(context.clone(), "most recent snapshot does not match incremental source".into())
            },
            libc::ETXTBSY => {
                Error::Busy(context.clone(), "destination has been modified since most recent snapshot".into())
            },
            libc::EEXIST if begin.is_incremental() => {
                Error::AlreadyExists(context.clone(), format!("destination '{}' already exists", dest))
            },
            libc::EEXIST => Error::AlreadyExists(context.clone(), format!("destination '{}' already exists", fs)),
            libc::EINVAL => Error::BadStream(context.clone(), "invalid stream".into()),
            _ => Error::from_errno(errno, context.clone()),
        });

        if ret.is_err() && !begin.is_incremental() {
            return ret.map(|_| dest);
        }
        let cleanup = match ZfsHandle::open(self, fs, ZfsType::FILESYSTEM | ZfsType::VOLUME) {
            Ok(head) if head.kind() == DatasetType::Volume => self.create_device_link(head.name()).and_then(|_| {
                if ret.is_ok() {
                    self.create_device_link(&dest)
                } else {
                    Ok(())
                }
            }),
            Ok(head) => match changelist.as_mut() {
                Some(clp) => clp.postfix(),
                None => head.mount(None),
            },
            Err(e) => Err(e),
        };
        ret.and(cleanup)?;
        info!(logger, "received"; "snapshot" => &dest);
        Ok(dest)
    }

    /// Create, mount and share every missing filesystem strictly between `prefix` and `fs`.
    fn create_ancestors(&self, prefix: &str, fs: &str) -> Result<()> {
        let rest = match fs.get(prefix.len() + 1..) {
            Some(rest) if fs.is_descendant_of(prefix) => rest,
            _ => return Ok(()),
        };
        for (idx, _) in rest.match_indices('/') {
            let ancestor = &fs[..prefix.len() + 1 + idx];
            let request = CreateDatasetRequest::builder()
                .name(ancestor)
                .kind(DatasetType::Filesystem)
                .build()
                .map_err(|e| Error::Internal(e.to_string()))?;
            match self.create(request) {
                Ok(()) | Err(Error::AlreadyExists(..)) => {},
                Err(e) => return Err(e),
            }
            let zhp = ZfsHandle::open(self, ancestor, ZfsType::FILESYSTEM)?;
            zhp.mount(None)?;
            zhp.share_nfs()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> DrrBegin {
        let mut begin = DrrBegin::new("tank/fs@today", 0xdead_beef, 0);
        begin.creation_time = 1_184_000_000;
        begin.objset_type = 1;
        begin.payload_len = 77;
        begin
    }

    #[test]
    fn record_is_fixed_size() {
        assert_eq!(DRR_BEGIN_SIZE, sample().encode(false).len());
        assert_eq!(DRR_BEGIN_SIZE, sample().encode(true).len());
    }

    #[test]
    fn native_and_swapped_records_decode_the_same() {
        let (native, swapped) = DrrBegin::decode(&sample().encode(false)).unwrap();
        assert!(!swapped);
        assert_eq!(sample(), native);

        let (foreign, swapped) = DrrBegin::decode(&sample().encode(true)).unwrap();
        assert!(swapped);
        assert_eq!(sample(), foreign);
        assert!(!foreign.is_incremental());
    }

    #[test]
    fn refuses_bad_records() {
        let mut begin = sample();
        begin.version = 2;
        assert_eq!(Err(StreamError::BadVersion(2)), DrrBegin::decode(&begin.encode(true)));

        let mut begin = sample();
        begin.magic = 0x1234;
        assert_eq!(Err(StreamError::BadMagic), DrrBegin::decode(&begin.encode(false)));

        let short = sample().encode(false);
        assert_eq!(Err(StreamError::Truncated), DrrBegin::decode(&short[..100]));

        let mut not_begin = sample().encode(false);
        not_begin[..4].copy_from_slice(&7_u32.to_ne_bytes());
        assert_eq!(Err(StreamError::NotBegin(7)), DrrBegin::decode(&not_begin));
    }

    #[test]
    fn destination_names() {
        let plain = ReceiveRequest::builder().target("backup/fs").build().unwrap();
        assert_eq!(1, *plain.strip());
        assert_eq!("backup/fs@today", plain.destination("tank/fs@today").unwrap());

        let explicit = ReceiveRequest::builder().target("backup/fs@other").build().unwrap();
        assert_eq!("backup/fs@other", explicit.destination("tank/fs@today").unwrap());

        let prefix = ReceiveRequest::builder().target("backup").is_prefix(true).build().unwrap();
        assert_eq!("backup/a/b@today", prefix.destination("tank/a/b@today").unwrap());
        assert_eq!("backup@today", prefix.destination("tank@today").unwrap());

        let keep_pool = ReceiveRequest::builder().target("backup").is_prefix(true).strip(0_usize).build().unwrap();
        assert_eq!("backup/tank/a@today", keep_pool.destination("tank/a@today").unwrap());
    }

    #[test]
    fn destination_refusals() {
        let prefix = ReceiveRequest::builder().target("backup@x").is_prefix(true).build().unwrap();
        assert_eq!(crate::zfs::ErrorKind::WrongType, prefix.destination("tank/a@s").unwrap_err().kind());

        let deep = ReceiveRequest::builder().target("backup").is_prefix(true).strip(3_usize).build().unwrap();
        assert_eq!(crate::zfs::ErrorKind::InvalidName, deep.destination("tank/a@s").unwrap_err().kind());

        let plain = ReceiveRequest::builder().target("backup/fs").build().unwrap();
        assert_eq!(crate::zfs::ErrorKind::BadStream, plain.destination("tank/a").unwrap_err().kind());
    }
}
