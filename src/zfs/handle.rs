//! Open dataset and the property accessor built on top of it.
//!
//! A [ZfsHandle](struct.ZfsHandle.html) is a snapshot of what the engine reported about a dataset
//! at the time it was opened or last refreshed. Values are raw until asked for: sources and the
//! effective mountpoint are worked out on every lookup, and only the mount table entry is cached.
use std::fmt;

use once_cell::unsync::OnceCell;
use slog::Logger;

use crate::{ioctl::{Errno, ObjsetStats, Opcode, ZfsCmd},
            nv::{NvList, NvTypeOp, NvValue},
            os::find_mount,
            session::Session,
            utils::{format_time, nicebool, nicenum, ratio},
            zfs::{changelist::Changelist,
                  pathext::validate_dataset_name,
                  properties::{is_user_property, lookup_by_name},
                  validate_properties, DatasetType, Error, PathExt, PropKind, Result, ValidateContext,
                  ZfsProp, ZfsType}};

/// Where the effective value of a property comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropSource {
    /// Nobody set it; the table default applies.
    Default,
    /// Set on the dataset itself.
    Local,
    /// Set on the named ancestor.
    Inherited(String),
    /// Overridden by a mount option of the live mount.
    Temporary,
    /// Statistic or other value without a source.
    None,
}

impl fmt::Display for PropSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropSource::Default => write!(f, "default"),
            PropSource::Local => write!(f, "local"),
            PropSource::Inherited(from) => write!(f, "inherited from {}", from),
            PropSource::Temporary => write!(f, "temporary"),
            PropSource::None => write!(f, "-"),
        }
    }
}

/// Typed property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropVal {
    Number(u64),
    Str(String),
    Bool(bool),
    Index(u64),
}

/// Mount options that override a stored boolean: `(property, option when on, option when off)`.
static MOUNT_OVERRIDES: &[(ZfsProp, &str, &str)] = &[
    (ZfsProp::Atime, "atime", "noatime"),
    (ZfsProp::Devices, "devices", "nodevices"),
    (ZfsProp::Exec, "exec", "noexec"),
    (ZfsProp::Readonly, "ro", "rw"),
    (ZfsProp::Setuid, "setuid", "nosetuid"),
    (ZfsProp::Xattr, "xattr", "noxattr"),
];

/// Whether a comma separated option string carries `opt`, with or without a value.
pub(crate) fn has_mntopt(options: &str, opt: &str) -> bool {
    options.split(',').any(|o| o == opt || o.split('=').next() == Some(opt))
}

/// Open dataset. Borrowing the session ties every handle to the context it was opened in.
pub struct ZfsHandle<'a> {
    session:   &'a Session,
    name:      String,
    kind:      DatasetType,
    head_type: DatasetType,
    stats:     ObjsetStats,
    props:     NvList,
    user:      NvList,
    mntopts:   OnceCell<Option<String>>,
    altroot:   OnceCell<String>,
    logger:    Logger,
}

impl<'a> fmt::Debug for ZfsHandle<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZfsHandle").field("name", &self.name).field("kind", &self.kind).finish()
    }
}

fn fetch(session: &Session, name: &str) -> std::result::Result<(NvList, ObjsetStats), Errno> {
    let mut cmd = ZfsCmd::new(name);
    let doc = session.transport().call_with_reply(Opcode::ObjsetStats, &mut cmd)?;
    Ok((doc, cmd.stats))
}

impl<'a> ZfsHandle<'a> {
    /// Open `name`, refusing anything that is not one of `types`.
    pub fn open(session: &'a Session, name: &str, types: ZfsType) -> Result<ZfsHandle<'a>> {
        let context = format!("cannot open '{}'", name);
        validate_dataset_name(name, types).map_err(|e| Error::InvalidName(context.clone(), e.to_string()))?;
        let handle = ZfsHandle::make(session, name).map_err(|e| match e {
            Error::NotFound(_, detail) => Error::NotFound(context.clone(), detail),
            other => other,
        })?;
        if !types.contains(handle.type_mask()) {
            return Err(Error::WrongType(context, "operation not applicable to datasets of this type".into()));
        }
        Ok(handle)
    }

    /// Fetch `name`, cleaning up after an interrupted receive if the dataset was left
    /// inconsistent: roll it back, or failing that destroy it.
    pub(crate) fn make(session: &'a Session, name: &str) -> Result<ZfsHandle<'a>> {
        let context = format!("cannot open '{}'", name);
        let mut attempts = 0;
        loop {
            let (doc, stats) = fetch(session, name).map_err(|Errno(errno)| Error::from_errno(errno, context.clone()))?;
            if !stats.inconsistent || attempts > 0 {
                return ZfsHandle::from_reply(session, name, doc, stats);
            }
            attempts += 1;
            debug!(session.logger(), "dataset is inconsistent"; "dataset" => name);
            if stats.objset_type == DatasetType::Volume as u64 {
                if let Err(Errno(errno)) = session.call(Opcode::RemoveMinor, &mut ZfsCmd::new(name)) {
                    warn!(session.logger(), "failed to remove device link"; "dataset" => name, "errno" => errno);
                }
            }
            if session.call(Opcode::Rollback, &mut ZfsCmd::new(name)).is_ok() {
                info!(session.logger(), "rolled back inconsistent dataset"; "dataset" => name);
                continue;
            }
            if session.call(Opcode::Destroy, &mut ZfsCmd::new(name)).is_ok() {
                info!(session.logger(), "destroyed inconsistent dataset"; "dataset" => name);
                return Err(Error::NotFound(context, "dataset does not exist".into()));
            }
            warn!(session.logger(), "unable to clean up inconsistent dataset"; "dataset" => name);
            return ZfsHandle::from_reply(session, name, doc, stats);
        }
    }

    /// Build a handle from a document the engine already returned, as listing does.
    pub(crate) fn from_reply(
        session: &'a Session,
        name: &str,
        doc: NvList,
        stats: ObjsetStats,
    ) -> Result<ZfsHandle<'a>> {
        let head_type = DatasetType::from_raw(stats.objset_type)
            .ok_or_else(|| Error::Internal(format!("unknown objset type {} for '{}'", stats.objset_type, name)))?;
        let kind = if stats.is_snapshot { DatasetType::Snapshot } else { head_type };
        let (props, user) = split_user(doc);
        Ok(ZfsHandle {
            session,
            name: name.to_string(),
            kind,
            head_type,
            stats,
            props,
            user,
            mntopts: OnceCell::new(),
            altroot: OnceCell::new(),
            logger: session.logger().new(o!("zetta_module" => "zfs", "dataset" => name.to_string())),
        })
    }

    /// Re-read properties and statistics. Cached mount information is dropped as well.
    pub fn refresh(&mut self) -> Result<()> {
        let (doc, stats) = fetch(self.session, &self.name)
            .map_err(|Errno(errno)| Error::from_errno(errno, format!("cannot refresh '{}'", self.name)))?;
        let (props, user) = split_user(doc);
        self.props = props;
        self.user = user;
        self.stats = stats;
        self.mntopts = OnceCell::new();
        trace!(self.logger, "refreshed");
        Ok(())
    }

    pub fn session(&self) -> &'a Session { self.session }

    pub fn logger(&self) -> &Logger { &self.logger }

    pub fn name(&self) -> &str { &self.name }

    pub fn kind(&self) -> DatasetType { self.kind }

    /// Type of the filesystem or volume a snapshot belongs to. Same as `kind` otherwise.
    pub fn head_type(&self) -> DatasetType { self.head_type }

    pub fn type_mask(&self) -> ZfsType { self.kind.as_mask() }

    pub fn pool_name(&self) -> &str { self.name.get_pool() }

    pub fn stats(&self) -> &ObjsetStats { &self.stats }

    /// Raw `{value, source}` entries of user properties.
    pub fn user_props(&self) -> &NvList { &self.user }

    pub(crate) fn rename_to(&mut self, name: &str) {
        self.name = name.to_string();
        self.mntopts = OnceCell::new();
    }

    /// Options of the live mount, looked up once per handle.
    pub fn mntopts(&self) -> Option<&str> {
        self.mntopts
            .get_or_init(|| match self.session.os().mnttab() {
                Ok(table) => find_mount(&table, &self.name).map(|line| line.mntopts().clone()),
                Err(e) => {
                    warn!(self.logger, "failed to read mount table"; "error" => %e);
                    None
                },
            })
            .as_deref()
    }

    /// Where the dataset is mounted right now.
    pub fn live_mountpoint(&self) -> Option<String> {
        let table = self.session.os().mnttab().ok()?;
        find_mount(&table, &self.name).map(|line| line.mountp().clone())
    }

    fn altroot(&self) -> &str {
        self.altroot.get_or_init(|| {
            let mut cmd = ZfsCmd::new(self.pool_name());
            match self.session.transport().call_with_reply(Opcode::PoolGetProps, &mut cmd) {
                Ok(doc) => doc
                    .get_nvlist("altroot")
                    .ok()
                    .and_then(|prop| prop.get("value"))
                    .and_then(NvValue::as_str)
                    .map(|root| root.trim_end_matches('/').to_string())
                    .unwrap_or_default(),
                Err(Errno(errno)) => {
                    warn!(self.logger, "failed to read pool properties"; "errno" => errno);
                    String::new()
                },
            }
        })
    }

    /// Raw value and the dataset it was set on. `None` for the setpoint means a statistic.
    fn raw(&self, name: &str) -> Option<(&NvValue, Option<&str>)> {
        let entry = self.props.get_nvlist(name).ok()?;
        let value = entry.get("value")?;
        Some((value, entry.get("source").and_then(NvValue::as_str)))
    }

    fn classify(&self, setpoint: Option<&str>) -> PropSource {
        match setpoint {
            None => PropSource::None,
            Some(s) if s == self.name => PropSource::Local,
            Some(s) => PropSource::Inherited(s.to_string()),
        }
    }

    fn raw_number(&self, prop: ZfsProp) -> (u64, PropSource) {
        match self.raw(prop.name()) {
            Some((value, setpoint)) => (value.as_number().unwrap_or(0), self.classify(setpoint)),
            None => (prop.default_numeric(), PropSource::Default),
        }
    }

    /// Raw string and the dataset it was set on, `""` when nobody set it.
    fn raw_string(&self, prop: ZfsProp) -> (String, String) {
        match self.raw(prop.name()) {
            Some((value, setpoint)) => {
                (value.as_str().unwrap_or_default().to_string(), setpoint.unwrap_or_default().to_string())
            },
            None => (prop.default_string().to_string(), String::new()),
        }
    }

    fn check_applies(&self, prop: ZfsProp) -> Result<()> {
        if prop.applies_to(self.type_mask()) {
            Ok(())
        } else {
            Err(Error::NotApplicableToType(
                format!("cannot get '{}' for '{}'", prop, self.name),
                "property does not apply to datasets of this type".into(),
            ))
        }
    }

    /// Effective numeric value of a number, boolean or index property.
    pub fn get_numeric(&self, prop: ZfsProp) -> Result<(u64, PropSource)> {
        self.check_applies(prop)?;
        if prop.kind() == PropKind::String {
            return Err(Error::InvalidProperty(
                format!("cannot get '{}' for '{}'", prop, self.name),
                "not a numeric property".into(),
            ));
        }
        if let Some((_, on, off)) = MOUNT_OVERRIDES.iter().find(|(p, _, _)| *p == prop) {
            let (value, source) = self.raw_number(prop);
            let opts = self.mntopts().unwrap_or_default();
            if value == 0 && has_mntopt(opts, on) {
                return Ok((1, PropSource::Temporary));
            }
            if value != 0 && has_mntopt(opts, off) {
                return Ok((0, PropSource::Temporary));
            }
            return Ok((value, source));
        }
        Ok(match prop {
            ZfsProp::Mounted => (self.mntopts().is_some() as u64, PropSource::None),
            ZfsProp::Quota | ZfsProp::Reservation => {
                let (value, _) = self.raw_number(prop);
                (value, if value == 0 { PropSource::Default } else { PropSource::Local })
            },
            ZfsProp::Canmount => {
                let (value, _) = self.raw_number(prop);
                (value, if value == 0 { PropSource::Local } else { PropSource::Default })
            },
            ZfsProp::Numclones => (self.stats.num_clones, PropSource::None),
            ZfsProp::Createtxg => (self.stats.create_txg, PropSource::None),
            _ => self.raw_number(prop),
        })
    }

    /// Effective numeric value, source dropped.
    pub fn get_prop_int(&self, prop: ZfsProp) -> Result<u64> { self.get_numeric(prop).map(|(value, _)| value) }

    /// Effective string value of a string property. The mountpoint is composed.
    pub fn get_string(&self, prop: ZfsProp) -> Result<(String, PropSource)> {
        self.check_applies(prop)?;
        Ok(match prop {
            ZfsProp::Name => (self.name.clone(), PropSource::None),
            ZfsProp::Type => (self.kind.to_string(), PropSource::None),
            ZfsProp::Origin => (self.stats.clone_of.clone(), PropSource::None),
            ZfsProp::Mountpoint => self.mountpoint(),
            _ => {
                let (value, setpoint) = self.raw_string(prop);
                let source = if setpoint.is_empty() { PropSource::Default } else { self.classify(Some(&setpoint)) };
                (value, source)
            },
        })
    }

    /// Effective mountpoint: pool altroot, then the mountpoint set on the nearest ancestor, then
    /// the path from that ancestor down to this dataset. `none` and `legacy` come back verbatim.
    pub fn mountpoint(&self) -> (String, PropSource) {
        let (mut value, setpoint) = self.raw_string(ZfsProp::Mountpoint);
        let source = if setpoint.is_empty() { PropSource::Default } else { self.classify(Some(&setpoint)) };
        if !value.is_empty() && !value.starts_with('/') {
            return (value, source);
        }
        let relpath = self.name.get(setpoint.len()..).unwrap_or_default().trim_start_matches('/');
        if value == "/" {
            value.clear();
        }
        let root = self.altroot();
        let mut path = format!("{}{}", root, value);
        if !relpath.is_empty() {
            if !relpath.starts_with('@') {
                path.push('/');
            }
            path.push_str(relpath);
        }
        if path.is_empty() {
            path.push('/');
        }
        (path, source)
    }

    /// Typed effective value.
    pub fn get_prop_value(&self, prop: ZfsProp) -> Result<(PropVal, PropSource)> {
        match prop.kind() {
            PropKind::String => self.get_string(prop).map(|(value, source)| (PropVal::Str(value), source)),
            PropKind::Number => self.get_numeric(prop).map(|(value, source)| (PropVal::Number(value), source)),
            PropKind::Boolean => self.get_numeric(prop).map(|(value, source)| (PropVal::Bool(value != 0), source)),
            PropKind::Index => self.get_numeric(prop).map(|(value, source)| (PropVal::Index(value), source)),
        }
    }

    /// Effective value as text. `literal` keeps numbers exact; otherwise sizes, times and ratios
    /// are made readable.
    pub fn get_prop(&self, prop: ZfsProp, literal: bool) -> Result<(String, PropSource)> {
        let (value, source) = self.get_prop_value(prop)?;
        let text = match (prop, value) {
            (_, PropVal::Str(value)) => value,
            (ZfsProp::Mounted, PropVal::Bool(mounted)) => String::from(if mounted { "yes" } else { "no" }),
            (_, PropVal::Bool(value)) => nicebool(value).to_string(),
            (_, PropVal::Index(value)) => prop
                .index_to_string(value)
                .ok_or_else(|| Error::Internal(format!("no alias for {}={}", prop, value)))?
                .to_string(),
            (_, PropVal::Number(value)) if literal => value.to_string(),
            (ZfsProp::Creation, PropVal::Number(value)) => format_time(value),
            (ZfsProp::Quota, PropVal::Number(0)) | (ZfsProp::Reservation, PropVal::Number(0)) => "none".to_string(),
            (ZfsProp::CompressRatio, PropVal::Number(value)) => ratio(value),
            (ZfsProp::Createtxg, PropVal::Number(value)) | (ZfsProp::Numclones, PropVal::Number(value)) => {
                value.to_string()
            },
            (_, PropVal::Number(value)) => nicenum(value),
        };
        Ok((text, source))
    }

    /// Value of a user property, if anybody up the tree set it.
    pub fn get_user_prop(&self, name: &str) -> Option<(String, PropSource)> {
        let entry = self.user.get_nvlist(name).ok()?;
        let value = entry.get("value").and_then(NvValue::as_str)?.to_string();
        Some((value, self.classify(entry.get("source").and_then(NvValue::as_str))))
    }

    /// Validation context describing this dataset as it is now.
    pub fn validate_context<C: Into<String>>(&self, context: C) -> ValidateContext {
        let mut ctx = ValidateContext::new(self.type_mask(), context);
        if self.kind == DatasetType::Filesystem {
            let zoned = self.get_prop_int(ZfsProp::Zoned).unwrap_or(0) != 0;
            ctx = ctx.zoned(zoned, self.session.global_zone());
        }
        if self.kind == DatasetType::Volume {
            let (volsize, _) = self.raw_number(ZfsProp::Volsize);
            let (volblocksize, _) = self.raw_number(ZfsProp::Volblocksize);
            let (reservation, _) = self.raw_number(ZfsProp::Reservation);
            ctx = ctx.volume(volsize, volblocksize, reservation);
        }
        ctx
    }

    /// Set a single property. Datasets whose mount state depends on it are unmounted first and
    /// brought back afterwards.
    pub fn set_property<V: NvTypeOp>(&mut self, name: &str, value: V) -> Result<()> {
        let context = format!("cannot set property for '{}'", self.name);
        let requested = NvList::new().with(name, value);
        let validated = validate_properties(&self.validate_context(context.clone()), &requested)?;
        let prop = lookup_by_name(name, self.type_mask());

        let mut changelist = match prop {
            Some(prop) => Changelist::gather(self, prop, false)?,
            None => Changelist::empty(self.session),
        };
        if prop == Some(ZfsProp::Mountpoint) && changelist.has_zoned_child() {
            return Err(Error::PermissionDenied(
                context,
                "child dataset with inherited mountpoint is used in a non-global zone".into(),
            ));
        }
        changelist.prefix()?;

        let mut cmd = ZfsCmd::new(self.name.as_str()).with_src(&validated);
        if let Err(Errno(errno)) = self.session.call(Opcode::SetProp, &mut cmd) {
            let _ = changelist.postfix();
            return Err(set_errno(errno, prop, context));
        }
        debug!(self.logger, "property set"; "property" => name);
        let restored = changelist.postfix();
        let refreshed = self.refresh();
        restored.and(refreshed)
    }

    /// Revert a property to the inherited or default value.
    pub fn inherit_property(&mut self, name: &str) -> Result<()> {
        let context = format!("cannot inherit {} for '{}'", name, self.name);
        let prop = if is_user_property(name) {
            None
        } else {
            let prop = lookup_by_name(name, ZfsType::all())
                .ok_or_else(|| Error::InvalidProperty(context.clone(), "invalid property".into()))?;
            if prop.is_readonly() {
                return Err(Error::ReadOnlyProperty(context, "property is read-only".into()));
            }
            if !prop.is_inheritable() {
                return Err(Error::NonInheritableProperty(context, "property cannot be inherited".into()));
            }
            if !prop.applies_to(self.type_mask()) {
                return Err(Error::NotApplicableToType(context, "property does not apply to datasets of this type".into()));
            }
            if prop == ZfsProp::Zoned && !self.session.global_zone() {
                return Err(Error::PermissionDenied(context, "dataset is used in a non-global zone".into()));
            }
            Some(prop)
        };

        let mut changelist = match prop {
            Some(prop) => Changelist::gather(self, prop, false)?,
            None => Changelist::empty(self.session),
        };
        if prop == Some(ZfsProp::Mountpoint) && changelist.has_zoned_child() {
            return Err(Error::PermissionDenied(
                context,
                "child dataset with inherited mountpoint is used in a non-global zone".into(),
            ));
        }
        changelist.prefix()?;

        let mut cmd = ZfsCmd::new(self.name.as_str()).with_value(name);
        if let Err(Errno(errno)) = self.session.call(Opcode::InheritProp, &mut cmd) {
            let _ = changelist.postfix();
            return Err(Error::from_errno(errno, context));
        }
        let restored = changelist.postfix();
        let refreshed = self.refresh();
        restored.and(refreshed)
    }
}

fn split_user(doc: NvList) -> (NvList, NvList) {
    let mut props = NvList::new();
    let mut user = NvList::new();
    for (name, value) in doc.iter() {
        if name.contains(':') {
            user.insert(name, value.clone());
        } else {
            props.insert(name, value.clone());
        }
    }
    (props, user)
}

fn set_errno(errno: i32, prop: Option<ZfsProp>, context: String) -> Error {
    match (errno, prop) {
        (libc::ENOSPC, Some(ZfsProp::Quota)) => {
            Error::SpaceExceeded(context, "size is less than current used or reserved space".into())
        },
        (libc::ENOSPC, Some(ZfsProp::Reservation)) => {
            Error::SpaceExceeded(context, "size is greater than available space".into())
        },
        (libc::EBUSY, Some(ZfsProp::Volblocksize)) => {
            Error::BadPropertyValue(context, "volume block size cannot be changed".into())
        },
        (libc::EDOM, _) => Error::BadPropertyValue(context, "block size out of range or not a power of 2".into()),
        (libc::EINVAL, _) => Error::BadPropertyValue(context, "invalid property value".into()),
        _ => Error::from_errno(errno, context),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mount_options_match_whole_words() {
        assert!(has_mntopt("rw,noatime,dev=4010002", "noatime"));
        assert!(has_mntopt("rw,noatime,dev=4010002", "dev"));
        assert!(!has_mntopt("rw,noatime", "atime"));
        assert!(!has_mntopt("", "ro"));
    }

    #[test]
    fn source_rendering() {
        assert_eq!("inherited from tank", PropSource::Inherited("tank".into()).to_string());
        assert_eq!("-", PropSource::None.to_string());
        assert_eq!("temporary", PropSource::Temporary.to_string());
    }
}
