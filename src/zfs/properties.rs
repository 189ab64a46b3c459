//! Property descriptor table. The single source of truth for what properties exist, what kind of
//! value they hold, their defaults, and which dataset types they apply to.
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

use crate::zfs::{ZfsType, DEFAULT_VOLBLOCKSIZE, MAX_BLOCK_SIZE};

/// Every native property known to this library. Pool properties live in the same table and are
/// told apart by their type mask.
#[derive(AsRefStr, Display, EnumIter, EnumString, IntoStaticStr, Eq, PartialEq, Hash, Debug, Clone, Copy)]
#[strum(serialize_all = "lowercase")]
pub enum ZfsProp {
    Type,
    Creation,
    Used,
    Available,
    Referenced,
    CompressRatio,
    Mounted,
    Origin,
    Quota,
    Reservation,
    Volsize,
    Volblocksize,
    Recordsize,
    Mountpoint,
    Sharenfs,
    Checksum,
    Compression,
    Atime,
    Devices,
    Exec,
    Setuid,
    Readonly,
    Zoned,
    Snapdir,
    Aclmode,
    Aclinherit,
    Createtxg,
    Name,
    Canmount,
    Xattr,
    Numclones,
    Copies,
    Bootfs,
    Autoreplace,
    Failmode,
    Version,
    Health,
    Guid,
    Size,
    Altroot,
}

/// What kind of value a property holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    Number,
    String,
    Boolean,
    /// Enum-like numeric value with string aliases.
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropAttr {
    Default,
    ReadOnly,
    Inheritable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropDefault {
    Number(u64),
    String(&'static str),
}

/// One entry of the table.
#[derive(Debug, Clone)]
pub struct PropDesc {
    prop:        ZfsProp,
    kind:        PropKind,
    default:     PropDefault,
    attr:        PropAttr,
    types:       ZfsType,
    values:      Option<&'static str>,
    column:      Option<&'static str>,
    visible:     bool,
    create_only: bool,
    index:       Option<&'static [(&'static str, u64)]>,
}

static CHECKSUM_TABLE: &[(&str, u64)] =
    &[("on", 1), ("off", 2), ("fletcher2", 6), ("fletcher4", 7), ("sha256", 8)];

// "gzip" and "gzip-6" are the same thing; "gzip" comes first so it's what gets displayed.
static COMPRESSION_TABLE: &[(&str, u64)] = &[
    ("on", 1),
    ("off", 2),
    ("lzjb", 3),
    ("gzip", 10),
    ("gzip-1", 5),
    ("gzip-2", 6),
    ("gzip-3", 7),
    ("gzip-4", 8),
    ("gzip-5", 9),
    ("gzip-6", 10),
    ("gzip-7", 11),
    ("gzip-8", 12),
    ("gzip-9", 13),
];

static SNAPDIR_TABLE: &[(&str, u64)] = &[("hidden", 0), ("visible", 1)];

static ACL_MODE_TABLE: &[(&str, u64)] = &[("discard", 0), ("groupmask", 2), ("passthrough", 3)];

static ACL_INHERIT_TABLE: &[(&str, u64)] =
    &[("discard", 0), ("noallow", 1), ("secure", 2), ("passthrough", 3)];

static COPIES_TABLE: &[(&str, u64)] = &[("1", 1), ("2", 2), ("3", 3)];

static FAILMODE_TABLE: &[(&str, u64)] = &[("wait", 0), ("continue", 1), ("panic", 2)];

fn number(prop: ZfsProp, default: u64, attr: PropAttr, types: ZfsType) -> PropDesc {
    PropDesc {
        prop,
        kind: PropKind::Number,
        default: PropDefault::Number(default),
        attr,
        types,
        values: None,
        column: None,
        visible: true,
        create_only: false,
        index: None,
    }
}

fn string(prop: ZfsProp, default: &'static str, attr: PropAttr, types: ZfsType) -> PropDesc {
    PropDesc { kind: PropKind::String, default: PropDefault::String(default), ..number(prop, 0, attr, types) }
}

fn boolean(prop: ZfsProp, default: bool, attr: PropAttr, types: ZfsType) -> PropDesc {
    PropDesc {
        kind: PropKind::Boolean,
        values: Some("on | off"),
        ..number(prop, u64::from(default), attr, types)
    }
}

fn index(
    prop: ZfsProp,
    default: u64,
    types: ZfsType,
    table: &'static [(&'static str, u64)],
    values: &'static str,
) -> PropDesc {
    PropDesc {
        kind: PropKind::Index,
        index: Some(table),
        values: Some(values),
        ..number(prop, default, PropAttr::Inheritable, types)
    }
}

impl PropDesc {
    fn column(mut self, column: &'static str) -> Self {
        self.column = Some(column);
        self
    }

    fn values(mut self, values: &'static str) -> Self {
        self.values = Some(values);
        self
    }

    fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    fn create_only(mut self) -> Self {
        self.create_only = true;
        self
    }
}

#[allow(clippy::too_many_lines)]
fn describe(prop: ZfsProp) -> PropDesc {
    use PropAttr::{Default as Dflt, Inheritable as Inherit, ReadOnly as Ro};
    let any = ZfsType::DATASET;
    let fs = ZfsType::FILESYSTEM;
    let vol = ZfsType::VOLUME;
    let snap = ZfsType::SNAPSHOT;
    let pool = ZfsType::POOL;
    match prop {
        ZfsProp::Type => string(prop, "", Ro, any).column("TYPE").values("filesystem | volume | snapshot"),
        ZfsProp::Creation => number(prop, 0, Ro, any).column("CREATION").values("<date>"),
        ZfsProp::Used => number(prop, 0, Ro, any).column("USED").values("<size>"),
        ZfsProp::Available => number(prop, 0, Ro, fs | vol).column("AVAIL").values("<size>"),
        ZfsProp::Referenced => number(prop, 0, Ro, any).column("REFER").values("<size>"),
        ZfsProp::CompressRatio => {
            number(prop, 100, Ro, any).column("RATIO").values("<1.00x or higher if compressed>")
        },
        ZfsProp::Mounted => boolean(prop, false, Ro, fs).column("MOUNTED").values("yes | no | -"),
        ZfsProp::Origin => string(prop, "", Ro, fs | vol).column("ORIGIN").values("<snapshot>"),
        ZfsProp::Quota => number(prop, 0, Dflt, fs).column("QUOTA").values("<size> | none"),
        ZfsProp::Reservation => number(prop, 0, Dflt, fs | vol).column("RESERV").values("<size> | none"),
        ZfsProp::Volsize => number(prop, 0, Dflt, vol).column("VOLSIZE").values("<size>"),
        ZfsProp::Volblocksize => number(prop, DEFAULT_VOLBLOCKSIZE, Ro, vol)
            .column("VOLBLOCK")
            .values("512 to 128k, power of 2")
            .create_only(),
        ZfsProp::Recordsize => number(prop, MAX_BLOCK_SIZE, Inherit, fs)
            .column("RECSIZE")
            .values("512 to 128k, power of 2"),
        ZfsProp::Mountpoint => {
            string(prop, "/", Inherit, fs).column("MOUNTPOINT").values("<path> | legacy | none")
        },
        ZfsProp::Sharenfs => {
            string(prop, "off", Inherit, fs).column("SHARENFS").values("on | off | share(1M) options")
        },
        ZfsProp::Checksum => index(prop, 1, any, CHECKSUM_TABLE, "on | off | fletcher2 | fletcher4 | sha256")
            .column("CHECKSUM"),
        ZfsProp::Compression => {
            index(prop, 2, any, COMPRESSION_TABLE, "on | off | lzjb | gzip | gzip-[1-9]").column("COMPRESS")
        },
        ZfsProp::Atime => boolean(prop, true, Inherit, fs).column("ATIME"),
        ZfsProp::Devices => boolean(prop, true, Inherit, fs | snap).column("DEVICES"),
        ZfsProp::Exec => boolean(prop, true, Inherit, fs | snap).column("EXEC"),
        ZfsProp::Setuid => boolean(prop, true, Inherit, fs | snap).column("SETUID"),
        ZfsProp::Readonly => boolean(prop, false, Inherit, fs | vol).column("RDONLY"),
        ZfsProp::Zoned => boolean(prop, false, Inherit, fs).column("ZONED"),
        ZfsProp::Snapdir => index(prop, 0, fs, SNAPDIR_TABLE, "hidden | visible").column("SNAPDIR"),
        ZfsProp::Aclmode => {
            index(prop, 2, fs, ACL_MODE_TABLE, "discard | groupmask | passthrough").column("ACLMODE")
        },
        ZfsProp::Aclinherit => {
            index(prop, 2, fs, ACL_INHERIT_TABLE, "discard | noallow | secure | passthrough")
                .column("ACLINHERIT")
        },
        ZfsProp::Createtxg => number(prop, 0, Ro, any).hidden(),
        ZfsProp::Name => string(prop, "", Ro, any | pool).column("NAME").hidden(),
        ZfsProp::Canmount => boolean(prop, true, Dflt, fs).column("CANMOUNT"),
        ZfsProp::Xattr => boolean(prop, true, Inherit, fs).column("XATTR"),
        ZfsProp::Numclones => number(prop, 0, Ro, snap).hidden(),
        ZfsProp::Copies => index(prop, 1, fs | vol, COPIES_TABLE, "1 | 2 | 3").column("COPIES"),
        ZfsProp::Bootfs => string(prop, "", Dflt, pool).column("BOOTFS").values("<filesystem>"),
        ZfsProp::Autoreplace => boolean(prop, false, Dflt, pool).column("REPLACE"),
        ZfsProp::Failmode => index(prop, 0, pool, FAILMODE_TABLE, "wait | continue | panic").column("FAILMODE"),
        ZfsProp::Version => number(prop, 0, Ro, pool).column("VERSION").values("<version>"),
        ZfsProp::Health => string(prop, "", Ro, pool).column("HEALTH").values("<state>"),
        ZfsProp::Guid => number(prop, 0, Ro, pool).column("GUID").values("<guid>"),
        ZfsProp::Size => number(prop, 0, Ro, pool).column("SIZE").values("<size>"),
        ZfsProp::Altroot => string(prop, "", Ro, pool).column("ALTROOT").values("<path>").create_only(),
    }
}

lazy_static! {
    static ref PROP_TABLE: Vec<PropDesc> = ZfsProp::iter().map(describe).collect();
}

impl ZfsProp {
    /// Descriptor for this property.
    pub fn desc(self) -> &'static PropDesc { &PROP_TABLE[self as usize] }

    pub fn name(self) -> &'static str { self.into() }

    pub fn kind(self) -> PropKind { self.desc().kind }

    pub fn is_readonly(self) -> bool { self.desc().attr == PropAttr::ReadOnly }

    pub fn is_inheritable(self) -> bool { self.desc().attr == PropAttr::Inheritable }

    /// Readonly after creation, but may be given when the dataset or pool is created.
    pub fn is_create_only(self) -> bool { self.desc().create_only }

    pub fn is_visible(self) -> bool { self.desc().visible }

    pub fn applies_to(self, types: ZfsType) -> bool { self.desc().types.intersects(types) }

    pub fn types(self) -> ZfsType { self.desc().types }

    pub fn index_table(self) -> Option<&'static [(&'static str, u64)]> { self.desc().index }

    pub fn values(self) -> Option<&'static str> { self.desc().values }

    pub fn column_name(self) -> Option<&'static str> { self.desc().column }

    pub fn default_numeric(self) -> u64 {
        match self.desc().default {
            PropDefault::Number(val) => val,
            PropDefault::String(_) => 0,
        }
    }

    pub fn default_string(self) -> &'static str {
        match self.desc().default {
            PropDefault::String(val) => val,
            PropDefault::Number(_) => "",
        }
    }

    /// Minimum column width for listing and whether every value is guaranteed to fit in it.
    pub fn display_width(self) -> (usize, bool) {
        let mut width = self.column_name().map_or(0, str::len);
        match self.kind() {
            PropKind::Number => {
                // "20.4M" is as long as a human readable number gets.
                width = width.max(5);
                (width, self != ZfsProp::Creation)
            },
            PropKind::Boolean => (width.max(3), true),
            PropKind::Index => {
                let longest =
                    self.index_table().into_iter().flatten().map(|(alias, _)| alias.len()).max();
                (width.max(longest.unwrap_or(0)), true)
            },
            PropKind::String => (width, false),
        }
    }

    /// Visible properties that apply to any of `types`, in table order.
    pub fn all_visible(types: ZfsType) -> impl Iterator<Item = ZfsProp> {
        ZfsProp::iter().filter(move |prop| prop.is_visible() && prop.applies_to(types))
    }

    pub fn string_to_index(self, alias: &str) -> Option<u64> {
        self.index_table()?.iter().find(|(name, _)| *name == alias).map(|(_, val)| *val)
    }

    pub fn index_to_string(self, value: u64) -> Option<&'static str> {
        self.index_table()?.iter().find(|(_, val)| *val == value).map(|(name, _)| *name)
    }
}

impl PropDesc {
    pub fn prop(&self) -> ZfsProp { self.prop }

    pub fn name(&self) -> &'static str { self.prop.name() }

    pub fn kind(&self) -> PropKind { self.kind }

    pub fn attr(&self) -> PropAttr { self.attr }

    pub fn default(&self) -> PropDefault { self.default }
}

/// Find a property by its name or, ignoring case, by its listing column. Only properties that
/// apply to at least one of `types` are considered.
pub fn lookup_by_name(name: &str, types: ZfsType) -> Option<ZfsProp> {
    ZfsProp::iter().filter(|prop| prop.applies_to(types)).find(|prop| {
        prop.name() == name || prop.column_name().map_or(false, |col| col.eq_ignore_ascii_case(name))
    })
}

/// User properties are anything with a colon that doesn't collide with a native name: lowercase
/// letters, digits and `:`, `.`, `_`, `-`.
pub fn is_user_property(name: &str) -> bool {
    name.contains(':')
        && lookup_by_name(name, ZfsType::all()).is_none()
        && name.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == ':' || c == '.' || c == '_' || c == '-'
        })
}

macro_rules! impl_index_prop {
    ($type_:ty, $prop:expr) => {
        impl IndexProp for $type_ {
            fn prop() -> ZfsProp { $prop }

            fn as_index(&self) -> u64 { *self as u64 }
        }
    };
}

/// Typed access to index properties. The discriminant is the stored value.
pub trait IndexProp {
    /// Property this type describes.
    fn prop() -> ZfsProp;
    /// Value as stored by the storage engine.
    fn as_index(&self) -> u64;
}

/// Controls the checksum used to verify data integrity. Default value is `on`.
#[derive(AsRefStr, EnumString, Display, EnumIter, Eq, PartialEq, Debug, Clone, Copy)]
#[repr(u64)]
pub enum Checksum {
    /// Auto-select most appropriate algorithm.
    #[strum(serialize = "on")]
    On = 1,
    /// Disable integrity check. Not recommended at all.
    #[strum(serialize = "off")]
    Off = 2,
    #[strum(serialize = "fletcher2")]
    Fletcher2 = 6,
    #[strum(serialize = "fletcher4")]
    Fletcher4 = 7,
    #[strum(serialize = "sha256")]
    SHA256 = 8,
}

impl Default for Checksum {
    fn default() -> Self { Checksum::On }
}

/// Enables or disables compression for a dataset. `gzip` is the same as `gzip-6`.
#[derive(AsRefStr, EnumString, Display, EnumIter, Eq, PartialEq, Debug, Clone, Copy)]
#[repr(u64)]
pub enum Compression {
    #[strum(serialize = "on")]
    On = 1,
    /// Disables compression.
    #[strum(serialize = "off")]
    Off = 2,
    #[strum(serialize = "lzjb")]
    LZJB = 3,
    /// Fastest gzip level
    #[strum(serialize = "gzip-1")]
    Gzip1 = 5,
    #[strum(serialize = "gzip-2")]
    Gzip2 = 6,
    #[strum(serialize = "gzip-3")]
    Gzip3 = 7,
    #[strum(serialize = "gzip-4")]
    Gzip4 = 8,
    #[strum(serialize = "gzip-5")]
    Gzip5 = 9,
    #[strum(to_string = "gzip", serialize = "gzip-6")]
    Gzip6 = 10,
    #[strum(serialize = "gzip-7")]
    Gzip7 = 11,
    #[strum(serialize = "gzip-8")]
    Gzip8 = 12,
    /// Slowest gzip level
    #[strum(serialize = "gzip-9")]
    Gzip9 = 13,
}

impl Default for Compression {
    fn default() -> Self { Compression::Off }
}

/// Controls whether the `.zfs` directory is hidden or visible in the root of the file system.
#[derive(AsRefStr, EnumString, Display, EnumIter, Eq, PartialEq, Debug, Clone, Copy)]
#[repr(u64)]
pub enum SnapDir {
    #[strum(serialize = "hidden")]
    Hidden = 0,
    #[strum(serialize = "visible")]
    Visible = 1,
}

impl Default for SnapDir {
    fn default() -> Self { SnapDir::Hidden }
}

/// This property modifies ACL behavior when a file initially created or whenever a file or
/// directory's permissions modified by the chmod command.
#[derive(AsRefStr, EnumString, Display, EnumIter, Eq, PartialEq, Debug, Clone, Copy)]
#[repr(u64)]
pub enum AclMode {
    /// All ACL entries removed except for the entries needed to define the mode of the file or
    /// directory.
    #[strum(serialize = "discard")]
    Discard = 0,
    /// User or group ACL permissions reduced so that they are no greater than the group
    /// permissions, unless it is a user entry that has the same UID as the owner of the file or
    /// directory.
    #[strum(serialize = "groupmask")]
    GroupMask = 2,
    #[strum(serialize = "passthrough")]
    Passthrough = 3,
}

impl Default for AclMode {
    fn default() -> AclMode { AclMode::GroupMask }
}

/// Controls how ACL entries inherited when files and directories created.
#[derive(AsRefStr, EnumString, Display, EnumIter, Eq, PartialEq, Debug, Clone, Copy)]
#[repr(u64)]
pub enum AclInheritMode {
    /// For new objects, no ACL entries inherited when a file or directory created.
    #[strum(serialize = "discard")]
    Discard = 0,
    /// For new objects, only inheritable ACL entries that have an access type of `deny` are
    /// inherited.
    #[strum(serialize = "noallow")]
    Noallow = 1,
    /// For new objects, the `write_owner` and `write_acl` permissions removed when an ACL entry
    /// inherited.
    #[strum(serialize = "secure")]
    Secure = 2,
    #[strum(serialize = "passthrough")]
    Passthrough = 3,
}

impl Default for AclInheritMode {
    fn default() -> AclInheritMode { AclInheritMode::Secure }
}

/// Sets the number of copies of user data per file system. These copies are in addition to any
/// pool-level redundancy.
#[derive(AsRefStr, EnumString, Display, EnumIter, Eq, PartialEq, Debug, Clone, Copy)]
#[repr(u64)]
pub enum Copies {
    #[strum(serialize = "1")]
    One = 1,
    #[strum(serialize = "2")]
    Two = 2,
    #[strum(serialize = "3")]
    Three = 3,
}

impl Default for Copies {
    fn default() -> Self { Copies::One }
}

/// Controls the system behavior in the event of catastrophic pool failure.
#[derive(AsRefStr, EnumString, Display, EnumIter, Eq, PartialEq, Debug, Clone, Copy)]
#[repr(u64)]
pub enum FailMode {
    /// Blocks all I/O access until the device connectivity is recovered and the errors are
    /// cleared. This is the default behavior.
    #[strum(serialize = "wait")]
    Wait = 0,
    /// Returns EIO to any new write I/O requests but allows reads to any of the remaining healthy
    /// devices.
    #[strum(serialize = "continue")]
    Continue = 1,
    /// Prints out a message to the console and generates a system crash dump.
    #[strum(serialize = "panic")]
    Panic = 2,
}

impl Default for FailMode {
    fn default() -> Self { FailMode::Wait }
}

impl_index_prop!(Checksum, ZfsProp::Checksum);
impl_index_prop!(Compression, ZfsProp::Compression);
impl_index_prop!(SnapDir, ZfsProp::Snapdir);
impl_index_prop!(AclMode, ZfsProp::Aclmode);
impl_index_prop!(AclInheritMode, ZfsProp::Aclinherit);
impl_index_prop!(Copies, ZfsProp::Copies);
impl_index_prop!(FailMode, ZfsProp::Failmode);

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn table_matches_enum_order() {
        for prop in ZfsProp::iter() {
            assert_eq!(prop, prop.desc().prop());
            assert_eq!(prop.as_ref(), prop.name());
        }
    }

    #[test]
    fn table_invariants() {
        for prop in ZfsProp::iter() {
            if prop.kind() == PropKind::Index {
                assert!(!prop.index_table().unwrap().is_empty(), "{} has no aliases", prop);
            } else {
                assert!(prop.index_table().is_none());
            }
            assert!(!(prop.is_readonly() && prop.is_inheritable()));
            assert!(!prop.types().is_empty());
        }
    }

    #[test]
    fn lookup_names_and_columns() {
        assert_eq!(Some(ZfsProp::Available), lookup_by_name("available", ZfsType::DATASET));
        assert_eq!(Some(ZfsProp::Available), lookup_by_name("avail", ZfsType::DATASET));
        assert_eq!(Some(ZfsProp::Available), lookup_by_name("AVAIL", ZfsType::DATASET));
        assert_eq!(Some(ZfsProp::Reservation), lookup_by_name("reserv", ZfsType::DATASET));
        assert_eq!(None, lookup_by_name("Available", ZfsType::DATASET));
        assert_eq!(None, lookup_by_name("bootfs", ZfsType::DATASET));
        assert_eq!(Some(ZfsProp::Bootfs), lookup_by_name("bootfs", ZfsType::POOL));
        assert_eq!(None, lookup_by_name("nope", ZfsType::all()));
    }

    #[test]
    fn applicability() {
        assert!(ZfsProp::Quota.applies_to(ZfsType::FILESYSTEM));
        assert!(!ZfsProp::Quota.applies_to(ZfsType::SNAPSHOT));
        assert!(ZfsProp::Volsize.applies_to(ZfsType::VOLUME));
        assert!(ZfsProp::Exec.applies_to(ZfsType::SNAPSHOT | ZfsType::VOLUME));
    }

    #[test]
    fn widths() {
        assert_eq!((5, true), ZfsProp::Used.display_width());
        assert_eq!((8, false), ZfsProp::Creation.display_width());
        assert_eq!((5, true), ZfsProp::Atime.display_width());
        assert_eq!((8, true), ZfsProp::Compression.display_width());
        assert_eq!((10, false), ZfsProp::Mountpoint.display_width());
    }

    #[test]
    fn index_round_trip() {
        for prop in ZfsProp::iter().filter(|p| p.kind() == PropKind::Index) {
            for (alias, value) in prop.index_table().unwrap() {
                assert_eq!(Some(*value), prop.string_to_index(prop.index_to_string(*value).unwrap()));
                let canonical = prop.index_to_string(*value).unwrap();
                if canonical == *alias {
                    assert_eq!(Some(*alias), prop.index_to_string(prop.string_to_index(alias).unwrap()));
                } else {
                    // Synonym: resolves to the same value as the canonical alias.
                    assert_eq!(prop.string_to_index(canonical), prop.string_to_index(alias));
                }
            }
        }
        assert_eq!(Some("gzip"), ZfsProp::Compression.index_to_string(10));
        assert_eq!(Some(10), ZfsProp::Compression.string_to_index("gzip-6"));
        assert_eq!(None, ZfsProp::Compression.string_to_index("lz4"));
    }

    #[test]
    fn typed_enums_agree_with_table() {
        fn check<T: IndexProp + AsRef<str> + IntoEnumIterator>() {
            for variant in T::iter() {
                assert_eq!(Some(variant.as_index()), T::prop().string_to_index(variant.as_ref()));
            }
        }
        check::<Checksum>();
        check::<Compression>();
        check::<SnapDir>();
        check::<AclMode>();
        check::<AclInheritMode>();
        check::<Copies>();
        check::<FailMode>();
        assert_eq!(Compression::Gzip6, Compression::from_str("gzip").unwrap());
        assert_eq!(Compression::Gzip6, Compression::from_str("gzip-6").unwrap());
        assert_eq!("gzip", Compression::Gzip6.to_string());
        assert_eq!(ZfsProp::Aclinherit.default_numeric(), AclInheritMode::default().as_index());
        assert_eq!(ZfsProp::Aclmode.default_numeric(), AclMode::default().as_index());
    }

    #[test]
    fn user_properties() {
        assert!(is_user_property("com.example:backup"));
        assert!(!is_user_property("quota"));
        assert!(!is_user_property("Com:Upper"));
        assert!(!is_user_property("nocolon"));
    }
}
