//! Pool states, on-disk versions and the typed view of pool properties.
use strum_macros::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

use crate::{nv::NvList, zfs::FailMode};

/// Current on-disk version new pools are created with.
pub const SPA_VERSION: u64 = 8;
/// Version that introduced hot spares.
pub const VERSION_SPARES: u64 = 3;
/// Version that introduced double parity raidz.
pub const VERSION_RAID6: u64 = 3;
/// Version that introduced multiple copies of user data.
pub const VERSION_DITTO_BLOCKS: u64 = 2;
/// Version that introduced gzip compression.
pub const VERSION_GZIP: u64 = 5;
/// Version that introduced the `bootfs` property.
pub const VERSION_BOOTFS: u64 = 6;

/// Represent state of zpool or vdev. Read
/// [more](https://docs.oracle.com/cd/E19253-01/819-5461/gamno/index.html).
#[derive(AsRefStr, EnumString, Display, IntoStaticStr, Debug, Clone, Copy, Eq, PartialEq)]
pub enum Health {
    /// Healthy and operational
    #[strum(serialize = "ONLINE")]
    Online,
    /// Unhealthy, but operational,
    #[strum(serialize = "DEGRADED")]
    Degraded,
    /// Not operational
    #[strum(serialize = "FAULTED")]
    Faulted,
    /// Taken offline by admin
    #[strum(serialize = "OFFLINE")]
    Offline,
    /// Can't open device.
    #[strum(serialize = "UNAVAIL")]
    Unavailable,
    /// Physically removed while the system was running.
    #[strum(serialize = "REMOVED")]
    Removed,
}

/// State of a single vdev as stored in the configuration.
#[derive(AsRefStr, Display, EnumIter, Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u64)]
pub enum VdevState {
    Unknown = 0,
    Closed = 1,
    Offline = 2,
    Removed = 3,
    CantOpen = 4,
    Faulted = 5,
    Degraded = 6,
    Healthy = 7,
}

impl VdevState {
    pub fn from_raw(raw: u64) -> VdevState {
        match raw {
            1 => VdevState::Closed,
            2 => VdevState::Offline,
            3 => VdevState::Removed,
            4 => VdevState::CantOpen,
            5 => VdevState::Faulted,
            6 => VdevState::Degraded,
            7 => VdevState::Healthy,
            _ => VdevState::Unknown,
        }
    }

    pub fn health(self) -> Health {
        match self {
            VdevState::Healthy => Health::Online,
            VdevState::Degraded => Health::Degraded,
            VdevState::Faulted => Health::Faulted,
            VdevState::Offline => Health::Offline,
            VdevState::Removed => Health::Removed,
            VdevState::CantOpen | VdevState::Closed | VdevState::Unknown => Health::Unavailable,
        }
    }
}

/// Whether the pool could be opened at all.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PoolState {
    Active,
    Unavailable,
}

/// Snapshot of pool properties as reported by the engine.
#[derive(Debug, Clone, PartialEq, Getters)]
#[get = "pub"]
pub struct ZpoolProperties {
    /// Default bootable dataset.
    bootfs:      Option<String>,
    /// Replace a device found in the same physical location automatically.
    autoreplace: bool,
    /// Behavior on catastrophic failure.
    fail_mode:   FailMode,
    version:     u64,
    health:      Health,
    guid:        u64,
    /// Total size in bytes.
    size:        u64,
    altroot:     Option<String>,
}

fn prop_value<'a>(props: &'a NvList, name: &str) -> Option<&'a crate::nv::NvValue> {
    props.get_nvlist(name).ok().and_then(|prop| prop.get("value"))
}

impl ZpoolProperties {
    /// Build from the `{prop: {value, source}}` document the engine returns.
    pub fn from_nvlist(props: &NvList) -> ZpoolProperties {
        let number = |name: &str| prop_value(props, name).and_then(|v| v.as_number()).unwrap_or(0);
        let string = |name: &str| {
            prop_value(props, name)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        let fail_mode = match number("failmode") {
            1 => FailMode::Continue,
            2 => FailMode::Panic,
            _ => FailMode::Wait,
        };
        ZpoolProperties {
            bootfs: string("bootfs"),
            autoreplace: number("autoreplace") != 0,
            fail_mode,
            version: number("version"),
            health: string("health").and_then(|h| h.parse().ok()).unwrap_or(Health::Unavailable),
            guid: number("guid"),
            size: number("size"),
            altroot: string("altroot"),
        }
    }
}
