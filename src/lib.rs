#![recursion_limit = "256"]
#![deny(nonstandard_style, future_incompatible)]
#![allow(clippy::module_name_repetitions, clippy::multiple_inherent_impl, clippy::implicit_return)]

//! Administrative control layer for ZFS-style pools and datasets.
//!
//! This library sits between an operator tool and the storage engine. The storage engine itself is
//! reachable only through a numbered command interface ([ioctl](ioctl/index.html)), and the host
//! OS is reachable only through mount/share primitives ([os](os/index.html)). Everything in
//! between lives here: the property table, coercion of user supplied values, source tracking for
//! inherited values, changelists that unmount and remount dependents around destructive
//! operations, and the multi-step dataset and pool lifecycle operations.
//!
//! # Overview
//! ## zfs
//! Dataset handles, the property system and every dataset operation (create, destroy, snapshot,
//! clone, promote, rollback, rename, send and receive). Refer to the
//! [zfs module documentation](zfs/index.html).
//!
//! ## zpool
//! Pool handles, pool lifecycle, vdev management and pool-wide mount/unmount of datasets.
//! Refer to the [zpool module documentation](zpool/index.html).
//!
//! # Usage
//! Everything starts with a [Session](session/struct.Session.html). It owns the command transport,
//! the mount layer and the pool namespace. Tests and demos can use the in-memory engine and
//! mounter:
//!
//! ```rust
//! use std::sync::Arc;
//! use zetta_admin::{ioctl::memory::MemoryEngine, os::memory::MemoryMounter,
//!                   session::{Session, SessionConfig}};
//!
//! let session = Session::new(Arc::new(MemoryEngine::new()),
//!                            Arc::new(MemoryMounter::new()),
//!                            SessionConfig::default(),
//!                            None);
//! assert!(session.pools().unwrap().is_empty());
//! ```
//!
//! # Project Structure
//! ### parsers
//! Module for PEG parsers backed by [Pest](https://pest.rs/).
//!
//! ### nv
//! Nested name/value documents used as command payloads.

#[macro_use] extern crate derive_builder;
#[macro_use] extern crate getset;

#[macro_use] extern crate lazy_static;

#[macro_use] extern crate quick_error;

#[macro_use] pub extern crate slog;

// library modules
pub mod ioctl;
pub mod nv;
pub mod os;
pub mod parsers;
pub mod session;
pub mod utils;
pub mod zfs;
pub mod zpool;

const VERSION: &str = env!("CARGO_PKG_VERSION");
use once_cell::sync::OnceCell;
use slog::{Drain, Logger as SlogLogger};
use slog_stdlog::StdLog;
use std::{borrow::Borrow, ops::Deref};

static GLOBAL_LOGGER: OnceCell<GlobalLogger> = OnceCell::new();

#[derive(Debug, Clone)]
pub struct GlobalLogger {
    inner: SlogLogger,
}

impl Deref for GlobalLogger {
    type Target = SlogLogger;

    fn deref(&self) -> &Self::Target { self.inner.borrow() }
}

impl GlobalLogger {
    fn new(logger: SlogLogger) -> Self { GlobalLogger { inner: logger } }

    /// Get global logger. If you didn't call `Logger::setup` prior calling this then default logger
    /// created with `StdLog` as drain.
    pub fn get() -> &'static GlobalLogger {
        GLOBAL_LOGGER.get_or_init(|| {
            let root_logger = SlogLogger::root(StdLog.fuse(), o!());
            GlobalLogger::new(logger_from_root_logger(&root_logger))
        })
    }

    /// Set global logger. Optional.
    /// Can only called once. Returns Ok(()) if the cell was empty and Err(value) if it was full.
    pub fn setup(root_logger: &SlogLogger) -> Result<(), GlobalLogger> {
        GLOBAL_LOGGER.set(GlobalLogger::new(logger_from_root_logger(root_logger)))
    }
}

pub(crate) fn logger_from_root_logger(root_logger: &SlogLogger) -> SlogLogger {
    root_logger.new(o!("zetta_version" => crate::VERSION))
}
