use std::sync::Arc;

use slog::{o, Drain, Logger};
use slog_stdlog::StdLog;
use zetta_admin::{ioctl::memory::MemoryEngine,
                  os::memory::MemoryMounter,
                  session::{Session, SessionConfig},
                  zfs::{ErrorKind, ZfsHandle, ZfsType},
                  GlobalLogger};

fn config() -> SessionConfig {
    SessionConfig::builder().mount_cmd("/sbin/mount").global_zone(true).build().unwrap()
}

#[test]
fn empty_session() {
    let root = Logger::root(StdLog.fuse(), o!());
    let session = Session::new(Arc::new(MemoryEngine::new()), Arc::new(MemoryMounter::new()), config(), Some(root));

    assert!(format!("{:?}", session).contains("/sbin/mount"));
    assert_eq!("(zetta_version)", format!("{:?}", session.logger().list()));
    assert!(session.global_zone());
    assert!(session.pools().unwrap().is_empty());
    assert!(!session.pool_exists("tank").unwrap());
    assert_eq!(None, session.pool_guid("tank"));

    let err = ZfsHandle::open(&session, "tank", ZfsType::FILESYSTEM).unwrap_err();
    assert_eq!(ErrorKind::NotFound, err.kind());
}

#[test]
fn session_without_logger_uses_global_one() {
    let root = Logger::root(StdLog.fuse(), o!("site" => "lab"));
    GlobalLogger::setup(&root).unwrap();
    assert!(GlobalLogger::setup(&root).is_err());

    let session = Session::new(Arc::new(MemoryEngine::new()), Arc::new(MemoryMounter::new()), config(), None);
    assert_eq!("(zetta_version, site)", format!("{:?}", session.logger().list()));
    session.refresh_namespace().unwrap();
    assert!(session.pools().unwrap().is_empty());
}
