extern crate slog_term;
extern crate tempfile;
extern crate zetta_admin;

use std::{io::{Seek, SeekFrom, Write},
          sync::Arc};

use rand::Rng;

use zetta_admin::{ioctl::{memory::MemoryEngine, Opcode},
                  nv::NvList,
                  os::memory::{MemoryMounter, MountEvent, MountOp},
                  session::{Session, SessionConfig},
                  slog::*,
                  zfs::{Changelist, CreateDatasetRequest, DatasetType, ErrorKind, PropSource, ReceiveRequest,
                        ZfsHandle, ZfsProp, ZfsType},
                  zpool::{CreateZpoolRequest, TopologyBuilder, Vdev}};

static ONE_MB_IN_BYTES: u64 = 1024 * 1024;

fn get_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(slog_term::FullFormat::new(plain).build().fuse(), o!())
}

fn get_dataset_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix = rng.gen::<u32>();
    format!("ds{}", suffix)
}

struct Fixture {
    engine:  Arc<MemoryEngine>,
    mounter: Arc<MemoryMounter>,
    session: Session,
}

/// Session with a single pool `tank` whose root dataset is mounted on `/tank`.
fn setup() -> Fixture {
    let engine = Arc::new(MemoryEngine::new());
    engine.add_device("/dev/dsk/c0t0d0", 1 << 30);
    let mounter = Arc::new(MemoryMounter::new());
    let config = SessionConfig::builder().global_zone(true).build().unwrap();
    let session = Session::new(engine.clone(), mounter.clone(), config, Some(get_logger()));
    let topology = TopologyBuilder::default().vdev(Vdev::disk("/dev/dsk/c0t0d0")).build().unwrap();
    let request = CreateZpoolRequest::builder().name("tank").topology(topology).build().unwrap();
    session.create_pool(&request).unwrap().enable_datasets(None).unwrap();
    Fixture { engine, mounter, session }
}

fn create_fs(session: &Session, name: &str) {
    session.create(CreateDatasetRequest::builder().name(name).kind(DatasetType::Filesystem).build().unwrap()).unwrap();
}

fn create_and_mount(session: &Session, name: &str) {
    create_fs(session, name);
    open(session, name).mount(None).unwrap();
}

fn create_volume(session: &Session, name: &str) {
    let request = CreateDatasetRequest::builder()
        .name(name)
        .kind(DatasetType::Volume)
        .property("volsize", "8M")
        .build()
        .unwrap();
    session.create(request).unwrap();
}

fn open<'a>(session: &'a Session, name: &str) -> ZfsHandle<'a> {
    ZfsHandle::open(session, name, ZfsType::all()).unwrap()
}

#[test]
fn create_with_properties() {
    let fx = setup();
    let name = format!("tank/{}", get_dataset_name());
    let request = CreateDatasetRequest::builder()
        .name(name.clone())
        .kind(DatasetType::Filesystem)
        .property("compression", "gzip-6")
        .property("quota", "10M")
        .property("atime", false)
        .property("org.example:owner", "ops")
        .build()
        .unwrap();
    fx.session.create(request).unwrap();

    let zhp = open(&fx.session, &name);
    assert_eq!(DatasetType::Filesystem, zhp.kind());
    assert_eq!((String::from("gzip"), PropSource::Local), zhp.get_prop(ZfsProp::Compression, false).unwrap());
    assert_eq!((String::from("10M"), PropSource::Local), zhp.get_prop(ZfsProp::Quota, false).unwrap());
    assert_eq!((10 * ONE_MB_IN_BYTES).to_string(), zhp.get_prop(ZfsProp::Quota, true).unwrap().0);
    assert_eq!((String::from("off"), PropSource::Local), zhp.get_prop(ZfsProp::Atime, false).unwrap());
    assert_eq!(Some((String::from("ops"), PropSource::Local)), zhp.get_user_prop("org.example:owner"));
    assert_eq!((format!("/{}", name), PropSource::Default), zhp.mountpoint());

    let child = format!("{}/child", name);
    create_fs(&fx.session, &child);
    let child = open(&fx.session, &child);
    assert_eq!(
        (String::from("gzip"), PropSource::Inherited(name.clone())),
        child.get_prop(ZfsProp::Compression, false).unwrap()
    );
    assert_eq!((String::from("none"), PropSource::Default), child.get_prop(ZfsProp::Quota, false).unwrap());
    assert_eq!(Some((String::from("ops"), PropSource::Inherited(name))), child.get_user_prop("org.example:owner"));
}

#[test]
fn create_refusals() {
    let fx = setup();
    create_fs(&fx.session, "tank/fs");
    create_volume(&fx.session, "tank/vol");
    let fs = |name: &str| CreateDatasetRequest::builder().name(name).kind(DatasetType::Filesystem).build().unwrap();

    assert_eq!(ErrorKind::AlreadyExists, fx.session.create(fs("tank/fs")).unwrap_err().kind());
    assert_eq!(ErrorKind::NotFound, fx.session.create(fs("tank/missing/fs")).unwrap_err().kind());
    assert_eq!(ErrorKind::NotFound, fx.session.create(fs("dozer/fs")).unwrap_err().kind());
    assert_eq!(ErrorKind::WrongType, fx.session.create(fs("tank/vol/fs")).unwrap_err().kind());
    assert_eq!(ErrorKind::InvalidName, fx.session.create(fs("tank/fs@snap")).unwrap_err().kind());
    assert_eq!(ErrorKind::InvalidName, fx.session.create(fs("tank/f%s")).unwrap_err().kind());

    let bad = CreateDatasetRequest::builder()
        .name("tank/q")
        .kind(DatasetType::Filesystem)
        .property("quota", "lots")
        .build()
        .unwrap();
    assert_eq!(ErrorKind::BadPropertyValue, fx.session.create(bad).unwrap_err().kind());

    let volprop = CreateDatasetRequest::builder()
        .name("tank/q")
        .kind(DatasetType::Filesystem)
        .property("volsize", "1M")
        .build()
        .unwrap();
    assert_eq!(ErrorKind::NotApplicableToType, fx.session.create(volprop).unwrap_err().kind());

    let sizeless = CreateDatasetRequest::builder().name("tank/v2").kind(DatasetType::Volume).build().unwrap();
    assert_eq!(ErrorKind::BadPropertyValue, fx.session.create(sizeless).unwrap_err().kind());
    assert!(!fx.session.dataset_exists("tank/q"));
    assert!(!fx.session.dataset_exists("tank/v2"));
}

#[test]
fn volumes_reserve_their_size() {
    let fx = setup();
    create_volume(&fx.session, "tank/vol");
    let vol = open(&fx.session, "tank/vol");
    assert_eq!(DatasetType::Volume, vol.kind());
    assert_eq!(8 * ONE_MB_IN_BYTES, vol.get_prop_int(ZfsProp::Volsize).unwrap());
    assert_eq!(8 * ONE_MB_IN_BYTES, vol.get_prop_int(ZfsProp::Reservation).unwrap());

    let sparse = CreateDatasetRequest::builder()
        .name("tank/sparse")
        .kind(DatasetType::Volume)
        .property("volsize", "8M")
        .sparse(true)
        .build()
        .unwrap();
    fx.session.create(sparse).unwrap();
    let sparse = open(&fx.session, "tank/sparse");
    assert_eq!((0, PropSource::Default), sparse.get_numeric(ZfsProp::Reservation).unwrap());

    vol.destroy().unwrap();
    sparse.destroy().unwrap();
    assert!(!fx.session.dataset_exists("tank/vol"));
    assert!(!fx.session.dataset_exists("tank/sparse"));
}

#[test]
fn resize_volume() {
    let fx = setup();
    create_volume(&fx.session, "tank/vol");
    let mut vol = open(&fx.session, "tank/vol");

    let err = vol.set_property("volsize", "12345").unwrap_err();
    assert_eq!(ErrorKind::BadPropertyValue, err.kind());
    let vol_again = open(&fx.session, "tank/vol");
    assert_eq!(8 * ONE_MB_IN_BYTES, vol_again.get_prop_int(ZfsProp::Volsize).unwrap());

    vol.set_property("volsize", "16M").unwrap();
    let vol = open(&fx.session, "tank/vol");
    assert_eq!(16 * ONE_MB_IN_BYTES, vol.get_prop_int(ZfsProp::Volsize).unwrap());
    assert_eq!(16 * ONE_MB_IN_BYTES, vol.get_prop_int(ZfsProp::Reservation).unwrap());
}

#[test]
fn set_and_inherit_property() {
    let fx = setup();
    create_fs(&fx.session, "tank/a");
    create_fs(&fx.session, "tank/a/b");
    let mut parent = open(&fx.session, "tank/a");
    parent.set_property("checksum", "sha256").unwrap();

    let mut child = open(&fx.session, "tank/a/b");
    assert_eq!(
        (String::from("sha256"), PropSource::Inherited(String::from("tank/a"))),
        child.get_prop(ZfsProp::Checksum, false).unwrap()
    );
    child.set_property("checksum", "fletcher4").unwrap();
    assert_eq!((String::from("fletcher4"), PropSource::Local), child.get_prop(ZfsProp::Checksum, false).unwrap());
    child.inherit_property("checksum").unwrap();
    assert_eq!(
        (String::from("sha256"), PropSource::Inherited(String::from("tank/a"))),
        child.get_prop(ZfsProp::Checksum, false).unwrap()
    );

    let err = child.set_property("used", "1M").unwrap_err();
    assert_eq!(ErrorKind::ReadOnlyProperty, err.kind());
    let err = child.set_property("nosuchprop", "1").unwrap_err();
    assert_eq!(ErrorKind::InvalidProperty, err.kind());
    let err = child.inherit_property("quota").unwrap_err();
    assert_eq!(ErrorKind::NonInheritableProperty, err.kind());
}

#[test]
fn mountpoint_change_moves_children() {
    let fx = setup();
    create_and_mount(&fx.session, "tank/a");
    create_and_mount(&fx.session, "tank/a/b");
    assert!(fx.mounter.is_mounted("/tank/a/b"));

    let mut zhp = open(&fx.session, "tank/a");
    zhp.set_property("mountpoint", "/export/a").unwrap();
    assert!(fx.mounter.is_mounted("/export/a"));
    assert!(fx.mounter.is_mounted("/export/a/b"));
    assert!(!fx.mounter.is_mounted("/tank/a"));
    let child = open(&fx.session, "tank/a/b");
    assert_eq!(
        (String::from("/export/a/b"), PropSource::Inherited(String::from("tank/a"))),
        child.mountpoint()
    );

    zhp.set_property("mountpoint", "none").unwrap();
    assert!(!fx.mounter.is_mounted("/export/a"));
    assert!(!fx.mounter.is_mounted("/export/a/b"));
}

#[test]
fn changelist_orders_unmounts() {
    let fx = setup();
    create_and_mount(&fx.session, "tank/a");
    create_and_mount(&fx.session, "tank/a/b");
    create_and_mount(&fx.session, "tank/a/b/c");

    let zhp = open(&fx.session, "tank/a");
    let mut changelist = Changelist::gather(&zhp, ZfsProp::Mountpoint, false).unwrap();
    assert_eq!(3, changelist.len());
    assert!(changelist.contains_mountpoint("/tank/a/b"));

    fx.mounter.clear_journal();
    changelist.prefix().unwrap();
    let unmounts: Vec<MountEvent> =
        fx.mounter.journal().into_iter().filter(|e| matches!(e, MountEvent::Unmount(_))).collect();
    assert_eq!(
        vec![
            MountEvent::Unmount(String::from("/tank/a/b/c")),
            MountEvent::Unmount(String::from("/tank/a/b")),
            MountEvent::Unmount(String::from("/tank/a")),
        ],
        unmounts
    );
    fx.mounter.clear_journal();
    changelist.postfix().unwrap();
    let mounts: Vec<String> = fx
        .mounter
        .journal()
        .into_iter()
        .filter_map(|e| match e {
            MountEvent::Mount { mountpoint, .. } => Some(mountpoint),
            _ => None,
        })
        .collect();
    assert_eq!(vec!["/tank/a", "/tank/a/b", "/tank/a/b/c"], mounts);
    assert!(fx.mounter.is_mounted("/tank/a/b/c"));
}

#[test]
fn mountpoint_kept_when_remount_fails() {
    let fx = setup();
    create_and_mount(&fx.session, "tank/a");

    fx.mounter.fail_next(MountOp::Mount, libc::EBUSY);
    let mut zhp = open(&fx.session, "tank/a");
    let err = zhp.set_property("mountpoint", "/export/a").unwrap_err();
    assert_eq!(ErrorKind::MountFailed, err.kind());
    assert!(!fx.mounter.is_mounted("/tank/a"));
    assert!(!fx.mounter.is_mounted("/export/a"));

    let zhp = open(&fx.session, "tank/a");
    assert_eq!((String::from("/export/a"), PropSource::Local), zhp.mountpoint());
    zhp.mount(None).unwrap();
    assert!(fx.mounter.is_mounted("/export/a"));
}

#[test]
fn mount_options_override_stored_values() {
    let fx = setup();
    create_fs(&fx.session, "tank/fs");
    open(&fx.session, "tank/fs").mount(Some("noatime,ro")).unwrap();

    let zhp = open(&fx.session, "tank/fs");
    assert_eq!((String::from("off"), PropSource::Temporary), zhp.get_prop(ZfsProp::Atime, false).unwrap());
    assert_eq!((String::from("on"), PropSource::Temporary), zhp.get_prop(ZfsProp::Readonly, false).unwrap());
}

#[test]
fn snapshot_recursive_and_destroy() {
    let fx = setup();
    create_fs(&fx.session, "tank/a");
    create_fs(&fx.session, "tank/a/b");
    create_volume(&fx.session, "tank/a/vol");

    fx.session.snapshot("tank/a@today", true).unwrap();
    assert!(fx.session.dataset_exists("tank/a@today"));
    assert!(fx.session.dataset_exists("tank/a/b@today"));
    assert!(fx.session.dataset_exists("tank/a/vol@today"));
    assert!(fx.engine.calls().contains(&(Opcode::CreateMinor, String::from("tank/a/vol@today"))));

    let err = fx.session.snapshot("tank/a@today", true).unwrap_err();
    assert_eq!(ErrorKind::AlreadyExists, err.kind());
    let err = fx.session.snapshot("tank/a@to@day", false).unwrap_err();
    assert_eq!(ErrorKind::InvalidName, err.kind());
    let err = fx.session.snapshot("tank/none@today", false).unwrap_err();
    assert_eq!(ErrorKind::NotFound, err.kind());

    let snap = open(&fx.session, "tank/a/b@today");
    assert_eq!(DatasetType::Snapshot, snap.kind());
    assert_eq!(DatasetType::Filesystem, snap.head_type());

    open(&fx.session, "tank/a").destroy_snaps("today").unwrap();
    assert!(!fx.session.dataset_exists("tank/a@today"));
    assert!(!fx.session.dataset_exists("tank/a/b@today"));
    assert!(!fx.session.dataset_exists("tank/a/vol@today"));

    let err = open(&fx.session, "tank/a").destroy_snaps("today").unwrap_err();
    assert_eq!(ErrorKind::NotFound, err.kind());
}

#[test]
fn destroy_unmounts_and_cleans_up() {
    let fx = setup();
    create_and_mount(&fx.session, "tank/a");
    create_fs(&fx.session, "tank/a/b");

    let err = open(&fx.session, "tank/a").destroy().unwrap_err();
    assert_eq!(ErrorKind::Busy, err.kind());

    open(&fx.session, "tank/a/b").destroy().unwrap();
    open(&fx.session, "tank/a").destroy().unwrap();
    assert!(!fx.mounter.is_mounted("/tank/a"));
    assert!(!fx.mounter.dir_exists("/tank/a"));
    assert!(!fx.session.dataset_exists("tank/a"));

    let err = open(&fx.session, "tank").destroy().unwrap_err();
    assert_eq!(ErrorKind::WrongType, err.kind());
}

#[test]
fn clone_and_promote() {
    let fx = setup();
    create_fs(&fx.session, "tank/fs");
    fx.session.snapshot("tank/fs@a", false).unwrap();
    fx.session.snapshot("tank/fs@b", false).unwrap();
    fx.session.snapshot("tank/fs@c", false).unwrap();

    let snap = open(&fx.session, "tank/fs@b");
    snap.clone_to("tank/clone", &NvList::new().with("atime", "off")).unwrap();
    let mut clone = open(&fx.session, "tank/clone");
    assert_eq!((String::from("tank/fs@b"), PropSource::None), clone.get_prop(ZfsProp::Origin, false).unwrap());
    assert_eq!((String::from("off"), PropSource::Local), clone.get_prop(ZfsProp::Atime, false).unwrap());

    let err = open(&fx.session, "tank/fs@b").destroy().unwrap_err();
    assert_eq!(ErrorKind::Busy, err.kind());
    let err = open(&fx.session, "tank/fs").clone_to("tank/c2", &NvList::new()).unwrap_err();
    assert_eq!(ErrorKind::WrongType, err.kind());
    let err = snap.clone_to("dozer/c2", &NvList::new()).unwrap_err();
    assert_eq!(ErrorKind::CrossPoolOperation, err.kind());
    let err = snap.clone_to("tank/nope/c2", &NvList::new()).unwrap_err();
    assert_eq!(ErrorKind::NotFound, err.kind());

    clone.promote().unwrap();
    assert!(fx.session.dataset_exists("tank/clone@a"));
    assert!(fx.session.dataset_exists("tank/clone@b"));
    assert!(fx.session.dataset_exists("tank/fs@c"));
    assert!(!fx.session.dataset_exists("tank/fs@a"));
    assert_eq!("", clone.stats().clone_of);
    let fs = open(&fx.session, "tank/fs");
    assert_eq!("tank/clone@b", fs.stats().clone_of);

    let err = open(&fx.session, "tank/clone").promote().unwrap_err();
    assert_eq!(ErrorKind::WrongType, err.kind());
}

#[test]
fn promote_refuses_conflicting_names() {
    let fx = setup();
    create_fs(&fx.session, "tank/fs");
    fx.session.snapshot("tank/fs@x", false).unwrap();
    open(&fx.session, "tank/fs@x").clone_to("tank/clone", &NvList::new()).unwrap();
    fx.session.snapshot("tank/clone@x", false).unwrap();
    fx.engine.clear_calls();

    let err = open(&fx.session, "tank/clone").promote().unwrap_err();
    assert_eq!(ErrorKind::AlreadyExists, err.kind());
    assert!(!fx.engine.calls().iter().any(|(op, _)| *op == Opcode::Promote));
    assert!(fx.session.dataset_exists("tank/fs@x"));
}

#[test]
fn rollback_destroys_newer_snapshots() {
    let fx = setup();
    create_and_mount(&fx.session, "tank/fs");
    fx.session.snapshot("tank/fs@a", false).unwrap();
    fx.engine.set_used("tank/fs", 4 * ONE_MB_IN_BYTES);
    fx.session.snapshot("tank/fs@b", false).unwrap();
    fx.session.snapshot("tank/fs@c", false).unwrap();
    open(&fx.session, "tank/fs@b").clone_to("tank/fromb", &NvList::new()).unwrap();
    create_fs(&fx.session, "tank/other");
    fx.session.snapshot("tank/other@a", false).unwrap();

    let mut fs = open(&fx.session, "tank/fs");
    let err = fs.rollback(&open(&fx.session, "tank/other@a"), false).unwrap_err();
    assert_eq!(ErrorKind::InvalidName, err.kind());

    fs.rollback(&open(&fx.session, "tank/fs@a"), false).unwrap();
    assert!(fx.session.dataset_exists("tank/fs@a"));
    assert!(!fx.session.dataset_exists("tank/fs@b"));
    assert!(!fx.session.dataset_exists("tank/fs@c"));
    assert!(!fx.session.dataset_exists("tank/fromb"));
    assert!(fx.mounter.is_mounted("/tank/fs"));
    assert_eq!(0, fs.get_prop_int(ZfsProp::Referenced).unwrap());
}

#[test]
fn rename_filesystem_remounts() {
    let fx = setup();
    create_and_mount(&fx.session, "tank/a");
    create_and_mount(&fx.session, "tank/a/b");
    create_fs(&fx.session, "tank/taken");

    let mut zhp = open(&fx.session, "tank/a");
    assert_eq!(ErrorKind::InvalidName, zhp.rename("tank/a/b/c", false).unwrap_err().kind());
    assert_eq!(ErrorKind::CrossPoolOperation, zhp.rename("dozer/a", false).unwrap_err().kind());
    assert_eq!(ErrorKind::AlreadyExists, zhp.rename("tank/taken", false).unwrap_err().kind());
    assert_eq!(ErrorKind::NotFound, zhp.rename("tank/nope/a", false).unwrap_err().kind());
    assert_eq!(ErrorKind::WrongType, zhp.rename("tank/c", true).unwrap_err().kind());
    zhp.rename("tank/a", false).unwrap();

    zhp.rename("tank/taken/c", false).unwrap();
    assert_eq!("tank/taken/c", zhp.name());
    assert!(fx.session.dataset_exists("tank/taken/c/b"));
    assert!(!fx.session.dataset_exists("tank/a"));
    assert!(fx.mounter.is_mounted("/tank/taken/c"));
    assert!(fx.mounter.is_mounted("/tank/taken/c/b"));
    assert!(!fx.mounter.is_mounted("/tank/a"));
}

#[test]
fn rename_snapshots() {
    let fx = setup();
    create_fs(&fx.session, "tank/a");
    create_fs(&fx.session, "tank/a/b");
    create_volume(&fx.session, "tank/a/vol");
    fx.session.snapshot("tank/a@s", true).unwrap();
    fx.session.snapshot("tank/a/b@t", false).unwrap();

    let mut snap = open(&fx.session, "tank/a@s");
    assert_eq!(ErrorKind::CrossPoolOperation, snap.rename("tank/b@s2", false).unwrap_err().kind());

    let err = snap.rename("t", true).unwrap_err();
    assert_eq!(ErrorKind::AlreadyExists, err.kind());
    assert!(fx.session.dataset_exists("tank/a/vol@s"));

    snap.rename("@u", true).unwrap();
    assert_eq!("tank/a@u", snap.name());
    assert!(fx.session.dataset_exists("tank/a/b@u"));
    assert!(fx.session.dataset_exists("tank/a/vol@u"));
    assert!(!fx.session.dataset_exists("tank/a/vol@s"));
    assert!(fx.engine.calls().contains(&(Opcode::CreateMinor, String::from("tank/a/vol@u"))));

    snap.rename("tank/a@v", false).unwrap();
    assert!(fx.session.dataset_exists("tank/a@v"));
    assert!(fx.session.dataset_exists("tank/a/b@u"));
}

#[test]
fn inconsistent_dataset_is_cleaned_up() {
    let fx = setup();
    create_fs(&fx.session, "tank/recv");
    fx.session.snapshot("tank/recv@a", false).unwrap();
    fx.engine.set_inconsistent("tank/recv");
    assert!(ZfsHandle::open(&fx.session, "tank/recv", ZfsType::FILESYSTEM).is_ok());
    assert!(fx.engine.calls().contains(&(Opcode::Rollback, String::from("tank/recv"))));

    create_fs(&fx.session, "tank/partial");
    fx.engine.set_inconsistent("tank/partial");
    let err = ZfsHandle::open(&fx.session, "tank/partial", ZfsType::FILESYSTEM).unwrap_err();
    assert_eq!(ErrorKind::NotFound, err.kind());
    assert!(!fx.session.dataset_exists("tank/partial"));
}

#[test]
fn send_and_receive_full_and_incremental() {
    let fx = setup();
    create_fs(&fx.session, "tank/src");
    fx.engine.set_used("tank/src", 3 * ONE_MB_IN_BYTES);
    fx.session.snapshot("tank/src@one", false).unwrap();

    let mut stream = tempfile::tempfile().unwrap();
    open(&fx.session, "tank/src@one").send(None, &stream).unwrap();
    stream.seek(SeekFrom::Start(0)).unwrap();

    let request = ReceiveRequest::builder().target("tank/dst").build().unwrap();
    let received = fx.session.receive(&request, &mut stream).unwrap();
    assert_eq!("tank/dst@one", received);
    assert!(fx.session.dataset_exists("tank/dst@one"));
    assert!(fx.mounter.is_mounted("/tank/dst"));
    assert_eq!(3 * ONE_MB_IN_BYTES, open(&fx.session, "tank/dst").get_prop_int(ZfsProp::Referenced).unwrap());

    fx.engine.set_used("tank/src", 5 * ONE_MB_IN_BYTES);
    fx.session.snapshot("tank/src@two", false).unwrap();
    let mut incremental = tempfile::tempfile().unwrap();
    open(&fx.session, "tank/src@two").send(Some("@one"), &incremental).unwrap();
    incremental.seek(SeekFrom::Start(0)).unwrap();

    fx.mounter.clear_journal();
    let request = ReceiveRequest::builder().target("tank/dst@two").build().unwrap();
    assert_eq!("tank/dst@two", fx.session.receive(&request, &mut incremental).unwrap());
    assert_eq!(5 * ONE_MB_IN_BYTES, open(&fx.session, "tank/dst").get_prop_int(ZfsProp::Referenced).unwrap());
    assert!(fx.mounter.journal().contains(&MountEvent::Unmount(String::from("/tank/dst"))));
    assert!(fx.mounter.is_mounted("/tank/dst"));

    // same stream again: the destination moved on past its source
    incremental.seek(SeekFrom::Start(0)).unwrap();
    let err = fx.session.receive(&request, &mut incremental).unwrap_err();
    assert_eq!(ErrorKind::BadStream, err.kind());
    assert!(fx.mounter.is_mounted("/tank/dst"));
}

#[test]
fn receive_refusals() {
    let fx = setup();
    create_fs(&fx.session, "tank/src");
    fx.session.snapshot("tank/src@one", false).unwrap();
    fx.session.snapshot("tank/src@two", false).unwrap();

    let mut garbage = tempfile::tempfile().unwrap();
    garbage.write_all(b"definitely not a stream").unwrap();
    garbage.seek(SeekFrom::Start(0)).unwrap();
    let request = ReceiveRequest::builder().target("tank/dst").build().unwrap();
    assert_eq!(ErrorKind::BadStream, fx.session.receive(&request, &mut garbage).unwrap_err().kind());

    let mut full = tempfile::tempfile().unwrap();
    open(&fx.session, "tank/src@one").send(None, &full).unwrap();

    full.seek(SeekFrom::Start(0)).unwrap();
    let exists = ReceiveRequest::builder().target("tank/src").build().unwrap();
    assert_eq!(ErrorKind::AlreadyExists, fx.session.receive(&exists, &mut full).unwrap_err().kind());

    full.seek(SeekFrom::Start(0)).unwrap();
    let orphan = ReceiveRequest::builder().target("tank/nope/dst").build().unwrap();
    assert_eq!(ErrorKind::NotFound, fx.session.receive(&orphan, &mut full).unwrap_err().kind());

    full.seek(SeekFrom::Start(0)).unwrap();
    let dry = ReceiveRequest::builder().target("tank/dst").dry_run(true).build().unwrap();
    assert_eq!("tank/dst@one", fx.session.receive(&dry, &mut full).unwrap());
    assert!(!fx.session.dataset_exists("tank/dst"));

    let mut incremental = tempfile::tempfile().unwrap();
    open(&fx.session, "tank/src@two").send(Some("one"), &incremental).unwrap();
    incremental.seek(SeekFrom::Start(0)).unwrap();
    create_fs(&fx.session, "tank/unrelated");
    fx.session.snapshot("tank/unrelated@one", false).unwrap();
    let mismatch = ReceiveRequest::builder().target("tank/unrelated").build().unwrap();
    assert_eq!(ErrorKind::BadStream, fx.session.receive(&mismatch, &mut incremental).unwrap_err().kind());

    let err = open(&fx.session, "tank/src@one").send(Some("two"), &incremental).unwrap_err();
    assert_eq!(ErrorKind::CrossPoolOperation, err.kind());
    let err = open(&fx.session, "tank/src").send(None, &incremental).unwrap_err();
    assert_eq!(ErrorKind::WrongType, err.kind());
}

#[test]
fn receive_into_prefix_creates_ancestors() {
    let fx = setup();
    create_fs(&fx.session, "tank/a");
    create_fs(&fx.session, "tank/a/b");
    fx.session.snapshot("tank/a/b@snap", false).unwrap();
    create_fs(&fx.session, "tank/backup");

    let mut stream = tempfile::tempfile().unwrap();
    open(&fx.session, "tank/a/b@snap").send(None, &stream).unwrap();
    stream.seek(SeekFrom::Start(0)).unwrap();

    let request = ReceiveRequest::builder().target("tank/backup").is_prefix(true).build().unwrap();
    assert_eq!("tank/backup/a/b@snap", fx.session.receive(&request, &mut stream).unwrap());
    assert!(fx.session.dataset_exists("tank/backup/a"));
    assert!(fx.mounter.is_mounted("/tank/backup/a"));
    assert!(fx.mounter.is_mounted("/tank/backup/a/b"));
}
