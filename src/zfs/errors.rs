use crate::{nv::NvError, parsers::zfs::NumberError};
use std::io;

quick_error! {
    #[derive(Debug)]
    /// Every failure surfaced by dataset and pool operations. `context` is operator-facing text
    /// naming the action and the target, e.g. `cannot destroy 'tank/fs'`.
    pub enum Error {
        InvalidName(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        NotFound(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        AlreadyExists(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        WrongType(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        InvalidProperty(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        NotApplicableToType(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        ReadOnlyProperty(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        NonInheritableProperty(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        BadPropertyValue(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        PermissionDenied(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        CrossPoolOperation(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        Busy(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        SpaceExceeded(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        VersionTooOld(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        BadStream(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        PoolUnavailable(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        MountFailed(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        UnmountFailed(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        ShareFailed(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        /// The dataset was created, but its device link wasn't.
        DeviceLinks(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        InvalidConfig(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        NoSuchDevice(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        IsSpare(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        DeviceTooSmall(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        AlignmentMismatch(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        NotSupported(context: String, detail: String) {
            display("{}: {}", context, detail)
        }
        /// Raw error code from the storage engine that doesn't have a better category.
        Engine(context: String, errno: i32) {
            display("{}: {}", context, io::Error::from_raw_os_error(*errno))
        }
        Io(context: String, err: io::Error) {
            display("{}: {}", context, err)
            cause(err)
        }
        Nv(err: NvError) {
            display("malformed payload: {}", err)
            cause(err)
            from()
        }
        /// Logic error inside this library. Never expected in practice.
        Internal(detail: String) {
            display("internal error: {}", detail)
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidName(..) => ErrorKind::InvalidName,
            Error::NotFound(..) => ErrorKind::NotFound,
            Error::AlreadyExists(..) => ErrorKind::AlreadyExists,
            Error::WrongType(..) => ErrorKind::WrongType,
            Error::InvalidProperty(..) => ErrorKind::InvalidProperty,
            Error::NotApplicableToType(..) => ErrorKind::NotApplicableToType,
            Error::ReadOnlyProperty(..) => ErrorKind::ReadOnlyProperty,
            Error::NonInheritableProperty(..) => ErrorKind::NonInheritableProperty,
            Error::BadPropertyValue(..) => ErrorKind::BadPropertyValue,
            Error::PermissionDenied(..) => ErrorKind::PermissionDenied,
            Error::CrossPoolOperation(..) => ErrorKind::CrossPoolOperation,
            Error::Busy(..) => ErrorKind::Busy,
            Error::SpaceExceeded(..) => ErrorKind::SpaceExceeded,
            Error::VersionTooOld(..) => ErrorKind::VersionTooOld,
            Error::BadStream(..) => ErrorKind::BadStream,
            Error::PoolUnavailable(..) => ErrorKind::PoolUnavailable,
            Error::MountFailed(..) => ErrorKind::MountFailed,
            Error::UnmountFailed(..) => ErrorKind::UnmountFailed,
            Error::ShareFailed(..) => ErrorKind::ShareFailed,
            Error::DeviceLinks(..) => ErrorKind::DeviceLinks,
            Error::InvalidConfig(..) => ErrorKind::InvalidConfig,
            Error::NoSuchDevice(..) => ErrorKind::NoSuchDevice,
            Error::IsSpare(..) => ErrorKind::IsSpare,
            Error::DeviceTooSmall(..) => ErrorKind::DeviceTooSmall,
            Error::AlignmentMismatch(..) => ErrorKind::AlignmentMismatch,
            Error::NotSupported(..) => ErrorKind::NotSupported,
            Error::Engine(_, errno) => ErrorKind::Engine(*errno),
            Error::Io(..) => ErrorKind::Io,
            Error::Nv(_) => ErrorKind::Nv,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Operator-facing context, if the variant carries one.
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::InvalidName(ctx, _)
            | Error::NotFound(ctx, _)
            | Error::AlreadyExists(ctx, _)
            | Error::WrongType(ctx, _)
            | Error::InvalidProperty(ctx, _)
            | Error::NotApplicableToType(ctx, _)
            | Error::ReadOnlyProperty(ctx, _)
            | Error::NonInheritableProperty(ctx, _)
            | Error::BadPropertyValue(ctx, _)
            | Error::PermissionDenied(ctx, _)
            | Error::CrossPoolOperation(ctx, _)
            | Error::Busy(ctx, _)
            | Error::SpaceExceeded(ctx, _)
            | Error::VersionTooOld(ctx, _)
            | Error::BadStream(ctx, _)
            | Error::PoolUnavailable(ctx, _)
            | Error::MountFailed(ctx, _)
            | Error::UnmountFailed(ctx, _)
            | Error::ShareFailed(ctx, _)
            | Error::DeviceLinks(ctx, _)
            | Error::InvalidConfig(ctx, _)
            | Error::NoSuchDevice(ctx, _)
            | Error::IsSpare(ctx, _)
            | Error::DeviceTooSmall(ctx, _)
            | Error::AlignmentMismatch(ctx, _)
            | Error::NotSupported(ctx, _)
            | Error::Engine(ctx, _)
            | Error::Io(ctx, _) => Some(ctx),
            Error::Nv(_) | Error::Internal(_) => None,
        }
    }

    /// Standard remapping of a raw engine error code. Operations with their own interpretation of
    /// a code match on it before falling back to this.
    pub fn from_errno<C: Into<String>>(errno: i32, context: C) -> Self {
        let context = context.into();
        match errno {
            libc::EPERM | libc::EACCES => Error::PermissionDenied(context, "permission denied".into()),
            libc::ENOENT => Error::NotFound(context, "dataset does not exist".into()),
            libc::EEXIST => Error::AlreadyExists(context, "dataset already exists".into()),
            libc::EBUSY => Error::Busy(context, "dataset is busy".into()),
            libc::ENOSPC | libc::EDQUOT => Error::SpaceExceeded(context, "out of space".into()),
            libc::ENOTSUP => {
                Error::VersionTooOld(context, "pool must be upgraded to set this property or value".into())
            },
            libc::EXDEV => Error::CrossPoolOperation(context, "source and target pools differ".into()),
            libc::ENXIO | libc::ENODEV => Error::NoSuchDevice(context, "no such device in pool".into()),
            libc::EROFS => Error::PermissionDenied(context, "read only dataset".into()),
            _ => Error::Engine(context, errno),
        }
    }

    /// Standard remapping for pool level commands. Differs from dataset remapping in what the
    /// missing thing is called.
    pub fn from_pool_errno<C: Into<String>>(errno: i32, context: C) -> Self {
        let context = context.into();
        match errno {
            libc::ENOENT => Error::NotFound(context, "no such pool".into()),
            libc::EEXIST => Error::AlreadyExists(context, "pool already exists".into()),
            libc::EBUSY => Error::Busy(context, "pool is busy".into()),
            libc::ENXIO | libc::ENODEV => Error::NoSuchDevice(context, "no such device in pool".into()),
            libc::EINVAL => Error::InvalidConfig(context, "invalid vdev configuration".into()),
            libc::EIO => Error::PoolUnavailable(context, "I/O error".into()),
            _ => Error::from_errno(errno, context),
        }
    }

    pub(crate) fn bad_value<C: Into<String>, D: Into<String>>(context: C, detail: D) -> Self {
        Error::BadPropertyValue(context.into(), detail.into())
    }

    pub(crate) fn number<C: Into<String>>(context: C, err: NumberError) -> Self {
        Error::BadPropertyValue(context.into(), err.to_string())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    InvalidName,
    NotFound,
    AlreadyExists,
    WrongType,
    InvalidProperty,
    NotApplicableToType,
    ReadOnlyProperty,
    NonInheritableProperty,
    BadPropertyValue,
    PermissionDenied,
    CrossPoolOperation,
    Busy,
    SpaceExceeded,
    VersionTooOld,
    BadStream,
    PoolUnavailable,
    MountFailed,
    UnmountFailed,
    ShareFailed,
    DeviceLinks,
    InvalidConfig,
    NoSuchDevice,
    IsSpare,
    DeviceTooSmall,
    AlignmentMismatch,
    NotSupported,
    Engine(i32),
    Io,
    Nv,
    Internal,
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool { self.kind() == other.kind() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_table() {
        assert_eq!(ErrorKind::PermissionDenied, Error::from_errno(libc::EPERM, "x").kind());
        assert_eq!(ErrorKind::NotFound, Error::from_errno(libc::ENOENT, "x").kind());
        assert_eq!(ErrorKind::Busy, Error::from_errno(libc::EBUSY, "x").kind());
        assert_eq!(ErrorKind::SpaceExceeded, Error::from_errno(libc::EDQUOT, "x").kind());
        assert_eq!(ErrorKind::CrossPoolOperation, Error::from_errno(libc::EXDEV, "x").kind());
        assert_eq!(ErrorKind::Engine(libc::EFAULT), Error::from_errno(libc::EFAULT, "x").kind());
        assert_eq!(ErrorKind::InvalidConfig, Error::from_pool_errno(libc::EINVAL, "x").kind());
    }

    #[test]
    fn context_is_kept() {
        let err = Error::from_errno(libc::EFAULT, "cannot destroy 'tank/fs'");
        assert_eq!(Some("cannot destroy 'tank/fs'"), err.context());
        assert!(err.to_string().starts_with("cannot destroy 'tank/fs': "));
    }
}
