use regex::Regex;

use crate::zfs::{ZfsType, DATASET_NAME_MAX_LENGTH};

lazy_static! {
    static ref INVALID_CHAR: Regex = Regex::new(r"[^A-Za-z0-9_.:@/\-]").expect("static regex");
    static ref DISK_LIKE: Regex = Regex::new(r"^c[0-9]").expect("static regex");
}

static RESERVED_POOL_PREFIXES: &[&str] = &["mirror", "raidz", "spare"];

quick_error! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    /// Reasons a dataset or pool name is refused.
    pub enum NameError {
        Empty {
            display("empty component in name")
        }
        LeadingSlash {
            display("leading slash in name")
        }
        EmptyComponent {
            display("empty component in name")
        }
        TrailingSlash {
            display("trailing slash in name")
        }
        InvalidChar(c: char) {
            display("invalid character '{}' in name", c)
        }
        MultipleAt {
            display("multiple '@' delimiters in name")
        }
        MissingAt {
            display("missing '@' delimiter in snapshot name")
        }
        UnexpectedAt {
            display("snapshot delimiter '@' in filesystem name")
        }
        NoLetter {
            display("pool doesn't begin with a letter")
        }
        Reserved {
            display("name is reserved")
        }
        DiskLike {
            display("pool name is reserved")
        }
        TooLong {
            display("name is too long")
        }
    }
}

/// Name helpers for dataset names (`pool/fs/child@snap`).
pub trait PathExt {
    fn get_pool(&self) -> &str;
    fn get_snapshot(&self) -> Option<&str>;
    /// Name of the filesystem or volume, without the snapshot part.
    fn head_name(&self) -> &str;
    /// Parent of a filesystem or volume, or the head of a snapshot.
    fn parent_name(&self) -> Option<&str>;
    /// `true` when `self` lives strictly below `ancestor`.
    fn is_descendant_of(&self, ancestor: &str) -> bool;
    /// `true` when `self` is `ancestor` or anything below it, including its snapshots.
    fn is_child_of(&self, ancestor: &str) -> bool;

    fn is_snapshot(&self) -> bool { self.get_snapshot().is_some() }
}

impl PathExt for str {
    fn get_pool(&self) -> &str {
        let end = self.find(|c| c == '/' || c == '@').unwrap_or_else(|| self.len());
        &self[..end]
    }

    fn get_snapshot(&self) -> Option<&str> { self.find('@').map(|at| &self[at + 1..]) }

    fn head_name(&self) -> &str {
        match self.find('@') {
            Some(at) => &self[..at],
            None => self,
        }
    }

    fn parent_name(&self) -> Option<&str> {
        if let Some(at) = self.find('@') {
            return Some(&self[..at]);
        }
        self.rfind('/').map(|slash| &self[..slash])
    }

    fn is_descendant_of(&self, ancestor: &str) -> bool {
        self.len() > ancestor.len() + 1
            && self.starts_with(ancestor)
            && self.as_bytes()[ancestor.len()] == b'/'
    }

    fn is_child_of(&self, ancestor: &str) -> bool {
        self.starts_with(ancestor)
            && matches!(self.as_bytes().get(ancestor.len()), None | Some(b'/') | Some(b'@'))
    }
}

fn pool_namecheck(pool: &str, creating: bool) -> Result<(), NameError> {
    if pool.is_empty() {
        return Err(NameError::Empty);
    }
    if pool.len() > DATASET_NAME_MAX_LENGTH {
        return Err(NameError::TooLong);
    }
    if let Some(found) = INVALID_CHAR.find(pool) {
        return Err(NameError::InvalidChar(found.as_str().chars().next().unwrap_or('?')));
    }
    if let Some(c) = pool.chars().find(|c| *c == '/' || *c == '@') {
        return Err(NameError::InvalidChar(c));
    }
    if !pool.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(NameError::NoLetter);
    }
    if RESERVED_POOL_PREFIXES.iter().any(|reserved| *reserved == pool) {
        return Err(NameError::Reserved);
    }
    if creating && RESERVED_POOL_PREFIXES.iter().any(|reserved| pool.starts_with(reserved)) {
        return Err(NameError::Reserved);
    }
    if DISK_LIKE.is_match(pool) {
        return Err(NameError::DiskLike);
    }
    Ok(())
}

/// Pool name rules. `creating` additionally rejects anything starting with a vdev type keyword,
/// which existing pools are allowed to keep.
pub fn validate_pool_name(pool: &str, creating: bool) -> Result<(), NameError> {
    pool_namecheck(pool, creating)
}

fn dataset_namecheck(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > DATASET_NAME_MAX_LENGTH {
        return Err(NameError::TooLong);
    }
    if name.starts_with('/') {
        return Err(NameError::LeadingSlash);
    }
    if let Some(found) = INVALID_CHAR.find(name) {
        return Err(NameError::InvalidChar(found.as_str().chars().next().unwrap_or('?')));
    }
    if name.matches('@').count() > 1 {
        return Err(NameError::MultipleAt);
    }
    let (head, snapshot) = match name.find('@') {
        Some(at) => (&name[..at], Some(&name[at + 1..])),
        None => (name, None),
    };
    if let Some(snapshot) = snapshot {
        if snapshot.is_empty() {
            return Err(NameError::EmptyComponent);
        }
        if snapshot.contains('/') {
            return Err(NameError::InvalidChar('/'));
        }
    }
    if head.ends_with('/') {
        return Err(NameError::TrailingSlash);
    }
    if head.split('/').any(str::is_empty) {
        return Err(NameError::EmptyComponent);
    }
    if !head.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(NameError::NoLetter);
    }
    Ok(())
}

/// Check a dataset name against the types the caller is willing to accept.
pub fn validate_dataset_name(name: &str, types: ZfsType) -> Result<(), NameError> {
    if types == ZfsType::SNAPSHOT && !name.contains('@') {
        return Err(NameError::MissingAt);
    }
    if !types.contains(ZfsType::SNAPSHOT) && name.contains('@') {
        return Err(NameError::UnexpectedAt);
    }
    dataset_namecheck(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_dataset_no_snapshots() {
        let name = "tank/usr/home";
        assert_eq!("tank", name.get_pool());
        assert!(!name.is_snapshot());
        assert_eq!(None, name.get_snapshot());
        assert_eq!(Some("tank/usr"), name.parent_name());
        assert_eq!(name, name.head_name());
        assert!(validate_dataset_name(name, ZfsType::FILESYSTEM).is_ok());
    }

    #[test]
    fn valid_snapshot() {
        let name = "tank/usr/home@snap";
        assert_eq!("tank", name.get_pool());
        assert!(name.is_snapshot());
        assert_eq!(Some("snap"), name.get_snapshot());
        assert_eq!("tank/usr/home", name.head_name());
        assert_eq!(Some("tank/usr/home"), name.parent_name());
        assert!(validate_dataset_name(name, ZfsType::SNAPSHOT).is_ok());
        assert_eq!("tank", "tank@now".get_pool());
    }

    #[test]
    fn pool_root_has_no_parent() {
        assert_eq!(None, "tank".parent_name());
        assert!(validate_dataset_name("tank", ZfsType::FILESYSTEM).is_ok());
    }

    #[test]
    fn descendants() {
        assert!("pool/a/b".is_descendant_of("pool/a"));
        assert!(!"pool/ab".is_descendant_of("pool/a"));
        assert!(!"pool/a".is_descendant_of("pool/a"));
        assert!(!"pool/a@s".is_descendant_of("pool/a"));
        assert!("pool/a@s".is_child_of("pool/a"));
        assert!("pool/a".is_child_of("pool/a"));
        assert!(!"pool/ab".is_child_of("pool/a"));
    }

    #[test]
    fn broken_dataset_names() {
        let fs = ZfsType::FILESYSTEM;
        assert_eq!(Err(NameError::LeadingSlash), validate_dataset_name("/usr/home", fs));
        assert_eq!(Err(NameError::TrailingSlash), validate_dataset_name("z/asd/", fs));
        assert_eq!(Err(NameError::EmptyComponent), validate_dataset_name("z//asd", fs));
        assert_eq!(Err(NameError::InvalidChar('#')), validate_dataset_name("z/a#b", fs));
        assert_eq!(Err(NameError::NoLetter), validate_dataset_name("1tank/fs", fs));
        assert_eq!(Err(NameError::UnexpectedAt), validate_dataset_name("tank/fs@s", fs));
        assert_eq!(Err(NameError::MissingAt), validate_dataset_name("tank/fs", ZfsType::SNAPSHOT));
        assert_eq!(Err(NameError::MultipleAt), validate_dataset_name("tank@a@b", ZfsType::SNAPSHOT));
        assert_eq!(Err(NameError::InvalidChar('/')), validate_dataset_name("tank@a/b", ZfsType::SNAPSHOT));
        assert_eq!(Err(NameError::EmptyComponent), validate_dataset_name("tank@", ZfsType::SNAPSHOT));
        let long = format!("z/{}", "a".repeat(300));
        assert_eq!(Err(NameError::TooLong), validate_dataset_name(&long, fs));
    }

    #[test]
    fn pool_names() {
        assert!(validate_pool_name("tank", true).is_ok());
        assert_eq!(Err(NameError::NoLetter), validate_pool_name("1tank", true));
        assert_eq!(Err(NameError::Reserved), validate_pool_name("mirror", false));
        assert_eq!(Err(NameError::Reserved), validate_pool_name("raidz2pool", true));
        assert!(validate_pool_name("raidz2pool", false).is_ok());
        assert!(validate_pool_name("spares", false).is_ok());
        assert_eq!(Err(NameError::DiskLike), validate_pool_name("c0t0d0", true));
        assert_eq!(Err(NameError::InvalidChar('/')), validate_pool_name("tank/fs", true));
    }
}
