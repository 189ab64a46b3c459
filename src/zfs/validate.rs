//! Coercion and validation of user supplied property values. Input values may already be typed
//! (`4096`, `true`) or be the strings an operator typed (`"10M"`, `"on"`, `"gzip-9"`). Output is
//! the form the storage engine stores: numbers for number, boolean and index properties, strings
//! for everything else.
use crate::{nv::{NvList, NvValue},
            parsers::zfs::nicestrtonum,
            zfs::{pathext::validate_dataset_name,
                  properties::{is_user_property, lookup_by_name},
                  DatasetType, Error, PathExt, PropKind, Result, ZfsProp, ZfsType, MAX_BLOCK_SIZE,
                  MAX_PROP_LEN, MIN_BLOCK_SIZE, USER_PROP_MAX_LEN}};

/// What a property list is being validated for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidateContext {
    types:        ZfsType,
    context:      String,
    creating:     bool,
    zoned:        bool,
    global_zone:  bool,
    volsize:      Option<u64>,
    volblocksize: Option<u64>,
    reservation:  Option<u64>,
}

impl ValidateContext {
    /// `context` is the prefix of every error message, e.g. `cannot create 'tank/fs'`.
    pub fn new<C: Into<String>>(types: ZfsType, context: C) -> Self {
        ValidateContext { types, context: context.into(), global_zone: true, ..ValidateContext::default() }
    }

    /// Allow properties that can only be given at creation time.
    pub fn creating(mut self) -> Self {
        self.creating = true;
        self
    }

    pub fn zoned(mut self, zoned: bool, global_zone: bool) -> Self {
        self.zoned = zoned;
        self.global_zone = global_zone;
        self
    }

    /// Current geometry of the volume being changed (or cloned).
    pub fn volume(mut self, volsize: u64, volblocksize: u64, reservation: u64) -> Self {
        self.volsize = Some(volsize);
        self.volblocksize = Some(volblocksize);
        self.reservation = Some(reservation);
        self
    }

    pub fn types(&self) -> ZfsType { self.types }

    pub fn context(&self) -> &str { &self.context }

    fn is_existing_volume(&self) -> bool { self.types == ZfsType::VOLUME && self.volsize.is_some() && !self.creating }
}

/// Boolean from `on`/`off`, `0`/`1` or a native boolean.
fn coerce_boolean(ctx: &ValidateContext, name: &str, value: &NvValue) -> Result<u64> {
    match value {
        NvValue::Bool(val) => Ok(u64::from(*val)),
        NvValue::Number(val) if *val <= 1 => Ok(*val),
        NvValue::String(val) if val == "on" => Ok(1),
        NvValue::String(val) if val == "off" => Ok(0),
        _ => Err(Error::bad_value(&ctx.context, format!("'{}' must be 'on' or 'off'", name))),
    }
}

/// Number from a native integer, `none`, or a human readable size. Second value is whether the
/// input was `none`.
fn coerce_number(ctx: &ValidateContext, name: &str, value: &NvValue) -> Result<(u64, bool)> {
    match value {
        NvValue::Number(val) => Ok((*val, false)),
        NvValue::String(val) if val == "none" => Ok((0, true)),
        NvValue::String(val) => {
            nicestrtonum(val).map(|num| (num, false)).map_err(|e| Error::number(&ctx.context, e))
        },
        _ => Err(Error::bad_value(&ctx.context, format!("'{}' must be a number", name))),
    }
}

fn coerce_index(ctx: &ValidateContext, prop: ZfsProp, value: &NvValue) -> Result<u64> {
    let alias = match value {
        NvValue::String(alias) => alias,
        _ => return Err(Error::bad_value(&ctx.context, format!("'{}' must be a string", prop))),
    };
    prop.string_to_index(alias).ok_or_else(|| {
        Error::bad_value(
            &ctx.context,
            format!("'{}' must be one of '{}'", prop, prop.values().unwrap_or_default()),
        )
    })
}

fn check_block_size(ctx: &ValidateContext, prop: ZfsProp, size: u64) -> Result<()> {
    if size < MIN_BLOCK_SIZE || size > MAX_BLOCK_SIZE || !size.is_power_of_two() {
        return Err(Error::bad_value(
            &ctx.context,
            format!("'{}' must be power of 2 from {} to {}k", prop, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE / 1024),
        ));
    }
    Ok(())
}

fn check_zone(ctx: &ValidateContext, prop: ZfsProp) -> Result<()> {
    let denied = |detail: String| Err(Error::PermissionDenied(ctx.context.clone(), detail));
    if ctx.zoned {
        if ctx.global_zone {
            return denied(format!("'{}' cannot be set on dataset in a non-global zone", prop));
        }
        if prop == ZfsProp::Sharenfs {
            return denied(format!("'{}' cannot be set in a non-global zone", prop));
        }
    } else if !ctx.global_zone {
        return denied(format!("'{}' cannot be set while dataset 'zoned' property is set", prop));
    }
    Ok(())
}

fn validate_user_property(ctx: &ValidateContext, name: &str, value: &NvValue) -> Result<NvValue> {
    let value = match value {
        NvValue::String(value) => value,
        _ => return Err(Error::bad_value(&ctx.context, format!("'{}' must be a string", name))),
    };
    if name.len() >= USER_PROP_MAX_LEN {
        return Err(Error::bad_value(&ctx.context, format!("property name '{}' is too long", name)));
    }
    if value.len() >= USER_PROP_MAX_LEN {
        return Err(Error::bad_value(&ctx.context, format!("property value '{}' is too long", value)));
    }
    Ok(NvValue::String(value.clone()))
}

/// Validate and coerce a dataset property list. Returns the list the engine should be given.
pub fn validate_properties(ctx: &ValidateContext, props: &NvList) -> Result<NvList> {
    let mut ret = NvList::new();
    for (name, value) in props.iter() {
        if name.contains(':') && lookup_by_name(name, ZfsType::all()).is_none() {
            if !is_user_property(name) {
                return Err(Error::InvalidProperty(ctx.context.clone(), format!("invalid property '{}'", name)));
            }
            if ret.contains_key(name) {
                return Err(Error::bad_value(&ctx.context, format!("property '{}' specified multiple times", name)));
            }
            ret.insert(name, validate_user_property(ctx, name, value)?);
            continue;
        }

        let prop = lookup_by_name(name, ZfsType::DATASET)
            .ok_or_else(|| Error::InvalidProperty(ctx.context.clone(), format!("invalid property '{}'", name)))?;
        if !prop.applies_to(ctx.types) {
            return Err(Error::NotApplicableToType(
                ctx.context.clone(),
                format!("'{}' does not apply to datasets of this type", prop),
            ));
        }
        if prop.is_readonly() && !(ctx.creating && prop.is_create_only()) {
            return Err(Error::ReadOnlyProperty(ctx.context.clone(), format!("'{}' is readonly", prop)));
        }
        if ret.contains_key(prop.name()) {
            return Err(Error::bad_value(&ctx.context, format!("property '{}' specified multiple times", prop)));
        }

        let coerced = match prop.kind() {
            PropKind::Boolean => NvValue::Number(coerce_boolean(ctx, prop.name(), value)?),
            PropKind::Index => NvValue::Number(coerce_index(ctx, prop, value)?),
            PropKind::String => match value {
                NvValue::String(val) if val.len() >= MAX_PROP_LEN => {
                    return Err(Error::bad_value(&ctx.context, format!("'{}' is too long", prop)));
                },
                NvValue::String(val) => NvValue::String(val.clone()),
                _ => return Err(Error::bad_value(&ctx.context, format!("'{}' must be a string", prop))),
            },
            PropKind::Number => {
                let (number, is_none) = coerce_number(ctx, prop.name(), value)?;
                if prop == ZfsProp::Quota && number == 0 && !is_none {
                    return Err(Error::bad_value(&ctx.context, "use 'none' to disable quota"));
                }
                NvValue::Number(number)
            },
        };

        match (prop, &coerced) {
            (ZfsProp::Recordsize, NvValue::Number(size)) | (ZfsProp::Volblocksize, NvValue::Number(size)) => {
                check_block_size(ctx, prop, *size)?;
            },
            (ZfsProp::Mountpoint, NvValue::String(path)) => {
                if path != "none" && path != "legacy" && !path.starts_with('/') {
                    return Err(Error::bad_value(
                        &ctx.context,
                        format!("'{}' must be an absolute path, 'none', or 'legacy'", prop),
                    ));
                }
                check_zone(ctx, prop)?;
            },
            (ZfsProp::Sharenfs, _) => check_zone(ctx, prop)?,
            (ZfsProp::Volsize, NvValue::Number(size)) if ctx.is_existing_volume() => {
                let blocksize = ctx.volblocksize.unwrap_or(crate::zfs::DEFAULT_VOLBLOCKSIZE);
                if *size == 0 {
                    return Err(Error::bad_value(&ctx.context, format!("'{}' cannot be zero", prop)));
                }
                if *size % blocksize != 0 {
                    return Err(Error::bad_value(
                        &ctx.context,
                        format!("'{}' must be a multiple of volume block size", prop),
                    ));
                }
            },
            (ZfsProp::Reservation, NvValue::Number(size)) if ctx.is_existing_volume() => {
                if *size > ctx.volsize.unwrap_or(0) {
                    return Err(Error::bad_value(
                        &ctx.context,
                        format!("'{}' is greater than current volume size", prop),
                    ));
                }
            },
            _ => {},
        }
        ret.insert(prop.name(), coerced);
    }

    // A volume whose reservation tracks its size keeps doing so.
    if ctx.is_existing_volume() && !ret.contains_key("reservation") {
        if let Some(new_size) = ret.get("volsize").and_then(NvValue::as_number) {
            if ctx.reservation == ctx.volsize {
                ret.insert("reservation", new_size);
            }
        }
    }
    Ok(ret)
}

/// Validate and coerce a pool property list. `creating` allows `altroot`.
pub fn validate_pool_properties(pool: &str, props: &NvList, creating: bool) -> Result<NvList> {
    let ctx = ValidateContext::new(ZfsType::POOL, format!("cannot set property for '{}'", pool));
    let mut ret = NvList::new();
    for (name, value) in props.iter() {
        let prop = lookup_by_name(name, ZfsType::POOL)
            .filter(|prop| prop.types() == ZfsType::POOL)
            .ok_or_else(|| Error::InvalidProperty(ctx.context.clone(), format!("invalid property '{}'", name)))?;
        if prop.is_readonly() && !(creating && prop.is_create_only()) {
            return Err(Error::ReadOnlyProperty(ctx.context.clone(), format!("'{}' is readonly", prop)));
        }
        let coerced = match prop {
            ZfsProp::Bootfs => {
                let fs = match value {
                    NvValue::String(fs) => fs,
                    _ => return Err(Error::bad_value(&ctx.context, "'bootfs' must be a string")),
                };
                if !fs.is_empty() {
                    if validate_dataset_name(fs, DatasetType::Filesystem.as_mask()).is_err() {
                        return Err(Error::bad_value(&ctx.context, format!("'{}' is an invalid name", fs)));
                    }
                    if fs.get_pool() != pool {
                        return Err(Error::bad_value(
                            &ctx.context,
                            format!("'{}' is an invalid name: not in pool '{}'", fs, pool),
                        ));
                    }
                }
                NvValue::String(fs.clone())
            },
            ZfsProp::Altroot => match value {
                NvValue::String(root) if root.starts_with('/') => NvValue::String(root.clone()),
                _ => return Err(Error::bad_value(&ctx.context, "alternate root must be an absolute path")),
            },
            _ => match prop.kind() {
                PropKind::Boolean => NvValue::Number(coerce_boolean(&ctx, prop.name(), value)?),
                PropKind::Index => NvValue::Number(coerce_index(&ctx, prop, value)?),
                _ => return Err(Error::ReadOnlyProperty(ctx.context.clone(), format!("'{}' is readonly", prop))),
            },
        };
        ret.insert(prop.name(), coerced);
    }
    Ok(ret)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{nv::NvTypeOp, zfs::ErrorKind};

    fn fs_ctx() -> ValidateContext { ValidateContext::new(ZfsType::FILESYSTEM, "cannot set property for 'tank/fs'") }

    fn one<V: NvTypeOp>(ctx: &ValidateContext, name: &str, value: V) -> Result<NvValue> {
        let props = NvList::new().with(name, value);
        let ret = validate_properties(ctx, &props)?;
        let value = ret.iter().next().map(|(_, v)| v.clone()).unwrap();
        Ok(value)
    }

    #[test]
    fn sizes_and_none() {
        let ctx = fs_ctx();
        assert_eq!(NvValue::Number(10 << 20), one(&ctx, "quota", "10M").unwrap());
        assert_eq!(NvValue::Number(0), one(&ctx, "quota", "none").unwrap());
        assert_eq!(NvValue::Number(0), one(&ctx, "reservation", "0").unwrap());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "quota", "0").unwrap_err().kind());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "quota", 0_u64).unwrap_err().kind());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "quota", "5BB").unwrap_err().kind());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "quota", true).unwrap_err().kind());
    }

    #[test]
    fn booleans_and_indexes() {
        let ctx = fs_ctx();
        assert_eq!(NvValue::Number(0), one(&ctx, "atime", "off").unwrap());
        assert_eq!(NvValue::Number(1), one(&ctx, "atime", true).unwrap());
        assert_eq!(NvValue::Number(1), one(&ctx, "exec", 1_u64).unwrap());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "atime", "ON").unwrap_err().kind());
        assert_eq!(NvValue::Number(13), one(&ctx, "compression", "gzip-9").unwrap());
        let err = one(&ctx, "checksum", "md5").unwrap_err();
        assert!(err.to_string().contains("fletcher4"));
    }

    #[test]
    fn column_names_are_normalized() {
        let ret = validate_properties(&fs_ctx(), &NvList::new().with("RECSIZE", "64K")).unwrap();
        assert_eq!(Some(64 * 1024), ret.get("recordsize").and_then(NvValue::as_number));
        let dup = NvList::new().with("recsize", "64K").with("recordsize", "32K");
        assert_eq!(ErrorKind::BadPropertyValue, validate_properties(&fs_ctx(), &dup).unwrap_err().kind());
    }

    #[test]
    fn property_rules() {
        let ctx = fs_ctx();
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "recordsize", "3K").unwrap_err().kind());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "recordsize", "256K").unwrap_err().kind());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "mountpoint", "relative").unwrap_err().kind());
        assert!(one(&ctx, "mountpoint", "legacy").is_ok());
        assert_eq!(ErrorKind::ReadOnlyProperty, one(&ctx, "used", "1M").unwrap_err().kind());
        assert_eq!(ErrorKind::InvalidProperty, one(&ctx, "bogus", "1").unwrap_err().kind());
        assert_eq!(ErrorKind::InvalidProperty, one(&ctx, "bootfs", "tank").unwrap_err().kind());
        assert_eq!(ErrorKind::NotApplicableToType, one(&ctx, "volsize", "1M").unwrap_err().kind());
    }

    #[test]
    fn create_only_properties() {
        let ctx = ValidateContext::new(ZfsType::VOLUME, "cannot create 'tank/vol'");
        assert_eq!(ErrorKind::ReadOnlyProperty, one(&ctx, "volblocksize", "4K").unwrap_err().kind());
        let ctx = ctx.creating();
        assert_eq!(NvValue::Number(4096), one(&ctx, "volblocksize", "4K").unwrap());
    }

    #[test]
    fn user_properties() {
        let ctx = fs_ctx();
        assert_eq!(NvValue::String("ops".into()), one(&ctx, "com.example:owner", "ops").unwrap());
        assert_eq!(ErrorKind::InvalidProperty, one(&ctx, "Com:Owner", "ops").unwrap_err().kind());
        let long = "x".repeat(USER_PROP_MAX_LEN);
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "com:owner", long).unwrap_err().kind());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "com:owner", 1_u64).unwrap_err().kind());
    }

    #[test]
    fn zone_rules() {
        let zoned_from_global = fs_ctx().zoned(true, true);
        assert_eq!(
            ErrorKind::PermissionDenied,
            one(&zoned_from_global, "mountpoint", "/x").unwrap_err().kind()
        );
        let zoned_from_zone = fs_ctx().zoned(true, false);
        assert!(one(&zoned_from_zone, "mountpoint", "/x").is_ok());
        assert_eq!(ErrorKind::PermissionDenied, one(&zoned_from_zone, "sharenfs", "on").unwrap_err().kind());
        let unzoned_from_zone = fs_ctx().zoned(false, false);
        assert_eq!(
            ErrorKind::PermissionDenied,
            one(&unzoned_from_zone, "mountpoint", "/x").unwrap_err().kind()
        );
    }

    #[test]
    fn volume_geometry() {
        let ctx = ValidateContext::new(ZfsType::VOLUME, "cannot set property for 'tank/vol'").volume(
            1 << 20,
            8192,
            1 << 20,
        );
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "volsize", "1000").unwrap_err().kind());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "volsize", 0_u64).unwrap_err().kind());
        assert_eq!(ErrorKind::BadPropertyValue, one(&ctx, "reservation", "2M").unwrap_err().kind());

        let ret = validate_properties(&ctx, &NvList::new().with("volsize", "2M")).unwrap();
        assert_eq!(Some(2 << 20), ret.get("reservation").and_then(NvValue::as_number));

        let sparse = ValidateContext::new(ZfsType::VOLUME, "x").volume(1 << 20, 8192, 0);
        let ret = validate_properties(&sparse, &NvList::new().with("volsize", "2M")).unwrap();
        assert!(!ret.contains_key("reservation"));
    }

    #[test]
    fn pool_properties() {
        let ret = validate_pool_properties("tank", &NvList::new().with("failmode", "panic"), false).unwrap();
        assert_eq!(Some(2), ret.get("failmode").and_then(NvValue::as_number));
        let bad = NvList::new().with("bootfs", "other/root");
        assert_eq!(ErrorKind::BadPropertyValue, validate_pool_properties("tank", &bad, false).unwrap_err().kind());
        let ro = NvList::new().with("health", "ONLINE");
        assert_eq!(ErrorKind::ReadOnlyProperty, validate_pool_properties("tank", &ro, false).unwrap_err().kind());
        let altroot = NvList::new().with("altroot", "/a");
        assert_eq!(ErrorKind::ReadOnlyProperty, validate_pool_properties("tank", &altroot, false).unwrap_err().kind());
        assert!(validate_pool_properties("tank", &altroot, true).is_ok());
        let quota = NvList::new().with("quota", "1M");
        assert_eq!(ErrorKind::InvalidProperty, validate_pool_properties("tank", &quota, false).unwrap_err().kind());
    }
}
