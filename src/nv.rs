#![deny(missing_docs)]
//! Name/Value lists. This is what travels between this library and the storage engine: property
//! sets, pool configurations and vdev trees are all nested `NvList`s.
//!
//! It kinda acts like `Map<&str, T>` where T is any type Name/Value list can hold, except the
//! insertion order is preserved, which matters for configuration documents. Lists can be packed
//! into a flat little-endian byte buffer and unpacked back; that buffer is what the command
//! interface moves around.

use std::{convert::TryFrom, string::FromUtf8Error};

quick_error! {
    #[derive(Debug)]
    /// Error kinds for Name/Value library.
    pub enum NvError {
        /// Packed buffer ended before the value it describes.
        Truncated {
            display("packed nvlist is truncated")
        }
        /// Packed buffer doesn't start with the expected magic.
        BadMagic {
            display("packed nvlist has bad magic")
        }
        /// Unknown value tag in a packed buffer.
        BadTag(tag: u8) {
            display("packed nvlist has unknown tag {}", tag)
        }
        /// Name or string value isn't valid UTF-8.
        InvalidString(err: FromUtf8Error) {
            cause(err)
            from()
        }
        /// Requested name doesn't exist in the list.
        NotFound(name: String) {
            display("'{}' not found in nvlist", name)
        }
        /// Requested name exists, but holds a different type.
        WrongType(name: String) {
            display("'{}' has unexpected type", name)
        }
    }
}

/// Short-cut to Result<T, NvError>.
pub type NvResult<T> = Result<T, NvError>;

const NV_MAGIC: &[u8; 4] = b"ZNV1";

/// Enumeration of available data types that the API supports.
#[derive(Clone, Debug, PartialEq)]
pub enum NvValue {
    /// The value is a `bool` value
    Bool(bool),
    /// The value is a `u64` value
    Number(u64),
    /// The value is a string
    String(String),
    /// The value is another `nvlist`
    NvList(NvList),
    /// The value is an array of `u64` values
    NumberArray(Vec<u64>),
    /// The value is an array of strings
    StringArray(Vec<String>),
    /// The value is an array of other `nvlist`'s
    NvListArray(Vec<NvList>),
}

impl NvValue {
    /// Number, if that's what it holds.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            NvValue::Number(val) => Some(*val),
            _ => None,
        }
    }

    /// String, if that's what it holds.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            NvValue::String(val) => Some(val.as_str()),
            _ => None,
        }
    }

    /// Boolean, if that's what it holds.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NvValue::Bool(val) => Some(*val),
            _ => None,
        }
    }

    /// Nested list, if that's what it holds.
    pub fn as_nvlist(&self) -> Option<&NvList> {
        match self {
            NvValue::NvList(val) => Some(val),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            NvValue::Bool(_) => 1,
            NvValue::Number(_) => 2,
            NvValue::String(_) => 3,
            NvValue::NvList(_) => 4,
            NvValue::NumberArray(_) => 5,
            NvValue::StringArray(_) => 6,
            NvValue::NvListArray(_) => 7,
        }
    }
}

/// Marker-ish trait to allow usage of insert method. Implement this for your own types if you don't
/// want to convert to primitive types everytime.
pub trait NvTypeOp {
    /// Turn self into a value that can be stored in a list.
    fn into_nv_value(self) -> NvValue;
}

macro_rules! impl_list_op {
    ($type_:ty, $variant:ident) => {
        impl NvTypeOp for $type_ {
            fn into_nv_value(self) -> NvValue { NvValue::$variant(self.into()) }
        }
    };
}

impl_list_op! {bool, Bool}
impl_list_op! {u8, Number}
impl_list_op! {u16, Number}
impl_list_op! {u32, Number}
impl_list_op! {u64, Number}
impl_list_op! {String, String}
impl_list_op! {&str, String}
impl_list_op! {NvList, NvList}
impl_list_op! {Vec<u64>, NumberArray}
impl_list_op! {Vec<String>, StringArray}
impl_list_op! {Vec<NvList>, NvListArray}

impl NvTypeOp for NvValue {
    fn into_nv_value(self) -> NvValue { self }
}

/// A list of name/value pairs. Names are unique; inserting an existing name replaces the value in
/// place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NvList {
    pairs: Vec<(String, NvValue)>,
}

impl NvList {
    /// Make new empty list.
    pub fn new() -> Self { NvList { pairs: Vec::new() } }

    /// Insert value under the given name, replacing whatever was there.
    pub fn insert<N: Into<String>, V: NvTypeOp>(&mut self, name: N, value: V) {
        let name = name.into();
        let value = value.into_nv_value();
        if let Some(slot) = self.pairs.iter_mut().find(|(key, _)| *key == name) {
            slot.1 = value;
        } else {
            self.pairs.push((name, value));
        }
    }

    /// Builder-style insert.
    pub fn with<N: Into<String>, V: NvTypeOp>(mut self, name: N, value: V) -> Self {
        self.insert(name, value);
        self
    }

    /// Remove value with given name. Returns removed value if it existed.
    pub fn remove(&mut self, name: &str) -> Option<NvValue> {
        let idx = self.pairs.iter().position(|(key, _)| key == name)?;
        Some(self.pairs.remove(idx).1)
    }

    /// Get a value by name.
    pub fn get(&self, name: &str) -> Option<&NvValue> {
        self.pairs.iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    /// Get a mutable value by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut NvValue> {
        self.pairs.iter_mut().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    /// Check if list has a value with given name.
    pub fn contains_key(&self, name: &str) -> bool { self.get(name).is_some() }

    /// Number of pairs in the list.
    pub fn len(&self) -> usize { self.pairs.len() }

    /// Check if list is empty.
    pub fn is_empty(&self) -> bool { self.pairs.is_empty() }

    /// Iterate over pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NvValue)> {
        self.pairs.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Iterate over names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> { self.pairs.iter().map(|(key, _)| key.as_str()) }

    fn lookup(&self, name: &str) -> NvResult<&NvValue> {
        self.get(name).ok_or_else(|| NvError::NotFound(name.to_string()))
    }

    /// Get a `bool` by name.
    pub fn get_bool(&self, name: &str) -> NvResult<bool> {
        match self.lookup(name)? {
            NvValue::Bool(val) => Ok(*val),
            _ => Err(NvError::WrongType(name.to_string())),
        }
    }

    /// Get a `u64` by name.
    pub fn get_number(&self, name: &str) -> NvResult<u64> {
        match self.lookup(name)? {
            NvValue::Number(val) => Ok(*val),
            _ => Err(NvError::WrongType(name.to_string())),
        }
    }

    /// Get a string by name.
    pub fn get_string(&self, name: &str) -> NvResult<&str> {
        match self.lookup(name)? {
            NvValue::String(val) => Ok(val.as_str()),
            _ => Err(NvError::WrongType(name.to_string())),
        }
    }

    /// Get a nested list by name.
    pub fn get_nvlist(&self, name: &str) -> NvResult<&NvList> {
        match self.lookup(name)? {
            NvValue::NvList(val) => Ok(val),
            _ => Err(NvError::WrongType(name.to_string())),
        }
    }

    /// Get an array of nested lists by name.
    pub fn get_nvlist_array(&self, name: &str) -> NvResult<&[NvList]> {
        match self.lookup(name)? {
            NvValue::NvListArray(val) => Ok(val.as_slice()),
            _ => Err(NvError::WrongType(name.to_string())),
        }
    }

    /// Get a mutable array of nested lists by name.
    pub fn get_nvlist_array_mut(&mut self, name: &str) -> NvResult<&mut Vec<NvList>> {
        match self.get_mut(name) {
            Some(NvValue::NvListArray(val)) => Ok(val),
            Some(_) => Err(NvError::WrongType(name.to_string())),
            None => Err(NvError::NotFound(name.to_string())),
        }
    }

    /// Get an array of strings by name.
    pub fn get_string_array(&self, name: &str) -> NvResult<&[String]> {
        match self.lookup(name)? {
            NvValue::StringArray(val) => Ok(val.as_slice()),
            _ => Err(NvError::WrongType(name.to_string())),
        }
    }

    /// Pack list into a flat buffer.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(NV_MAGIC);
        self.encode(&mut buf);
        buf
    }

    /// Unpack list from a buffer made by `pack`.
    pub fn unpack(buf: &[u8]) -> NvResult<NvList> {
        if buf.len() < NV_MAGIC.len() {
            return Err(NvError::Truncated);
        }
        if &buf[..NV_MAGIC.len()] != NV_MAGIC {
            return Err(NvError::BadMagic);
        }
        let mut reader = Reader { buf, pos: NV_MAGIC.len() };
        NvList::decode(&mut reader)
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.pairs.len());
        for (key, value) in &self.pairs {
            put_str(buf, key);
            buf.push(value.tag());
            match value {
                NvValue::Bool(val) => buf.push(u8::from(*val)),
                NvValue::Number(val) => buf.extend_from_slice(&val.to_le_bytes()),
                NvValue::String(val) => put_str(buf, val),
                NvValue::NvList(val) => val.encode(buf),
                NvValue::NumberArray(vals) => {
                    put_u32(buf, vals.len());
                    for val in vals {
                        buf.extend_from_slice(&val.to_le_bytes());
                    }
                },
                NvValue::StringArray(vals) => {
                    put_u32(buf, vals.len());
                    for val in vals {
                        put_str(buf, val);
                    }
                },
                NvValue::NvListArray(vals) => {
                    put_u32(buf, vals.len());
                    for val in vals {
                        val.encode(buf);
                    }
                },
            }
        }
    }

    fn decode(reader: &mut Reader<'_>) -> NvResult<NvList> {
        let count = reader.u32()?;
        let mut list = NvList::new();
        for _ in 0..count {
            let key = reader.string()?;
            let value = match reader.u8()? {
                1 => NvValue::Bool(reader.u8()? != 0),
                2 => NvValue::Number(reader.u64()?),
                3 => NvValue::String(reader.string()?),
                4 => NvValue::NvList(NvList::decode(reader)?),
                5 => {
                    let len = reader.u32()?;
                    let vals = (0..len).map(|_| reader.u64()).collect::<NvResult<Vec<_>>>()?;
                    NvValue::NumberArray(vals)
                },
                6 => {
                    let len = reader.u32()?;
                    let vals = (0..len).map(|_| reader.string()).collect::<NvResult<Vec<_>>>()?;
                    NvValue::StringArray(vals)
                },
                7 => {
                    let len = reader.u32()?;
                    let vals =
                        (0..len).map(|_| NvList::decode(reader)).collect::<NvResult<Vec<_>>>()?;
                    NvValue::NvListArray(vals)
                },
                tag => return Err(NvError::BadTag(tag)),
            };
            list.pairs.push((key, value));
        }
        Ok(list)
    }
}

fn put_u32(buf: &mut Vec<u8>, val: usize) {
    let val = u32::try_from(val).unwrap_or(u32::MAX);
    buf.extend_from_slice(&val.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, val: &str) {
    put_u32(buf, val.len());
    buf.extend_from_slice(val.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> NvResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(NvError::Truncated)?;
        if end > self.buf.len() {
            return Err(NvError::Truncated);
        }
        let ret = &self.buf[self.pos..end];
        self.pos = end;
        Ok(ret)
    }

    fn u8(&mut self) -> NvResult<u8> { Ok(self.take(1)?[0]) }

    fn u32(&mut self) -> NvResult<u32> {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> NvResult<u64> {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self) -> NvResult<String> {
        let len = self.u32()? as usize;
        Ok(String::from_utf8(self.take(len)?.to_vec())?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_replaces_in_place() {
        let mut list = NvList::new().with("a", 1_u64).with("b", "two");
        list.insert("a", 3_u64);
        assert_eq!(2, list.len());
        assert_eq!(vec!["a", "b"], list.keys().collect::<Vec<_>>());
        assert_eq!(3, list.get_number("a").unwrap());
    }

    #[test]
    fn typed_getters_check_type() {
        let list = NvList::new().with("a", 1_u64);
        assert!(matches!(list.get_string("a"), Err(NvError::WrongType(_))));
        assert!(matches!(list.get_number("b"), Err(NvError::NotFound(_))));
    }

    #[test]
    fn pack_nested_config() {
        let disk = NvList::new().with("type", "disk").with("path", "/dev/ada0").with("guid", 42_u64);
        let root = NvList::new()
            .with("type", "root")
            .with("children", vec![disk.clone(), disk])
            .with("flags", vec![1_u64, 2])
            .with("names", vec![String::from("x")])
            .with("active", true);
        let config = NvList::new().with("name", "tank").with("vdev_tree", root);

        let packed = config.pack();
        let unpacked = NvList::unpack(&packed).unwrap();
        assert_eq!(config, unpacked);
        let children = unpacked.get_nvlist("vdev_tree").unwrap().get_nvlist_array("children");
        assert_eq!(2, children.unwrap().len());
    }

    #[test]
    fn unpack_rejects_garbage() {
        assert!(matches!(NvList::unpack(b"ZN"), Err(NvError::Truncated)));
        assert!(matches!(NvList::unpack(b"ABCD\0\0\0\0"), Err(NvError::BadMagic)));
        let mut packed = NvList::new().with("a", 1_u64).pack();
        packed.truncate(packed.len() - 3);
        assert!(matches!(NvList::unpack(&packed), Err(NvError::Truncated)));
    }
}
