//! Property lists for listing tools: `name,used,com.example:tag` or `all`.
use crate::{parsers::zfs::{parse_proplist, PropListError},
            zfs::{handle::ZfsHandle,
                  properties::{is_user_property, lookup_by_name},
                  Error, Result, ZfsProp, ZfsType}};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropListItem {
    Native(ZfsProp),
    User(String),
}

impl PropListItem {
    pub fn name(&self) -> &str {
        match self {
            PropListItem::Native(prop) => prop.name(),
            PropListItem::User(name) => name,
        }
    }

    fn header(&self) -> String {
        match self {
            PropListItem::Native(prop) => prop.column_name().unwrap_or_else(|| prop.name()).to_string(),
            PropListItem::User(name) => name.to_uppercase(),
        }
    }
}

/// One column. `fixed` columns never need widening for their values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropListEntry {
    item:  PropListItem,
    width: usize,
    fixed: bool,
}

impl PropListEntry {
    fn new(item: PropListItem) -> Self {
        let (width, fixed) = match &item {
            PropListItem::Native(prop) => prop.display_width(),
            PropListItem::User(name) => (name.len(), false),
        };
        PropListEntry { width: width.max(item.header().len()), item, fixed }
    }

    pub fn item(&self) -> &PropListItem { &self.item }

    pub fn width(&self) -> usize { self.width }

    pub fn fixed(&self) -> bool { self.fixed }
}

/// Parsed list of columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropList {
    entries: Vec<PropListEntry>,
    all:     bool,
}

impl PropList {
    /// Parse `fields` for datasets of `types`. `all` expands to every visible property that
    /// applies, `name` first. One unknown name fails the whole list.
    pub fn parse(fields: &str, types: ZfsType) -> Result<PropList> {
        let context = "bad property list";
        let names =
            parse_proplist(fields).map_err(|e: PropListError| Error::InvalidProperty(context.into(), e.to_string()))?;
        let names = match names {
            Some(names) => names,
            None => {
                let mut entries = vec![PropListEntry::new(PropListItem::Native(ZfsProp::Name))];
                entries.extend(
                    ZfsProp::all_visible(types)
                        .filter(|prop| *prop != ZfsProp::Name)
                        .map(|prop| PropListEntry::new(PropListItem::Native(prop))),
                );
                return Ok(PropList { entries, all: true });
            },
        };
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let item = match lookup_by_name(&name, types) {
                Some(prop) => PropListItem::Native(prop),
                None if is_user_property(&name) => PropListItem::User(name),
                None => return Err(Error::InvalidProperty(context.into(), format!("invalid property '{}'", name))),
            };
            entries.push(PropListEntry::new(item));
        }
        Ok(PropList { entries, all: false })
    }

    pub fn entries(&self) -> &[PropListEntry] { &self.entries }

    pub fn is_all(&self) -> bool { self.all }

    /// Widen columns to fit the values of `handle`. An `all` list also picks up the user
    /// properties the dataset carries.
    pub fn expand(&mut self, handle: &ZfsHandle<'_>) {
        if self.all {
            for (name, _) in handle.user_props().iter() {
                if !self.entries.iter().any(|e| e.item.name() == name) {
                    self.entries.push(PropListEntry::new(PropListItem::User(name.to_string())));
                }
            }
        }
        for entry in self.entries.iter_mut().filter(|e| !e.fixed) {
            let value = match &entry.item {
                PropListItem::Native(prop) => handle.get_prop(*prop, false).ok().map(|(value, _)| value),
                PropListItem::User(name) => handle.get_user_prop(name).map(|(value, _)| value),
            };
            if let Some(value) = value {
                entry.width = entry.width.max(value.len());
            }
        }
    }
}
