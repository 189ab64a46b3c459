use pest::Parser;
use pest_derive::Parser;
use std::convert::TryFrom;

pub mod zfs;

#[derive(Parser)]
#[grammar = "parsers/mnttab.pest"] // relative to src
pub struct MnttabParser;

/// One line of the mount table, with octal escapes already decoded.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[get = "pub"]
pub struct MnttabLine {
    special: String,
    mountp:  String,
    fstype:  String,
    mntopts: String,
}

impl MnttabLine {
    pub fn new<S: Into<String>>(special: S, mountp: S, fstype: S, mntopts: S) -> Self {
        MnttabLine {
            special: special.into(),
            mountp:  mountp.into(),
            fstype:  fstype.into(),
            mntopts: mntopts.into(),
        }
    }
}

/// Decode `\040` style escapes used by the mount tables for blanks inside fields.
pub fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut ret = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' && idx + 4 <= bytes.len() {
            let digits = &bytes[idx + 1..idx + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let val = digits.iter().fold(0_u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(val) {
                    ret.push(byte);
                    idx += 4;
                    continue;
                }
            }
        }
        ret.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&ret).into_owned()
}

/// Parse a whole mount table. Lines that don't parse (comments, garbage) are skipped.
pub fn parse_mnttab(table: &str) -> Vec<MnttabLine> {
    table.lines().filter_map(parse_mnttab_line).collect()
}

pub fn parse_mnttab_line(line: &str) -> Option<MnttabLine> {
    if line.trim_start().starts_with('#') {
        return None;
    }
    let pair = MnttabParser::parse(Rule::mnttab_line, line).ok()?.next()?;
    let mut entry = MnttabLine::new("", "", "", "");
    for field in pair.into_inner() {
        let value = unescape_octal(field.as_str());
        match field.as_rule() {
            Rule::special => entry.special = value,
            Rule::mountp => entry.mountp = value,
            Rule::fstype => entry.fstype = value,
            Rule::mntopts => entry.mntopts = value,
            _ => {},
        }
    }
    Some(entry)
}

/// Parse a share table and return shared paths.
pub fn parse_sharetab(table: &str) -> Vec<String> {
    table
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let pair = MnttabParser::parse(Rule::sharetab_line, line).ok()?.next()?;
            pair.into_inner()
                .find(|field| field.as_rule() == Rule::share_path)
                .map(|field| unescape_octal(field.as_str()))
        })
        .collect()
}
