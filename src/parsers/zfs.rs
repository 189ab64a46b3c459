use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "parsers/zfs.pest"] // relative to src
pub struct ZfsParser;

static SUFFIXES: &str = "BKMGTPEZ";

quick_error! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    /// Reasons a human readable number is refused.
    pub enum NumberError {
        BadValue(value: String) {
            display("bad numeric value '{}'", value)
        }
        BadSuffix(suffix: String) {
            display("invalid numeric suffix '{}'", suffix)
        }
        TooLarge {
            display("numeric value is too large")
        }
    }
}

quick_error! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    /// Reasons a property list is refused.
    pub enum PropListError {
        NoProperties {
            display("no properties specified")
        }
        EmptyName {
            display("empty property name")
        }
    }
}

/// Shift selected by a size suffix: `K` is 10, `M` is 20 and so on. A trailing `b` is allowed after
/// a unit, but never after `B` itself.
fn suffix_shift(suffix: &str) -> Result<u32, NumberError> {
    let upper = suffix.to_ascii_uppercase();
    let mut chars = upper.chars();
    let unit = match chars.next() {
        None => return Ok(0),
        Some(c) => c,
    };
    let index = SUFFIXES.find(unit).ok_or_else(|| NumberError::BadSuffix(suffix.to_string()))?;
    match (chars.next(), chars.next()) {
        (None, _) => Ok(10 * index as u32),
        (Some('B'), None) if unit != 'B' => Ok(10 * index as u32),
        _ => Err(NumberError::BadSuffix(suffix.to_string())),
    }
}

/// Turn a human readable size into bytes. `1.5M` is `1572864`, `10gb` is `10737418240`.
pub fn nicestrtonum(value: &str) -> Result<u64, NumberError> {
    match value.chars().next() {
        Some(c) if c.is_ascii_digit() || c == '.' => {},
        _ => return Err(NumberError::BadValue(value.to_string())),
    }
    let number = ZfsParser::parse(Rule::number, value)
        .ok()
        .and_then(|mut pairs| pairs.next())
        .ok_or_else(|| {
            let tail = value.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.');
            NumberError::BadSuffix(tail.to_string())
        })?;

    let mut mantissa = "";
    let mut suffix = "";
    for pair in number.into_inner() {
        match pair.as_rule() {
            Rule::mantissa => mantissa = pair.as_str(),
            Rule::suffix => suffix = pair.as_str(),
            _ => {},
        }
    }
    let shift = suffix_shift(suffix)?;

    if mantissa.contains('.') {
        let fval: f64 = mantissa.parse().map_err(|_| NumberError::BadValue(value.to_string()))?;
        let fval = fval * 2_f64.powi(shift as i32);
        if fval > u64::MAX as f64 {
            return Err(NumberError::TooLarge);
        }
        Ok(fval as u64)
    } else {
        let num: u64 = mantissa.parse().map_err(|_| NumberError::TooLarge)?;
        if num == 0 {
            return Ok(0);
        }
        if shift >= 64 || num > (u64::MAX >> shift) {
            return Err(NumberError::TooLarge);
        }
        Ok(num << shift)
    }
}

/// Split a property list. `None` means `all`.
pub fn parse_proplist(fields: &str) -> Result<Option<Vec<String>>, PropListError> {
    if fields.is_empty() {
        return Err(PropListError::NoProperties);
    }
    let list = ZfsParser::parse(Rule::proplist, fields)
        .map_err(|_| PropListError::EmptyName)?
        .next()
        .ok_or(PropListError::EmptyName)?;
    let mut names = Vec::new();
    for pair in list.into_inner() {
        match pair.as_rule() {
            Rule::all => return Ok(None),
            Rule::names => names.extend(pair.into_inner().map(|name| name.as_str().to_string())),
            _ => {},
        }
    }
    Ok(Some(names))
}

#[cfg(test)]
mod test {
    use super::*;
    use pest::{consumes_to, parses_to};

    #[test]
    fn test_number_tokens() {
        let line = "1.5Mb";

        parses_to! {
            parser: ZfsParser,
            input: line,
            rule: Rule::number,
            tokens: [
                number(0, 5, [
                    mantissa(0, 3),
                    suffix(3, 5, [
                        unit(3, 4),
                        bytes(4, 5)
                    ]),
                    EOI(5, 5)
                ])
            ]
        }
    }

    #[test]
    fn test_plain_and_suffixed() {
        assert_eq!(Ok(0), nicestrtonum("0"));
        assert_eq!(Ok(512), nicestrtonum("512"));
        assert_eq!(Ok(1024), nicestrtonum("1K"));
        assert_eq!(Ok(1024), nicestrtonum("1k"));
        assert_eq!(Ok(1024), nicestrtonum("1KB"));
        assert_eq!(Ok(10 << 30), nicestrtonum("10gb"));
        assert_eq!(Ok(7), nicestrtonum("7B"));
        assert_eq!(Ok(1 << 60), nicestrtonum("1E"));
    }

    #[test]
    fn test_fractions() {
        assert_eq!(Ok(1_572_864), nicestrtonum("1.5M"));
        assert_eq!(Ok(512), nicestrtonum(".5K"));
        assert_eq!(Ok(5), nicestrtonum("5."));
    }

    #[test]
    fn test_rejects() {
        assert_eq!(Err(NumberError::BadValue("abc".into())), nicestrtonum("abc"));
        assert_eq!(Err(NumberError::BadValue("".into())), nicestrtonum(""));
        assert_eq!(Err(NumberError::BadSuffix("BB".into())), nicestrtonum("5BB"));
        assert_eq!(Err(NumberError::BadSuffix("KK".into())), nicestrtonum("1KK"));
        assert_eq!(Err(NumberError::BadSuffix("Q".into())), nicestrtonum("1Q"));
        assert_eq!(Err(NumberError::TooLarge), nicestrtonum("5Z"));
        assert_eq!(Err(NumberError::TooLarge), nicestrtonum("5ZB"));
        assert_eq!(Err(NumberError::TooLarge), nicestrtonum("16E"));
        assert_eq!(Err(NumberError::TooLarge), nicestrtonum("99999999999999999999"));
    }

    #[test]
    fn test_proplist() {
        assert_eq!(Ok(None), parse_proplist("all"));
        assert_eq!(Ok(Some(vec!["name".to_string(), "used".to_string()])), parse_proplist("name,used"));
        assert_eq!(Ok(Some(vec!["all".to_string(), "used".to_string()])), parse_proplist("all,used"));
        assert_eq!(Err(PropListError::NoProperties), parse_proplist(""));
        assert_eq!(Err(PropListError::EmptyName), parse_proplist("name,,used"));
        assert_eq!(Err(PropListError::EmptyName), parse_proplist("name,"));
    }
}
