//! Range syntaxes used by inventories and bulk requests.
//!
//! - Port ranges: `[1,3,5-10]` expands to the sorted, de-duplicated set of
//!   port numbers. Brackets are optional; all numbers must be positive.
//! - Hostname ranges: `leaf[101-104]` expands to `leaf101..leaf104` (numbers
//!   zero-padded to three digits) and `leaf[101a-101c]` to
//!   `leaf101a, leaf101b, leaf101c`. A name without brackets expands to
//!   itself.

use crate::ParseError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static SPAN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)-(\d+)$").expect("static regex"));

static HOSTNAME_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^\[]+)\[([0-9a-zA-Z]+)-([0-9a-zA-Z]+)\]$").expect("static regex")
});

static HOSTNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9-]+$").expect("static regex"));

/// Parses a flexible port range such as `[1,3,5-10]`.
///
/// ```
/// use portctl_types::parse_port_range;
///
/// assert_eq!(parse_port_range("[1,3,5-7]").unwrap(), vec![1, 3, 5, 6, 7]);
/// assert_eq!(parse_port_range("4").unwrap(), vec![4]);
/// assert!(parse_port_range("[0-2]").is_err());
/// ```
pub fn parse_port_range(input: &str) -> Result<Vec<u32>, ParseError> {
    let trimmed = input.trim();
    let body = match (trimmed.strip_prefix('['), trimmed.strip_suffix(']')) {
        (Some(_), Some(_)) => &trimmed[1..trimmed.len() - 1],
        (None, None) => trimmed,
        _ => return Err(ParseError::range(input, "unbalanced brackets")),
    };

    let mut result = BTreeSet::new();
    for item in body.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if item.contains('-') {
            let caps = SPAN_RE
                .captures(item)
                .ok_or_else(|| ParseError::range(input, format!("bad span '{}'", item)))?;
            let start = parse_positive(input, &caps[1])?;
            let end = parse_positive(input, &caps[2])?;
            if start > end {
                return Err(ParseError::range(
                    input,
                    format!("start ({}) must be <= end ({})", start, end),
                ));
            }
            result.extend(start..=end);
        } else {
            result.insert(parse_positive(input, item)?);
        }
    }

    Ok(result.into_iter().collect())
}

fn parse_positive(input: &str, item: &str) -> Result<u32, ParseError> {
    match item.parse::<u32>() {
        Ok(0) => Err(ParseError::range(input, "port numbers must be positive")),
        Ok(n) => Ok(n),
        Err(_) => Err(ParseError::range(input, format!("bad number '{}'", item))),
    }
}

/// Expands a hostname range such as `leaf[101-104]` or `leaf[101a-101c]`.
///
/// Every produced hostname must consist of alphanumerics and hyphens only.
pub fn expand_hostname_range(input: &str) -> Result<Vec<String>, ParseError> {
    let input = input.trim();

    let Some(caps) = HOSTNAME_RANGE_RE.captures(input) else {
        if input.contains('[') || input.contains(']') {
            return Err(ParseError::range(input, "expected prefix[start-end]"));
        }
        check_hostname(input)?;
        return Ok(vec![input.to_string()]);
    };

    let (prefix, start, end) = (&caps[1], &caps[2], &caps[3]);
    let is_numeric = |s: &str| s.chars().all(|c| c.is_ascii_digit());

    let names: Vec<String> = if is_numeric(start) && is_numeric(end) {
        let (from, to) = (
            start.parse::<u32>().map_err(|_| ParseError::range(input, "bad start"))?,
            end.parse::<u32>().map_err(|_| ParseError::range(input, "bad end"))?,
        );
        if from > to {
            return Err(ParseError::range(
                input,
                format!("start ({}) must be <= end ({})", start, end),
            ));
        }
        (from..=to).map(|i| format!("{}{:03}", prefix, i)).collect()
    } else {
        if start.len() != end.len() {
            return Err(ParseError::range(
                input,
                "alphanumeric bounds must have the same length",
            ));
        }
        let (start_base, start_suffix) = start.split_at(start.len() - 1);
        let (end_base, end_suffix) = end.split_at(end.len() - 1);
        let from = start_suffix.chars().next().map(|c| c.to_ascii_lowercase());
        let to = end_suffix.chars().next().map(|c| c.to_ascii_lowercase());
        match (from, to) {
            (Some(from), Some(to))
                if start_base == end_base && from.is_ascii_alphabetic() && to.is_ascii_alphabetic() =>
            {
                if from > to {
                    return Err(ParseError::range(
                        input,
                        format!("start ({}) must be <= end ({})", from, to),
                    ));
                }
                (from..=to)
                    .map(|c| format!("{}{}{}", prefix, start_base, c))
                    .collect()
            }
            _ => {
                return Err(ParseError::range(
                    input,
                    "alphanumeric range needs a shared base and alphabetic suffixes (e.g. 101a-101c)",
                ))
            }
        }
    };

    for name in &names {
        check_hostname(name)?;
    }
    Ok(names)
}

fn check_hostname(name: &str) -> Result<(), ParseError> {
    if HOSTNAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(ParseError::InvalidIdentifier(format!(
            "invalid hostname '{}': only alphanumerics and hyphens allowed",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_port_range_mixed() {
        assert_eq!(
            parse_port_range("[1, 3, 5-8, 3]").unwrap(),
            vec![1, 3, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_port_range_empty() {
        assert_eq!(parse_port_range("[]").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_port_range_errors() {
        assert!(parse_port_range("[1-").is_err());
        assert!(parse_port_range("[5-3]").is_err());
        assert!(parse_port_range("[a]").is_err());
        assert!(parse_port_range("[0]").is_err());
        assert!(parse_port_range("[1--3]").is_err());
    }

    #[test]
    fn test_hostname_numeric_range() {
        assert_eq!(
            expand_hostname_range("nj01leaf[1-3]").unwrap(),
            vec!["nj01leaf001", "nj01leaf002", "nj01leaf003"]
        );
    }

    #[test]
    fn test_hostname_alpha_range() {
        assert_eq!(
            expand_hostname_range("spine[101a-101c]").unwrap(),
            vec!["spine101a", "spine101b", "spine101c"]
        );
        assert!(expand_hostname_range("spine[101a-102c]").is_err());
        assert!(expand_hostname_range("spine[101c-101a]").is_err());
    }

    #[test]
    fn test_plain_hostname() {
        assert_eq!(expand_hostname_range("core-1").unwrap(), vec!["core-1"]);
        assert!(expand_hostname_range("core_1").is_err());
        assert!(expand_hostname_range("core[1").is_err());
    }
}
