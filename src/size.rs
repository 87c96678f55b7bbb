//! Parse human-readable size strings, such as "2M" or "1s".
//!
//! Ported from nbdkit's `common/include/human-size.h`: a decimal integer
//! plus an optional one-letter scaling suffix. Sizes cannot be negative
//! and cannot overflow an `i64`.

use std::fmt;

/// Error returned by [`parse`] / [`parse_substring`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeParseError {
    message: &'static str,
    /// Byte offset into the input at which the problem was found.
    pub at: usize,
}

impl fmt::Display for SizeParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SizeParseError {}

fn err(message: &'static str, at: usize) -> SizeParseError {
    SizeParseError { message, at }
}

/// Parse `str` as a size with an optional suffix, requiring the entire
/// string to be consumed.
pub fn parse(s: &str) -> Result<i64, SizeParseError> {
    let (value, rest) = parse_substring(s)?;
    if !rest.is_empty() {
        return Err(err(
            "could not parse size: unknown suffix",
            s.len() - rest.len(),
        ));
    }
    Ok(value)
}

/// Parse a size prefix out of `str`, returning the parsed value and the
/// unconsumed remainder (which is empty iff there was no trailing
/// garbage).
pub fn parse_substring(s: &str) -> Result<(i64, &str), SizeParseError> {
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(err("could not parse size string", 0));
    }
    let digits = &s[..digits_end];
    let size: i64 = digits
        .parse()
        .map_err(|_| err("size exceeds maximum value", 0))?;
    if size < 0 {
        // unreachable since we only scanned ASCII digits, kept for parity
        // with the original's explicit negative check
        return Err(err("size cannot be negative", 0));
    }

    let rest = &s[digits_end..];
    let mut chars = rest.chars();
    let (scale, suffix_len): (i64, usize) = match chars.next() {
        None => (1, 0),
        Some(c) => match c {
            'b' | 'B' => (1, 1),
            'k' | 'K' => (1 << 10, 1),
            'm' | 'M' => (1 << 20, 1),
            'g' | 'G' => (1 << 30, 1),
            't' | 'T' => (1 << 40, 1),
            'p' | 'P' => (1 << 50, 1),
            'e' | 'E' => (1 << 60, 1),
            's' | 'S' => (512, 1),
            _ => (1, 0),
        },
    };

    if scale != 1 && (i64::MAX / scale) < size {
        return Err(err(
            "could not parse size: size * scale overflows",
            digits_end,
        ));
    }

    Ok((size * scale, &rest[suffix_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_values() {
        assert_eq!(parse("0").unwrap(), 0);
        assert_eq!(parse("512").unwrap(), 512);
        assert_eq!(parse("2M").unwrap(), 2_097_152);
        assert_eq!(parse("1s").unwrap(), 512);
        assert_eq!(parse("1E").unwrap(), 1_152_921_504_606_846_976);
    }

    #[test]
    fn rejects_negative_and_empty() {
        assert!(parse("-1").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn strict_mode_rejects_trailing_garbage() {
        assert!(parse("1 M").is_err());
    }

    #[test]
    fn substring_mode_stops_at_first_unconsumed_byte() {
        let (value, rest) = parse_substring("1 M").unwrap();
        assert_eq!(value, 1);
        assert_eq!(rest, " M");
    }

    #[test]
    fn substring_mode_leaves_empty_rest_on_full_consumption() {
        let (value, rest) = parse_substring("2M").unwrap();
        assert_eq!(value, 2_097_152);
        assert_eq!(rest, "");
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse("20000000000000000000E").is_err());
    }
}
