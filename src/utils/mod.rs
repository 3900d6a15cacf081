use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDate};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::str::FromStr;

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Parses a money string written with either `.` or `,` as decimal separator.
///
/// Only the first number in the text is read; currency symbols and words
/// around it are ignored, but any further digits make the value ambiguous and
/// are rejected. Digit groups may be separated by spaces (`1 234,56`). When
/// both separators are present the right-most one is taken as the decimal
/// separator and the other as a thousands separator (`1.234,56` and
/// `1,234.56` both give `1234.56`).
pub fn parse_decimal(value: &str) -> Result<Decimal> {
    let (negative, token, rest) =
        numeric_token(value).ok_or_else(|| anyhow!("Parse decimal: no digits in '{}'", value))?;
    if rest.chars().any(|c| c.is_ascii_digit()) {
        return Err(anyhow!("Parse decimal: more than one number in '{}'", value));
    }

    let cleaned: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned.trim_end_matches(['.', ',']);
    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(_)) => cleaned.replace(',', "."),
        _ => cleaned.to_string(),
    };
    let normalized = if negative { format!("-{}", normalized) } else { normalized };

    Decimal::from_str(&normalized).map_err(|e| anyhow!("Parse decimal '{}': {}", value, e))
}

/// Splits out the first run of digits and separators.
///
/// Returns whether a `-` precedes it, the run itself and the remaining text.
fn numeric_token(value: &str) -> Option<(bool, &str, &str)> {
    let start = value.find(|c: char| c.is_ascii_digit())?;
    let negative = value[..start]
        .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, '€' | '$' | '£'))
        .ends_with('-');

    let bytes = value.as_bytes();
    let mut end = start;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' | b'.' | b',' => end += 1,
            b' ' if is_digit_group(&bytes[end + 1..]) => end += 1,
            _ => break,
        }
    }
    Some((negative, &value[start..end], &value[end..]))
}

/// A thousands group: exactly three digits not followed by another digit.
fn is_digit_group(bytes: &[u8]) -> bool {
    bytes.len() >= 3
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && !bytes.get(3).is_some_and(u8::is_ascii_digit)
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let raw = value.trim();
    if raw.is_empty() {
        return None;
    }

    let formats = ["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%Y/%m/%d", "%Y.%m.%d", "%d-%m-%Y"];
    for fmt in formats.iter() {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }
    // Timestamps like 2024-03-01T00:00:00Z
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Normalizes a loosely formatted date to `YYYY-MM-DD`.
///
/// Absent values become `default`; unparseable values are passed through
/// unchanged so a reviewer can see and correct them.
pub fn normalize_date(value: Option<&str>, default: NaiveDate) -> String {
    match value.map(str::trim) {
        None | Some("") => default.format("%Y-%m-%d").to_string(),
        Some(raw) => parse_date(raw)
            .map(|date| date.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse_decimal_handles_both_separators() {
        assert_eq!(parse_decimal("1.234,56").unwrap(), dec!(1234.56));
        assert_eq!(parse_decimal("1,234.56").unwrap(), dec!(1234.56));
        assert_eq!(parse_decimal("12,5").unwrap(), dec!(12.5));
        assert_eq!(parse_decimal("€ 99.90").unwrap(), dec!(99.90));
        assert!(parse_decimal("n/a").is_err());
    }

    #[test]
    fn parse_decimal_reads_one_number_only() {
        assert_eq!(parse_decimal("121,00 EUR").unwrap(), dec!(121.00));
        assert_eq!(parse_decimal("1 234,56 €").unwrap(), dec!(1234.56));
        assert_eq!(parse_decimal("-12,50").unwrap(), dec!(-12.50));
        assert_eq!(parse_decimal("- € 7").unwrap(), dec!(-7));
        assert_eq!(parse_decimal("Total: 99.").unwrap(), dec!(99));
        assert!(parse_decimal("121,00 EUR (IVA 21%)").is_err());
        assert!(parse_decimal("2 x 50").is_err());
        assert!(parse_decimal("10 20").is_err());
    }

    #[test]
    fn normalize_date_defaults_and_reformats() {
        let fallback = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(normalize_date(None, fallback), "2024-05-01");
        assert_eq!(normalize_date(Some("  "), fallback), "2024-05-01");
        assert_eq!(normalize_date(Some("31/01/2024"), fallback), "2024-01-31");
        assert_eq!(normalize_date(Some("2024-02-03T10:00:00Z"), fallback), "2024-02-03");
        assert_eq!(normalize_date(Some("sometime"), fallback), "sometime");
    }

    #[test]
    fn sha256_is_hex_encoded() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
