// src/process/convert.rs

use chrono::{NaiveDate, NaiveDateTime};

use crate::process::raw_table::excel_serial_to_date;
use crate::process::utils::clean_str;
use crate::schema::Currency;

/// Largest magnitude a Decimal128(18, 2) column holds, in cents.
const MAX_CENTS: i128 = 999_999_999_999_999_999;

pub const STATE_CODE_WIDTH: usize = 2;
pub const COUNTY_CODE_WIDTH: usize = 3;

/// Parse a currency cell into exact cents.
///
/// Accepts `$`, thousands separators, inner spaces, a leading `+`/`-`, a
/// trailing `-` and accounting-style `(500.00)` negatives. An empty cell is
/// `None`. Fractions beyond two places are accepted only when they are zero.
pub fn parse_currency(raw: &str) -> Result<Option<Currency>, &'static str> {
    let s = clean_str(raw);
    if s.is_empty() {
        return Ok(None);
    }

    let (parenthesised, body) = match s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, s.as_str()),
    };
    let compact: String = body
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();

    let (minus, digits) = if let Some(rest) = compact.strip_prefix('-') {
        (true, rest)
    } else if let Some(rest) = compact.strip_suffix('-') {
        (true, rest)
    } else {
        (false, compact.strip_prefix('+').unwrap_or(&compact))
    };
    if parenthesised && minus {
        return Err("conflicting negative signs");
    }

    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err("no digits");
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err("not a currency amount");
    }
    if frac.len() > 2 && frac[2..].bytes().any(|b| b != b'0') {
        return Err("more than two decimal places");
    }

    let whole_cents = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<i128>()
            .ok()
            .and_then(|v| v.checked_mul(100))
            .ok_or("amount out of range")?
    };
    let frac_cents: i128 = match frac.len() {
        0 => 0,
        1 => i128::from(frac.as_bytes()[0] - b'0') * 10,
        _ => frac[..2].parse().map_err(|_| "not a currency amount")?,
    };
    let cents = whole_cents + frac_cents;
    if cents > MAX_CENTS {
        return Err("amount out of range");
    }

    let signed = if parenthesised || minus { -cents } else { cents };
    Ok(Some(Currency::from_cents(signed)))
}

/// Left-zero-pad a numeric state or county code to `width` digits.
///
/// Spreadsheet numerics such as `6.0` are accepted. An empty cell is `None`.
pub fn pad_code(raw: &str, width: usize) -> Result<Option<String>, &'static str> {
    let s = clean_str(raw);
    if s.is_empty() {
        return Ok(None);
    }
    let digits = match s.split_once('.') {
        Some((whole, frac)) if frac.bytes().all(|b| b == b'0') => whole,
        Some(_) => return Err("fractional code"),
        None => s.as_str(),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err("not a numeric code");
    }
    let significant = digits.trim_start_matches('0');
    if significant.len() > width {
        return Err("code too long");
    }
    Ok(Some(format!("{:0>width$}", significant, width = width)))
}

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%m/%d/%y", "%m-%d-%Y", "%Y%m%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M",
];

/// Parse a payment date in any of the layouts the releases have used,
/// including raw spreadsheet serial numbers.
pub fn parse_payment_date(raw: &str) -> Result<Option<NaiveDate>, &'static str> {
    let s = clean_str(raw);
    if s.is_empty() {
        return Ok(None);
    }
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&s, fmt).ok())
    {
        return Ok(Some(date));
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&s, fmt).ok())
    {
        return Ok(Some(dt.date()));
    }
    if let Ok(serial) = s.parse::<f64>() {
        if let Some(date) = excel_serial_to_date(serial) {
            return Ok(Some(date));
        }
    }
    Err("unrecognised date")
}
