//! Kubernetes quantity strings ("500m", "4Gi", "100M") to and from integer
//! base units.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

pub const GI: i64 = 1024 * 1024 * 1024;
pub const MEGA: i64 = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("invalid quantity: {0:?}")]
    Invalid(String),
    #[error("quantity out of range: {0:?}")]
    Overflow(String),
}

/// Multiplier of a suffix, as (numerator, denominator).
fn suffix_scale(suffix: &str) -> Option<(i128, i128)> {
    let scale = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => return None,
    };
    Some(scale)
}

/// Parses a quantity into thousandths of its base unit, rounding up.
pub fn parse_milli(raw: &str) -> Result<i128, QuantityError> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let (num, den) = suffix_scale(suffix).ok_or_else(|| QuantityError::Invalid(raw.to_string()))?;
    if number.is_empty() {
        return Err(QuantityError::Invalid(raw.to_string()));
    }

    let (negative, digits) = match number.as_bytes()[0] {
        b'-' => (true, &number[1..]),
        b'+' => (false, &number[1..]),
        _ => (false, number),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
        || frac_part.len() > 18
    {
        return Err(QuantityError::Invalid(raw.to_string()));
    }

    let overflow = || QuantityError::Overflow(raw.to_string());
    let frac_den = 10i128.pow(frac_part.len() as u32);
    let int_val: i128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| overflow())?
    };
    let frac_val: i128 = if frac_part.is_empty() {
        0
    } else {
        frac_part.parse().map_err(|_| overflow())?
    };
    let mantissa = int_val
        .checked_mul(frac_den)
        .and_then(|v| v.checked_add(frac_val))
        .ok_or_else(overflow)?;
    let scaled = mantissa
        .checked_mul(num)
        .and_then(|v| v.checked_mul(1000))
        .ok_or_else(overflow)?;
    let total_den = frac_den * den;
    let milli = (scaled + total_den - 1) / total_den;
    Ok(if negative { -milli } else { milli })
}

/// Whole base units, rounded up like `Quantity.Value()` does upstream.
pub fn parse_value(raw: &str) -> Result<i64, QuantityError> {
    let milli = parse_milli(raw)?;
    let value = if milli >= 0 { (milli + 999) / 1000 } else { milli / 1000 };
    i64::try_from(value).map_err(|_| QuantityError::Overflow(raw.to_string()))
}

pub fn parse_cpu_millis(raw: &str) -> Result<i64, QuantityError> {
    i64::try_from(parse_milli(raw)?).map_err(|_| QuantityError::Overflow(raw.to_string()))
}

/// Bandwidth in megabits. Accepts "100", "100M", "100Mi" and "100Mbps".
pub fn parse_bandwidth(raw: &str) -> Result<i64, QuantityError> {
    let s = raw.trim();
    let s = s.strip_suffix("bps").unwrap_or(s);
    let s = s.strip_suffix("Mi").or_else(|| s.strip_suffix('M')).unwrap_or(s);
    parse_value(s)
}

pub fn format_cpu(millis: i64) -> String {
    if millis % 1000 == 0 {
        (millis / 1000).to_string()
    } else {
        format!("{}m", millis)
    }
}

pub fn format_bytes(bytes: i64) -> String {
    const UNITS: [(&str, i64); 3] = [("Gi", GI), ("Mi", 1024 * 1024), ("Ki", 1024)];
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, size) in UNITS {
        if bytes % size == 0 {
            return format!("{}{}", bytes / size, suffix);
        }
    }
    bytes.to_string()
}

pub fn format_bandwidth(mega: i64) -> String {
    format!("{}M", mega)
}

pub fn cpu_quantity(millis: i64) -> Quantity {
    Quantity(format_cpu(millis))
}

pub fn bytes_quantity(bytes: i64) -> Quantity {
    Quantity(format_bytes(bytes))
}

pub fn gib(n: i64) -> i64 {
    n.saturating_mul(GI)
}

/// Whole gibibytes, rounded up.
pub fn to_gib(bytes: i64) -> i64 {
    if bytes <= 0 {
        return bytes / GI;
    }
    (bytes + GI - 1) / GI
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_suffixes() {
        assert_eq!(parse_milli("500m").unwrap(), 500);
        assert_eq!(parse_milli("2").unwrap(), 2000);
        assert_eq!(parse_value("4Gi").unwrap(), 4 * GI);
        assert_eq!(parse_value("1.5Gi").unwrap(), 3 * GI / 2);
        assert_eq!(parse_value("100M").unwrap(), 100 * MEGA);
        assert_eq!(parse_value("2k").unwrap(), 2000);
    }

    #[test]
    fn value_rounds_up_fractions() {
        assert_eq!(parse_value("1500m").unwrap(), 2);
        assert_eq!(parse_value("0.1").unwrap(), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_milli("").is_err());
        assert!(parse_milli("Gi").is_err());
        assert!(parse_milli("12Qi").is_err());
        assert!(parse_milli("1.2.3").is_err());
    }

    #[test]
    fn bandwidth_accepts_legacy_units() {
        assert_eq!(parse_bandwidth("100").unwrap(), 100);
        assert_eq!(parse_bandwidth("100M").unwrap(), 100);
        assert_eq!(parse_bandwidth("100Mbps").unwrap(), 100);
        assert_eq!(parse_bandwidth("100Mi").unwrap(), 100);
    }

    #[test]
    fn formats_to_largest_exact_unit() {
        assert_eq!(format_cpu(2000), "2");
        assert_eq!(format_cpu(250), "250m");
        assert_eq!(format_bytes(4 * GI), "4Gi");
        assert_eq!(format_bytes(100 * 1024 * 1024), "100Mi");
        assert_eq!(format_bytes(0), "0");
        assert_eq!(format_bytes(1000), "1000");
    }
}
