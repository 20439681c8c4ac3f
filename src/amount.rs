//! sompi/KAS conversion per spec §6's unit convention.
//!
//! Amounts cross the wire and sit in storage as `sompi` decimal strings so
//! JSON's `f64` number type never touches them. Internally a `u64` is plenty:
//! Kaspa's maximum supply is ~2.87e18 sompi, well under `u64::MAX`.

use crate::error::GatewayError;

pub const SOMPI_PER_KAS: u64 = 100_000_000;

/// Parses a decimal KAS string (`"1.5"`, `"0"`, `"42"`) into sompi.
///
/// Matches `^\d+(\.\d{1,8})?$`: an integer part, optionally a `.` followed by
/// 1-8 fractional digits. The fractional part is right-padded to 8 digits and
/// concatenated with the integer part before parsing, avoiding any float math.
pub fn kas_to_sompi(input: &str) -> Result<u64, GatewayError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(GatewayError::validation("amount must not be empty"));
    }
    let (int_part, frac_part) = match input.split_once('.') {
        Some((i, f)) => (i, f),
        None => (input, ""),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GatewayError::validation(format!("invalid amount: {input}")));
    }
    if frac_part.len() > 8 || (!frac_part.is_empty() && !frac_part.bytes().all(|b| b.is_ascii_digit())) {
        return Err(GatewayError::validation(format!("invalid amount: {input}")));
    }
    let mut padded_frac = frac_part.to_string();
    while padded_frac.len() < 8 {
        padded_frac.push('0');
    }
    let digits = format!("{int_part}{padded_frac}");
    let trimmed = digits.trim_start_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
    trimmed.parse::<u64>().map_err(|_| GatewayError::validation(format!("amount out of range: {input}")))
}

/// Formats sompi as a normalized KAS decimal string: trailing fractional
/// zeros stripped, and a bare integer part when the fraction is all zero.
pub fn sompi_to_kas(sompi: u64) -> String {
    let int_part = sompi / SOMPI_PER_KAS;
    let frac_part = sompi % SOMPI_PER_KAS;
    if frac_part == 0 {
        return int_part.to_string();
    }
    let frac_str = format!("{frac_part:08}");
    let frac_str = frac_str.trim_end_matches('0');
    format!("{int_part}.{frac_str}")
}
