//! Byte-size string parsing for configuration values like `50MB`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("empty size value")]
    Empty,
    #[error("missing unit in size value: {0}")]
    MissingUnit(String),
    #[error("unknown size unit: {0}")]
    UnknownUnit(String),
    #[error("invalid size number: {0}")]
    InvalidNumber(String),
    #[error("size must not be negative: {0}")]
    Negative(String),
}

/// Parse a size string with a `B`/`KB`/`MB`/`GB` unit into bytes.
///
/// Case-insensitive; whitespace around and between number and unit is
/// tolerated. The unit is mandatory and unknown units are rejected, as
/// are negative values.
pub fn parse_size(input: &str) -> Result<u64, SizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeError::Empty);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '+'))
        .unwrap_or(trimmed.len());
    let (number_part, unit_part) = trimmed.split_at(split);
    let number_part = number_part.trim();
    let unit_part = unit_part.trim();

    if number_part.is_empty() {
        return Err(SizeError::InvalidNumber(input.trim().to_string()));
    }
    if number_part.starts_with('-') {
        return Err(SizeError::Negative(input.trim().to_string()));
    }
    if unit_part.is_empty() {
        return Err(SizeError::MissingUnit(input.trim().to_string()));
    }

    let value: u64 = number_part
        .trim_start_matches('+')
        .parse()
        .map_err(|_| SizeError::InvalidNumber(input.trim().to_string()))?;

    let multiplier: u64 = match unit_part.to_ascii_uppercase().as_str() {
        "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => return Err(SizeError::UnknownUnit(unit_part.to_string())),
    };

    Ok(value.saturating_mul(multiplier))
}
