//! Byte size and rate parsing for CLI flags ("10MB", "1gbps", "100KB/s")

use thiserror::Error;

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;
const TB: f64 = 1024.0 * 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum ByteSizeError {
    #[error("empty size string")]
    Empty,
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("unknown unit: {0}")]
    UnknownUnit(String),
    #[error("size cannot be negative: {0}")]
    Negative(String),
}

fn split_value_unit(input: &str) -> Result<(f64, String), ByteSizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ByteSizeError::Empty);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(trimmed.len());
    let (num, unit) = trimmed.split_at(split);
    if num.is_empty() {
        return Err(ByteSizeError::InvalidNumber(trimmed.to_string()));
    }

    let value: f64 = num
        .parse()
        .map_err(|_| ByteSizeError::InvalidNumber(num.to_string()))?;
    if value < 0.0 {
        return Err(ByteSizeError::Negative(trimmed.to_string()));
    }

    Ok((value, unit.trim().to_ascii_lowercase()))
}

/// Parse a human byte size ("100", "64KB", "1.5MB") into bytes.
/// Units are binary (1KB = 1024 bytes); a bare number means bytes.
pub fn parse(input: &str) -> Result<i64, ByteSizeError> {
    let (value, unit) = split_value_unit(input)?;

    let multiplier = match unit.as_str() {
        "" | "b" => 1.0,
        "kb" | "k" => KB,
        "mb" | "m" => MB,
        "gb" | "g" => GB,
        "tb" | "t" => TB,
        other => return Err(ByteSizeError::UnknownUnit(other.to_string())),
    };

    Ok((value * multiplier) as i64)
}

/// Format a byte count for display ("1.50 KB", "100.00 MB").
pub fn format(bytes: i64) -> String {
    let b = bytes as f64;
    if b >= TB {
        format!("{:.2} TB", b / TB)
    } else if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Parse a rate into bytes per second. Accepts bit rates ("10mbps",
/// decimal units) and byte rates ("10MB/s", binary units).
pub fn parse_rate(input: &str) -> Result<i64, ByteSizeError> {
    let trimmed = input.trim();
    let lower = trimmed.to_ascii_lowercase();

    if let Some(bits) = lower.strip_suffix("bps") {
        let (value, unit) = split_value_unit(bits)?;
        let multiplier = match unit.as_str() {
            "" => 1.0,
            "k" => 1000.0,
            "m" => 1000.0 * 1000.0,
            "g" => 1000.0 * 1000.0 * 1000.0,
            other => return Err(ByteSizeError::UnknownUnit(other.to_string())),
        };
        return Ok((value * multiplier / 8.0) as i64);
    }

    if let Some(bytes) = lower.strip_suffix("/s") {
        return parse(bytes);
    }

    Err(ByteSizeError::UnknownUnit(trimmed.to_string()))
}

/// Format a byte rate as a bit rate ("1.00 Mbps").
pub fn format_rate(bytes_per_sec: i64) -> String {
    let bits = bytes_per_sec as f64 * 8.0;
    if bits >= 1e9 {
        format!("{:.2} Gbps", bits / 1e9)
    } else if bits >= 1e6 {
        format!("{:.2} Mbps", bits / 1e6)
    } else if bits >= 1e3 {
        format!("{:.2} Kbps", bits / 1e3)
    } else {
        format!("{} bps", bits as i64)
    }
}

// ============================================================================
// TESTS
// ============================================================================
