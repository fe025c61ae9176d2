use chrono::Duration;
use hushbox_core::error::VaultError;

/// Parse a caller's TTL hint such as `"48h"`, `"30m"`, `"7d"`, `"90s"` or a bare
/// number of seconds. `None` or a blank hint falls back to `default_secs`.
/// Hints above `max_secs` are rejected rather than clamped.
pub fn parse_ttl_hint(
    hint: Option<&str>,
    default_secs: u64,
    max_secs: u64,
) -> Result<Duration, VaultError> {
    let secs = match hint.map(str::trim).filter(|h| !h.is_empty()) {
        None => default_secs,
        Some(hint) => parse_secs(hint)?,
    };
    if secs == 0 {
        return Err(VaultError::validation("ttl must be positive"));
    }
    if secs > max_secs {
        return Err(VaultError::validation(format!(
            "ttl exceeds maximum of {max_secs}s"
        )));
    }
    let secs = i64::try_from(secs).map_err(|_| VaultError::validation("ttl out of range"))?;
    Ok(Duration::seconds(secs))
}

fn parse_secs(hint: &str) -> Result<u64, VaultError> {
    let (digits, unit) = match hint.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&hint[..idx], c.to_ascii_lowercase()),
        _ => (hint, 's'),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| VaultError::validation(format!("unparseable ttl hint: {hint}")))?;
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => {
            return Err(VaultError::validation(format!(
                "unknown ttl unit in hint: {hint}"
            )))
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| VaultError::validation("ttl out of range"))
}
