use anyhow::{Result, bail};

pub const KENYA_COUNTRY_CODE: &str = "254";

/// E.164 caps a full international number at 15 digits.
const MAX_MSISDN_DIGITS: usize = 15;
const MIN_MSISDN_DIGITS: usize = 10;

/// Normalizes a payer phone into the `2547XXXXXXXX` form M-Pesa expects.
///
/// Spaces and dashes are dropped, a leading `+` is stripped and a local
/// `07XXXXXXXX` number gets the Kenyan country code in place of its `0`.
pub fn normalize_msisdn(raw: &str) -> Result<String> {
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();

    let without_plus = compact.strip_prefix('+').unwrap_or(&compact);

    let normalized = match without_plus.strip_prefix('0') {
        Some(local) if without_plus.len() == 10 => format!("{KENYA_COUNTRY_CODE}{local}"),
        _ => without_plus.to_string(),
    };

    if normalized.is_empty() {
        bail!("Phone number is required");
    }
    if !normalized.chars().all(|c| c.is_ascii_digit()) {
        bail!("Phone number must contain digits only");
    }
    if !(MIN_MSISDN_DIGITS..=MAX_MSISDN_DIGITS).contains(&normalized.len()) {
        bail!("Phone number must be in the format 07XXXXXXXX or 2547XXXXXXXX");
    }

    Ok(normalized)
}

/// First three and last three characters around `****`. Anything shorter than
/// six characters is returned as is.
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() < 6 {
        return phone.to_string();
    }

    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}****{tail}")
}
