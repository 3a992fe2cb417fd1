//! Contact normalization
//!
//! Visitor phone numbers arrive in whatever shape the form produced
//! ("(321) 704-7403", "321-704-7403", "+1 321 704 7403"). Everything is
//! normalized to E.164 before it touches the store so duplicate
//! suppression and fingerprinting compare like with like.

use regex::Regex;

/// Normalize a raw phone number to E.164
///
/// Rules:
/// - separators (spaces, parens, hyphens, dots) are stripped
/// - a `+`-prefixed number is validated against the E.164 shape as-is
/// - 10 bare digits get the default country code prepended
/// - 11 bare digits with a leading 1 become `+{digits}`
pub fn normalize_phone(raw: &str, default_country: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("Phone number is required".to_string());
    }

    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if trimmed
        .chars()
        .any(|c| !c.is_ascii_digit() && !matches!(c, '+' | ' ' | '(' | ')' | '-' | '.'))
    {
        return Err(format!("Invalid phone number: {}", raw));
    }

    let candidate = if has_plus {
        format!("+{}", digits)
    } else if digits.len() == 10 {
        format!("{}{}", default_country, digits)
    } else if digits.len() == 11 && digits.starts_with('1') {
        format!("+{}", digits)
    } else {
        return Err(format!("Invalid phone number: {}", raw));
    };

    let e164 = Regex::new(r"^\+[1-9]\d{6,14}$").map_err(|e| e.to_string())?;
    if !e164.is_match(&candidate) {
        return Err(format!("Invalid phone number: {}", raw));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_formatted_us_number() {
        assert_eq!(normalize_phone("(321) 704-7403", "+1").unwrap(), "+13217047403");
        assert_eq!(normalize_phone("321-704-7403", "+1").unwrap(), "+13217047403");
        assert_eq!(normalize_phone("321.704.7403", "+1").unwrap(), "+13217047403");
    }

    #[test]
    fn test_normalize_eleven_digits_leading_one() {
        assert_eq!(normalize_phone("1 321 704 7403", "+1").unwrap(), "+13217047403");
    }

    #[test]
    fn test_normalize_already_e164() {
        assert_eq!(normalize_phone("+13217047403", "+1").unwrap(), "+13217047403");
        assert_eq!(normalize_phone("+44 20 7946 0958", "+1").unwrap(), "+442079460958");
    }

    #[test]
    fn test_normalize_uses_default_country() {
        assert_eq!(normalize_phone("20 7946 0958", "+44").unwrap(), "+442079460958");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_phone("", "+1").is_err());
        assert!(normalize_phone("   ", "+1").is_err());
        assert!(normalize_phone("call me", "+1").is_err());
        assert!(normalize_phone("12345", "+1").is_err());
        assert!(normalize_phone("+0123456789", "+1").is_err());
        assert!(normalize_phone("321-704-740", "+1").is_err());
    }
}
