//! Per-channel identifier normalization.

use crate::Channel;

/// Normalize a raw identifier for its channel. The result is the globally
/// unique key within (channel, identifier).
pub fn normalize_identifier(channel: Channel, raw: &str) -> String {
    match channel {
        Channel::Email | Channel::Gmail => normalize_email(raw),
        Channel::Sms | Channel::Imessage => normalize_phone(raw),
        Channel::Slack => raw.trim().to_ascii_uppercase(),
        _ => raw.trim().to_string(),
    }
}

fn normalize_email(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '<' || c == '>').to_ascii_lowercase()
}

/// Best-effort E.164. Ten bare digits are assumed NANP; eleven digits with a
/// leading 1 likewise. Anything else keeps its digits behind a `+` when one
/// was present, otherwise as-is (short codes, alphanumeric senders).
fn normalize_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    let had_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if had_plus && !digits.is_empty() {
        return format!("+{digits}");
    }
    match digits.len() {
        10 => format!("+1{digits}"),
        11 if digits.starts_with('1') => format!("+{digits}"),
        _ if digits.is_empty() => trimmed.to_string(),
        _ => digits,
    }
}

/// Domain part of a normalized email, if any.
pub fn email_domain(identifier: &str) -> Option<&str> {
    identifier.rsplit_once('@').map(|(_, domain)| domain)
}

/// Free-mail domains carry no employer signal and never count as shared.
pub fn is_generic_domain(domain: &str) -> bool {
    matches!(
        domain,
        "gmail.com"
            | "googlemail.com"
            | "yahoo.com"
            | "hotmail.com"
            | "outlook.com"
            | "icloud.com"
            | "me.com"
            | "aol.com"
            | "proton.me"
            | "protonmail.com"
    )
}

/// NANP area code of an E.164 phone, if derivable.
pub fn phone_area_code(identifier: &str) -> Option<&str> {
    identifier
        .strip_prefix("+1")
        .filter(|rest| rest.len() == 10)
        .map(|rest| &rest[..3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_lowercases_and_strips_brackets() {
        assert_eq!(
            normalize_identifier(Channel::Email, " <Alice@X.COM> "),
            "alice@x.com"
        );
    }

    #[test]
    fn phone_is_e164_best_effort() {
        assert_eq!(normalize_identifier(Channel::Sms, "(555) 211-1000"), "+15552111000");
        assert_eq!(normalize_identifier(Channel::Sms, "1 555 211 1000"), "+15552111000");
        assert_eq!(normalize_identifier(Channel::Imessage, "+44 20 7946 0958"), "+442079460958");
        // Short codes keep their digits untouched.
        assert_eq!(normalize_identifier(Channel::Sms, "86753"), "86753");
    }

    #[test]
    fn helpers_extract_domain_and_area() {
        assert_eq!(email_domain("alice@initrode.com"), Some("initrode.com"));
        assert!(is_generic_domain("gmail.com"));
        assert!(!is_generic_domain("initrode.com"));
        assert_eq!(phone_area_code("+15552111000"), Some("555"));
        assert_eq!(phone_area_code("+442079460958"), None);
    }
}
