//! Display-safe redaction of personal data.
//!
//! Emails and phone numbers pass through these helpers before they reach
//! logs, audit snapshots or UI payloads. Both functions are pure.

/// Character substituted for redacted content.
pub const MASK_CHAR: char = '*';

/// Masks the local part of an email address, keeping the domain intact.
///
/// The first and last characters of the local part survive and everything
/// between them becomes [`MASK_CHAR`] (at least one). Local parts of one
/// character or fewer are fully masked. Input without `@` is treated as a
/// bare local part.
///
/// ```
/// use palisade_core::masking::mask_email;
/// assert_eq!(mask_email("alice@example.com"), "a***e@example.com");
/// assert_eq!(mask_email("ab@example.com"), "a*b@example.com");
/// ```
pub fn mask_email(email: &str) -> String {
    let (local, domain) = match email.rsplit_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (email, None),
    };

    let masked_local = mask_local(local);
    match domain {
        Some(domain) => format!("{masked_local}@{domain}"),
        None => masked_local,
    }
}

fn mask_local(local: &str) -> String {
    let chars: Vec<char> = local.chars().collect();
    if chars.len() <= 1 {
        return MASK_CHAR.to_string();
    }

    let interior = chars.len().saturating_sub(2).max(1);
    let mut out = String::with_capacity(local.len() + 1);
    out.push(chars[0]);
    out.extend(std::iter::repeat(MASK_CHAR).take(interior));
    out.push(chars[chars.len() - 1]);
    out
}

/// Masks a phone number down to its last four digits.
///
/// Non-digit characters are ignored. Inputs with fewer than four digits are
/// returned unchanged because there is too little signal to mask.
///
/// ```
/// use palisade_core::masking::mask_phone;
/// assert_eq!(mask_phone("+1 809-555-1234"), "***-***-1234");
/// assert_eq!(mask_phone("12"), "12");
/// ```
pub fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 4 {
        return phone.to_string();
    }

    let last_four: String = digits[digits.len() - 4..].iter().collect();
    format!("***-***-{last_four}")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn email_keeps_first_and_last_local_characters() {
        assert_eq!(mask_email("jonathan@corp.io"), "j******n@corp.io");
    }

    #[test]
    fn two_character_local_part_gets_one_mask() {
        assert_eq!(mask_email("ab@example.com"), "a*b@example.com");
    }

    #[test]
    fn single_character_local_part_is_fully_masked() {
        assert_eq!(mask_email("a@example.com"), "*@example.com");
        assert_eq!(mask_email("@example.com"), "*@example.com");
    }

    #[test]
    fn email_splits_on_last_at_sign() {
        assert_eq!(mask_email("\"a@b\"@example.com"), "\"***\"@example.com");
    }

    #[test]
    fn email_without_domain_is_masked_as_local_part() {
        assert_eq!(mask_email("nobody"), "n****y");
    }

    #[test]
    fn phone_keeps_only_last_four_digits() {
        let masked = mask_phone("+1 809-555-1234");
        assert_eq!(masked, "***-***-1234");
    }

    #[test]
    fn short_phone_is_returned_unchanged() {
        assert_eq!(mask_phone("911"), "911");
        assert_eq!(mask_phone("ext. 12"), "ext. 12");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn masked_email_preserves_domain(
            local in "[a-z0-9.]{2,20}",
            domain in "[a-z]{1,10}\\.[a-z]{2,4}",
        ) {
            let masked = mask_email(&format!("{local}@{domain}"));
            let suffix = format!("@{domain}");
            prop_assert!(masked.ends_with(&suffix));
            prop_assert!(masked.starts_with(&local[..1]));
        }

        #[test]
        fn masked_phone_leaks_no_other_digits(digits in "[0-9]{4,15}") {
            let masked = mask_phone(&digits);
            let leaked: String = masked.chars().filter(char::is_ascii_digit).collect();
            prop_assert_eq!(leaked, digits[digits.len() - 4..].to_string());
        }
    }
}
