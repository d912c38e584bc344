use regex::Regex;
use std::sync::LazyLock;

use super::labels;
use super::{ExtractionMethod, Fields, RawCapture, Strategy};

static USER_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:usu[aá]rio|username|user|login)\b\W{0,4}([\p{L}\p{N}._@-]{3,})")
        .expect("user pattern is valid")
});

static USER_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{8,12})\b").expect("numeric user pattern is valid"));

static PASS_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:senha|password|pass|pwd)\b\W{0,4}(\S{3,})").expect("password pattern is valid")
});

static PASS_MIXED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z0-9]{6,16})\b").expect("mixed password pattern is valid"));

static EXPIRY_BR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{2}/\d{2}/\d{4}(?:[ \t]+\d{2}:\d{2}(?::\d{2})?)?)").expect("date pattern is valid")
});

static EXPIRY_ISO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{4}-\d{2}-\d{2}(?:[ T]\d{2}:\d{2}(?::\d{2})?)?)").expect("iso date pattern is valid")
});

/// Tier 3: field-specific regex families over the whole text.
pub struct BlindRegex;

impl Strategy for BlindRegex {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::BlindRegex
    }

    fn extract(&self, capture: &RawCapture) -> Fields {
        let text = capture.text();

        let username = first_capture(&USER_LABELLED, text, |v| !labels::is_label_word(v))
            .or_else(|| first_capture(&USER_NUMERIC, text, |_| true));

        let password = first_capture(&PASS_LABELLED, text, |v| {
            !labels::is_label_word(v) && Some(v) != username.as_deref()
        })
        .or_else(|| {
            first_capture(&PASS_MIXED, text, |v| {
                v.chars().any(|c| c.is_ascii_alphabetic())
                    && v.chars().any(|c| c.is_ascii_digit())
                    && Some(v) != username.as_deref()
            })
        });

        Fields {
            username,
            password,
            expires_at: find_expiry(text),
        }
    }
}

fn first_capture(re: &Regex, text: &str, accept: impl Fn(&str) -> bool) -> Option<String> {
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches([',', ';', '.', ')']))
        .find(|v| !v.is_empty() && accept(v))
        .map(str::to_string)
}

/// First date-shaped value in the text, Brazilian format preferred.
pub fn find_expiry(text: &str) -> Option<String> {
    EXPIRY_BR
        .captures(text)
        .or_else(|| EXPIRY_ISO.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> Fields {
        BlindRegex.extract(&RawCapture::new(text))
    }

    #[test]
    fn test_arrow_separated_labels() {
        let fields = scan("Login -> 55667788 | Pass -> zz99yy88");
        assert_eq!(fields.username.as_deref(), Some("55667788"));
        assert_eq!(fields.password.as_deref(), Some("zz99yy88"));
    }

    #[test]
    fn test_unlabelled_pair() {
        let fields = scan("Acesso: 1234567890 / AB12CD34");
        assert_eq!(fields.username.as_deref(), Some("1234567890"));
        assert_eq!(fields.password.as_deref(), Some("AB12CD34"));
    }

    #[test]
    fn test_label_word_is_not_a_value() {
        let fields = scan("Usuário:\nSenha:\n");
        assert!(fields.username.is_none());
        assert!(fields.password.is_none());
    }

    #[test]
    fn test_find_expiry_formats() {
        assert_eq!(find_expiry("vence 10/10/2025 10:00:00 ok").as_deref(), Some("10/10/2025 10:00:00"));
        assert_eq!(find_expiry("exp 2025-10-10T08:30").as_deref(), Some("2025-10-10T08:30"));
        assert_eq!(find_expiry("sem data"), None);
    }
}
