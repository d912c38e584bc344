//! Field label recognition shared by the extraction strategies.

use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Username,
    Password,
    Expiry,
}

// Longer alternatives first so "username" is not read as "user" + "name".
static LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(?P<user>usu[aá]rio|username|user|login)|(?P<pass>senha|password|pass|pwd)|(?P<exp>vencimento|validade|expira[cç][aã]o|expiration|expires|expiry|expira|vence))\b\s*(?P<sep>[:=])?",
    )
    .expect("label pattern is valid")
});

/// A label found inside one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelHit {
    pub kind: FieldKind,
    /// Label sits at the start of the line (after bullets/indentation).
    pub anchored: bool,
    /// Label is followed by `:` or `=`.
    pub separated: bool,
    /// Text between this label and the next one (or the end of the line).
    pub value: String,
}

const BULLETS: &[char] = &['-', '•', '*', '>', '#', '|', '_', '`'];

/// Every label occurrence in `line`, in order.
pub fn scan_line(line: &str) -> Vec<LabelHit> {
    let matches: Vec<_> = LABEL.captures_iter(line).collect();
    let mut hits = Vec::with_capacity(matches.len());

    for (idx, caps) in matches.iter().enumerate() {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };

        let kind = if caps.name("user").is_some() {
            FieldKind::Username
        } else if caps.name("pass").is_some() {
            FieldKind::Password
        } else {
            FieldKind::Expiry
        };

        let value_end = matches
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(line.len());

        let prefix = &line[..whole.start()];
        let anchored = prefix.chars().all(|c| c.is_whitespace() || BULLETS.contains(&c));

        hits.push(LabelHit {
            kind,
            anchored,
            separated: caps.name("sep").is_some(),
            value: line[whole.end()..value_end].trim().to_string(),
        });
    }

    hits
}

/// Line is nothing but a label (optionally followed by a separator).
pub fn is_label_only(line: &str) -> Option<FieldKind> {
    let hits = scan_line(line);
    match hits.as_slice() {
        [hit] if hit.anchored && clean_token(&hit.value).is_none() => Some(hit.kind),
        _ => None,
    }
}

/// Line reads like a field label, known or not ("Plano:", "Senha").
pub fn looks_like_label(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    if scan_line(trimmed).iter().any(|hit| hit.anchored) {
        return true;
    }
    trimmed.ends_with(':') && trimmed.chars().count() <= 40
}

/// Token is itself one of the known label words.
pub fn is_label_word(token: &str) -> bool {
    scan_line(token)
        .first()
        .map(|hit| hit.anchored && hit.value.is_empty())
        .unwrap_or(false)
}

const WRAPPERS: &[char] = &['*', '_', '`', '"', '\'', '“', '”'];

/// First whitespace-separated token with markup and trailing list punctuation removed.
pub fn clean_token(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_start_matches(WRAPPERS).trim_start();
    let token = trimmed.split_whitespace().next()?;
    let token = token.trim_end_matches([',', ';']).trim_matches(WRAPPERS);
    if token.is_empty() || is_label_word(token) {
        None
    } else {
        Some(token.to_string())
    }
}

/// Expiry keeps the whole remainder (date plus time).
pub fn clean_expiry(value: &str) -> Option<String> {
    let cleaned = value
        .trim()
        .trim_matches(WRAPPERS)
        .trim_end_matches(['.', ',', ';'])
        .trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Clean a raw value according to the field it belongs to.
pub fn clean_value(kind: FieldKind, value: &str) -> Option<String> {
    match kind {
        FieldKind::Expiry => clean_expiry(value),
        FieldKind::Username | FieldKind::Password => clean_token(value),
    }
}
