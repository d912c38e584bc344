//! Credential extraction from captured panel text.
//!
//! Pure and synchronous: a [`RawCapture`] goes in, an [`ExtractionResult`] or
//! [`ExtractionError::NotFound`] comes out. Strategies run from most to least
//! structurally confident and the first one that yields both a username and a
//! password wins.

pub mod heuristic;
pub mod labels;
pub mod pattern;
pub mod structured;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ExtractionError;
use labels::FieldKind;

/// Plain text captured from the panel (or any other capture front-end).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    text: String,
}

impl RawCapture {
    pub fn new(text: impl Into<String>) -> Self {
        let text: String = text.into();
        let normalized = text
            .replace("\r\n", "\n")
            .replace('\r', "\n")
            .replace(['\u{a0}', '\u{2007}', '\u{202f}'], " ")
            .lines()
            .map(|line| line.trim_end())
            .collect::<Vec<_>>()
            .join("\n");

        Self { text: normalized }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Hex SHA-256 of the normalized text, kept for audit instead of the text itself.
    pub fn digest(&self) -> String {
        format!("{:x}", Sha256::digest(self.text.as_bytes()))
    }
}

/// Which strategy produced the credentials, most confident first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Structured,
    LineHeuristic,
    BlindRegex,
}

impl ExtractionMethod {
    pub fn confidence(&self) -> u8 {
        match self {
            ExtractionMethod::Structured => 3,
            ExtractionMethod::LineHeuristic => 2,
            ExtractionMethod::BlindRegex => 1,
        }
    }
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionMethod::Structured => write!(f, "structured"),
            ExtractionMethod::LineHeuristic => write!(f, "line_heuristic"),
            ExtractionMethod::BlindRegex => write!(f, "blind_regex"),
        }
    }
}

impl std::str::FromStr for ExtractionMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "structured" => Ok(ExtractionMethod::Structured),
            "line_heuristic" => Ok(ExtractionMethod::LineHeuristic),
            "blind_regex" => Ok(ExtractionMethod::BlindRegex),
            other => Err(format!("unknown extraction method '{}'", other)),
        }
    }
}

/// Fields a single strategy pulled out of the text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    pub username: Option<String>,
    pub password: Option<String>,
    pub expires_at: Option<String>,
}

impl Fields {
    pub fn slot_mut(&mut self, kind: FieldKind) -> &mut Option<String> {
        match kind {
            FieldKind::Username => &mut self.username,
            FieldKind::Password => &mut self.password,
            FieldKind::Expiry => &mut self.expires_at,
        }
    }

    pub fn has_credentials(&self) -> bool {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => !user.is_empty() && !pass.is_empty() && user != pass,
            _ => false,
        }
    }
}

/// One tier of the extraction chain.
pub trait Strategy {
    fn method(&self) -> ExtractionMethod;
    fn extract(&self, capture: &RawCapture) -> Fields;
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionResult {
    pub username: String,
    pub password: String,
    pub expires_at: Option<String>,
    pub method: ExtractionMethod,
    pub raw_digest: String,
}

impl std::fmt::Debug for ExtractionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionResult")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("method", &self.method)
            .field("raw_digest", &self.raw_digest)
            .finish()
    }
}

const EXPIRY_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const EXPIRY_DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d"];

impl ExtractionResult {
    /// Parse the captured expiry text. Date-only values resolve to the end of that day.
    pub fn expires_at_parsed(&self) -> Option<NaiveDateTime> {
        let raw = self.expires_at.as_deref()?.trim();
        parse_expiry(raw)
    }
}

pub fn parse_expiry(raw: &str) -> Option<NaiveDateTime> {
    for fmt in EXPIRY_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    for fmt in EXPIRY_DATE_FORMATS {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(23, 59, 59);
        }
    }
    None
}

/// Run the strategy chain against one capture.
pub fn extract(capture: &RawCapture) -> Result<ExtractionResult, ExtractionError> {
    let chain: [&dyn Strategy; 3] = [
        &structured::StructuredScan,
        &heuristic::LineHeuristic,
        &pattern::BlindRegex,
    ];

    let mut attempted = Vec::with_capacity(chain.len());

    if capture.is_blank() {
        debug!("Capture is blank, nothing to extract");
        return Err(ExtractionError::NotFound { attempted });
    }

    for strategy in chain {
        let method = strategy.method();
        attempted.push(method);

        let fields = strategy.extract(capture);
        if !fields.has_credentials() {
            debug!("Strategy {} found no credential pair", method);
            continue;
        }

        // Expiry is supplementary; borrowing it from the date scan never changes the tier.
        let expires_at = fields.expires_at.or_else(|| pattern::find_expiry(capture.text()));

        debug!("Strategy {} matched", method);
        return Ok(ExtractionResult {
            username: fields.username.unwrap_or_default(),
            password: fields.password.unwrap_or_default(),
            expires_at,
            method,
            raw_digest: capture.digest(),
        });
    }

    Err(ExtractionError::NotFound { attempted })
}
