use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extraction::ExtractionMethod;

#[derive(Error, Debug)]
pub enum RenewalError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Partner API returned {status}: {message}")]
    PartnerApi { status: u16, message: String },

    #[error("Panel automation failed: {0}")]
    Panel(#[from] PanelError),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("System not found: {0}")]
    SystemNotFound(String),

    #[error("Point not found: {0}")]
    PointNotFound(String),

    #[error("System {0} already has renewal work in flight")]
    ConcurrencyConflict(String),

    #[error("Snapshot is stale: {0}")]
    StaleSnapshot(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RenewalError>;

/// Failures of one panel automation run.
///
/// The display strings end up verbatim in queue items as the operator-facing
/// reason, so they are kept short.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PanelError {
    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("navigation timed out: {0}")]
    NavigationTimeout(String),

    #[error("{0} action missing")]
    ActionNotFound(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("cancelled before generation")]
    Cancelled,

    #[error("browser transport error: {0}")]
    Transport(String),

    #[error("generation outcome unknown: {0}")]
    GenerationUncertain(String),
}

impl PanelError {
    /// Once generation was triggered the panel may already have spent a point,
    /// so transient failures past that step stop being retryable.
    pub fn after_generation(self) -> Self {
        match self {
            PanelError::NavigationTimeout(msg) | PanelError::Transport(msg) => PanelError::GenerationUncertain(msg),
            other => other,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("no credentials found (tried: {})", join_methods(.attempted))]
    NotFound { attempted: Vec<ExtractionMethod> },
}

fn join_methods(methods: &[ExtractionMethod]) -> String {
    if methods.is_empty() {
        return "nothing".to_string();
    }
    methods
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error taxonomy the renewal controller uses to decide retry vs terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    AuthenticationRequired,
    ActionNotFound,
    ExtractionFailed,
    ConcurrencyConflict,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientNetwork)
    }

    /// Kinds that mean the upstream panel workflow changed and somebody has to look at it.
    pub fn needs_maintenance(&self) -> bool {
        matches!(self, ErrorKind::ActionNotFound)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::AuthenticationRequired => "authentication_required",
            ErrorKind::ActionNotFound => "action_not_found",
            ErrorKind::ExtractionFailed => "extraction_failed",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient_network" => Ok(ErrorKind::TransientNetwork),
            "authentication_required" => Ok(ErrorKind::AuthenticationRequired),
            "action_not_found" => Ok(ErrorKind::ActionNotFound),
            "extraction_failed" => Ok(ErrorKind::ExtractionFailed),
            "concurrency_conflict" => Ok(ErrorKind::ConcurrencyConflict),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "internal" => Ok(ErrorKind::Internal),
            other => Err(format!("unknown error kind '{}'", other)),
        }
    }
}

impl PanelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PanelError::LoginFailed(_) => ErrorKind::AuthenticationRequired,
            PanelError::NavigationTimeout(_) => ErrorKind::TransientNetwork,
            PanelError::ActionNotFound(_) => ErrorKind::ActionNotFound,
            PanelError::ExtractionFailed(_) => ErrorKind::ExtractionFailed,
            PanelError::Cancelled => ErrorKind::Cancelled,
            PanelError::Transport(_) => ErrorKind::TransientNetwork,
            PanelError::GenerationUncertain(_) => ErrorKind::ExtractionFailed,
        }
    }
}

impl RenewalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RenewalError::Http(_) => ErrorKind::TransientNetwork,
            RenewalError::PartnerApi { status, .. } if *status >= 500 => ErrorKind::TransientNetwork,
            RenewalError::Panel(e) => e.kind(),
            RenewalError::Extraction(_) => ErrorKind::ExtractionFailed,
            RenewalError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            _ => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_kinds_retry() {
        assert!(PanelError::NavigationTimeout("login page".into()).kind().is_retryable());
        assert!(PanelError::Transport("reset".into()).kind().is_retryable());
        assert!(!PanelError::ActionNotFound("generate".into()).kind().is_retryable());
        assert!(!PanelError::LoginFailed("grace window lapsed".into()).kind().is_retryable());
        assert!(!PanelError::ExtractionFailed("empty".into()).kind().is_retryable());
        assert!(!PanelError::Cancelled.kind().is_retryable());
        assert!(!PanelError::GenerationUncertain("reset".into()).kind().is_retryable());
    }

    #[test]
    fn test_transient_failures_after_generation_are_final() {
        let err = PanelError::Transport("connection reset".into()).after_generation();
        assert_eq!(err, PanelError::GenerationUncertain("connection reset".into()));
        assert!(!err.kind().is_retryable());

        let timeout = PanelError::NavigationTimeout("result".into()).after_generation();
        assert!(matches!(timeout, PanelError::GenerationUncertain(_)));

        let missing = PanelError::ActionNotFound("confirm step 1".into());
        assert_eq!(missing.clone().after_generation(), missing);
    }

    #[test]
    fn test_action_not_found_reason() {
        let err = PanelError::ActionNotFound("generate".to_string());
        assert_eq!(err.to_string(), "generate action missing");
        assert!(err.kind().needs_maintenance());
    }

    #[test]
    fn test_partner_status_classification() {
        let server = RenewalError::PartnerApi { status: 503, message: "busy".into() };
        let client = RenewalError::PartnerApi { status: 422, message: "bad".into() };
        assert_eq!(server.kind(), ErrorKind::TransientNetwork);
        assert_eq!(client.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_not_found_lists_attempts() {
        let err = ExtractionError::NotFound {
            attempted: vec![ExtractionMethod::Structured, ExtractionMethod::BlindRegex],
        };
        assert_eq!(err.to_string(), "no credentials found (tried: structured, blind_regex)");
    }

    #[test]
    fn test_error_kind_round_trip() {
        for kind in [ErrorKind::TransientNetwork, ErrorKind::ActionNotFound, ErrorKind::Cancelled] {
            assert_eq!(kind.to_string().parse::<ErrorKind>(), Ok(kind));
        }
    }
}
