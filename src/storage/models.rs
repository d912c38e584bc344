use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::extraction::ExtractionMethod;

/// Externally hosted provisioning account.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct System {
    pub id: String,
    pub external_id: String,
    pub panel_username: String,
    #[serde(default, skip_serializing)]
    pub panel_password: String,
    pub active_points: u32,
    pub max_points: u32,
    pub last_renewed_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("id", &self.id)
            .field("external_id", &self.external_id)
            .field("panel_username", &self.panel_username)
            .field("active_points", &self.active_points)
            .field("max_points", &self.max_points)
            .field("last_renewed_at", &self.last_renewed_at)
            .finish()
    }
}

impl System {
    pub fn new(id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external_id: external_id.into(),
            panel_username: String::new(),
            panel_password: String::new(),
            active_points: 0,
            max_points: 0,
            last_renewed_at: None,
        }
    }

    pub fn with_panel_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.panel_username = username.into();
        self.panel_password = password.into();
        self
    }

    pub fn with_capacity(mut self, max_points: u32) -> Self {
        self.max_points = max_points;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PointSource {
    Local,
    Api,
    Both,
}

/// Access slot (credential) under a system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub id: i64,
    pub system_id: String,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    pub expires_at: DateTime<Utc>,
    pub status: PointStatus,
    pub source: PointSource,
    pub superseded_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Point about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPoint {
    pub system_id: String,
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
    pub source: PointSource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Processing,
    Completed,
    Error,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Error)
    }

    /// Terminal states are sinks; a failed attempt may drop back to waiting for a retry.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        match (self, next) {
            (QueueStatus::Waiting, QueueStatus::Processing) => true,
            (QueueStatus::Waiting, QueueStatus::Error) => true,
            (QueueStatus::Processing, QueueStatus::Waiting) => true,
            (QueueStatus::Processing, QueueStatus::Completed) => true,
            (QueueStatus::Processing, QueueStatus::Error) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scan,
    Forced,
}

/// One unit of renewal work for a system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenewalQueueItem {
    pub id: i64,
    pub system_id: String,
    pub status: QueueStatus,
    pub trigger: Trigger,
    /// Expiry of the point that caused the enqueue, if any.
    pub expiry_window: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub not_before: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub cancel_requested: bool,
}

impl RenewalQueueItem {
    pub fn new(
        id: i64,
        system_id: impl Into<String>,
        trigger: Trigger,
        expiry_window: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            system_id: system_id.into(),
            status: QueueStatus::Waiting,
            trigger,
            expiry_window,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
            not_before: now,
            attempts: 0,
            last_error: None,
            error_kind: None,
            cancel_requested: false,
        }
    }
}

/// Audit trail entry for one successful extraction. Raw text is never stored, only its digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub system_id: String,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    pub expires_at: Option<String>,
    pub method: ExtractionMethod,
    pub raw_digest: String,
    pub recorded_at: DateTime<Utc>,
}

macro_rules! snake_case_str {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($ty::$variant => write!(f, $s),)+
                }
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

snake_case_str!(PointStatus { Active => "active", Inactive => "inactive" });
snake_case_str!(PointSource { Local => "local", Api => "api", Both => "both" });
snake_case_str!(QueueStatus {
    Waiting => "waiting",
    Processing => "processing",
    Completed => "completed",
    Error => "error",
});
snake_case_str!(Trigger { Scan => "scan", Forced => "forced" });
