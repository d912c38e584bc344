use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::models::{Point, PointStatus};

/// A system as the partner platform reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSystem {
    pub external_id: String,
    pub active_points: u32,
    pub max_points: u32,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiPoint {
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// External id of the owning system.
    pub system_external_id: String,
    pub expires_at: DateTime<Utc>,
    pub status: PointStatus,
}

impl std::fmt::Debug for ApiPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiPoint")
            .field("username", &self.username)
            .field("system_external_id", &self.system_external_id)
            .field("expires_at", &self.expires_at)
            .field("status", &self.status)
            .finish()
    }
}

impl ApiPoint {
    pub fn from_local(point: &Point, system_external_id: &str) -> Self {
        Self {
            username: point.username.clone(),
            password: point.password.clone(),
            system_external_id: system_external_id.to_string(),
            expires_at: point.expires_at,
            status: point.status,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListEnvelope<T> {
    pub data: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: String,
}
