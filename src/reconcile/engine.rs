use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::partner::{ApiPoint, ApiSystem};
use crate::storage::models::{Point, PointStatus, System};

/// Identity shared by both sides: systems by external id, points by username.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityKey {
    System(String),
    Point(String),
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::System(id) => write!(f, "system:{}", id),
            EntityKey::Point(username) => write!(f, "point:{}", username),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    LocalOnly,
    ApiOnly,
    BothInSync,
    BothDivergent,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Classification::LocalOnly => "local_only",
            Classification::ApiOnly => "api_only",
            Classification::BothInSync => "both_in_sync",
            Classification::BothDivergent => "both_divergent",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDivergence {
    pub field: String,
    pub local: String,
    pub api: String,
}

impl FieldDivergence {
    fn new(field: &str, local: impl ToString, api: impl ToString) -> Self {
        Self {
            field: field.to_string(),
            local: local.to_string(),
            api: api.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationEntry {
    pub key: EntityKey,
    pub classification: Classification,
    pub divergent: bool,
    pub fields: Vec<FieldDivergence>,
}

/// Local store as read at `taken_at`.
#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    pub taken_at: DateTime<Utc>,
    pub systems: Vec<System>,
    pub points: Vec<Point>,
}

/// Partner API as read at `taken_at`.
#[derive(Debug, Clone)]
pub struct ApiSnapshot {
    pub taken_at: DateTime<Utc>,
    pub systems: Vec<ApiSystem>,
    pub points: Vec<ApiPoint>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tolerances {
    pub expiry_secs: i64,
    pub count: u32,
}

/// Compared view of one side's point.
struct PointView {
    system: String,
    expires_at: DateTime<Utc>,
    status: PointStatus,
}

enum Sides<'a> {
    System(Option<&'a System>, Option<&'a ApiSystem>),
    Point(Option<PointView>, Option<PointView>),
}

/// Classify every entity on either side, sorted by key.
pub fn classify(local: &LocalSnapshot, api: &ApiSnapshot, tolerances: Tolerances) -> Vec<ReconciliationEntry> {
    let external_ids: HashMap<&str, &str> = local
        .systems
        .iter()
        .map(|s| (s.id.as_str(), s.external_id.as_str()))
        .collect();

    let mut sides: BTreeMap<EntityKey, Sides> = BTreeMap::new();

    for system in &local.systems {
        sides.insert(EntityKey::System(system.external_id.clone()), Sides::System(Some(system), None));
    }
    for system in &api.systems {
        let key = EntityKey::System(system.external_id.clone());
        match sides.get_mut(&key) {
            Some(Sides::System(_, api_side)) => *api_side = Some(system),
            _ => {
                sides.insert(key, Sides::System(None, Some(system)));
            }
        }
    }

    // Usernames can repeat across superseded rows; the newest row speaks for the point
    let mut latest: BTreeMap<&str, &Point> = BTreeMap::new();
    for point in &local.points {
        let newer = latest.get(point.username.as_str()).map_or(true, |seen| point.id > seen.id);
        if newer {
            latest.insert(point.username.as_str(), point);
        }
    }
    for (username, point) in latest {
        let view = PointView {
            system: external_ids
                .get(point.system_id.as_str())
                .map_or_else(|| point.system_id.clone(), |ext| ext.to_string()),
            expires_at: point.expires_at,
            status: point.status,
        };
        sides.insert(EntityKey::Point(username.to_string()), Sides::Point(Some(view), None));
    }
    for point in &api.points {
        let view = PointView {
            system: point.system_external_id.clone(),
            expires_at: point.expires_at,
            status: point.status,
        };
        let key = EntityKey::Point(point.username.clone());
        match sides.get_mut(&key) {
            Some(Sides::Point(_, api_side)) => *api_side = Some(view),
            _ => {
                sides.insert(key, Sides::Point(None, Some(view)));
            }
        }
    }

    sides
        .into_iter()
        .map(|(key, side)| {
            let (present, fields) = match side {
                Sides::System(l, a) => ((l.is_some(), a.is_some()), compare_systems(l, a, tolerances)),
                Sides::Point(l, a) => (
                    (l.is_some(), a.is_some()),
                    compare_points(l.as_ref(), a.as_ref(), tolerances),
                ),
            };

            let classification = match present {
                (true, false) => Classification::LocalOnly,
                (false, true) => Classification::ApiOnly,
                _ if fields.is_empty() => Classification::BothInSync,
                _ => Classification::BothDivergent,
            };

            ReconciliationEntry {
                key,
                classification,
                divergent: classification == Classification::BothDivergent,
                fields,
            }
        })
        .collect()
}

fn compare_systems(local: Option<&System>, api: Option<&ApiSystem>, tolerances: Tolerances) -> Vec<FieldDivergence> {
    let (Some(local), Some(api)) = (local, api) else {
        return Vec::new();
    };

    let mut fields = Vec::new();
    if local.active_points.abs_diff(api.active_points) > tolerances.count {
        fields.push(FieldDivergence::new("active_points", local.active_points, api.active_points));
    }
    if local.max_points != api.max_points {
        fields.push(FieldDivergence::new("max_points", local.max_points, api.max_points));
    }
    fields
}

fn compare_points(local: Option<&PointView>, api: Option<&PointView>, tolerances: Tolerances) -> Vec<FieldDivergence> {
    let (Some(local), Some(api)) = (local, api) else {
        return Vec::new();
    };

    let mut fields = Vec::new();
    if (local.expires_at - api.expires_at).num_seconds().abs() > tolerances.expiry_secs {
        fields.push(FieldDivergence::new(
            "expires_at",
            local.expires_at.to_rfc3339(),
            api.expires_at.to_rfc3339(),
        ));
    }
    if local.status != api.status {
        fields.push(FieldDivergence::new("status", local.status, api.status));
    }
    if local.system != api.system {
        fields.push(FieldDivergence::new("system", &local.system, &api.system));
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::PointSource;
    use chrono::Duration;

    fn point(id: i64, username: &str, expires_at: DateTime<Utc>) -> Point {
        let now = Utc::now();
        Point {
            id,
            system_id: "sys-1".to_string(),
            username: username.to_string(),
            password: "pw".to_string(),
            expires_at,
            status: PointStatus::Active,
            source: PointSource::Local,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn api_point(username: &str, expires_at: DateTime<Utc>) -> ApiPoint {
        ApiPoint {
            username: username.to_string(),
            password: String::new(),
            system_external_id: "EXT-1".to_string(),
            expires_at,
            status: PointStatus::Active,
        }
    }

    #[test]
    fn test_point_tolerance() {
        let now = Utc::now();
        let local = LocalSnapshot {
            taken_at: now,
            systems: vec![System::new("sys-1", "EXT-1")],
            points: vec![point(1, "U1", now), point(2, "U2", now)],
        };
        let api = ApiSnapshot {
            taken_at: now,
            systems: vec![],
            points: vec![
                api_point("U1", now + Duration::seconds(30)),
                api_point("U2", now + Duration::days(1)),
            ],
        };

        let entries = classify(&local, &api, Tolerances { expiry_secs: 60, count: 0 });
        let by_key: HashMap<_, _> = entries.iter().map(|e| (e.key.clone(), e)).collect();

        assert_eq!(by_key[&EntityKey::Point("U1".into())].classification, Classification::BothInSync);
        let u2 = by_key[&EntityKey::Point("U2".into())];
        assert_eq!(u2.classification, Classification::BothDivergent);
        assert_eq!(u2.fields[0].field, "expires_at");
        assert_eq!(by_key[&EntityKey::System("EXT-1".into())].classification, Classification::LocalOnly);
    }

    #[test]
    fn test_newest_local_row_wins() {
        let now = Utc::now();
        let mut old = point(1, "U1", now - Duration::days(30));
        old.status = PointStatus::Inactive;
        let local = LocalSnapshot {
            taken_at: now,
            systems: vec![System::new("sys-1", "EXT-1")],
            points: vec![point(5, "U1", now), old],
        };
        let api = ApiSnapshot {
            taken_at: now,
            systems: vec![],
            points: vec![api_point("U1", now)],
        };

        let entries = classify(&local, &api, Tolerances::default());
        let u1 = entries.iter().find(|e| e.key == EntityKey::Point("U1".into())).unwrap();
        assert_eq!(u1.classification, Classification::BothInSync);
    }

    #[test]
    fn test_sorted_by_key() {
        let now = Utc::now();
        let local = LocalSnapshot {
            taken_at: now,
            systems: vec![System::new("b", "EXT-B"), System::new("a", "EXT-A")],
            points: vec![],
        };
        let api = ApiSnapshot {
            taken_at: now,
            systems: vec![],
            points: vec![api_point("zz", now), api_point("aa", now)],
        };

        let keys: Vec<String> = classify(&local, &api, Tolerances::default())
            .iter()
            .map(|e| e.key.to_string())
            .collect();
        assert_eq!(keys, vec!["system:EXT-A", "system:EXT-B", "point:aa", "point:zz"]);
    }
}
