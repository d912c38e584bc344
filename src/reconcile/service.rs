use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{classify, ApiSnapshot, Classification, LocalSnapshot, ReconciliationEntry, Tolerances};
use crate::{
    config::ReconciliationConfig,
    error::{RenewalError, Result},
    partner::{ApiPoint, PartnerApi},
    renewal::SystemLocks,
    storage::{
        models::{NewPoint, Point, PointSource, PointStatus, System},
        Database,
    },
};

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub generated_at: DateTime<Utc>,
    pub local_taken_at: DateTime<Utc>,
    pub api_taken_at: DateTime<Utc>,
    pub entries: Vec<ReconciliationEntry>,
}

impl ReconciliationReport {
    pub fn count(&self, classification: Classification) -> usize {
        self.entries
            .iter()
            .filter(|e| e.classification == classification)
            .count()
    }

    pub fn divergent(&self) -> impl Iterator<Item = &ReconciliationEntry> {
        self.entries.iter().filter(|e| e.divergent)
    }
}

/// Compares the local store with the partner API and serves the latest
/// report. Reports only; converging is an explicit operator call.
pub struct ReconciliationService {
    config: ReconciliationConfig,
    db: Arc<Mutex<Database>>,
    partner: Arc<dyn PartnerApi>,
    locks: SystemLocks,
    cache: Mutex<Option<ReconciliationReport>>,
}

impl ReconciliationService {
    pub fn new(
        config: ReconciliationConfig,
        db: Arc<Mutex<Database>>,
        partner: Arc<dyn PartnerApi>,
        locks: SystemLocks,
    ) -> Self {
        Self {
            config,
            db,
            partner,
            locks,
            cache: Mutex::new(None),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(self.config.report_ttl_secs)
    }

    fn tolerances(&self) -> Tolerances {
        Tolerances {
            expiry_secs: self.config.expiry_tolerance_secs,
            count: self.config.count_tolerance,
        }
    }

    /// Cached report if still inside the TTL, otherwise a fresh one.
    pub async fn report(&self) -> Result<ReconciliationReport> {
        let now = Utc::now();
        if let Some(cached) = self.cache.lock().await.as_ref() {
            if now - cached.generated_at < self.ttl() {
                debug!("Serving cached reconciliation report");
                return Ok(cached.clone());
            }
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<ReconciliationReport> {
        let api = self.api_snapshot().await?;
        let local = self.local_snapshot().await?;
        let report = self.build_report(&local, &api, Utc::now())?;

        info!(
            "Reconciliation: {} entries, {} divergent, {} local only, {} api only",
            report.entries.len(),
            report.count(Classification::BothDivergent),
            report.count(Classification::LocalOnly),
            report.count(Classification::ApiOnly)
        );

        *self.cache.lock().await = Some(report.clone());
        Ok(report)
    }

    /// Classify two snapshots, refusing either one if it is older than the TTL.
    pub fn build_report(&self, local: &LocalSnapshot, api: &ApiSnapshot, now: DateTime<Utc>) -> Result<ReconciliationReport> {
        for (side, taken_at) in [("local", local.taken_at), ("api", api.taken_at)] {
            if now - taken_at > self.ttl() {
                return Err(RenewalError::StaleSnapshot(format!(
                    "{} snapshot taken at {} is older than {}s",
                    side,
                    taken_at.to_rfc3339(),
                    self.config.report_ttl_secs
                )));
            }
        }

        Ok(ReconciliationReport {
            generated_at: now,
            local_taken_at: local.taken_at,
            api_taken_at: api.taken_at,
            entries: classify(local, api, self.tolerances()),
        })
    }

    async fn local_snapshot(&self) -> Result<LocalSnapshot> {
        let db = self.db.lock().await;
        Ok(LocalSnapshot {
            taken_at: Utc::now(),
            systems: db.list_systems()?,
            points: db.list_points()?,
        })
    }

    async fn api_snapshot(&self) -> Result<ApiSnapshot> {
        let taken_at = Utc::now();
        let systems = self.partner.list_systems().await?;
        let points = self.partner.list_points().await?;
        Ok(ApiSnapshot {
            taken_at,
            systems,
            points,
        })
    }

    async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Local point to the partner API: update if it exists there, create otherwise.
    pub async fn push_point(&self, username: &str) -> Result<ApiPoint> {
        let (_, system) = self.local_point(username).await?;
        let _guard = self.locks.lock(&system.id).await;
        // A renewal may have committed while we waited
        let (point, system) = self.local_point(username).await?;

        let exists = self
            .partner
            .list_points()
            .await?
            .iter()
            .any(|p| p.username == username);

        let payload = ApiPoint::from_local(&point, &system.external_id);
        let pushed = if exists {
            self.partner.update_point(&payload).await?
        } else {
            self.partner.create_point(&payload).await?
        };

        self.db.lock().await.set_point_source(point.id, PointSource::Both)?;
        self.invalidate().await;

        info!("Pushed point {} to partner API ({})", username, if exists { "updated" } else { "created" });
        Ok(pushed)
    }

    /// Partner API point into the local store, under its system's lock.
    pub async fn pull_point(&self, username: &str) -> Result<Point> {
        let remote = self
            .partner
            .list_points()
            .await?
            .into_iter()
            .find(|p| p.username == username)
            .ok_or_else(|| RenewalError::PointNotFound(username.to_string()))?;

        let system = self
            .db
            .lock()
            .await
            .get_system_by_external_id(&remote.system_external_id)?
            .ok_or_else(|| RenewalError::SystemNotFound(remote.system_external_id.clone()))?;

        let _guard = self.locks.lock(&system.id).await;
        let db = self.db.lock().await;

        let id = match db.get_latest_point_by_username(username)? {
            Some(existing) => {
                let password = if remote.password.is_empty() {
                    existing.password.clone()
                } else {
                    remote.password.clone()
                };
                db.update_point(existing.id, &password, remote.expires_at, remote.status, PointSource::Both)?;
                existing.id
            }
            None => {
                let inserted = db.insert_point(&NewPoint {
                    system_id: system.id.clone(),
                    username: remote.username.clone(),
                    password: remote.password.clone(),
                    expires_at: remote.expires_at,
                    source: PointSource::Api,
                })?;
                if remote.status == PointStatus::Inactive {
                    db.update_point(inserted.id, &inserted.password, inserted.expires_at, PointStatus::Inactive, PointSource::Api)?;
                }
                inserted.id
            }
        };

        let point = db
            .get_point(id)?
            .ok_or_else(|| RenewalError::PointNotFound(username.to_string()))?;
        drop(db);
        self.invalidate().await;

        info!("Pulled point {} from partner API into system {}", username, system.id);
        Ok(point)
    }

    /// Adopt the partner API's point counts for one system.
    pub async fn pull_system_counts(&self, external_id: &str) -> Result<System> {
        let remote = self
            .partner
            .list_systems()
            .await?
            .into_iter()
            .find(|s| s.external_id == external_id)
            .ok_or_else(|| RenewalError::SystemNotFound(external_id.to_string()))?;

        let system_id = self
            .db
            .lock()
            .await
            .get_system_by_external_id(external_id)?
            .map(|s| s.id)
            .ok_or_else(|| RenewalError::SystemNotFound(external_id.to_string()))?;

        let _guard = self.locks.lock(&system_id).await;
        let system = {
            let db = self.db.lock().await;
            db.set_system_counts(&system_id, remote.active_points, remote.max_points)?;
            db.get_system(&system_id)?
                .ok_or_else(|| RenewalError::SystemNotFound(external_id.to_string()))?
        };
        self.invalidate().await;

        info!(
            "Pulled counts for system {}: {}/{} points",
            external_id, system.active_points, system.max_points
        );
        Ok(system)
    }

    /// Refresh the report every `interval_secs` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("Reconciliation cycle failed: {}", e);
                    }
                }
            }
        }
        debug!("Reconciliation loop stopped");
    }

    async fn local_point(&self, username: &str) -> Result<(Point, System)> {
        let db = self.db.lock().await;
        let point = db
            .get_latest_point_by_username(username)?
            .ok_or_else(|| RenewalError::PointNotFound(username.to_string()))?;
        let system = db
            .get_system(&point.system_id)?
            .ok_or_else(|| RenewalError::SystemNotFound(point.system_id.clone()))?;
        Ok((point, system))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partner::{ApiSystem, MockPartnerApi};

    fn service(db: Database, partner: MockPartnerApi) -> ReconciliationService {
        ReconciliationService::new(
            ReconciliationConfig::default(),
            Arc::new(Mutex::new(db)),
            Arc::new(partner),
            SystemLocks::new(),
        )
    }

    #[test]
    fn test_stale_snapshot_refused() {
        let svc = service(Database::in_memory().unwrap(), MockPartnerApi::new());
        let now = Utc::now();
        let local = LocalSnapshot {
            taken_at: now,
            systems: vec![],
            points: vec![],
        };
        let api = ApiSnapshot {
            taken_at: now - Duration::hours(2),
            systems: vec![],
            points: vec![],
        };

        let err = svc.build_report(&local, &api, now).unwrap_err();
        assert!(matches!(err, RenewalError::StaleSnapshot(_)));
    }

    #[tokio::test]
    async fn test_report_is_cached_within_ttl() {
        let mut partner = MockPartnerApi::new();
        partner.expect_list_systems().times(1).returning(|| Ok(vec![]));
        partner.expect_list_points().times(1).returning(|| Ok(vec![]));

        let svc = service(Database::in_memory().unwrap(), partner);
        svc.report().await.unwrap();
        svc.report().await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_point_inserts_under_system() {
        let db = Database::in_memory().unwrap();
        db.save_system(&System::new("sys-1", "EXT-1")).unwrap();

        let expires = Utc::now() + Duration::days(10);
        let mut partner = MockPartnerApi::new();
        partner.expect_list_points().returning(move || {
            Ok(vec![ApiPoint {
                username: "U9".to_string(),
                password: "remote-pw".to_string(),
                system_external_id: "EXT-1".to_string(),
                expires_at: expires,
                status: PointStatus::Active,
            }])
        });

        let svc = service(db, partner);
        let point = svc.pull_point("U9").await.unwrap();
        assert_eq!(point.system_id, "sys-1");
        assert_eq!(point.source, PointSource::Api);

        let missing = svc.pull_point("nobody").await.unwrap_err();
        assert!(matches!(missing, RenewalError::PointNotFound(_)));
    }

    #[tokio::test]
    async fn test_pull_system_counts() {
        let db = Database::in_memory().unwrap();
        db.save_system(&System::new("sys-1", "EXT-1").with_capacity(2)).unwrap();

        let mut partner = MockPartnerApi::new();
        partner.expect_list_systems().returning(|| {
            Ok(vec![ApiSystem {
                external_id: "EXT-1".to_string(),
                active_points: 4,
                max_points: 6,
            }])
        });

        let svc = service(db, partner);
        let system = svc.pull_system_counts("EXT-1").await.unwrap();
        assert_eq!(system.active_points, 4);
        assert_eq!(system.max_points, 6);
    }

    #[tokio::test]
    async fn test_pull_counts_keeps_renewal_committed_while_waiting() {
        let db = Database::in_memory().unwrap();
        db.save_system(&System::new("sys-1", "EXT-1").with_capacity(2)).unwrap();
        let db = Arc::new(Mutex::new(db));

        let mut partner = MockPartnerApi::new();
        partner.expect_list_systems().returning(|| {
            Ok(vec![ApiSystem {
                external_id: "EXT-1".to_string(),
                active_points: 4,
                max_points: 6,
            }])
        });

        let locks = SystemLocks::new();
        let svc = Arc::new(ReconciliationService::new(
            ReconciliationConfig::default(),
            db.clone(),
            Arc::new(partner),
            locks.clone(),
        ));

        // A renewal owns the system while the pull is requested
        let guard = locks.lock("sys-1").await;
        let pull = tokio::spawn({
            let svc = svc.clone();
            async move { svc.pull_system_counts("EXT-1").await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let renewed_at = Utc::now();
        db.lock()
            .await
            .apply_renewal(
                &NewPoint {
                    system_id: "sys-1".to_string(),
                    username: "fresh".to_string(),
                    password: "pw".to_string(),
                    expires_at: renewed_at + Duration::days(30),
                    source: PointSource::Local,
                },
                &[],
                renewed_at,
            )
            .unwrap();
        drop(guard);

        let system = pull.await.unwrap().unwrap();
        assert_eq!(system.active_points, 4);
        assert_eq!(system.max_points, 6);
        assert!(system.last_renewed_at.is_some());

        let stored = db.lock().await.get_system("sys-1").unwrap().unwrap();
        assert!(stored.last_renewed_at.is_some());
        assert_eq!(stored.max_points, 6);
    }

    #[tokio::test]
    async fn test_push_sends_point_renewed_while_waiting() {
        let db = Database::in_memory().unwrap();
        db.save_system(&System::new("sys-1", "EXT-1")).unwrap();
        let old_expiry = Utc::now() + Duration::days(1);
        db.insert_point(&NewPoint {
            system_id: "sys-1".to_string(),
            username: "U1".to_string(),
            password: "old-pw".to_string(),
            expires_at: old_expiry,
            source: PointSource::Local,
        })
        .unwrap();
        let db = Arc::new(Mutex::new(db));

        let mut partner = MockPartnerApi::new();
        partner.expect_list_points().returning(|| Ok(vec![]));
        partner
            .expect_create_point()
            .times(1)
            .withf(|point| point.password == "new-pw")
            .returning(|point| Ok(point.clone()));

        let locks = SystemLocks::new();
        let svc = Arc::new(ReconciliationService::new(
            ReconciliationConfig::default(),
            db.clone(),
            Arc::new(partner),
            locks.clone(),
        ));

        let guard = locks.lock("sys-1").await;
        let push = tokio::spawn({
            let svc = svc.clone();
            async move { svc.push_point("U1").await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let now = Utc::now();
        db.lock()
            .await
            .apply_renewal(
                &NewPoint {
                    system_id: "sys-1".to_string(),
                    username: "U1".to_string(),
                    password: "new-pw".to_string(),
                    expires_at: now + Duration::days(30),
                    source: PointSource::Local,
                },
                &[],
                now,
            )
            .unwrap();
        drop(guard);

        push.await.unwrap().unwrap();
        let latest = db.lock().await.get_latest_point_by_username("U1").unwrap().unwrap();
        assert_eq!(latest.password, "new-pw");
        assert_eq!(latest.source, PointSource::Both);
    }
}
