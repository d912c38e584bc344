//! Hand-written fakes shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use point_renewal_bot::{
    audit::TracingAuditSink,
    config::RenewalConfig,
    error::{PanelError, RenewalError, Result},
    extraction::{extract, ExtractionResult, RawCapture},
    panel::CredentialRenewer,
    partner::{ApiPoint, ApiSystem, PartnerApi},
    renewal::{RenewalController, SystemLocks},
    storage::{
        models::{NewPoint, PointSource, System},
        Database,
    },
};

pub const SCENARIO_CAPTURE: &str = "USUÁRIO: 1234567890\nSENHA: AB12CD34\nVENCIMENTO: 10/10/2025 10:00:00";

pub fn renewed(username: &str) -> ExtractionResult {
    extract(&RawCapture::new(format!(
        "USUÁRIO: {}\nSENHA: AB12CD34\nVENCIMENTO: 10/10/2030 10:00:00",
        username
    )))
    .unwrap()
}

pub fn db_with_system(system_id: &str, external_id: &str, expires_at: DateTime<Utc>) -> Database {
    let db = Database::in_memory().unwrap();
    add_system(&db, system_id, external_id, expires_at);
    db
}

pub fn add_system(db: &Database, system_id: &str, external_id: &str, expires_at: DateTime<Utc>) {
    db.save_system(
        &System::new(system_id, external_id)
            .with_panel_credentials("reseller", "secret")
            .with_capacity(5),
    )
    .unwrap();
    db.insert_point(&NewPoint {
        system_id: system_id.to_string(),
        username: format!("{}-old", system_id),
        password: "old-pass".to_string(),
        expires_at,
        source: PointSource::Local,
    })
    .unwrap();
}

pub fn renewal_config() -> RenewalConfig {
    RenewalConfig {
        lead_time_days: 3,
        max_workers: 4,
        max_attempts: 3,
        ..RenewalConfig::default()
    }
}

pub fn controller(
    config: RenewalConfig,
    db: Arc<Mutex<Database>>,
    renewer: Arc<dyn CredentialRenewer>,
) -> Arc<RenewalController> {
    Arc::new(RenewalController::new(
        config,
        db,
        SystemLocks::new(),
        renewer,
        Arc::new(TracingAuditSink),
    ))
}

/// Replays a fixed list of outcomes, one per attempt.
pub struct ScriptedRenewer {
    script: std::sync::Mutex<VecDeque<std::result::Result<ExtractionResult, PanelError>>>,
    calls: AtomicUsize,
}

impl ScriptedRenewer {
    pub fn new(outcomes: Vec<std::result::Result<ExtractionResult, PanelError>>) -> Self {
        Self {
            script: std::sync::Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialRenewer for ScriptedRenewer {
    async fn renew(
        &self,
        _system: &System,
        _cancel: &CancellationToken,
    ) -> std::result::Result<ExtractionResult, PanelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PanelError::Transport("script exhausted".to_string())))
    }
}

/// Blocks every attempt until released, so a test can observe the processing state.
pub struct GatedRenewer {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GatedRenewer {
    pub fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl CredentialRenewer for GatedRenewer {
    async fn renew(
        &self,
        _system: &System,
        _cancel: &CancellationToken,
    ) -> std::result::Result<ExtractionResult, PanelError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(renewed("5550001111"))
    }
}

/// Records how many attempts run at once for each system.
#[derive(Default)]
pub struct OverlapRenewer {
    running: std::sync::Mutex<HashMap<String, usize>>,
    pub max_overlap: AtomicUsize,
    pub calls: AtomicUsize,
}

#[async_trait]
impl CredentialRenewer for OverlapRenewer {
    async fn renew(
        &self,
        system: &System,
        _cancel: &CancellationToken,
    ) -> std::result::Result<ExtractionResult, PanelError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut running = self.running.lock().unwrap();
            let count = running.entry(system.id.clone()).or_insert(0);
            *count += 1;
            self.max_overlap.fetch_max(*count, Ordering::SeqCst);
        }

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        if let Some(count) = self.running.lock().unwrap().get_mut(&system.id) {
            *count -= 1;
        }
        Ok(renewed(&format!("{:010}", n)))
    }
}

/// In-memory partner platform.
#[derive(Default)]
pub struct FakePartner {
    pub systems: std::sync::Mutex<Vec<ApiSystem>>,
    pub points: std::sync::Mutex<Vec<ApiPoint>>,
    pub writes: AtomicUsize,
}

impl FakePartner {
    pub fn with(systems: Vec<ApiSystem>, points: Vec<ApiPoint>) -> Self {
        Self {
            systems: std::sync::Mutex::new(systems),
            points: std::sync::Mutex::new(points),
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PartnerApi for FakePartner {
    async fn list_systems(&self) -> Result<Vec<ApiSystem>> {
        Ok(self.systems.lock().unwrap().clone())
    }

    async fn list_points(&self) -> Result<Vec<ApiPoint>> {
        Ok(self.points.lock().unwrap().clone())
    }

    async fn create_point(&self, point: &ApiPoint) -> Result<ApiPoint> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut points = self.points.lock().unwrap();
        if points.iter().any(|p| p.username == point.username) {
            return Err(RenewalError::PartnerApi {
                status: 409,
                message: "point exists".to_string(),
            });
        }
        points.push(point.clone());
        Ok(point.clone())
    }

    async fn update_point(&self, point: &ApiPoint) -> Result<ApiPoint> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut points = self.points.lock().unwrap();
        match points.iter_mut().find(|p| p.username == point.username) {
            Some(existing) => {
                *existing = point.clone();
                Ok(point.clone())
            }
            None => Err(RenewalError::PartnerApi {
                status: 404,
                message: "no such point".to_string(),
            }),
        }
    }
}

pub fn in_days(days: i64) -> DateTime<Utc> {
    Utc::now() + Duration::days(days)
}
