use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    eligibility::{Eligibility, EligibilityChecker},
    locks::{SystemGuard, SystemLocks},
    queue::{AttemptOutcome, CancelOutcome, RenewalQueue},
};
use crate::{
    audit::{audit_record, AuditSink},
    config::RenewalConfig,
    error::{RenewalError, Result},
    extraction::ExtractionResult,
    panel::CredentialRenewer,
    partner::{ApiPoint, PartnerApi},
    storage::{
        models::{NewPoint, Point, PointSource, RenewalQueueItem, System, Trigger},
        Database,
    },
};

/// Counts from one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub systems_examined: usize,
    pub due: usize,
    pub enqueued: Vec<i64>,
    pub skipped_in_flight: usize,
    pub skipped_suppressed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ForceOutcome {
    Enqueued { item_id: i64 },
    AlreadyInFlight { item_id: i64 },
}

/// Owns the renewal queue: scans for systems nearing expiry, dispatches work
/// to a bounded pool and records outcomes.
pub struct RenewalController {
    config: RenewalConfig,
    db: Arc<Mutex<Database>>,
    queue: Mutex<RenewalQueue>,
    locks: SystemLocks,
    renewer: Arc<dyn CredentialRenewer>,
    audit: Arc<dyn AuditSink>,
    partner: Option<Arc<dyn PartnerApi>>,
    notify_partner: bool,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl RenewalController {
    pub fn new(
        config: RenewalConfig,
        db: Arc<Mutex<Database>>,
        locks: SystemLocks,
        renewer: Arc<dyn CredentialRenewer>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            config,
            db,
            queue: Mutex::new(RenewalQueue::new(1)),
            locks,
            renewer,
            audit,
            partner: None,
            notify_partner: false,
            workers,
            shutdown: CancellationToken::new(),
        }
    }

    /// Push renewed points to the partner API when `notify` is set.
    pub fn with_partner(mut self, partner: Arc<dyn PartnerApi>, notify: bool) -> Self {
        self.partner = Some(partner);
        self.notify_partner = notify;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Reload the persisted queue. Returns how many live items came back.
    pub async fn restore_from_db(&self) -> Result<usize> {
        let mut queue = self.queue.lock().await;
        let db = self.db.lock().await;

        let items = db.load_queue_items()?;
        let changed = queue.restore(items, Utc::now());
        for item in &changed {
            warn!("Queue item {} for system {} was interrupted by a restart", item.id, item.system_id);
            db.save_queue_item(item)?;
        }

        info!("Restored {} queued renewal(s)", queue.len());
        Ok(queue.len())
    }

    /// Enqueue every system whose nearest active point is inside the lead time.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ScanSummary> {
        let (systems, nearest) = {
            let db = self.db.lock().await;
            (db.list_systems()?.len(), db.get_nearest_expiries()?)
        };

        let checker = EligibilityChecker::new(self.config.lead_time_days);
        let mut summary = ScanSummary {
            systems_examined: systems,
            ..ScanSummary::default()
        };

        let mut queue = self.queue.lock().await;
        for (system, expiry) in nearest {
            match checker.evaluate(&system.id, expiry, &queue, now) {
                Eligibility::Due => {
                    summary.due += 1;
                    if let Ok(item) = queue.enqueue(&system.id, Trigger::Scan, Some(expiry), now) {
                        self.persist(&item).await?;
                        summary.enqueued.push(item.id);
                    }
                }
                Eligibility::InFlight => {
                    summary.due += 1;
                    summary.skipped_in_flight += 1;
                }
                Eligibility::Suppressed => {
                    summary.due += 1;
                    summary.skipped_suppressed += 1;
                }
                Eligibility::NotYetDue { .. } => {}
            }
        }

        info!(
            "Scan: {} systems, {} due, {} enqueued, {} in flight, {} suppressed",
            summary.systems_examined,
            summary.due,
            summary.enqueued.len(),
            summary.skipped_in_flight,
            summary.skipped_suppressed
        );
        Ok(summary)
    }

    /// Operator-triggered renewal, bypassing the lead-time filter.
    pub async fn force_renew(&self, system_id: &str) -> Result<ForceOutcome> {
        let now = Utc::now();
        let window = {
            let db = self.db.lock().await;
            if db.get_system(system_id)?.is_none() {
                return Err(RenewalError::SystemNotFound(system_id.to_string()));
            }
            db.get_active_points(system_id)?.iter().map(|p| p.expires_at).min()
        };

        let mut queue = self.queue.lock().await;
        match queue.enqueue(system_id, Trigger::Forced, window, now) {
            Ok(item) => {
                self.persist(&item).await?;
                info!("Forced renewal queued for system {} (item {})", system_id, item.id);
                Ok(ForceOutcome::Enqueued { item_id: item.id })
            }
            Err(in_flight) => {
                if let Some(item) = queue.expedite(system_id, now) {
                    self.persist(&item).await?;
                }
                debug!("System {} already has item {} in flight", system_id, in_flight.item_id);
                Ok(ForceOutcome::AlreadyInFlight {
                    item_id: in_flight.item_id,
                })
            }
        }
    }

    pub async fn cancel(&self, system_id: &str) -> Result<CancelOutcome> {
        let mut queue = self.queue.lock().await;
        let (outcome, item) = queue.cancel(system_id, Utc::now());
        if let Some(item) = item {
            self.persist(&item).await?;
        }
        info!("Cancel for system {}: {:?}", system_id, outcome);
        Ok(outcome)
    }

    pub async fn queue_status(&self) -> Vec<RenewalQueueItem> {
        self.queue.lock().await.items()
    }

    pub async fn processing_count(&self) -> usize {
        self.queue.lock().await.processing_count()
    }

    /// Retire terminal items older than the retention window.
    pub async fn purge_retired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::hours(self.config.retention_hours);
        let mut queue = self.queue.lock().await;
        let purged = queue.purge(cutoff);
        self.db.lock().await.delete_queue_items_before(cutoff)?;
        if purged > 0 {
            debug!("Retired {} terminal queue item(s)", purged);
        }
        Ok(purged)
    }

    /// Start every ready item that has a free worker and an unlocked system.
    pub async fn dispatch_ready(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let mut queue = self.queue.lock().await;

        for system_id in queue.ready(now) {
            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                debug!("Worker pool full, leaving remaining items for the next tick");
                break;
            };

            // Held by a reconciliation converge; try again next tick
            let Some(guard) = self.locks.try_lock(&system_id) else {
                debug!("System {} is locked, skipping this tick", system_id);
                continue;
            };

            let token = self.shutdown.child_token();
            let Some(item) = queue.start(&system_id, now) else {
                continue;
            };
            if let Err(e) = self.persist(&item).await {
                warn!("Failed to persist queue item {}: {}", item.id, e);
            }

            info!("Dispatching item {} for system {} (attempt {})", item.id, system_id, item.attempts);
            let controller = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                controller.process_item(item, guard, token).await;
            }));
        }

        handles
    }

    /// Dispatch whatever is ready and wait for those attempts to finish.
    pub async fn run_once(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let handles = self.dispatch_ready(now).await;
        let dispatched = handles.len();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Renewal task panicked: {}", e);
            }
        }
        dispatched
    }

    async fn process_item(&self, item: RenewalQueueItem, _guard: SystemGuard, cancel: CancellationToken) {
        let outcome = match self.attempt(&item, &cancel).await {
            Ok(point) => {
                info!(
                    "Renewed system {} with point {} (expires {})",
                    item.system_id, point.username, point.expires_at
                );
                AttemptOutcome::Succeeded
            }
            Err(e) => self.classify_failure(&item, &e),
        };

        let now = Utc::now();
        let mut queue = self.queue.lock().await;
        if let Some(updated) = queue.finish(&item.system_id, outcome, now) {
            if let Err(e) = self.persist(&updated).await {
                warn!("Failed to persist queue item {}: {}", updated.id, e);
            }
        }
    }

    async fn attempt(&self, item: &RenewalQueueItem, cancel: &CancellationToken) -> Result<Point> {
        let system = self
            .db
            .lock()
            .await
            .get_system(&item.system_id)?
            .ok_or_else(|| RenewalError::SystemNotFound(item.system_id.clone()))?;

        let result = self.renewer.renew(&system, cancel).await?;
        self.persist_success(&system, item, &result).await
    }

    fn classify_failure(&self, item: &RenewalQueueItem, err: &RenewalError) -> AttemptOutcome {
        let kind = err.kind();
        let mut reason = match err {
            RenewalError::Panel(panel) => panel.to_string(),
            other => other.to_string(),
        };

        let retry_at = if kind.is_retryable() && item.attempts < self.config.max_attempts {
            let delay = self.config.backoff_for(item.attempts);
            warn!(
                "Item {} for system {} failed ({}), retrying in {}s",
                item.id,
                item.system_id,
                reason,
                delay.as_secs()
            );
            Duration::from_std(delay).ok().map(|d| Utc::now() + d)
        } else {
            if kind.is_retryable() {
                reason = format!("{} (gave up after {} attempts)", reason, item.attempts);
            }
            if kind.needs_maintenance() {
                error!(
                    system = %item.system_id,
                    "Panel workflow changed, needs maintenance: {}", reason
                );
            } else {
                warn!("Item {} for system {} failed: {}", item.id, item.system_id, reason);
            }
            None
        };

        AttemptOutcome::Failed { kind, reason, retry_at }
    }

    async fn persist_success(&self, system: &System, item: &RenewalQueueItem, result: &ExtractionResult) -> Result<Point> {
        if let Err(e) = self.audit.record(&audit_record(&system.id, result)).await {
            warn!("Audit sink rejected record for system {}: {}", system.id, e);
        }

        let now = Utc::now();
        let expires_at = result
            .expires_at_parsed()
            .map(|naive| naive.and_utc())
            .unwrap_or_else(|| now + Duration::days(self.config.default_validity_days));

        let new_point = NewPoint {
            system_id: system.id.clone(),
            username: result.username.clone(),
            password: result.password.clone(),
            expires_at,
            source: PointSource::Local,
        };

        let mut point = {
            let db = self.db.lock().await;
            let supersedes: Vec<i64> = match item.expiry_window {
                Some(window) => db
                    .get_active_points(&system.id)?
                    .into_iter()
                    .filter(|p| p.expires_at <= window)
                    .map(|p| p.id)
                    .collect(),
                None => Vec::new(),
            };
            db.apply_renewal(&new_point, &supersedes, now)?
        };

        if self.notify_partner {
            if let Some(partner) = &self.partner {
                match partner.create_point(&ApiPoint::from_local(&point, &system.external_id)).await {
                    Ok(_) => {
                        self.db.lock().await.set_point_source(point.id, PointSource::Both)?;
                        point.source = PointSource::Both;
                    }
                    Err(e) => warn!("Partner push for point {} failed, kept local: {}", point.username, e),
                }
            }
        }

        Ok(point)
    }

    async fn persist(&self, item: &RenewalQueueItem) -> Result<()> {
        self.db.lock().await.save_queue_item(item)
    }

    /// Scheduling loop: scan, dispatch and retention ticks until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut scan_tick = tokio::time::interval(std::time::Duration::from_secs(self.config.scan_interval_secs));
        let mut dispatch_tick =
            tokio::time::interval(std::time::Duration::from_secs(self.config.dispatch_interval_secs.max(1)));
        let mut retention_tick = tokio::time::interval(std::time::Duration::from_secs(3600));

        info!(
            "Renewal loop started (scan every {}s, {} worker(s))",
            self.config.scan_interval_secs, self.config.max_workers
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = scan_tick.tick() => {
                    if let Err(e) = self.scan(Utc::now()).await {
                        warn!("Scan failed: {}", e);
                    }
                }
                _ = dispatch_tick.tick() => {
                    // Handles are not awaited; the pool permits bound concurrency
                    drop(self.dispatch_ready(Utc::now()).await);
                }
                _ = retention_tick.tick() => {
                    if let Err(e) = self.purge_retired(Utc::now()).await {
                        warn!("Queue retention failed: {}", e);
                    }
                }
            }
        }

        info!("Renewal loop stopping, waiting for running attempts");
        let _ = self.workers.acquire_many(self.config.max_workers.max(1) as u32).await;
        Ok(())
    }
}
