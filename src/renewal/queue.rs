use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::error::ErrorKind;
use crate::storage::models::{QueueStatus, RenewalQueueItem, Trigger};

/// Item already waiting or processing for the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyInFlight {
    pub item_id: i64,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Waiting item retired before it ever ran.
    Cancelled { item_id: i64 },
    /// Item is running; the request applies once the attempt ends.
    Deferred { item_id: i64 },
    NothingQueued,
}

/// How a finished attempt went, as far as the queue is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed {
        kind: ErrorKind,
        reason: String,
        retry_at: Option<DateTime<Utc>>,
    },
}

/// Renewal work keyed by system id. At most one non-terminal item exists per
/// system, so at most one can be processing.
pub struct RenewalQueue {
    active: HashMap<String, RenewalQueueItem>,
    retired: Vec<RenewalQueueItem>,
    next_id: i64,
}

impl RenewalQueue {
    pub fn new(next_id: i64) -> Self {
        Self {
            active: HashMap::new(),
            retired: Vec::new(),
            next_id: next_id.max(1),
        }
    }

    /// Rebuild from persisted items. Items left processing by a previous run
    /// are closed as errors; the returned items need persisting again.
    pub fn restore(&mut self, items: Vec<RenewalQueueItem>, now: DateTime<Utc>) -> Vec<RenewalQueueItem> {
        let mut changed = Vec::new();

        for mut item in items {
            self.next_id = self.next_id.max(item.id + 1);

            match item.status {
                QueueStatus::Processing => {
                    item.status = QueueStatus::Error;
                    item.completed_at = Some(now);
                    item.last_error = Some("interrupted by restart".to_string());
                    item.error_kind = Some(ErrorKind::Internal);
                    changed.push(item.clone());
                    self.retired.push(item);
                }
                QueueStatus::Waiting if !self.active.contains_key(&item.system_id) => {
                    self.active.insert(item.system_id.clone(), item);
                }
                QueueStatus::Waiting => {
                    item.status = QueueStatus::Error;
                    item.completed_at = Some(now);
                    item.last_error = Some("duplicate waiting item dropped on restore".to_string());
                    item.error_kind = Some(ErrorKind::ConcurrencyConflict);
                    changed.push(item.clone());
                    self.retired.push(item);
                }
                QueueStatus::Completed | QueueStatus::Error => self.retired.push(item),
            }
        }

        changed
    }

    pub fn get(&self, system_id: &str) -> Option<&RenewalQueueItem> {
        self.active.get(system_id)
    }

    pub fn is_in_flight(&self, system_id: &str) -> bool {
        self.active.contains_key(system_id)
    }

    pub fn is_suppressed(&self, system_id: &str, window: DateTime<Utc>) -> bool {
        self.retired
            .iter()
            .any(|item| item.system_id == system_id && item.expiry_window == Some(window))
    }

    pub fn enqueue(
        &mut self,
        system_id: &str,
        trigger: Trigger,
        expiry_window: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<RenewalQueueItem, AlreadyInFlight> {
        if let Some(existing) = self.active.get(system_id) {
            return Err(AlreadyInFlight { item_id: existing.id });
        }

        let item = RenewalQueueItem::new(self.next_id, system_id, trigger, expiry_window, now);
        self.next_id += 1;

        debug!("Enqueued item {} for system {} ({})", item.id, system_id, trigger);
        self.active.insert(system_id.to_string(), item.clone());
        Ok(item)
    }

    /// Pull a waiting item's backoff forward so it runs on the next dispatch.
    pub fn expedite(&mut self, system_id: &str, now: DateTime<Utc>) -> Option<RenewalQueueItem> {
        let item = self.active.get_mut(system_id)?;
        if item.status != QueueStatus::Waiting || item.not_before <= now {
            return None;
        }
        item.not_before = now;
        Some(item.clone())
    }

    /// Waiting systems whose backoff has elapsed, oldest first.
    pub fn ready(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut ready: Vec<&RenewalQueueItem> = self
            .active
            .values()
            .filter(|item| item.status == QueueStatus::Waiting && item.not_before <= now)
            .collect();
        ready.sort_by_key(|item| (item.not_before, item.id));
        ready.into_iter().map(|item| item.system_id.clone()).collect()
    }

    pub fn processing_count(&self) -> usize {
        self.active
            .values()
            .filter(|item| item.status == QueueStatus::Processing)
            .count()
    }

    /// Move a waiting item to processing.
    pub fn start(&mut self, system_id: &str, now: DateTime<Utc>) -> Option<RenewalQueueItem> {
        let item = self.active.get_mut(system_id)?;
        if !item.status.can_transition_to(QueueStatus::Processing) {
            return None;
        }

        item.status = QueueStatus::Processing;
        item.started_at = Some(now);
        item.attempts += 1;
        Some(item.clone())
    }

    /// Record the end of an attempt. Returns the item in its new state.
    pub fn finish(
        &mut self,
        system_id: &str,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Option<RenewalQueueItem> {
        let mut item = self.active.remove(system_id)?;
        if item.status != QueueStatus::Processing {
            self.active.insert(system_id.to_string(), item);
            return None;
        }

        match outcome {
            AttemptOutcome::Succeeded => {
                item.status = QueueStatus::Completed;
                item.completed_at = Some(now);
                item.last_error = None;
                item.error_kind = None;
            }
            AttemptOutcome::Failed { kind, reason, .. } if item.cancel_requested => {
                item.status = QueueStatus::Error;
                item.completed_at = Some(now);
                item.last_error = Some(format!("cancelled after failed attempt: {}", reason));
                item.error_kind = Some(kind);
            }
            AttemptOutcome::Failed {
                kind,
                reason,
                retry_at: Some(retry_at),
            } => {
                item.status = QueueStatus::Waiting;
                item.not_before = retry_at;
                item.last_error = Some(reason);
                item.error_kind = Some(kind);
                self.active.insert(system_id.to_string(), item.clone());
                return Some(item);
            }
            AttemptOutcome::Failed {
                kind,
                reason,
                retry_at: None,
            } => {
                item.status = QueueStatus::Error;
                item.completed_at = Some(now);
                item.last_error = Some(reason);
                item.error_kind = Some(kind);
            }
        }

        self.retired.push(item.clone());
        Some(item)
    }

    pub fn cancel(&mut self, system_id: &str, now: DateTime<Utc>) -> (CancelOutcome, Option<RenewalQueueItem>) {
        let Some(item) = self.active.get_mut(system_id) else {
            return (CancelOutcome::NothingQueued, None);
        };

        match item.status {
            QueueStatus::Waiting => {
                let mut item = match self.active.remove(system_id) {
                    Some(item) => item,
                    None => return (CancelOutcome::NothingQueued, None),
                };
                item.status = QueueStatus::Error;
                item.completed_at = Some(now);
                item.last_error = Some("cancelled before dispatch".to_string());
                item.error_kind = Some(ErrorKind::Cancelled);
                self.retired.push(item.clone());
                (CancelOutcome::Cancelled { item_id: item.id }, Some(item))
            }
            _ => {
                // The running attempt is left alone; `finish` applies the request
                item.cancel_requested = true;
                let snapshot = item.clone();
                (CancelOutcome::Deferred { item_id: snapshot.id }, Some(snapshot))
            }
        }
    }

    /// Every item, live and retained, by id.
    pub fn items(&self) -> Vec<RenewalQueueItem> {
        let mut items: Vec<RenewalQueueItem> = self.active.values().chain(self.retired.iter()).cloned().collect();
        items.sort_by_key(|item| item.id);
        items
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Drop terminal items that finished before `cutoff`.
    pub fn purge(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.retired.len();
        self.retired
            .retain(|item| item.completed_at.map_or(true, |done| done >= cutoff));
        before - self.retired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn failure(kind: ErrorKind, retry_at: Option<DateTime<Utc>>) -> AttemptOutcome {
        AttemptOutcome::Failed {
            kind,
            reason: "boom".to_string(),
            retry_at,
        }
    }

    #[test]
    fn test_one_item_per_system() {
        let mut queue = RenewalQueue::new(1);
        let now = Utc::now();

        let first = queue.enqueue("s1", Trigger::Scan, Some(now), now).unwrap();
        let second = queue.enqueue("s1", Trigger::Forced, None, now);
        assert_eq!(second, Err(AlreadyInFlight { item_id: first.id }));
        assert_eq!(queue.len(), 1);

        queue.enqueue("s2", Trigger::Forced, None, now).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_retry_goes_back_to_waiting() {
        let mut queue = RenewalQueue::new(1);
        let now = Utc::now();
        queue.enqueue("s1", Trigger::Scan, Some(now), now).unwrap();
        queue.start("s1", now).unwrap();

        let retry_at = now + Duration::seconds(60);
        let item = queue
            .finish("s1", failure(ErrorKind::TransientNetwork, Some(retry_at)), now)
            .unwrap();

        assert_eq!(item.status, QueueStatus::Waiting);
        assert_eq!(item.attempts, 1);
        assert!(queue.ready(now).is_empty());
        assert_eq!(queue.ready(retry_at), vec!["s1".to_string()]);
    }

    #[test]
    fn test_terminal_failure_suppresses_window() {
        let mut queue = RenewalQueue::new(1);
        let now = Utc::now();
        let window = now + Duration::days(1);
        queue.enqueue("s1", Trigger::Scan, Some(window), now).unwrap();
        queue.start("s1", now).unwrap();
        queue.finish("s1", failure(ErrorKind::ActionNotFound, None), now).unwrap();

        assert!(!queue.is_in_flight("s1"));
        assert!(queue.is_suppressed("s1", window));
        assert!(!queue.is_suppressed("s1", window + Duration::days(30)));

        assert_eq!(queue.purge(now + Duration::seconds(1)), 1);
        assert!(!queue.is_suppressed("s1", window));
    }

    #[test]
    fn test_cancel_waiting_and_processing() {
        let mut queue = RenewalQueue::new(1);
        let now = Utc::now();

        queue.enqueue("s1", Trigger::Forced, None, now).unwrap();
        let (outcome, item) = queue.cancel("s1", now);
        assert_eq!(outcome, CancelOutcome::Cancelled { item_id: 1 });
        assert_eq!(item.unwrap().last_error.as_deref(), Some("cancelled before dispatch"));
        assert!(!queue.is_in_flight("s1"));

        queue.enqueue("s2", Trigger::Forced, None, now).unwrap();
        queue.start("s2", now).unwrap();
        let (outcome, item) = queue.cancel("s2", now);
        assert_eq!(outcome, CancelOutcome::Deferred { item_id: 2 });
        let item = item.unwrap();
        assert!(item.cancel_requested);
        assert_eq!(item.status, QueueStatus::Processing);

        // Retryable failure is not retried once cancellation was asked for
        let item = queue
            .finish("s2", failure(ErrorKind::TransientNetwork, Some(now)), now)
            .unwrap();
        assert_eq!(item.status, QueueStatus::Error);

        assert_eq!(queue.cancel("s3", now).0, CancelOutcome::NothingQueued);
    }

    #[test]
    fn test_restore_closes_interrupted_items() {
        let now = Utc::now();
        let mut waiting = RenewalQueueItem::new(4, "s1", Trigger::Scan, None, now);
        waiting.attempts = 1;
        let mut running = RenewalQueueItem::new(7, "s2", Trigger::Forced, None, now);
        running.status = QueueStatus::Processing;

        let mut queue = RenewalQueue::new(1);
        let changed = queue.restore(vec![waiting, running], now);

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, QueueStatus::Error);
        assert_eq!(changed[0].last_error.as_deref(), Some("interrupted by restart"));
        assert!(queue.is_in_flight("s1"));
        assert!(!queue.is_in_flight("s2"));

        let next = queue.enqueue("s3", Trigger::Forced, None, now).unwrap();
        assert_eq!(next.id, 8);
    }
}
