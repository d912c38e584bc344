use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::queue::RenewalQueue;

/// Why a system was or was not picked up by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Due,
    NotYetDue { days_remaining: i64 },
    InFlight,
    /// A retained terminal item already covered this expiry window.
    Suppressed,
}

impl Eligibility {
    pub fn is_due(&self) -> bool {
        matches!(self, Eligibility::Due)
    }

    pub fn reason(&self) -> String {
        match self {
            Eligibility::Due => "Nearest point expires inside the lead time".to_string(),
            Eligibility::NotYetDue { days_remaining } => {
                format!("Nearest point expires in {} more days than the lead time", days_remaining)
            }
            Eligibility::InFlight => "Renewal already queued or running".to_string(),
            Eligibility::Suppressed => "Same expiry window already handled, waiting for retirement".to_string(),
        }
    }
}

pub struct EligibilityChecker {
    lead_time: Duration,
}

impl EligibilityChecker {
    pub fn new(lead_time_days: i64) -> Self {
        Self {
            lead_time: Duration::days(lead_time_days),
        }
    }

    /// Decide whether a system whose nearest active point expires at
    /// `nearest_expiry` should get a scan-triggered renewal.
    pub fn evaluate(
        &self,
        system_id: &str,
        nearest_expiry: DateTime<Utc>,
        queue: &RenewalQueue,
        now: DateTime<Utc>,
    ) -> Eligibility {
        // Check 1: inside the lead-time window (already expired counts)
        let remaining = nearest_expiry - now;
        if remaining > self.lead_time {
            let days_remaining = (remaining - self.lead_time).num_days();
            debug!("System {} not due yet ({} days to spare)", system_id, days_remaining);
            return Eligibility::NotYetDue { days_remaining };
        }

        // Check 2: nothing waiting or processing for it
        if queue.is_in_flight(system_id) {
            debug!("System {} already has queued work", system_id);
            return Eligibility::InFlight;
        }

        // Check 3: no retained outcome for this same window
        if queue.is_suppressed(system_id, nearest_expiry) {
            debug!("System {} already handled for window {}", system_id, nearest_expiry);
            return Eligibility::Suppressed;
        }

        Eligibility::Due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::Trigger;

    #[test]
    fn test_lead_time_window() {
        let checker = EligibilityChecker::new(3);
        let queue = RenewalQueue::new(1);
        let now = Utc::now();

        assert!(checker.evaluate("s", now + Duration::days(2), &queue, now).is_due());
        assert!(checker.evaluate("s", now - Duration::days(1), &queue, now).is_due());
        assert_eq!(
            checker.evaluate("s", now + Duration::days(10), &queue, now),
            Eligibility::NotYetDue { days_remaining: 7 }
        );
    }

    #[test]
    fn test_in_flight_is_not_due() {
        let checker = EligibilityChecker::new(3);
        let mut queue = RenewalQueue::new(1);
        let now = Utc::now();
        queue.enqueue("s", Trigger::Forced, None, now).unwrap();

        assert_eq!(checker.evaluate("s", now, &queue, now), Eligibility::InFlight);
    }
}
