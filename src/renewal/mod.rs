pub mod controller;
pub mod eligibility;
pub mod locks;
pub mod queue;

pub use controller::{ForceOutcome, RenewalController, ScanSummary};
pub use eligibility::{Eligibility, EligibilityChecker};
pub use locks::{SystemGuard, SystemLocks};
pub use queue::{AlreadyInFlight, AttemptOutcome, CancelOutcome, RenewalQueue};
