pub mod db;
pub mod models;

pub use db::{Database, DatabaseStats};
pub use models::{
    AuditRecord, NewPoint, Point, PointSource, PointStatus, QueueStatus, RenewalQueueItem, System, Trigger,
};
