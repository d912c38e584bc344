pub mod engine;
pub mod service;

pub use engine::{
    classify, ApiSnapshot, Classification, EntityKey, FieldDivergence, LocalSnapshot, ReconciliationEntry, Tolerances,
};
pub use service::{ReconciliationReport, ReconciliationService};
