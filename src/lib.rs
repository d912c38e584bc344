pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod extraction;
pub mod panel;
pub mod partner;
pub mod reconcile;
pub mod renewal;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use error::{RenewalError, Result};
