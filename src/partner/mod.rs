pub mod client;
pub mod types;

pub use client::{PartnerApi, PartnerClient};
pub use types::{ApiPoint, ApiSystem};

#[cfg(test)]
pub use client::MockPartnerApi;
