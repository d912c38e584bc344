use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{AutomationDriver, PanelSession, WebDriverSession};
use crate::{config::PanelConfig, error::PanelError, extraction::ExtractionResult, storage::models::System};

/// Produces a fresh credential for a system. The renewal controller only sees this.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialRenewer: Send + Sync {
    async fn renew(&self, system: &System, cancel: &CancellationToken) -> Result<ExtractionResult, PanelError>;
}

/// Renews through a real browser: one WebDriver session per attempt.
pub struct PanelRenewer {
    config: PanelConfig,
    driver: AutomationDriver,
}

impl PanelRenewer {
    pub fn new(config: PanelConfig) -> Self {
        let driver = AutomationDriver::new(config.clone());
        Self { config, driver }
    }
}

#[async_trait]
impl CredentialRenewer for PanelRenewer {
    async fn renew(&self, system: &System, cancel: &CancellationToken) -> Result<ExtractionResult, PanelError> {
        let session = WebDriverSession::connect(&self.config).await?;
        let outcome = self.driver.run(&session, system, cancel).await;

        if let Err(e) = session.close().await {
            warn!("Failed to close browser session for system {}: {}", system.id, e);
        }
        outcome
    }
}
