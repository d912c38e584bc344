//! Browser automation against the third-party panel.
//!
//! The panel has no API, so renewals are produced by walking its web workflow
//! and reading the result text back. [`PanelSession`] is the browser seam;
//! [`AutomationDriver`] owns the workflow; [`PanelRenewer`] ties the two to a
//! real WebDriver-backed browser for the renewal controller.

pub mod driver;
pub mod renewer;
pub mod webdriver;

use async_trait::async_trait;

use crate::error::PanelError;

pub use driver::{AutomationDriver, DriverState};
pub use renewer::{CredentialRenewer, PanelRenewer};
pub use webdriver::WebDriverSession;

#[cfg(test)]
pub use renewer::MockCredentialRenewer;

/// One open browser session. Selectors are CSS selectors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PanelSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), PanelError>;

    async fn current_url(&self) -> Result<String, PanelError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PanelError>;

    /// Click the first match. `Ok(false)` when nothing matches.
    async fn click(&self, selector: &str) -> Result<bool, PanelError>;

    async fn exists(&self, selector: &str) -> Result<bool, PanelError>;

    /// Visible text of the first match.
    async fn text_of(&self, selector: &str) -> Result<Option<String>, PanelError>;

    /// Click every matching close control. Returns how many were dismissed.
    async fn dismiss_overlays(&self, close_selector: &str) -> Result<usize, PanelError>;

    async fn close(&self) -> Result<(), PanelError>;
}
