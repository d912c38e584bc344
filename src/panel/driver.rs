use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PanelSession;
use crate::{
    config::PanelConfig,
    error::PanelError,
    extraction::{self, ExtractionResult, RawCapture},
    storage::models::System,
};

/// Steps of one panel run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Init,
    Authenticate,
    Navigate,
    TriggerGeneration,
    ConfirmStep1,
    ConfirmStep2,
    AwaitResult,
    Extract,
    Cleanup,
    Done,
}

/// Walks the panel workflow for one system and hands back the extracted credentials.
pub struct AutomationDriver {
    config: PanelConfig,
}

impl AutomationDriver {
    pub fn new(config: PanelConfig) -> Self {
        Self { config }
    }

    /// Run the whole workflow. Overlays are dismissed on every exit path.
    pub async fn run(
        &self,
        session: &dyn PanelSession,
        system: &System,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult, PanelError> {
        let outcome = self.drive(session, system, cancel).await;

        self.enter(system, DriverState::Cleanup);
        match session.dismiss_overlays(&self.config.overlay_close_selector).await {
            Ok(0) => {}
            Ok(n) => debug!("Dismissed {} overlay(s) for system {}", n, system.id),
            Err(e) => warn!("Cleanup failed for system {}: {}", system.id, e),
        }

        if outcome.is_ok() {
            self.enter(system, DriverState::Done);
        }
        outcome
    }

    async fn drive(
        &self,
        session: &dyn PanelSession,
        system: &System,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult, PanelError> {
        self.enter(system, DriverState::Init);
        check_cancelled(cancel)?;

        self.enter(system, DriverState::Authenticate);
        self.authenticate(session, system, cancel).await?;

        self.enter(system, DriverState::Navigate);
        self.navigate(session, &self.config.points_url, cancel).await?;
        let landed = session.current_url().await?;
        if landed.starts_with(&self.config.login_url) {
            return Err(PanelError::LoginFailed("session dropped back to login".to_string()));
        }

        // Last point at which cancellation is honoured
        check_cancelled(cancel)?;

        // Whatever a previous run left in the result area is not our result
        let previous = session.text_of(&self.config.result_selector).await?;

        self.generate(session, system, previous.as_deref())
            .await
            .map_err(PanelError::after_generation)
    }

    /// Generate, confirm and extract. Runs at most once per attempt and is
    /// never retried, whatever fails inside it.
    async fn generate(
        &self,
        session: &dyn PanelSession,
        system: &System,
        previous: Option<&str>,
    ) -> Result<ExtractionResult, PanelError> {
        self.enter(system, DriverState::TriggerGeneration);
        if !session.click(&self.config.generate_selector).await? {
            return Err(PanelError::ActionNotFound("generate".to_string()));
        }

        self.enter(system, DriverState::ConfirmStep1);
        self.confirm(session, &self.config.confirm_selector, "confirm step 1").await?;

        self.enter(system, DriverState::ConfirmStep2);
        self.confirm(session, &self.config.confirm_final_selector, "confirm step 2").await?;

        self.enter(system, DriverState::AwaitResult);
        let text = self.await_result(session, previous).await?;

        self.enter(system, DriverState::Extract);
        let capture = RawCapture::new(text);
        let result = extraction::extract(&capture).map_err(|e| PanelError::ExtractionFailed(e.to_string()))?;

        info!(
            "Extracted credentials for system {} via {} (user {}, confidence {})",
            system.id,
            result.method,
            result.username,
            result.method.confidence()
        );
        Ok(result)
    }

    fn enter(&self, system: &System, state: DriverState) {
        debug!(system = %system.id, state = ?state, "panel driver");
    }

    async fn authenticate(
        &self,
        session: &dyn PanelSession,
        system: &System,
        cancel: &CancellationToken,
    ) -> Result<(), PanelError> {
        self.navigate(session, &self.config.login_url, cancel).await?;

        // Persisted profile may already carry a live session
        if session.exists(&self.config.logged_in_selector).await? {
            debug!("Session for system {} already authenticated", system.id);
            return Ok(());
        }

        session.fill(&self.config.username_selector, &system.panel_username).await?;
        session.fill(&self.config.password_selector, &system.panel_password).await?;
        if !session.click(&self.config.submit_selector).await? {
            return Err(PanelError::ActionNotFound("login submit".to_string()));
        }

        if session.exists(&self.config.logged_in_selector).await? {
            return Ok(());
        }

        // Captcha or second factor: give an operator one bounded window to finish it
        warn!(
            system = %system.id,
            grace_secs = self.config.login_grace_secs,
            "Panel login needs manual intervention, waiting"
        );

        let deadline = Instant::now() + self.config.login_grace();
        loop {
            if session.exists(&self.config.logged_in_selector).await? {
                info!("Manual login for system {} completed", system.id);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PanelError::LoginFailed("manual intervention window lapsed".to_string()));
            }
            self.pause(cancel).await?;
        }
    }

    /// Load a page, retrying timeouts and transport failures.
    async fn navigate(&self, session: &dyn PanelSession, url: &str, cancel: &CancellationToken) -> Result<(), PanelError> {
        let attempts = self.config.navigation_attempts.max(1);
        let mut last_error = PanelError::NavigationTimeout(url.to_string());

        for attempt in 1..=attempts {
            check_cancelled(cancel)?;

            let result = match tokio::time::timeout(self.config.navigation_timeout(), session.goto(url)).await {
                Ok(result) => result,
                Err(_) => Err(PanelError::NavigationTimeout(url.to_string())),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e @ (PanelError::NavigationTimeout(_) | PanelError::Transport(_))) => {
                    warn!("Navigation to {} failed (attempt {}/{}): {}", url, attempt, attempts, e);
                    last_error = e;
                    if attempt < attempts {
                        self.pause(cancel).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn confirm(&self, session: &dyn PanelSession, selector: &str, step: &str) -> Result<(), PanelError> {
        if !self.wait_for(session, selector, self.config.navigation_timeout()).await? {
            return Err(PanelError::ActionNotFound(step.to_string()));
        }
        if !session.click(selector).await? {
            return Err(PanelError::ActionNotFound(step.to_string()));
        }
        Ok(())
    }

    async fn wait_for(&self, session: &dyn PanelSession, selector: &str, limit: Duration) -> Result<bool, PanelError> {
        let deadline = Instant::now() + limit;
        loop {
            if session.exists(selector).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Poll the result area until it holds new text. The point is already
    /// consumed at this stage, so cancellation is not checked and a timeout is final.
    async fn await_result(&self, session: &dyn PanelSession, previous: Option<&str>) -> Result<String, PanelError> {
        let deadline = Instant::now() + self.config.result_timeout();
        loop {
            if let Some(text) = session.text_of(&self.config.result_selector).await? {
                if !text.trim().is_empty() && previous != Some(text.as_str()) {
                    return Ok(text);
                }
            }
            if Instant::now() >= deadline {
                return Err(PanelError::ExtractionFailed(format!(
                    "no result within {}s",
                    self.config.result_timeout_secs
                )));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), PanelError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PanelError::Cancelled),
            _ = tokio::time::sleep(self.config.poll_interval()) => Ok(()),
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), PanelError> {
    if cancel.is_cancelled() {
        Err(PanelError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::ExtractionMethod;
    use crate::panel::MockPanelSession;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const RESULT_TEXT: &str = "USUÁRIO: 1234567890\nSENHA: AB12CD34\nVENCIMENTO: 10/10/2025 10:00:00";

    fn config() -> PanelConfig {
        PanelConfig {
            login_url: "https://panel.test/login".to_string(),
            points_url: "https://panel.test/points".to_string(),
            navigation_attempts: 2,
            login_grace_secs: 5,
            result_timeout_secs: 3,
            poll_interval_ms: 500,
            ..PanelConfig::default()
        }
    }

    fn system() -> System {
        System::new("sys-1", "EXT-1").with_panel_credentials("reseller", "pw")
    }

    const STALE_TEXT: &str = "USUÁRIO: 5550001111\nSENHA: OLD99OLD\nVENCIMENTO: 01/01/2025 00:00:00";

    /// Logged-in session on the points page; `generate` decides whether the
    /// generate button exists and `result` is what the result area shows
    /// once generation ran (it starts out empty).
    fn panel(cfg: &PanelConfig, generate: bool, result: Option<&'static str>) -> MockPanelSession {
        let generate_selector = cfg.generate_selector.clone();

        let mut session = MockPanelSession::new();
        session.expect_goto().returning(|_| Ok(()));
        session
            .expect_current_url()
            .returning(|| Ok("https://panel.test/points".to_string()));
        session.expect_exists().returning(|_| Ok(true));
        session
            .expect_click()
            .returning(move |selector| Ok(generate || selector != generate_selector));
        let mut reads = 0;
        session.expect_text_of().returning(move |_| {
            reads += 1;
            Ok(if reads == 1 { None } else { result.map(str::to_string) })
        });
        session.expect_dismiss_overlays().times(1).returning(|_| Ok(1));
        session
    }

    /// Like `panel`, with the result area driven by `text_of` and generate
    /// clicks counted.
    fn scripted_panel(
        cfg: &PanelConfig,
        text_of: impl FnMut(&str) -> Result<Option<String>, PanelError> + Send + 'static,
    ) -> (MockPanelSession, Arc<AtomicUsize>) {
        let generate_selector = cfg.generate_selector.clone();
        let generated = Arc::new(AtomicUsize::new(0));
        let counter = generated.clone();

        let mut session = MockPanelSession::new();
        session.expect_goto().returning(|_| Ok(()));
        session
            .expect_current_url()
            .returning(|| Ok("https://panel.test/points".to_string()));
        session.expect_exists().returning(|_| Ok(true));
        session.expect_click().returning(move |selector| {
            if selector == generate_selector {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(true)
        });
        session.expect_text_of().returning(text_of);
        session.expect_dismiss_overlays().returning(|_| Ok(0));
        (session, generated)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_workflow_extracts_credentials() {
        let cfg = config();
        let session = panel(&cfg, true, Some(RESULT_TEXT));

        let result = AutomationDriver::new(cfg)
            .run(&session, &system(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.username, "1234567890");
        assert_eq!(result.password, "AB12CD34");
        assert_eq!(result.method, ExtractionMethod::Structured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_generate_button() {
        let cfg = config();
        let session = panel(&cfg, false, Some(RESULT_TEXT));

        let err = AutomationDriver::new(cfg)
            .run(&session, &system(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, PanelError::ActionNotFound("generate".to_string()));
        assert_eq!(err.to_string(), "generate action missing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_timeout_is_extraction_failure() {
        let cfg = config();
        let session = panel(&cfg, true, None);

        let err = AutomationDriver::new(cfg)
            .run(&session, &system(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PanelError::ExtractionFailed(_)));
        assert!(!err.kind().is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_retries_then_times_out() {
        let mut session = MockPanelSession::new();
        session
            .expect_goto()
            .times(2)
            .returning(|url| Err(PanelError::NavigationTimeout(url.to_string())));
        session.expect_dismiss_overlays().times(1).returning(|_| Ok(0));

        let err = AutomationDriver::new(config())
            .run(&session, &system(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PanelError::NavigationTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_grace_window_lapses() {
        let mut session = MockPanelSession::new();
        session.expect_goto().returning(|_| Ok(()));
        session.expect_fill().times(2).returning(|_, _| Ok(()));
        session.expect_click().times(1).returning(|_| Ok(true));
        session.expect_exists().returning(|_| Ok(false));
        session.expect_dismiss_overlays().returning(|_| Ok(0));

        let err = AutomationDriver::new(config())
            .run(&session, &system(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PanelError::LoginFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_generation() {
        let mut session = MockPanelSession::new();
        session.expect_goto().never();
        session.expect_click().never();
        session.expect_dismiss_overlays().times(1).returning(|_| Ok(0));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = AutomationDriver::new(config()).run(&session, &system(), &cancel).await.unwrap_err();
        assert_eq!(err, PanelError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_after_generate_is_final() {
        let cfg = config();
        let mut reads = 0;
        let (session, generated) = scripted_panel(&cfg, move |_| {
            reads += 1;
            if reads == 1 {
                Ok(None)
            } else {
                Err(PanelError::Transport("connection reset".to_string()))
            }
        });

        let err = AutomationDriver::new(cfg)
            .run(&session, &system(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, PanelError::GenerationUncertain("connection reset".to_string()));
        assert!(!err.kind().is_retryable());
        assert_eq!(generated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_before_generate_stays_retryable() {
        let cfg = config();
        let (session, generated) = scripted_panel(&cfg, |_| Err(PanelError::Transport("connection reset".to_string())));

        let err = AutomationDriver::new(cfg)
            .run(&session, &system(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, PanelError::Transport("connection reset".to_string()));
        assert!(err.kind().is_retryable());
        assert_eq!(generated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leftover_modal_is_not_taken_as_result() {
        let cfg = config();
        let mut reads = 0;
        let (session, _) = scripted_panel(&cfg, move |_| {
            reads += 1;
            Ok(Some(if reads <= 3 { STALE_TEXT } else { RESULT_TEXT }.to_string()))
        });

        let result = AutomationDriver::new(cfg)
            .run(&session, &system(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.username, "1234567890");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_modal_times_out() {
        let cfg = config();
        let (session, _) = scripted_panel(&cfg, |_| Ok(Some(STALE_TEXT.to_string())));

        let err = AutomationDriver::new(cfg)
            .run(&session, &system(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PanelError::ExtractionFailed(_)));
    }
}
