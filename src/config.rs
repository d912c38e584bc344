use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub partner: PartnerConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "renewal.db".to_string(),
        }
    }
}

/// Where the panel lives, how to find its controls and how long to wait for it.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PanelConfig {
    /// WebDriver endpoint (chromedriver / geckodriver).
    pub webdriver_url: String,
    pub browser: String,
    pub headless: bool,
    /// Browser profile directory that keeps the panel session between runs.
    pub profile_dir: Option<String>,

    pub login_url: String,
    pub points_url: String,

    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    /// Present only once the session is authenticated.
    pub logged_in_selector: String,
    pub generate_selector: String,
    pub confirm_selector: String,
    pub confirm_final_selector: String,
    pub result_selector: String,
    pub overlay_close_selector: String,

    pub navigation_attempts: u32,
    pub navigation_timeout_secs: u64,
    pub login_grace_secs: u64,
    pub result_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            browser: "chrome".to_string(),
            headless: true,
            profile_dir: None,
            login_url: "https://panel.example.invalid/login".to_string(),
            points_url: "https://panel.example.invalid/points".to_string(),
            username_selector: "input[name='username']".to_string(),
            password_selector: "input[name='password']".to_string(),
            submit_selector: "button[type='submit']".to_string(),
            logged_in_selector: ".user-menu".to_string(),
            generate_selector: "button.generate-point".to_string(),
            confirm_selector: ".modal .btn-confirm".to_string(),
            confirm_final_selector: ".modal .btn-confirm-final".to_string(),
            result_selector: ".modal .result".to_string(),
            overlay_close_selector: ".modal .close".to_string(),
            navigation_attempts: 3,
            navigation_timeout_secs: 30,
            login_grace_secs: 120,
            result_timeout_secs: 15,
            poll_interval_ms: 500,
        }
    }
}

impl PanelConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn login_grace(&self) -> Duration {
        Duration::from_secs(self.login_grace_secs)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PartnerConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_token: String,
    pub timeout_secs: u64,
    pub rate_limit_delay_ms: u64,
    /// Push every renewed point to the partner API.
    pub notify_on_renewal: bool,
}

impl Default for PartnerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://partner.example.invalid/api/v1".to_string(),
            api_token: String::new(),
            timeout_secs: 20,
            rate_limit_delay_ms: 250,
            notify_on_renewal: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RenewalConfig {
    /// Renew once the nearest active point expires within this many days.
    pub lead_time_days: i64,
    pub scan_interval_secs: u64,
    pub dispatch_interval_secs: u64,
    pub max_workers: usize,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// How long terminal queue items are kept before being retired.
    pub retention_hours: i64,
    /// Validity assumed when the panel result carries no expiry.
    pub default_validity_days: i64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            lead_time_days: 3,
            scan_interval_secs: 300,
            dispatch_interval_secs: 5,
            max_workers: 2,
            max_attempts: 3,
            backoff_base_secs: 60,
            backoff_max_secs: 3600,
            retention_hours: 24,
            default_validity_days: 30,
        }
    }
}

impl RenewalConfig {
    /// Delay before retry number `attempts` (1-based), doubling each time.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let secs = self
            .backoff_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub interval_secs: u64,
    pub report_ttl_secs: i64,
    /// Expiry differences up to this many seconds count as equal.
    pub expiry_tolerance_secs: i64,
    /// Active-point counts may differ by this much before they diverge.
    pub count_tolerance: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            report_ttl_secs: 300,
            expiry_tolerance_secs: 60,
            count_tolerance: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditTarget {
    Database,
    Log,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    pub sink: AuditTarget,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditTarget::Database,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("RENEWAL").separator("__"))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.renewal.lead_time_days <= 0 {
            anyhow::bail!("renewal.lead_time_days must be positive");
        }
        if self.renewal.max_workers == 0 {
            anyhow::bail!("renewal.max_workers must be at least 1");
        }
        if self.renewal.max_attempts == 0 {
            anyhow::bail!("renewal.max_attempts must be at least 1");
        }
        if self.renewal.backoff_max_secs < self.renewal.backoff_base_secs {
            anyhow::bail!("renewal.backoff_max_secs is smaller than renewal.backoff_base_secs");
        }
        if self.renewal.default_validity_days <= 0 {
            anyhow::bail!("renewal.default_validity_days must be positive");
        }
        if self.panel.navigation_attempts == 0 {
            anyhow::bail!("panel.navigation_attempts must be at least 1");
        }
        if self.panel.poll_interval_ms == 0 {
            anyhow::bail!("panel.poll_interval_ms must be positive");
        }
        if self.reconciliation.report_ttl_secs <= 0 {
            anyhow::bail!("reconciliation.report_ttl_secs must be positive");
        }
        if self.partner.enabled && self.partner.api_token.is_empty() {
            anyhow::bail!("partner.api_token is required when the partner API is enabled");
        }
        Ok(())
    }

    /// TOML rendering of this configuration, written out by `init`.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
