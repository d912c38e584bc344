use chrono::{DateTime, Utc};
use colored::Colorize;

use crate::reconcile::Classification;
use crate::storage::models::QueueStatus;

/// Shorten an identifier for table display
pub fn format_id(id: &str) -> String {
    if id.chars().count() <= 16 {
        id.to_string()
    } else {
        let head: String = id.chars().take(7).collect();
        let tail: String = id.chars().rev().take(6).collect::<Vec<_>>().into_iter().rev().collect();
        format!("{}...{}", head, tail)
    }
}

/// Format timestamp in human-readable format
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_opt_timestamp(timestamp: Option<&DateTime<Utc>>) -> String {
    timestamp.map(format_timestamp).unwrap_or_else(|| "-".to_string())
}

/// Keep the first two characters of a secret, star the rest
pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(2).collect();
    let hidden = secret.chars().count().saturating_sub(2).max(4);
    format!("{}{}", visible, "*".repeat(hidden))
}

pub fn colored_status(status: QueueStatus) -> String {
    let label = status.to_string();
    match status {
        QueueStatus::Waiting => label.yellow().to_string(),
        QueueStatus::Processing => label.cyan().to_string(),
        QueueStatus::Completed => label.green().to_string(),
        QueueStatus::Error => label.red().to_string(),
    }
}

pub fn colored_classification(classification: Classification) -> String {
    let label = classification.to_string();
    match classification {
        Classification::BothInSync => label.green().to_string(),
        Classification::BothDivergent => label.red().to_string(),
        Classification::LocalOnly | Classification::ApiOnly => label.yellow().to_string(),
    }
}

/// Spaces out calls to a remote service
pub struct RateLimiter {
    delay: std::time::Duration,
    last_call: tokio::sync::Mutex<Option<tokio::time::Instant>>,
}

impl RateLimiter {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: std::time::Duration::from_millis(delay_ms),
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        // Lock stays held across the sleep so callers queue up behind it
        let mut last = self.last_call.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }

        *last = Some(tokio::time::Instant::now());
    }
}

/// Prompt user for yes/no confirmation
pub fn confirm_action(prompt: &str) -> bool {
    use std::io::{self, Write};

    print!("{} (y/N): ", prompt);
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }

    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Print a formatted table border
pub fn print_table_border(width: usize) {
    println!("{}", "=".repeat(width));
}

/// Print a table row with columns
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    let mut row = String::new();
    for (i, col) in columns.iter().enumerate() {
        if i < widths.len() {
            row.push_str(&format!("{:<width$}  ", col, width = widths[i]));
        }
    }
    println!("{}", row.trim_end());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_id() {
        assert_eq!(format_id("sys-1"), "sys-1");
        assert_eq!(format_id("abcdefghijklmnopqrstuvwxyz"), "abcdefg...uvwxyz");
    }

    #[test]
    fn test_format_opt_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 10, 10, 10, 0, 0).unwrap();
        assert_eq!(format_opt_timestamp(Some(&at)), "2025-10-10 10:00:00 UTC");
        assert_eq!(format_opt_timestamp(None), "-");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("AB12CD34"), "AB******");
        assert_eq!(mask_secret("x"), "x****");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_calls() {
        let limiter = RateLimiter::new(100);
        let start = tokio::time::Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(200));
    }
}
