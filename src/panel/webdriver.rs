use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::PanelSession;
use crate::{config::PanelConfig, error::PanelError};

/// W3C key under which element references are returned.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Deserialize)]
struct WireResponse {
    value: Value,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

/// Browser session spoken to over the W3C WebDriver HTTP protocol.
pub struct WebDriverSession {
    http: Client,
    base_url: String,
    session_id: String,
}

impl WebDriverSession {
    /// Start a new browser session on the configured driver.
    pub async fn connect(config: &PanelConfig) -> Result<Self, PanelError> {
        let http = Client::builder()
            .timeout(config.navigation_timeout())
            .build()
            .map_err(transport)?;
        let base_url = config.webdriver_url.trim_end_matches('/').to_string();

        let body = json!({ "capabilities": { "alwaysMatch": capabilities(config) } });
        let response = http
            .post(format!("{}/session", base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let value = read_value(response).await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| PanelError::Transport("driver returned no session id".to_string()))?
            .to_string();

        info!("Opened {} WebDriver session {}", config.browser, session_id);
        Ok(Self {
            http,
            base_url,
            session_id,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/session/{}/{}", self.base_url, self.session_id, path)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, PanelError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        read_value(response).await
    }

    async fn get(&self, path: &str) -> Result<Value, PanelError> {
        let response = self.http.get(self.endpoint(path)).send().await.map_err(transport)?;
        read_value(response).await
    }

    async fn find(&self, selector: &str) -> Result<Option<String>, PanelError> {
        match self.post("element", locator(selector)).await {
            Ok(value) => Ok(element_id(&value)),
            Err(PanelError::ActionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<String>, PanelError> {
        let value = self.post("elements", locator(selector)).await?;
        Ok(value
            .as_array()
            .map(|items| items.iter().filter_map(element_id).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl PanelSession for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<(), PanelError> {
        debug!("Navigating to {}", url);
        self.post("url", json!({ "url": url })).await.map(|_| ())
    }

    async fn current_url(&self) -> Result<String, PanelError> {
        let value = self.get("url").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PanelError> {
        let element = self
            .find(selector)
            .await?
            .ok_or_else(|| PanelError::ActionNotFound(format!("field {}", selector)))?;

        self.post(&format!("element/{}/clear", element), json!({})).await?;
        self.post(&format!("element/{}/value", element), json!({ "text": value }))
            .await
            .map(|_| ())
    }

    async fn click(&self, selector: &str) -> Result<bool, PanelError> {
        let Some(element) = self.find(selector).await? else {
            return Ok(false);
        };
        self.post(&format!("element/{}/click", element), json!({})).await?;
        Ok(true)
    }

    async fn exists(&self, selector: &str) -> Result<bool, PanelError> {
        Ok(self.find(selector).await?.is_some())
    }

    async fn text_of(&self, selector: &str) -> Result<Option<String>, PanelError> {
        let Some(element) = self.find(selector).await? else {
            return Ok(None);
        };
        let value = self.get(&format!("element/{}/text", element)).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn dismiss_overlays(&self, close_selector: &str) -> Result<usize, PanelError> {
        let mut dismissed = 0;
        for element in self.find_all(close_selector).await? {
            // Overlays can close each other; a stale one is fine
            if self.post(&format!("element/{}/click", element), json!({})).await.is_ok() {
                dismissed += 1;
            }
        }
        Ok(dismissed)
    }

    async fn close(&self) -> Result<(), PanelError> {
        let url = format!("{}/session/{}", self.base_url, self.session_id);
        let response = self.http.delete(url).send().await.map_err(transport)?;
        read_value(response).await?;
        debug!("Closed WebDriver session {}", self.session_id);
        Ok(())
    }
}

fn capabilities(config: &PanelConfig) -> Value {
    let mut args: Vec<String> = Vec::new();

    if config.browser.eq_ignore_ascii_case("firefox") {
        if config.headless {
            args.push("-headless".to_string());
        }
        if let Some(dir) = &config.profile_dir {
            args.push("-profile".to_string());
            args.push(dir.clone());
        }
        json!({ "browserName": "firefox", "moz:firefoxOptions": { "args": args } })
    } else {
        if config.headless {
            args.push("--headless=new".to_string());
        }
        if let Some(dir) = &config.profile_dir {
            args.push(format!("--user-data-dir={}", dir));
        }
        json!({ "browserName": "chrome", "goog:chromeOptions": { "args": args } })
    }
}

fn locator(selector: &str) -> Value {
    json!({ "using": "css selector", "value": selector })
}

fn element_id(value: &Value) -> Option<String> {
    value.get(ELEMENT_KEY).and_then(Value::as_str).map(str::to_string)
}

fn transport(err: reqwest::Error) -> PanelError {
    if err.is_timeout() {
        PanelError::NavigationTimeout(err.to_string())
    } else {
        PanelError::Transport(err.to_string())
    }
}

async fn read_value(response: reqwest::Response) -> Result<Value, PanelError> {
    let status = response.status();
    let body: WireResponse = response.json().await.map_err(transport)?;

    if status.is_success() {
        return Ok(body.value);
    }

    let error: WireError = serde_json::from_value(body.value).map_err(|e| PanelError::Transport(e.to_string()))?;
    Err(classify_wire_error(&error.error, &error.message))
}

fn classify_wire_error(code: &str, message: &str) -> PanelError {
    match code {
        "no such element" | "stale element reference" | "element not interactable" => {
            PanelError::ActionNotFound(message.to_string())
        }
        "timeout" | "script timeout" => PanelError::NavigationTimeout(message.to_string()),
        _ => PanelError::Transport(format!("{}: {}", code, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrome_capabilities_carry_profile() {
        let config = PanelConfig {
            profile_dir: Some("/tmp/panel-profile".to_string()),
            ..PanelConfig::default()
        };
        let caps = capabilities(&config);
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));
        assert!(args.iter().any(|a| a == "--user-data-dir=/tmp/panel-profile"));
    }

    #[test]
    fn test_firefox_capabilities() {
        let config = PanelConfig {
            browser: "firefox".to_string(),
            headless: false,
            ..PanelConfig::default()
        };
        let caps = capabilities(&config);
        assert_eq!(caps["browserName"], "firefox");
        assert!(caps["moz:firefoxOptions"]["args"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_element_reference() {
        let value = json!({ ELEMENT_KEY: "abc-123" });
        assert_eq!(element_id(&value).as_deref(), Some("abc-123"));
        assert_eq!(element_id(&json!({})), None);
    }

    #[test]
    fn test_wire_error_classification() {
        assert!(matches!(classify_wire_error("no such element", "x"), PanelError::ActionNotFound(_)));
        assert!(matches!(classify_wire_error("timeout", "x"), PanelError::NavigationTimeout(_)));
        assert!(matches!(
            classify_wire_error("session not created", "x"),
            PanelError::Transport(_)
        ));
    }
}
