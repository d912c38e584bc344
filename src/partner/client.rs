use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{ApiPoint, ApiSystem, ErrorBody, ListEnvelope};
use crate::{
    config::PartnerConfig,
    error::{RenewalError, Result},
    utils::RateLimiter,
};

/// The partner platform's API, as far as renewal and reconciliation need it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PartnerApi: Send + Sync {
    async fn list_systems(&self) -> Result<Vec<ApiSystem>>;
    async fn list_points(&self) -> Result<Vec<ApiPoint>>;
    async fn create_point(&self, point: &ApiPoint) -> Result<ApiPoint>;
    async fn update_point(&self, point: &ApiPoint) -> Result<ApiPoint>;
}

/// Bearer-token HTTP client for the partner API.
#[derive(Clone)]
pub struct PartnerClient {
    http: Client,
    base_url: String,
    token: String,
    rate_limiter: Arc<RateLimiter>,
}

impl PartnerClient {
    pub fn new(config: &PartnerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_delay_ms)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.rate_limiter.wait().await;
        let response = request.bearer_auth(&self.token).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or(body);

        warn!("Partner API returned {}: {}", status, message);
        Err(RenewalError::PartnerApi {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PartnerApi for PartnerClient {
    async fn list_systems(&self) -> Result<Vec<ApiSystem>> {
        debug!("Fetching systems from partner API");
        let envelope: ListEnvelope<ApiSystem> = self.send(self.http.get(self.url("systems"))).await?;
        Ok(envelope.data)
    }

    async fn list_points(&self) -> Result<Vec<ApiPoint>> {
        debug!("Fetching points from partner API");
        let envelope: ListEnvelope<ApiPoint> = self.send(self.http.get(self.url("points"))).await?;
        Ok(envelope.data)
    }

    async fn create_point(&self, point: &ApiPoint) -> Result<ApiPoint> {
        debug!("Creating point {} on partner API", point.username);
        self.send(self.http.post(self.url("points")).json(point)).await
    }

    async fn update_point(&self, point: &ApiPoint) -> Result<ApiPoint> {
        debug!("Updating point {} on partner API", point.username);
        let path = format!("points/{}", point.username);
        self.send(self.http.put(self.url(&path)).json(point)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let config = PartnerConfig {
            base_url: "https://partner.test/api/".to_string(),
            ..PartnerConfig::default()
        };
        let client = PartnerClient::new(&config).unwrap();
        assert_eq!(client.url("/points"), "https://partner.test/api/points");
        assert_eq!(client.url("systems"), "https://partner.test/api/systems");
    }

    #[test]
    fn test_list_envelope_shape() {
        let body = r#"{"data":[{"external_id":"EXT-1","active_points":2,"max_points":5}]}"#;
        let parsed: ListEnvelope<ApiSystem> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data[0].external_id, "EXT-1");
        assert_eq!(parsed.data[0].max_points, 5);
    }
}
