use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collaborators::{AccessPointDirectory, DirectoryError};
use crate::types::{AccessPoint, CloudDeviceId};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid control API URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
struct AccessPointList {
    access_points: Vec<AccessPoint>,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    endpoint: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: Vec<RegisteredDevice>,
}

#[derive(Debug, Deserialize)]
struct RegisteredDevice {
    id: CloudDeviceId,
}

/// Client for the control plane's device and access point API
pub struct ControlApiClient {
    client: Client,
    base_url: Url,
    api_token: String,
}

impl ControlApiClient {
    pub fn new(
        base_url: &str,
        api_token: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let invalid = |reason: String| ApiError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let parsed = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("not a base URL".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            base_url: parsed,
            api_token: api_token.to_string(),
        })
    }

    /// `base_url` with `segments` appended, each percent-encoded
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Api {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn list_access_points(&self) -> Result<Vec<AccessPoint>, ApiError> {
        let response = self
            .client
            .get(self.url(&["v1", "access-points"]))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let list: AccessPointList = Self::check(response).await?.json().await?;
        tracing::debug!("Control API returned {} access point(s)", list.access_points.len());
        Ok(list.access_points)
    }

    pub async fn issue_token(
        &self,
        device: &CloudDeviceId,
        endpoint: &str,
    ) -> Result<String, ApiError> {
        tracing::debug!("Requesting tunnel token for {} at {}", device, endpoint);
        let response = self
            .client
            .post(self.url(&["v1", "devices", device.as_str(), "tunnel-tokens"]))
            .bearer_auth(&self.api_token)
            .json(&TokenRequest { endpoint })
            .send()
            .await?;
        let token: TokenResponse = Self::check(response).await?.json().await?;
        Ok(token.token)
    }

    /// Registered devices matching a serial and, when known, a hardware id
    pub async fn find_devices(
        &self,
        serial: &str,
        hardware_id: Option<&str>,
    ) -> Result<Vec<CloudDeviceId>, ApiError> {
        let mut query = vec![("serial", serial)];
        if let Some(hardware_id) = hardware_id {
            query.push(("hardware_id", hardware_id));
        }

        let response = self
            .client
            .get(self.url(&["v1", "devices"]))
            .query(&query)
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let list: DeviceList = Self::check(response).await?.json().await?;
        Ok(list.devices.into_iter().map(|d| d.id).collect())
    }
}

#[async_trait]
impl AccessPointDirectory for ControlApiClient {
    async fn list_access_points(&self) -> Result<Vec<AccessPoint>, DirectoryError> {
        Ok(ControlApiClient::list_access_points(self).await?)
    }

    async fn issue_token(
        &self,
        device: &CloudDeviceId,
        endpoint: &str,
    ) -> Result<String, DirectoryError> {
        Ok(ControlApiClient::issue_token(self, device, endpoint).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ControlApiClient {
        ControlApiClient::new(base, "secret", "devtun-test", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_url_joins_segments() {
        let api = client("https://api.example.com/base/");
        assert_eq!(
            api.url(&["v1", "access-points"]).as_str(),
            "https://api.example.com/base/v1/access-points"
        );

        let api = client("https://api.example.com");
        assert_eq!(
            api.url(&["v1", "devices", "dev 1/x", "tunnel-tokens"]).as_str(),
            "https://api.example.com/v1/devices/dev%201%2Fx/tunnel-tokens"
        );
    }

    #[test]
    fn test_rejects_unusable_base_url() {
        let result = ControlApiClient::new("mailto:ops@example.com", "t", "ua", Duration::from_secs(1));
        assert!(matches!(result, Err(ApiError::InvalidUrl { .. })));

        let result = ControlApiClient::new("not a url", "t", "ua", Duration::from_secs(1));
        assert!(matches!(result, Err(ApiError::InvalidUrl { .. })));
    }

    #[test]
    fn test_device_list_shape() {
        let list: DeviceList =
            serde_json::from_str(r#"{"devices":[{"id":"dev-1","name":"Pixel"},{"id":"dev-2"}]}"#)
                .unwrap();
        let ids: Vec<_> = list.devices.into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![CloudDeviceId::from("dev-1"), CloudDeviceId::from("dev-2")]);
    }
}
