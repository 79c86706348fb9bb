//! Controller → node RPC over the node HTTP API.
//!
//! Thin reqwest wrapper with the shared bearer token attached to every
//! request. Failures come back as plain messages; the API layer maps them
//! to 502 responses, the deployer treats them as batch failures.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use crate::fleet::CommandResponse;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct FleetHttpClient {
    client: reqwest::Client,
}

impl FleetHttpClient {
    pub fn new(api_token: Option<&str>) -> Self {
        Self::with_timeout(api_token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(api_token: Option<&str>, timeout: Duration) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(token) = api_token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        FleetHttpClient { client }
    }

    fn base_url(host: &str, port: u16) -> String {
        format!("http://{}:{}", host, port)
    }

    async fn request(&self, method: reqwest::Method, url: String) -> Result<Value, String> {
        let response = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| format!("{}: {}", url, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{}: HTTP {} {}", url, status.as_u16(), body.trim()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| format!("{}: invalid JSON response: {}", url, e))
    }

    pub async fn list_workloads(&self, host: &str, port: u16) -> Result<Value, String> {
        self.request(
            reqwest::Method::GET,
            format!("{}/api/list", Self::base_url(host, port)),
        )
        .await
    }

    pub async fn get_status(&self, host: &str, port: u16, name: &str) -> Result<Value, String> {
        self.request(
            reqwest::Method::GET,
            format!("{}/api/status/{}", Self::base_url(host, port), name),
        )
        .await
    }

    async fn command(
        &self,
        host: &str,
        port: u16,
        action: &str,
        name: &str,
    ) -> Result<CommandResponse, String> {
        let value = self
            .request(
                reqwest::Method::POST,
                format!("{}/api/{}/{}", Self::base_url(host, port), action, name),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| format!("malformed command response: {}", e))
    }

    pub async fn start_workload(
        &self,
        host: &str,
        port: u16,
        name: &str,
    ) -> Result<CommandResponse, String> {
        self.command(host, port, "start", name).await
    }

    pub async fn stop_workload(
        &self,
        host: &str,
        port: u16,
        name: &str,
    ) -> Result<CommandResponse, String> {
        self.command(host, port, "stop", name).await
    }

    pub async fn restart_workload(
        &self,
        host: &str,
        port: u16,
        name: &str,
    ) -> Result<CommandResponse, String> {
        self.command(host, port, "restart", name).await
    }

    pub async fn health_check(&self, host: &str, port: u16) -> Result<Value, String> {
        self.request(
            reqwest::Method::GET,
            format!("{}/api/health", Self::base_url(host, port)),
        )
        .await
    }

    pub async fn reload_configs(&self, host: &str, port: u16) -> Result<Value, String> {
        self.request(
            reqwest::Method::POST,
            format!("{}/api/reload", Self::base_url(host, port)),
        )
        .await
    }

    pub async fn get_logs(
        &self,
        host: &str,
        port: u16,
        name: &str,
        lines: u32,
    ) -> Result<Value, String> {
        self.request(
            reqwest::Method::GET,
            format!(
                "{}/api/logs/{}?lines={}",
                Self::base_url(host, port),
                name,
                lines
            ),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_formats_host_and_port() {
        assert_eq!(FleetHttpClient::base_url("10.0.0.5", 9100), "http://10.0.0.5:9100");
    }

    #[tokio::test]
    async fn connection_refused_is_an_upstream_error() {
        let client = FleetHttpClient::with_timeout(None, Duration::from_millis(400));
        // Port 9 (discard) is essentially never an HTTP server.
        let err = client.health_check("127.0.0.1", 9).await.unwrap_err();
        assert!(err.contains("127.0.0.1:9"));
    }
}
