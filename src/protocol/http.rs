use std::future::Future;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::protocol::encode::encode_value;
use crate::protocol::status::StatusResponse;
use crate::protocol::{AGENT_TECHNOLOGY_TYPE, PLATFORM_TYPE};

/// Transport port used by the sender task.
///
/// Implementations never surface transport failures as errors; a request
/// that could not complete yields `None` and the caller decides whether
/// to retry or change state.
pub trait HttpClient: Send + Sync + 'static {
    /// Performs a status check against the given server.
    fn send_status_request(
        &self,
        server_id: i32,
    ) -> impl Future<Output = Option<StatusResponse>> + Send;

    /// Posts one beacon chunk on behalf of `client_ip`.
    fn send_beacon_request(
        &self,
        client_ip: &str,
        payload: &[u8],
        server_id: i32,
    ) -> impl Future<Output = Option<StatusResponse>> + Send;
}

/// Production client speaking the monitor endpoint over reqwest.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    endpoint: String,
    app_id_encoded: String,
    app_version_encoded: String,
}

impl ReqwestHttpClient {
    pub fn new(cfg: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            app_id_encoded: encode_value(&cfg.application_id),
            app_version_encoded: encode_value(&cfg.application_version),
        })
    }

    fn monitor_url(&self, server_id: i32) -> String {
        format!(
            "{}?type=m&srvid={}&app={}&va={}&pt={}&tt={}",
            self.endpoint,
            server_id,
            self.app_id_encoded,
            self.app_version_encoded,
            PLATFORM_TYPE,
            AGENT_TECHNOLOGY_TYPE,
        )
    }

    async fn parse_response(response: reqwest::Response) -> StatusResponse {
        let code = response.status().as_u16();

        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|seconds| seconds * 1000);

        let body = response.text().await.unwrap_or_default();

        let mut parsed = StatusResponse::parse(code, &body);
        parsed.retry_after_ms = retry_after_ms;
        parsed
    }
}

impl HttpClient for ReqwestHttpClient {
    async fn send_status_request(&self, server_id: i32) -> Option<StatusResponse> {
        let url = self.monitor_url(server_id);
        debug!(server_id, "sending status request");

        match self.client.get(&url).send().await {
            Ok(response) => Some(Self::parse_response(response).await),
            Err(e) => {
                warn!(error = %e, "status request failed");
                None
            }
        }
    }

    async fn send_beacon_request(
        &self,
        client_ip: &str,
        payload: &[u8],
        server_id: i32,
    ) -> Option<StatusResponse> {
        let url = self.monitor_url(server_id);
        debug!(server_id, bytes = payload.len(), "sending beacon request");

        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload.to_vec());

        if !client_ip.is_empty() {
            request = request.header("X-Client-IP", client_ip);
        }

        match request.send().await {
            Ok(response) => Some(Self::parse_response(response).await),
            Err(e) => {
                warn!(error = %e, "beacon request failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> HttpConfig {
        HttpConfig {
            endpoint: "https://collector.example.com/mbeacon".to_string(),
            application_id: "my app".to_string(),
            application_version: "1.2.3".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_monitor_url_encodes_query_fields() {
        let client = ReqwestHttpClient::new(&test_config()).expect("client");
        let url = client.monitor_url(7);
        assert_eq!(
            url,
            "https://collector.example.com/mbeacon?type=m&srvid=7&app=my%20app&va=1.2.3&pt=1&tt=rust"
        );
    }

    #[test]
    fn test_monitor_url_server_id_varies_per_request() {
        let client = ReqwestHttpClient::new(&test_config()).expect("client");
        assert!(client.monitor_url(1).contains("srvid=1"));
        assert!(client.monitor_url(42).contains("srvid=42"));
    }
}
