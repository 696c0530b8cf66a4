//! HTTP implementation of the contact provider boundary.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{ContactProvider, LookupRequest, ProviderError, ProviderResponse, parse_contacts};

/// Configuration for [`HttpContactProvider`], read once at startup.
#[derive(Clone, Debug)]
pub struct HttpProviderConfig {
    /// Base endpoint, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Bearer credential. Redacted in Debug output.
    pub api_key: SecretString,
    /// Stable provider identifier used as the cache/ledger partition.
    pub provider_name: String,
    /// Lookup path appended to `base_url`.
    pub lookup_path: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            provider_name: "skiptrace".to_string(),
            lookup_path: "/v1/lookup".to_string(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_provider_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = name.into();
        self
    }

    pub fn with_lookup_path(mut self, path: impl Into<String>) -> Self {
        self.lookup_path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Contact provider speaking JSON over HTTP.
pub struct HttpContactProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
    endpoint: String,
}

impl HttpContactProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let endpoint = format!(
            "{}{}",
            config.base_url.trim_end_matches('/'),
            config.lookup_path
        );
        Ok(Self {
            config,
            client,
            endpoint,
        })
    }
}

#[async_trait]
impl ContactProvider for HttpContactProvider {
    fn name(&self) -> &str {
        &self.config.provider_name
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn lookup(&self, request: &LookupRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&request.body())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.config.timeout)
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status().as_u16();
        match status {
            401 | 403 => {
                let message = error_message(response).await;
                return Err(ProviderError::Auth { message });
            }
            404 => return Err(ProviderError::NoMatch),
            429 => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(ProviderError::RateLimited { retry_after });
            }
            s if s >= 400 => {
                let message = error_message(response).await;
                return Err(ProviderError::Api { status, message });
            }
            _ => {}
        }

        let body: serde_json::Value = response.json().await?;

        if let Some(marker) = demo_mode_marker(&body) {
            tracing::error!(marker = %marker, "provider answered in demo mode; check credentials and endpoint");
            return Err(ProviderError::DemoMode { message: marker });
        }
        if reports_no_match(&body) {
            return Err(ProviderError::NoMatch);
        }

        let contacts = parse_contacts(&body);
        Ok(ProviderResponse {
            status,
            body,
            contacts,
        })
    }
}

async fn error_message(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(text) if !text.is_empty() => {
            // Error bodies are capped; they end up in ledger rows.
            let mut message = text;
            if message.len() > 512 {
                let mut cut = 512;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            message
        }
        _ => "no response body".to_string(),
    }
}

/// Detect non-production responses. Fabricated demo data must not be
/// cached as real contact information.
fn demo_mode_marker(body: &serde_json::Value) -> Option<String> {
    if let Some(mode) = body.get("mode").and_then(|v| v.as_str()) {
        if matches!(mode, "demo" | "test" | "sandbox") {
            return Some(format!("mode={mode}"));
        }
    }
    if body.get("demo_mode").and_then(|v| v.as_bool()) == Some(true) {
        return Some("demo_mode=true".to_string());
    }
    if body.get("live").and_then(|v| v.as_bool()) == Some(false) {
        return Some("live=false".to_string());
    }
    None
}

fn reports_no_match(body: &serde_json::Value) -> bool {
    if body.get("match").and_then(|v| v.as_bool()) == Some(false) {
        return true;
    }
    matches!(
        body.get("status").and_then(|v| v.as_str()),
        Some("no_match") | Some("not_found")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_marker_detection() {
        assert!(demo_mode_marker(&serde_json::json!({"mode": "demo"})).is_some());
        assert!(demo_mode_marker(&serde_json::json!({"demo_mode": true})).is_some());
        assert!(demo_mode_marker(&serde_json::json!({"live": false})).is_some());
        assert!(demo_mode_marker(&serde_json::json!({"mode": "live"})).is_none());
        assert!(demo_mode_marker(&serde_json::json!({"live": true})).is_none());
    }

    #[test]
    fn test_no_match_detection() {
        assert!(reports_no_match(&serde_json::json!({"match": false})));
        assert!(reports_no_match(&serde_json::json!({"status": "no_match"})));
        assert!(!reports_no_match(
            &serde_json::json!({"match": true, "phones": []})
        ));
    }

    #[test]
    fn test_endpoint_join() {
        let config = HttpProviderConfig::new("https://api.example.com/", "key".into());
        let provider = HttpContactProvider::new(config).unwrap();
        assert_eq!(provider.endpoint(), "https://api.example.com/v1/lookup");
    }
}
