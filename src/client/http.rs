//! REST client for the remote execution platform.
//!
//! Requests carry a bearer access token. A 401 triggers one refresh through
//! the OpenID token endpoint followed by a single retry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{Instrument, debug, info, warn};

use super::ExecutionClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{ExecutionHandle, ExecutionStatus, Payload};
use crate::telemetry::http::{record_response_status, start_request_span};

const EXECUTION_PATH: &str = "/datasets/vip/execution/";
const MONITORING_PATH: &str = "/datasets/execution-monitoring/";
const MONITORING_ATTEMPTS: u32 = 3;

struct Tokens {
    access: Option<SecretString>,
    refresh: SecretString,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

/// HTTP implementation of [`ExecutionClient`].
pub struct HttpExecutionClient {
    http: reqwest::Client,
    api_url: String,
    auth_url: String,
    client_id: String,
    tokens: RwLock<Tokens>,
    monitoring_retry_delay: Duration,
}

impl HttpExecutionClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_url()?,
            client_id: config.client_id.clone(),
            tokens: RwLock::new(Tokens {
                access: config
                    .access_token
                    .as_ref()
                    .map(|t| SecretString::from(t.expose_secret().to_owned())),
                refresh: SecretString::from(config.refresh_token.expose_secret().to_owned()),
            }),
            monitoring_retry_delay: Duration::from_secs(2),
        })
    }

    pub fn with_monitoring_retry_delay(mut self, delay: Duration) -> Self {
        self.monitoring_retry_delay = delay;
        self
    }

    /// Make sure an access token is held, then return the current refresh
    /// token. Stored payloads embed it, so resumes rewrite them with this value.
    pub async fn current_refresh_token(&self) -> Result<SecretString> {
        self.access_token().await?;
        let tokens = self.tokens.read().await;
        Ok(SecretString::from(tokens.refresh.expose_secret().to_owned()))
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.tokens.read().await.access.as_ref() {
            return Ok(token.expose_secret().to_owned());
        }
        self.refresh_access_token().await
    }

    /// Exchange the refresh token for a new access token.
    async fn refresh_access_token(&self) -> Result<String> {
        let mut tokens = self.tokens.write().await;
        info!("refreshing access token");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", tokens.refresh.expose_secret()),
            ("client_id", self.client_id.as_str()),
        ];
        let response = self.http.post(&self.auth_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "token refresh rejected ({status}): {body}"
            )));
        }

        let parsed: TokenResponse = response.json().await?;
        if let Some(refresh) = parsed.refresh_token {
            tokens.refresh = SecretString::from(refresh);
        }
        let access = parsed.access_token;
        tokens.access = Some(SecretString::from(access.clone()));
        Ok(access)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Payload>,
    ) -> Result<reqwest::Response> {
        let span = start_request_span(method.as_str(), path);
        async {
            let build = |token: &str| {
                let request = self
                    .http
                    .request(method.clone(), self.url(path))
                    .bearer_auth(token);
                match body {
                    Some(payload) => request.json(payload),
                    None => request,
                }
            };

            let token = self.access_token().await?;
            let mut response = build(&token).send().await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                warn!(path, "access token rejected, retrying with a fresh one");
                let token = self.refresh_access_token().await?;
                response = build(&token).send().await?;
            }
            record_response_status(&tracing::Span::current(), response.status().as_u16());
            Ok::<_, Error>(response)
        }
        .instrument(span)
        .await
    }

    /// Resolve the monitoring identifier the status endpoint is keyed by.
    async fn monitoring_id(&self, execution_id: &str) -> Result<String> {
        let path = format!("{MONITORING_PATH}{execution_id}");
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = async {
                let response = self
                    .send(Method::GET, &path, None)
                    .await?
                    .error_for_status()?;
                let body: Value = response.json().await?;
                json_string(&body, "identifier").ok_or_else(|| {
                    Error::Other(format!(
                        "execution monitoring {execution_id} has no identifier"
                    ))
                })
            }
            .await;

            match result {
                Ok(id) => return Ok(id),
                Err(e) if attempt < MONITORING_ATTEMPTS => {
                    warn!(
                        execution_id,
                        attempt, "monitoring lookup failed: {e}, retrying"
                    );
                    tokio::time::sleep(self.monitoring_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn submit(&self, payload: &Payload) -> Result<ExecutionHandle> {
        let response = self.send(Method::POST, EXECUTION_PATH, Some(payload)).await?;
        let status = response.status();
        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        let id = if status.is_success() {
            json_string(&body, "id")
        } else {
            None
        };
        let Some(id) = id else {
            debug!(%status, "execution request rejected");
            let message = json_string(&body, "message").or_else(|| {
                (!text.is_empty()).then(|| format!("{status}: {text}"))
            });
            return Ok(ExecutionHandle::rejected(
                message,
                json_string(&body, "details"),
            ));
        };

        let monitoring_id = self
            .monitoring_id(&id)
            .await
            .map_err(|e| Error::Submission(format!("execution {id} created but not trackable: {e}")))?;
        Ok(ExecutionHandle::accepted(id, monitoring_id))
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus> {
        let key = handle
            .status_key()
            .ok_or_else(|| Error::TransientPolling("handle has no identifier".to_string()))?;
        let path = format!("{EXECUTION_PATH}{key}/status");
        let response = self
            .send(Method::GET, &path, None)
            .await
            .map_err(|e| Error::TransientPolling(e.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|e| Error::TransientPolling(e.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|e| Error::TransientPolling(e.to_string()))?;
        Ok(ExecutionStatus::parse(&text))
    }
}

/// Read `key` as a string, accepting numeric ids as well.
fn json_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_string_accepts_numbers_and_strings() {
        let body = json!({"id": 42, "identifier": "abc", "message": null});
        assert_eq!(json_string(&body, "id").as_deref(), Some("42"));
        assert_eq!(json_string(&body, "identifier").as_deref(), Some("abc"));
        assert_eq!(json_string(&body, "message"), None);
        assert_eq!(json_string(&body, "missing"), None);
    }
}
