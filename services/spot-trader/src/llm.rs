//! Text-completion client
//!
//! HTTP client for a local completion gateway. Used by the sentiment engine
//! and by the peg watchdog for corroboration; never on the order path.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::LlmSettings;
use crate::error::LlmError;

/// Anything that turns a prompt into text
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn generate(&self, prompt: &str, system_prompt: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    system_prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

/// Gateway client: POST /v1/generate
pub struct HttpCompletionClient {
    gateway_url: String,
    http_client: Client,
    timeout: Duration,
}

impl HttpCompletionClient {
    pub fn new(settings: &LlmSettings) -> Result<Self, LlmError> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        info!(
            "Completion client initialized: url={}, timeout={}s",
            settings.gateway_url, settings.timeout_secs
        );

        Ok(Self {
            gateway_url: settings.gateway_url.trim_end_matches('/').to_string(),
            http_client,
            timeout,
        })
    }
}

#[async_trait]
impl TextCompletion for HttpCompletionClient {
    async fn generate(&self, prompt: &str, system_prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/v1/generate", self.gateway_url);
        debug!("Requesting completion ({} prompt chars)", prompt.len());

        let response = self
            .http_client
            .post(&url)
            .json(&GenerateRequest {
                prompt,
                system_prompt,
            })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Completion gateway returned error: status={}, body={}", status, body);
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(format!("failed to parse completion: {}", e)))?;

        if reply.text.trim().is_empty() {
            return Err(LlmError::EmptyReply);
        }
        Ok(reply.text)
    }
}
