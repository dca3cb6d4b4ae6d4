#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::config::{Credential, ProviderConfig};

// ***************************************************************************
//                                Constants
// ***************************************************************************
const COMPLETIONS_PATH: &str = "/chat/completions";
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

// Substrings that mark an exhausted plan or rate limit in provider error bodies.
const QUOTA_MARKERS: [&str; 2] = ["insufficient_quota", "429"];

// ***************************************************************************
//                                 Errors
// ***************************************************************************
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion request timed out after {0:?}")]
    Timeout(Duration),

    #[error("completion api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("completion api returned no message content")]
    EmptyCompletion,
}

impl ProviderError {
    /** True when the provider reports an exhausted quota or rate limit: a 429
     * status, or a quota marker in the body the provider sent back.  Failures
     * we detect ourselves (timeouts, transport errors) never count.
     */
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            ProviderError::Api {status, body} => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || QUOTA_MARKERS.iter().any(|m| body.contains(m))
            }
            _ => false,
        }
    }

    /// Failures worth one more attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) => true,
            ProviderError::Http(e) => e.is_connect(),
            _ => false,
        }
    }
}

// ***************************************************************************
//                          Completion Provider Seam
// ***************************************************************************
/// One system instruction plus one user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest<'a> {
    pub system_prompt: &'a str,
    pub user_message: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Return the generated text for the request.
    async fn complete(&self, req: &CompletionRequest<'_>) -> Result<String, ProviderError>;
}

// ***************************************************************************
//                             OpenAI Client
// ***************************************************************************
// Wire format of the chat completions api.
#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: [WireMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResp {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/** Client for OpenAI-compatible chat completion endpoints. */
#[derive(Debug)]
pub struct OpenAiClient {
    http: Client,
    url: String,
    model: String,
    credential: Credential,
    timeout: Duration,
    retry_transient: bool,
}

impl OpenAiClient {
    pub fn new(config: &ProviderConfig, credential: Credential) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: config.api_base.trim_end_matches('/').to_string() + COMPLETIONS_PATH,
            model: config.model.clone(),
            credential,
            timeout,
            retry_transient: config.retry_transient,
        })
    }

    async fn send_once(&self, req: &CompletionRequest<'_>) -> Result<String, ProviderError> {
        let body = ChatCompletionBody {
            model: &self.model,
            messages: [
                WireMessage {role: "system", content: req.system_prompt},
                WireMessage {role: "user", content: req.user_message},
            ],
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };

        let resp = self.http.post(&self.url)
            .bearer_auth(self.credential.secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {status: status.as_u16(), body});
        }

        let data: ChatCompletionResp = resp.json().await.map_err(|e| self.map_reqwest(e))?;
        data.choices.into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(ProviderError::EmptyCompletion)
    }

    fn map_reqwest(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {ProviderError::Timeout(self.timeout)} else {ProviderError::Http(e)}
    }
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    async fn complete(&self, req: &CompletionRequest<'_>) -> Result<String, ProviderError> {
        debug!("Sending completion request to {} using model {}.", self.url, self.model);
        match self.send_once(req).await {
            Err(e) if self.retry_transient && e.is_transient() => {
                warn!("Retrying completion request after transient failure: {}", e);
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.send_once(req).await
            }
            other => other,
        }
    }
}
