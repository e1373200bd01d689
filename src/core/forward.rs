//! Calls to the subscription sub-server.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::context::RequestContext;
use crate::utils::http::{body_excerpt, join_url, with_bearer};

const BODY_EXCERPT_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no sub-server domain is configured")]
    NotConfigured,
    #[error("request carries no bearer token for the sub-server")]
    MissingToken,
    #[error("sub-server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("sub-server response has no `data` field")]
    MissingData,
    #[error("sub-server response could not be decoded: {0}")]
    Decode(String),
    #[error("sub-server unreachable: {0}")]
    Transport(String),
    #[error("forwarded request cancelled")]
    Cancelled,
}

#[derive(Clone)]
pub struct SubServerClient {
    client: reqwest::Client,
    domain: String,
    timeout: Option<Duration>,
}

impl SubServerClient {
    pub fn new(client: reqwest::Client, domain: impl Into<String>) -> Self {
        Self {
            client,
            domain: domain.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// POSTs `inputs` to `{domain}{path}` and returns the response's `data`
    /// field.
    ///
    /// The bearer token is taken from `ctx`. Non-2xx answers keep their
    /// status and an excerpt of the body.
    pub async fn post<I, O>(&self, path: &str, inputs: &I, ctx: &RequestContext) -> Result<O, ForwardError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        if self.domain.trim().is_empty() {
            return Err(ForwardError::NotConfigured);
        }
        let token = ctx
            .auth_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or(ForwardError::MissingToken)?;

        let url = join_url(&self.domain, path);
        let mut request = self.client.post(&url).json(inputs);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let request = with_bearer(request, Some(token));

        tracing::debug!(conversation_id = %ctx.conversation_id, url = %url, "Forwarding request");
        let response = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => return Err(ForwardError::Cancelled),
            response = request.send() => response.map_err(|err| ForwardError::Transport(err.to_string()))?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => return Err(ForwardError::Cancelled),
            body = response.text() => body.map_err(|err| ForwardError::Transport(err.to_string()))?,
        };

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), url = %url, "Sub-server rejected request");
            return Err(ForwardError::Status {
                status: status.as_u16(),
                body: body_excerpt(&body, BODY_EXCERPT_LIMIT),
            });
        }

        let mut envelope: Value =
            serde_json::from_str(&body).map_err(|err| ForwardError::Decode(err.to_string()))?;
        let data = envelope
            .get_mut("data")
            .map(Value::take)
            .ok_or(ForwardError::MissingData)?;
        serde_json::from_value(data).map_err(|err| ForwardError::Decode(err.to_string()))
    }
}
