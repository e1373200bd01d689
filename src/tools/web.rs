use async_trait::async_trait;
use serde_json::json;

use crate::core::action::{Action, ActionResult};
use crate::core::context::RequestContext;
use crate::tools::schema::{normalize_arguments, required_str, ParameterType, ToolSchema};
use crate::tools::{Tool, ToolError};
use crate::utils::http::body_excerpt;

pub const WEB_FETCH_TOOL: &str = "web_fetch";
const DEFAULT_MAX_CHARS: usize = 20_000;

/// Fetches a URL over HTTP GET and returns the body as text.
pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        WEB_FETCH_TOOL
    }

    fn description(&self) -> &str {
        "Fetch a web page or API endpoint and return the response body"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
            .param("url", ParameterType::String, "Absolute http(s) URL", true)
            .param(
                "max_chars",
                ParameterType::Integer,
                "Maximum characters of body to return",
                false,
            )
    }

    async fn execute(
        &self,
        action: &Action,
        correlation_id: &str,
        ctx: &RequestContext,
    ) -> Result<ActionResult, ToolError> {
        let args = normalize_arguments(&action.params)?;
        let url = required_str(&args, "url")?;
        let parsed = reqwest::Url::parse(url)
            .map_err(|err| ToolError::InvalidArguments(format!("invalid url `{url}`: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ToolError::InvalidArguments(format!(
                "unsupported url scheme `{}`",
                parsed.scheme()
            )));
        }
        let max_chars = args
            .get("max_chars")
            .and_then(|value| value.as_u64())
            .map(|value| value as usize)
            .unwrap_or(DEFAULT_MAX_CHARS);
        tracing::debug!(correlation_id, url, "Fetching URL");

        let fetch = async {
            let response = self.client.get(parsed).send().await.map_err(map_http_error)?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.map_err(map_http_error)?;
            Ok::<_, ToolError>((status, content_type, body))
        };
        let (status, content_type, body) = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => return Err(ToolError::Cancelled),
            fetched = fetch => fetched?,
        };

        if !status.is_success() {
            return Err(ToolError::Http {
                message: format!("{url} returned {status}: {}", body_excerpt(&body, 200)),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }

        let mut text: String = body.chars().take(max_chars).collect();
        if text.len() < body.len() {
            text.push_str("\n[content truncated]");
        }
        Ok(ActionResult::success(text)
            .with_metadata("status", json!(status.as_u16()))
            .with_metadata("content_type", json!(content_type)))
    }
}

fn map_http_error(err: reqwest::Error) -> ToolError {
    ToolError::Http {
        retryable: err.is_connect() || err.is_timeout(),
        message: err.to_string(),
    }
}
