//! Provider adapters: turn a chat request into a stream of typed events.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;

use crate::api::{
    ChatMessage, ChatRequest, ChatResponse, ChatToolDefinition, ResponseFormatSpec,
    StreamOptions,
};
use crate::core::tokens::TokenUsage;
use crate::utils::http::{join_url, with_bearer};
use crate::utils::sse::{sse_data_payload, SseLineBuffer};

/// Error codes that mean the account cannot continue without outside action.
const PAUSE_ERROR_CODES: &[&str] = &[
    "insufficient_quota",
    "insufficient_credits",
    "billing_hard_limit_reached",
    "payment_required",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub response_format: ResponseFormat,
    pub tools: Vec<ChatToolDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Content(String),
    Reasoning(String),
    ToolCall(ToolCallDelta),
    Usage(TokenUsage),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Rejected request (bad input, rate limit, auth). `message` is already
    /// formatted for display.
    #[error("{message}")]
    Request { status: Option<u16>, message: String },
    /// Billing or quota exhaustion; never retried.
    #[error("{message}")]
    PauseRequired {
        status: Option<u16>,
        reason: String,
        message: String,
    },
    #[error("provider transport failed: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn is_pause_required(&self) -> bool {
        matches!(self, ProviderError::PauseRequired { .. })
    }
}

pub type ProviderStream = BoxStream<'static, Result<ProviderEvent, ProviderError>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Opens a streaming completion. Request-level rejections are reported
    /// here; failures after the first byte arrive through the stream.
    async fn open_stream(&self, request: ProviderRequest) -> Result<ProviderStream, ProviderError>;
}

/// OpenAI-compatible `chat/completions` over SSE.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    fn build_request(request: ProviderRequest) -> ChatRequest {
        ChatRequest {
            model: request.model,
            messages: request.messages,
            stream: true,
            tools: (!request.tools.is_empty()).then_some(request.tools),
            response_format: match request.response_format {
                ResponseFormat::Json => Some(ResponseFormatSpec {
                    kind: "json_object".to_string(),
                }),
                ResponseFormat::Text => None,
            },
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn open_stream(&self, request: ProviderRequest) -> Result<ProviderStream, ProviderError> {
        let chat_url = join_url(&self.base_url, "chat/completions");
        let model = request.model.clone();
        let body = Self::build_request(request);

        let http_request = self
            .client
            .post(&chat_url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        let response = with_bearer(http_request, self.api_key.as_deref())
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            tracing::warn!(status = status.as_u16(), model = %model, "Provider rejected request");
            return Err(classify_error(Some(status.as_u16()), &error_text));
        }

        tracing::debug!(model = %model, url = %chat_url, "Provider stream opened");
        Ok(sse_events(Box::pin(response.bytes_stream())).boxed())
    }
}

struct SseState<S> {
    body: S,
    lines: SseLineBuffer,
    queue: VecDeque<Result<ProviderEvent, ProviderError>>,
    finished: bool,
}

impl<S> SseState<S> {
    fn handle_line(&mut self, line: &str) {
        if self.finished {
            return;
        }
        let Some(payload) = sse_data_payload(line) else {
            return;
        };
        for event in events_from_payload(payload) {
            let terminal = matches!(event, Ok(ProviderEvent::Done) | Err(_));
            self.queue.push_back(event);
            if terminal {
                self.finished = true;
                return;
            }
        }
    }
}

/// Adapts an SSE byte stream into provider events, ending after `Done` or
/// the first error. A body that ends without `[DONE]` still yields `Done`.
fn sse_events<S, B, E>(body: S) -> impl Stream<Item = Result<ProviderEvent, ProviderError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let state = SseState {
        body,
        lines: SseLineBuffer::default(),
        queue: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    for line in state.lines.push(chunk.as_ref()) {
                        state.handle_line(&line);
                    }
                }
                Some(Err(err)) => {
                    state
                        .queue
                        .push_back(Err(ProviderError::Transport(err.to_string())));
                    state.finished = true;
                }
                None => {
                    for line in state.lines.finish() {
                        state.handle_line(&line);
                    }
                    if !state.finished {
                        state.queue.push_back(Ok(ProviderEvent::Done));
                        state.finished = true;
                    }
                }
            }
        }
    })
}

/// Decodes one SSE `data:` payload.
fn events_from_payload(payload: &str) -> Vec<Result<ProviderEvent, ProviderError>> {
    if payload == "[DONE]" {
        return vec![Ok(ProviderEvent::Done)];
    }
    if payload.trim().is_empty() {
        return Vec::new();
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => return vec![Err(classify_error(None, payload))],
    };
    if value.get("error").is_some() {
        return vec![Err(classify_error(None, payload))];
    }
    let response: ChatResponse = match serde_json::from_value(value) {
        Ok(response) => response,
        Err(_) => return vec![Err(classify_error(None, payload))],
    };

    let mut events = Vec::new();
    if let Some(choice) = response.choices.into_iter().next() {
        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.filter(|text| !text.is_empty()) {
            events.push(Ok(ProviderEvent::Reasoning(reasoning)));
        }
        if let Some(content) = delta.content.filter(|text| !text.is_empty()) {
            events.push(Ok(ProviderEvent::Content(content)));
        }
        for (position, call) in delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            events.push(Ok(ProviderEvent::ToolCall(ToolCallDelta {
                index: call.index.unwrap_or(position as u32),
                id: call.id,
                name,
                arguments,
            })));
        }
    }
    if let Some(usage) = response.usage {
        events.push(Ok(ProviderEvent::Usage(TokenUsage::new(
            usage.prompt_tokens,
            usage.completion_tokens,
        ))));
    }
    events
}

/// Types an error body as pause-required or as an ordinary request error.
pub fn classify_error(status: Option<u16>, body: &str) -> ProviderError {
    let message = format_api_error(body);
    let parsed = serde_json::from_str::<Value>(body.trim()).ok();
    let code = parsed.as_ref().and_then(error_code);

    let pause_reason = match (status, code.as_deref()) {
        (_, Some(code)) if PAUSE_ERROR_CODES.contains(&code) => Some(code.to_string()),
        (Some(402), code) => Some(code.unwrap_or("payment_required").to_string()),
        _ => None,
    };

    match pause_reason {
        Some(reason) => ProviderError::PauseRequired {
            status,
            reason,
            message,
        },
        None => ProviderError::Request { status, message },
    }
}

fn error_code(value: &Value) -> Option<String> {
    ["/error/code", "/error/type", "/code", "/type"]
        .iter()
        .find_map(|pointer| value.pointer(pointer).and_then(Value::as_str))
        .map(str::to_owned)
}

fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Renders a provider error body as `API Error: <summary>` plus a fenced copy
/// of the body.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            if let Some(summary) = extract_error_summary(&json_value) {
                if !summary.is_empty() {
                    return format!("API Error: {}\n```json\n{}\n```", summary, pretty_json);
                }
            }
            return format!("API Error:\n```json\n{}\n```", pretty_json);
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{}\n```", trimmed)
    } else {
        format!("API Error:\n```\n{}\n```", trimmed)
    }
}
