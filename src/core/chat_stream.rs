use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::{ChatMessage, ChatToolDefinition};
use crate::core::message::Role;
use crate::core::provider::{
    CompletionProvider, ProviderError, ProviderEvent, ProviderRequest, ResponseFormat,
    ToolCallDelta,
};
use crate::core::thinking::ThinkingSplitter;
use crate::core::tokens::TokenUsage;

#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// A single rendered template, sent under the caller's role.
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl Prompt {
    pub fn into_messages(self, role: Role) -> Vec<ChatMessage> {
        match self {
            Prompt::Text(text) => vec![ChatMessage::new(role.as_str(), text)],
            Prompt::Messages(messages) => messages,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub response_format: ResponseFormat,
    pub signal: CancellationToken,
    pub tools: Vec<ChatToolDefinition>,
}

impl CompletionOptions {
    pub fn with_signal(signal: CancellationToken) -> Self {
        Self {
            signal,
            ..Self::default()
        }
    }

    pub fn json(mut self) -> Self {
        self.response_format = ResponseFormat::Json;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ChatToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// A native tool call reassembled from streamed deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingToolCall {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

impl PendingToolCall {
    fn apply(&mut self, delta: ToolCallDelta) {
        if delta.id.is_some() {
            self.id = delta.id;
        }
        if let Some(name) = delta.name.filter(|name| !name.is_empty()) {
            self.name = Some(name);
        }
        if let Some(arguments) = delta.arguments {
            self.arguments.push_str(&arguments);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Exactly the concatenation of every delta passed to `on_token`.
    pub visible_text: String,
    pub reasoning_text: String,
    pub tool_calls: Vec<PendingToolCall>,
    /// Usage reported by the provider, when it sends any.
    pub usage: Option<TokenUsage>,
    /// Set when the visible text is a typed-out provider error.
    pub provider_error: Option<ProviderError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("completion cancelled")]
    Cancelled,
    #[error("provider requires attention before continuing ({reason})")]
    PauseRequired { reason: String, message: String },
    #[error("provider unreachable: {0}")]
    Transport(String),
}

/// Drives one request against a provider and streams visible text.
#[derive(Clone)]
pub struct CompletionEngine {
    provider: Arc<dyn CompletionProvider>,
    model: String,
}

enum Outcome {
    Finished,
    Failed(ProviderError),
}

impl CompletionEngine {
    pub fn new(provider: Arc<dyn CompletionProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Streams a completion, calling `on_token` once per visible fragment in
    /// arrival order.
    ///
    /// Inline `<think>` blocks are routed to `reasoning_text` and never reach
    /// `on_token`. Provider request errors are typed out character by
    /// character and returned as the visible text; pause-required errors are
    /// typed out as well but end in [`CompletionError::PauseRequired`].
    /// Cancellation stops all further callbacks.
    pub async fn complete<F>(
        &self,
        prompt: Prompt,
        conversation_id: &str,
        role: Role,
        options: CompletionOptions,
        mut on_token: F,
    ) -> Result<Completion, CompletionError>
    where
        F: FnMut(&str) + Send,
    {
        let signal = options.signal.clone();
        if signal.is_cancelled() {
            return Err(CompletionError::Cancelled);
        }

        let request = ProviderRequest {
            model: self.model.clone(),
            messages: prompt.into_messages(role),
            response_format: options.response_format,
            tools: options.tools,
        };
        tracing::debug!(
            conversation_id,
            model = %self.model,
            messages = request.messages.len(),
            "Starting completion"
        );

        let mut completion = Completion::default();
        let opened = tokio::select! {
            biased;
            _ = signal.cancelled() => return Err(CompletionError::Cancelled),
            opened = self.provider.open_stream(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                return type_out_error(err, completion, &signal, &mut on_token);
            }
        };

        let mut splitter = ThinkingSplitter::new();
        let mut calls: BTreeMap<u32, PendingToolCall> = BTreeMap::new();

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    tracing::debug!(conversation_id, "Completion cancelled mid-stream");
                    return Err(CompletionError::Cancelled);
                }
                next = stream.next() => next,
            };

            match next {
                None | Some(Ok(ProviderEvent::Done)) => break Outcome::Finished,
                Some(Ok(ProviderEvent::Content(text))) => {
                    let chunk = splitter.push(&text);
                    completion.reasoning_text.push_str(&chunk.reasoning);
                    emit(&mut completion, &chunk.visible, &mut on_token);
                }
                Some(Ok(ProviderEvent::Reasoning(text))) => {
                    completion.reasoning_text.push_str(&text);
                }
                Some(Ok(ProviderEvent::ToolCall(delta))) => {
                    calls.entry(delta.index).or_default().apply(delta);
                }
                Some(Ok(ProviderEvent::Usage(usage))) => completion.usage = Some(usage),
                Some(Err(err)) => break Outcome::Failed(err),
            }
        };

        let tail = splitter.finish();
        completion.reasoning_text.push_str(&tail.reasoning);
        emit(&mut completion, &tail.visible, &mut on_token);
        completion.tool_calls = calls.into_values().collect();

        match outcome {
            Outcome::Finished => {
                tracing::debug!(
                    conversation_id,
                    visible_len = completion.visible_text.len(),
                    tool_calls = completion.tool_calls.len(),
                    "Completion finished"
                );
                Ok(completion)
            }
            Outcome::Failed(err) => type_out_error(err, completion, &signal, &mut on_token),
        }
    }
}

fn emit<F: FnMut(&str)>(completion: &mut Completion, text: &str, on_token: &mut F) {
    if text.is_empty() {
        return;
    }
    completion.visible_text.push_str(text);
    on_token(text);
}

/// Streams a provider error to the caller one character at a time.
fn type_out_error<F: FnMut(&str)>(
    err: ProviderError,
    mut completion: Completion,
    signal: &CancellationToken,
    on_token: &mut F,
) -> Result<Completion, CompletionError> {
    let message = match &err {
        ProviderError::Transport(reason) => {
            tracing::warn!(error = %reason, "Provider transport failure");
            return Err(CompletionError::Transport(reason.clone()));
        }
        ProviderError::Request { message, .. } | ProviderError::PauseRequired { message, .. } => {
            message.clone()
        }
    };
    tracing::warn!(pause = err.is_pause_required(), "Provider returned an error");

    let separator = if completion.visible_text.is_empty() {
        ""
    } else {
        "\n\n"
    };
    let mut buf = [0u8; 4];
    for ch in separator.chars().chain(message.chars()) {
        if signal.is_cancelled() {
            return Err(CompletionError::Cancelled);
        }
        emit(&mut completion, ch.encode_utf8(&mut buf), on_token);
    }

    match err {
        ProviderError::PauseRequired {
            reason, message, ..
        } => Err(CompletionError::PauseRequired { reason, message }),
        other => {
            completion.provider_error = Some(other);
            Ok(completion)
        }
    }
}
