//! Top-level agent operations.
//!
//! Every operation asks the [`ModelRouter`] where it runs, then either drives
//! the local [`CompletionEngine`] or forwards the request to the subscription
//! sub-server. Token usage is estimated the same way on both paths and
//! recorded once per operation through
//! [`ConversationStore::add_token_usage`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::api::{ChatMessage, ChatToolDefinition};
use crate::core::action::{extract_actions, Action, ActionResult};
use crate::core::chat_stream::{CompletionEngine, CompletionError, CompletionOptions, Prompt};
use crate::core::context::RequestContext;
use crate::core::conversation::{Conversation, ConversationStore, StoreError};
use crate::core::dispatch::{memory_message, ActionDispatcher};
use crate::core::forward::{ForwardError, SubServerClient};
use crate::core::message::{Message, Role, ROOT_PID};
use crate::core::prompts::{self, render};
use crate::core::provider::ProviderError;
use crate::core::router::{ExecutionPath, ModelRouter, RouteDecision, RouterError, StoreModelSource};
use crate::core::tokens::{count_message_tokens, count_tokens, TokenUsage};

pub const DEFAULT_MAX_STEPS: usize = 8;
const MAX_TITLE_CHARS: usize = 80;

const CHAT_PATH: &str = "/api/agent/chat";
const REPLY_PATH: &str = "/api/agent/reply";
const TITLE_PATH: &str = "/api/agent/title";
const AGENT_PATH: &str = "/api/agent/generate";
const SUMMARY_PATH: &str = "/api/agent/summary";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("provider requires attention before continuing ({reason}): {message}")]
    PauseRequired { reason: String, message: String },
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Forward(ForwardError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error(transparent)]
    Provider(ProviderError),
    #[error("unexpected model response: {0}")]
    InvalidResponse(String),
}

impl From<CompletionError> for OrchestratorError {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::Cancelled => OrchestratorError::Cancelled,
            CompletionError::PauseRequired { reason, message } => {
                OrchestratorError::PauseRequired { reason, message }
            }
            CompletionError::Transport(reason) => OrchestratorError::Transport(reason),
        }
    }
}

impl From<ForwardError> for OrchestratorError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Cancelled => OrchestratorError::Cancelled,
            other => OrchestratorError::Forward(other),
        }
    }
}

/// Progress reported while `chat_completion` runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Token(String),
    ActionStarted {
        action: Action,
    },
    ActionFinished {
        correlation_id: String,
        action: Action,
        result: ActionResult,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub correlation_id: String,
    pub action: Action,
    pub result: ActionResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub path: ExecutionPath,
    /// The last non-empty assistant text of the run.
    pub reply: String,
    pub steps: usize,
    pub actions: Vec<ActionRecord>,
    /// Usage charged by this run.
    pub usage: TokenUsage,
    /// Conversation totals after this run.
    pub totals: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub description: String,
    pub instructions: String,
}

#[derive(Serialize)]
struct ChatInputs<'a> {
    conversation_id: &'a str,
    goal: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Serialize)]
struct HistoryInputs<'a> {
    conversation_id: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Serialize)]
struct TitleInputs<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct AgentInputs<'a> {
    description: &'a str,
}

struct RunState {
    leaf: String,
    steps: usize,
    reply: String,
    usage: TokenUsage,
    actions: Vec<ActionRecord>,
}

pub struct Orchestrator {
    store: Arc<dyn ConversationStore>,
    router: ModelRouter,
    engine: CompletionEngine,
    dispatcher: ActionDispatcher,
    sub_server: SubServerClient,
    max_steps: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        engine: CompletionEngine,
        dispatcher: ActionDispatcher,
        sub_server: SubServerClient,
    ) -> Self {
        let router = ModelRouter::new(Arc::new(StoreModelSource::new(store.clone())));
        Self {
            store,
            router,
            engine,
            dispatcher,
            sub_server,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_router(mut self, router: ModelRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Runs the agent loop for `goal` in `ctx.conversation_id`.
    ///
    /// The user message is appended to the active branch, then the model is
    /// asked repeatedly until it answers without an action or the step limit
    /// is reached. Actions from one completion run concurrently; their tool
    /// messages are appended in issue order.
    pub async fn chat_completion<F>(
        &self,
        goal: &str,
        ctx: &RequestContext,
        mut on_event: F,
    ) -> Result<ChatOutcome, OrchestratorError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let conversation = self.store.get_or_create(&ctx.conversation_id).await?;
        let decision = self.route(ctx).await?;
        let leaf = leaf_of(&conversation)?;
        let user = self
            .store
            .append_message(&ctx.conversation_id, Message::new(leaf, Role::User, goal))
            .await?;

        let mut state = RunState {
            leaf: user.id,
            steps: 0,
            reply: String::new(),
            usage: TokenUsage::default(),
            actions: Vec::new(),
        };
        let run = match decision.path {
            ExecutionPath::Local => self.agent_steps(ctx, &mut state, &mut on_event).await,
            ExecutionPath::Forward => {
                self.forward_chat(goal, ctx, &decision, &mut state, &mut on_event)
                    .await
            }
        };

        let totals = self.record_usage(ctx, state.usage).await?;
        run?;
        tracing::info!(
            conversation_id = %ctx.conversation_id,
            path = decision.path.as_str(),
            steps = state.steps,
            actions = state.actions.len(),
            "Chat completion finished"
        );
        Ok(ChatOutcome {
            path: decision.path,
            reply: state.reply,
            steps: state.steps,
            actions: state.actions,
            usage: state.usage,
            totals,
        })
    }

    async fn agent_steps<F>(
        &self,
        ctx: &RequestContext,
        state: &mut RunState,
        on_event: &mut F,
    ) -> Result<(), OrchestratorError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let model = self.engine.model().to_string();
        let tools: Vec<ChatToolDefinition> = self.dispatcher.registry().definitions(ctx).await;
        let mut actions_run = 0_usize;

        while state.steps < self.max_steps {
            state.steps += 1;
            let conversation = self.load(&ctx.conversation_id).await?;
            let messages = history_messages(&conversation, prompts::AGENT_SYSTEM_PROMPT)?;
            state.usage.input_tokens += count_message_tokens(&messages, &model);

            let options = CompletionOptions::with_signal(ctx.signal.clone()).with_tools(tools.clone());
            let completion = self
                .engine
                .complete(
                    Prompt::Messages(messages),
                    &ctx.conversation_id,
                    Role::Assistant,
                    options,
                    |delta| on_event(AgentEvent::Token(delta.to_string())),
                )
                .await;
            let completion = match completion {
                Ok(completion) => completion,
                Err(err) => {
                    state.usage.output_tokens += count_tokens(typed_output(&err), &model);
                    return Err(err.into());
                }
            };
            state.usage.output_tokens += count_tokens(&completion.visible_text, &model);

            let mut actions = if completion.provider_error.is_some() {
                Vec::new()
            } else {
                extract_actions(&completion.tool_calls, &completion.visible_text)
            };
            actions.truncate(self.max_steps.saturating_sub(actions_run));

            if !completion.visible_text.is_empty() || !actions.is_empty() {
                let assistant = Message::new(
                    state.leaf.as_str(),
                    Role::Assistant,
                    completion.visible_text.clone(),
                );
                state.leaf = self
                    .store
                    .append_message(&ctx.conversation_id, assistant)
                    .await?
                    .id;
            }
            if !completion.visible_text.trim().is_empty() {
                state.reply = completion.visible_text;
            }
            if actions.is_empty() {
                break;
            }

            for action in &actions {
                on_event(AgentEvent::ActionStarted {
                    action: action.clone(),
                });
            }
            let results = self.dispatcher.dispatch_all(&actions, ctx).await;
            if ctx.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            actions_run += actions.len();

            for (action, (correlation_id, result)) in actions.into_iter().zip(results) {
                let message = memory_message(&action, &correlation_id, &result, &state.leaf);
                state.leaf = self
                    .store
                    .append_message(&ctx.conversation_id, message)
                    .await?
                    .id;
                on_event(AgentEvent::ActionFinished {
                    correlation_id: correlation_id.clone(),
                    action: action.clone(),
                    result: result.clone(),
                });
                state.actions.push(ActionRecord {
                    correlation_id,
                    action,
                    result,
                });
            }
        }
        Ok(())
    }

    async fn forward_chat<F>(
        &self,
        goal: &str,
        ctx: &RequestContext,
        decision: &RouteDecision,
        state: &mut RunState,
        on_event: &mut F,
    ) -> Result<(), OrchestratorError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let conversation = self.load(&ctx.conversation_id).await?;
        let messages = history_messages(&conversation, prompts::AGENT_SYSTEM_PROMPT)?;
        let model = self.accounting_model(decision);
        state.steps = 1;
        state.usage.input_tokens += count_message_tokens(&messages, &model);

        let reply: String = self
            .sub_server
            .post(
                CHAT_PATH,
                &ChatInputs {
                    conversation_id: &ctx.conversation_id,
                    goal,
                    messages: &messages,
                },
                ctx,
            )
            .await?;
        state.usage.output_tokens += count_tokens(&reply, &model);
        if !reply.is_empty() {
            on_event(AgentEvent::Token(reply.clone()));
            let assistant = Message::new(state.leaf.as_str(), Role::Assistant, reply.clone());
            state.leaf = self
                .store
                .append_message(&ctx.conversation_id, assistant)
                .await?
                .id;
        }
        state.reply = reply;
        Ok(())
    }

    /// Answers the latest message of the active branch without tools.
    pub async fn auto_reply<F>(&self, ctx: &RequestContext, mut on_token: F) -> Result<String, OrchestratorError>
    where
        F: FnMut(&str) + Send,
    {
        let decision = self.route(ctx).await?;
        let conversation = self.load(&ctx.conversation_id).await?;
        let messages = history_messages(&conversation, prompts::AUTO_REPLY_PROMPT)?;
        let model = self.accounting_model(&decision);

        let reply = match decision.path {
            ExecutionPath::Local => {
                let completion = self
                    .engine
                    .complete(
                        Prompt::Messages(messages.clone()),
                        &ctx.conversation_id,
                        Role::Assistant,
                        CompletionOptions::with_signal(ctx.signal.clone()),
                        &mut on_token,
                    )
                    .await;
                match completion {
                    Ok(completion) => completion.visible_text,
                    Err(err) => {
                        self.record_usage(ctx, self.estimate(&decision, &messages, typed_output(&err)))
                            .await?;
                        return Err(err.into());
                    }
                }
            }
            ExecutionPath::Forward => {
                let reply: String = self
                    .sub_server
                    .post(
                        REPLY_PATH,
                        &HistoryInputs {
                            conversation_id: &ctx.conversation_id,
                            messages: &messages,
                        },
                        ctx,
                    )
                    .await?;
                on_token(&reply);
                reply
            }
        };

        if !reply.is_empty() {
            let leaf = leaf_of(&conversation)?;
            self.store
                .append_message(
                    &ctx.conversation_id,
                    Message::new(leaf, Role::Assistant, reply.clone()),
                )
                .await?;
        }
        self.record_usage(
            ctx,
            TokenUsage::new(
                count_message_tokens(&messages, &model),
                count_tokens(&reply, &model),
            ),
        )
        .await?;
        Ok(reply)
    }

    /// A short single-line title for `content`.
    pub async fn generate_title(
        &self,
        content: &str,
        ctx: &RequestContext,
    ) -> Result<String, OrchestratorError> {
        let decision = self.route(ctx).await?;
        let raw = match decision.path {
            ExecutionPath::Local => {
                let prompt = render(prompts::TITLE_PROMPT, &[("content", content)]);
                self.complete_once(ctx, &decision, prompt, CompletionOptions::with_signal(ctx.signal.clone()))
                    .await?
            }
            ExecutionPath::Forward => {
                let title: String = self
                    .sub_server
                    .post(TITLE_PATH, &TitleInputs { content }, ctx)
                    .await?;
                self.record_usage(
                    ctx,
                    self.estimate(&decision, &[ChatMessage::new(Role::User.as_str(), content)], &title),
                )
                .await?;
                title
            }
        };
        Ok(clean_title(&raw))
    }

    /// Drafts an assistant profile from a free-form description.
    pub async fn generate_agent(
        &self,
        description: &str,
        ctx: &RequestContext,
    ) -> Result<AgentProfile, OrchestratorError> {
        let decision = self.route(ctx).await?;
        match decision.path {
            ExecutionPath::Local => {
                let prompt = render(prompts::AGENT_GENERATION_PROMPT, &[("description", description)]);
                let raw = self
                    .complete_once(
                        ctx,
                        &decision,
                        prompt,
                        CompletionOptions::with_signal(ctx.signal.clone()).json(),
                    )
                    .await?;
                parse_json_reply(&raw)
            }
            ExecutionPath::Forward => {
                let profile: AgentProfile = self
                    .sub_server
                    .post(AGENT_PATH, &AgentInputs { description }, ctx)
                    .await?;
                let rendered = serde_json::to_string(&profile)
                    .map_err(|err| OrchestratorError::InvalidResponse(err.to_string()))?;
                self.record_usage(
                    ctx,
                    self.estimate(
                        &decision,
                        &[ChatMessage::new(Role::User.as_str(), description)],
                        &rendered,
                    ),
                )
                .await?;
                Ok(profile)
            }
        }
    }

    /// Summarizes the active branch of the conversation.
    pub async fn summarize(&self, ctx: &RequestContext) -> Result<String, OrchestratorError> {
        let decision = self.route(ctx).await?;
        let conversation = self.load(&ctx.conversation_id).await?;
        let summary = match decision.path {
            ExecutionPath::Local => {
                let transcript = transcript(&conversation)?;
                let prompt = render(prompts::SUMMARY_PROMPT, &[("transcript", &transcript)]);
                self.complete_once(ctx, &decision, prompt, CompletionOptions::with_signal(ctx.signal.clone()))
                    .await?
            }
            ExecutionPath::Forward => {
                let messages = history_messages(&conversation, prompts::AUTO_REPLY_PROMPT)?;
                let summary: String = self
                    .sub_server
                    .post(
                        SUMMARY_PATH,
                        &HistoryInputs {
                            conversation_id: &ctx.conversation_id,
                            messages: &messages,
                        },
                        ctx,
                    )
                    .await?;
                self.record_usage(ctx, self.estimate(&decision, &messages, &summary))
                    .await?;
                summary
            }
        };
        Ok(summary.trim().to_string())
    }

    /// One local completion of a rendered template, with usage recorded.
    async fn complete_once(
        &self,
        ctx: &RequestContext,
        decision: &RouteDecision,
        prompt: String,
        options: CompletionOptions,
    ) -> Result<String, OrchestratorError> {
        let messages = Prompt::Text(prompt).into_messages(Role::User);
        let completion = self
            .engine
            .complete(
                Prompt::Messages(messages.clone()),
                &ctx.conversation_id,
                Role::User,
                options,
                |_| {},
            )
            .await;
        let completion = match completion {
            Ok(completion) => completion,
            Err(err) => {
                self.record_usage(ctx, self.estimate(decision, &messages, typed_output(&err)))
                    .await?;
                return Err(err.into());
            }
        };
        self.record_usage(ctx, self.estimate(decision, &messages, &completion.visible_text))
            .await?;
        match completion.provider_error {
            Some(err) => Err(OrchestratorError::Provider(err)),
            None => Ok(completion.visible_text),
        }
    }

    async fn route(&self, ctx: &RequestContext) -> Result<RouteDecision, OrchestratorError> {
        if ctx.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        Ok(self.router.choose_execution_path(&ctx.conversation_id).await?)
    }

    async fn load(&self, conversation_id: &str) -> Result<Conversation, OrchestratorError> {
        self.store
            .get(conversation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()).into())
    }

    fn accounting_model(&self, decision: &RouteDecision) -> String {
        match decision.path {
            ExecutionPath::Local => self.engine.model().to_string(),
            ExecutionPath::Forward => decision
                .descriptor
                .model
                .clone()
                .unwrap_or_else(|| self.engine.model().to_string()),
        }
    }

    fn estimate(&self, decision: &RouteDecision, messages: &[ChatMessage], output: &str) -> TokenUsage {
        let model = self.accounting_model(decision);
        TokenUsage::new(count_message_tokens(messages, &model), count_tokens(output, &model))
    }

    async fn record_usage(
        &self,
        ctx: &RequestContext,
        usage: TokenUsage,
    ) -> Result<TokenUsage, OrchestratorError> {
        let totals = self.store.add_token_usage(&ctx.conversation_id, usage).await?;
        tracing::debug!(
            conversation_id = %ctx.conversation_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            total_input = totals.input_tokens,
            total_output = totals.output_tokens,
            "Token usage recorded"
        );
        Ok(totals)
    }
}

/// Text a failed completion already streamed to the caller.
fn typed_output(err: &CompletionError) -> &str {
    match err {
        CompletionError::PauseRequired { message, .. } => message,
        CompletionError::Cancelled | CompletionError::Transport(_) => "",
    }
}

fn leaf_of(conversation: &Conversation) -> Result<String, OrchestratorError> {
    Ok(conversation
        .active_leaf_id()
        .map_err(StoreError::from)?
        .unwrap_or_else(|| ROOT_PID.to_string()))
}

fn history_messages(
    conversation: &Conversation,
    system_prompt: &str,
) -> Result<Vec<ChatMessage>, OrchestratorError> {
    let path = conversation.active_path().map_err(StoreError::from)?;
    let mut messages = Vec::with_capacity(path.len() + 1);
    messages.push(ChatMessage::new(Role::System.as_str(), system_prompt));
    messages.extend(path.into_iter().map(Message::to_api_message));
    Ok(messages)
}

fn transcript(conversation: &Conversation) -> Result<String, OrchestratorError> {
    let path = conversation.active_path().map_err(StoreError::from)?;
    Ok(path
        .iter()
        .map(|message| format!("{}: {}", message.role.as_str(), message.content))
        .collect::<Vec<_>>()
        .join("\n"))
}

fn clean_title(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("title:"))
        .unwrap_or(line)
        .trim()
        .trim_matches(|ch| matches!(ch, '"' | '\'' | '`' | '*'))
        .trim_end_matches('.')
        .trim();
    line.chars().take(MAX_TITLE_CHARS).collect()
}

fn parse_json_reply<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, OrchestratorError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    let value: Value = serde_json::from_str(body)
        .map_err(|err| OrchestratorError::InvalidResponse(format!("reply is not JSON: {err}")))?;
    serde_json::from_value(value).map_err(|err| OrchestratorError::InvalidResponse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use crate::core::action::ActionStatus;
    use crate::core::conversation::InMemoryConversationStore;
    use crate::core::provider::{ProviderEvent, ToolCallDelta};
    use crate::tools::terminal::TerminalRunTool;
    use crate::tools::{ToolRegistry, Workspace};
    use crate::utils::test_utils::{
        http_response, serve_sequence, test_http_client, ScriptedProvider, ScriptedReply,
    };

    const MODEL: &str = "gpt-4o-mini";

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<InMemoryConversationStore>,
        provider: Arc<ScriptedProvider>,
        _workspace: TempDir,
    }

    fn harness(replies: Vec<ScriptedReply>, sub_server: &str) -> Harness {
        let workspace = TempDir::new().expect("tempdir");
        let registry = ToolRegistry::builder()
            .register(TerminalRunTool::new(
                Workspace::new(workspace.path()),
                Duration::from_secs(10),
            ))
            .build()
            .expect("registry");
        let store = Arc::new(InMemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(replies));
        let orchestrator = Orchestrator::new(
            store.clone(),
            CompletionEngine::new(provider.clone(), MODEL),
            ActionDispatcher::new(Arc::new(registry)),
            SubServerClient::new(test_http_client(), sub_server),
        );
        Harness {
            orchestrator,
            store,
            provider,
            _workspace: workspace,
        }
    }

    fn tool_call(name: &str, arguments: &str) -> Result<ProviderEvent, ProviderError> {
        Ok(ProviderEvent::ToolCall(ToolCallDelta {
            index: 0,
            id: Some("call-1".into()),
            name: Some(name.into()),
            arguments: Some(arguments.into()),
        }))
    }

    #[tokio::test]
    async fn failed_terminal_action_is_recorded_and_tokens_are_counted() {
        let h = harness(
            vec![
                ScriptedReply::Events(vec![
                    Ok(ProviderEvent::Content("Sure".into())),
                    Ok(ProviderEvent::Content(", ".into())),
                    Ok(ProviderEvent::Content("listing...".into())),
                    tool_call("terminal_run", r#"{"command":"exit 3"}"#),
                    Ok(ProviderEvent::Done),
                ]),
                ScriptedReply::text(&[]),
            ],
            "",
        );

        let mut tokens = Vec::new();
        let mut finished = Vec::new();
        let outcome = h
            .orchestrator
            .chat_completion("list files", &RequestContext::new("c1"), |event| match event {
                AgentEvent::Token(delta) => tokens.push(delta),
                AgentEvent::ActionFinished { result, .. } => finished.push(result),
                AgentEvent::ActionStarted { .. } => {}
            })
            .await
            .expect("chat completion");

        assert_eq!(tokens, vec!["Sure", ", ", "listing..."]);
        assert_eq!(outcome.reply, "Sure, listing...");
        assert_eq!(outcome.steps, 2);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, ActionStatus::Failure);
        assert_eq!(h.provider.request_count(), 2);

        let conversation = h.store.get("c1").await.expect("get").expect("exists");
        let path = conversation.active_path().expect("path");
        let roles: Vec<Role> = path.iter().map(|message| message.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
        let tool_message = path[2];
        assert_eq!(tool_message.metadata.status, Some(ActionStatus::Failure));
        assert_eq!(tool_message.metadata.action_type.as_deref(), Some("terminal_run"));
        assert!(tool_message.content.contains("command exited with status 3"));

        assert_eq!(conversation.output_tokens, count_tokens("Sure, listing...", MODEL));
        assert!(conversation.input_tokens > 0);
        assert_eq!(outcome.totals, conversation.usage());

        let second = &h.provider.requests.lock().expect("requests")[1];
        let last = second.messages.last().expect("observation");
        assert!(last.content.starts_with("Observation from `terminal_run` (failure)"));
        assert_eq!(second.tools.len(), 1);
    }

    #[tokio::test]
    async fn json_action_in_text_is_dispatched() {
        let h = harness(
            vec![
                ScriptedReply::text(&[r#"{"type":"terminal_run","params":{"command":"echo hi"}}"#]),
                ScriptedReply::text(&["Done: hi"]),
            ],
            "",
        );
        let outcome = h
            .orchestrator
            .chat_completion("say hi", &RequestContext::new("c1"), |_| {})
            .await
            .expect("chat completion");
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].result.content.to_text(), "hi\n");
        assert_eq!(outcome.reply, "Done: hi");
    }

    #[tokio::test]
    async fn step_limit_stops_the_loop() {
        let looping = || {
            ScriptedReply::Events(vec![
                tool_call("terminal_run", r#"{"command":"true"}"#),
                Ok(ProviderEvent::Done),
            ])
        };
        let h = harness(vec![looping(), looping(), looping()], "");
        let orchestrator = h.orchestrator.with_max_steps(2);
        let outcome = orchestrator
            .chat_completion("loop", &RequestContext::new("c1"), |_| {})
            .await
            .expect("chat completion");
        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(h.provider.request_count(), 2);
    }

    #[tokio::test]
    async fn pause_required_halts_without_retry() {
        let h = harness(
            vec![ScriptedReply::Reject(ProviderError::PauseRequired {
                status: Some(402),
                reason: "payment_required".into(),
                message: "API Error: out of credits".into(),
            })],
            "",
        );
        let mut typed = String::new();
        let err = h
            .orchestrator
            .chat_completion("hi", &RequestContext::new("c1"), |event| {
                if let AgentEvent::Token(delta) = event {
                    typed.push_str(&delta);
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PauseRequired { ref reason, .. } if reason == "payment_required"));
        assert_eq!(typed, "API Error: out of credits");
        assert_eq!(h.provider.request_count(), 1);

        let usage = h.store.get("c1").await.expect("get").expect("exists").usage();
        assert_eq!(usage.output_tokens, count_tokens("API Error: out of credits", MODEL));
        assert!(usage.input_tokens > 0);
    }

    #[tokio::test]
    async fn paused_titles_still_record_their_usage() {
        let h = harness(
            vec![ScriptedReply::Reject(ProviderError::PauseRequired {
                status: Some(402),
                reason: "insufficient_quota".into(),
                message: "API Error: quota exhausted".into(),
            })],
            "",
        );
        h.store.get_or_create("c1").await.expect("create");
        let err = h
            .orchestrator
            .generate_title("list the files please", &RequestContext::new("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PauseRequired { .. }));

        let usage = h.store.get("c1").await.expect("get").expect("exists").usage();
        assert_eq!(usage.output_tokens, count_tokens("API Error: quota exhausted", MODEL));
        assert!(usage.input_tokens > 0);
    }

    #[tokio::test]
    async fn cancelled_requests_stop_before_routing() {
        let h = harness(vec![], "");
        let signal = CancellationToken::new();
        signal.cancel();
        let ctx = RequestContext::new("c1").with_signal(signal);
        let err = h
            .orchestrator
            .chat_completion("hi", &ctx, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert_eq!(h.provider.request_count(), 0);
    }

    #[tokio::test]
    async fn forward_path_posts_to_sub_server_and_counts_tokens() {
        let (base_url, captured, server) = serve_sequence(1, |_| {
            http_response("200 OK", "application/json", &[], r#"{"data":"Forwarded answer"}"#)
        })
        .await;
        let h = harness(vec![], &base_url);
        h.store.get_or_create("c1").await.expect("create");
        h.store
            .set_subscription("c1", true, Some("pro-model".into()))
            .await
            .expect("bind");

        let ctx = RequestContext::new("c1").with_auth_token("user-token");
        let mut tokens = String::new();
        let outcome = h
            .orchestrator
            .chat_completion("hello", &ctx, |event| {
                if let AgentEvent::Token(delta) = event {
                    tokens.push_str(&delta);
                }
            })
            .await
            .expect("forwarded");
        server.await.expect("join").expect("server");

        assert_eq!(outcome.path, ExecutionPath::Forward);
        assert_eq!(tokens, "Forwarded answer");
        assert_eq!(h.provider.request_count(), 0);
        assert_eq!(
            outcome.usage.output_tokens,
            count_tokens("Forwarded answer", "pro-model")
        );
        assert!(outcome.usage.input_tokens > 0);

        let requests = captured.lock().await;
        assert_eq!(requests[0].request_line, "POST /api/agent/chat HTTP/1.1");
        assert_eq!(requests[0].header("authorization"), Some("Bearer user-token"));
        let body = requests[0].json();
        assert_eq!(body["goal"], json!("hello"));
        assert_eq!(body["conversation_id"], json!("c1"));

        let conversation = h.store.get("c1").await.expect("get").expect("exists");
        let path = conversation.active_path().expect("path");
        assert_eq!(path.len(), 2);
        assert_eq!(path[1].content, "Forwarded answer");
    }

    #[tokio::test]
    async fn titles_are_cleaned_up() {
        let h = harness(vec![ScriptedReply::text(&["\"Listing files", " in a repo.\"\nextra"])], "");
        h.store.get_or_create("c1").await.expect("create");
        let title = h
            .orchestrator
            .generate_title("list the files please", &RequestContext::new("c1"))
            .await
            .expect("title");
        assert_eq!(title, "Listing files in a repo");
        let usage = h.store.get("c1").await.expect("get").expect("exists").usage();
        assert!(usage.input_tokens > 0 && usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn unknown_conversations_are_router_errors() {
        let h = harness(vec![], "");
        let err = h
            .orchestrator
            .generate_title("anything", &RequestContext::new("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Router(RouterError::MissingConversation(_))));
    }

    #[tokio::test]
    async fn agent_profiles_are_parsed_from_json() {
        let h = harness(
            vec![
                ScriptedReply::text(&[
                    "```json\n{\"name\":\"Librarian\",\"description\":\"Finds books\",",
                    "\"instructions\":\"Be precise.\"}\n```",
                ]),
                ScriptedReply::text(&["not json at all"]),
            ],
            "",
        );
        h.store.get_or_create("c1").await.expect("create");
        let ctx = RequestContext::new("c1");
        let profile = h
            .orchestrator
            .generate_agent("a book finder", &ctx)
            .await
            .expect("profile");
        assert_eq!(profile.name, "Librarian");
        assert_eq!(profile.instructions, "Be precise.");

        let err = h.orchestrator.generate_agent("again", &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidResponse(_)));

        let requests = h.provider.requests.lock().expect("requests");
        assert_eq!(
            requests[0].response_format,
            crate::core::provider::ResponseFormat::Json
        );
    }

    #[tokio::test]
    async fn summaries_and_replies_use_the_active_branch() {
        let h = harness(
            vec![
                ScriptedReply::text(&["Hello there"]),
                ScriptedReply::text(&["  User greeted; assistant replied.  "]),
            ],
            "",
        );
        h.store.get_or_create("c1").await.expect("create");
        h.store
            .append_message("c1", Message::root(Role::User, "hi").with_id("u1"))
            .await
            .expect("append");
        let ctx = RequestContext::new("c1");

        let mut streamed = String::new();
        let reply = h
            .orchestrator
            .auto_reply(&ctx, |delta| streamed.push_str(delta))
            .await
            .expect("reply");
        assert_eq!(reply, "Hello there");
        assert_eq!(streamed, reply);

        let summary = h.orchestrator.summarize(&ctx).await.expect("summary");
        assert_eq!(summary, "User greeted; assistant replied.");
        let requests = h.provider.requests.lock().expect("requests");
        assert!(requests[1].messages[0].content.contains("user: hi\nassistant: Hello there"));
    }

    #[tokio::test]
    async fn forward_summary_unwraps_data() {
        let (base_url, captured, server) = serve_sequence(1, |_| {
            http_response("200 OK", "application/json", &[], r#"{"data":"A recap"}"#)
        })
        .await;
        let h = harness(vec![], &base_url);
        h.store.get_or_create("c1").await.expect("create");
        h.store.set_subscription("c1", true, None).await.expect("bind");
        let ctx = RequestContext::new("c1").with_auth_token("t");

        let summary = h.orchestrator.summarize(&ctx).await.expect("summary");
        server.await.expect("join").expect("server");
        assert_eq!(summary, "A recap");
        assert_eq!(
            captured.lock().await[0].request_line,
            "POST /api/agent/summary HTTP/1.1"
        );
    }

    #[test]
    fn title_cleanup_handles_prefixes_and_quotes() {
        assert_eq!(clean_title("Title: `Fix the build`"), "Fix the build");
        assert_eq!(clean_title("\n\n  Plain  \n"), "Plain");
        assert_eq!(clean_title(&"x".repeat(200)).len(), MAX_TITLE_CHARS);
    }
}
