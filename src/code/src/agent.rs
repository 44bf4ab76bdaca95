//! Agent Loop Implementation
//!
//! The loop drives one task to a terminal outcome:
//!
//! ```text
//! Idle → AwaitingModel → {ExecutingTool | AwaitingApproval} → AwaitingModel → … → Done | Failed | Cancelled
//! ```
//!
//! Every tool call is parsed into a typed invocation, checked against the
//! permission rules, optionally confirmed by a human, recorded in the
//! checkpoint operation log and only then executed. Tool calls of one model
//! response run sequentially so the operation log stays linear.
//!
//! Denied, declined and failed tool calls are reported back to the model as
//! tool errors. Provider failures end the run as `Failed`.

use crate::approval::{ApprovalDecision, ApprovalHandler, ApprovalRequest};
use crate::checkpoint::{CheckpointManager, OperationRequest};
use crate::llm::{LlmClient, LlmResponse, Message, StreamEvent, TokenUsage, ToolCall};
use crate::permissions::{PermissionCategory, PermissionDecision, PermissionManager};
use crate::session::{NewMessage, SessionManager};
use crate::tools::{ToolExecutor, ToolInvocation};
use keel_core::{AgentConfig, KeelError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SYSTEM_PROMPT: &str = "You are keel, a coding agent working in a local repository. \
Use the provided tools to inspect and change files and to run commands. \
Paths are relative to the working directory. Some actions may be denied by the user's \
permission rules; when a tool reports an error, adjust your approach instead of repeating \
the same call. When the task is complete, reply with a short summary and no tool calls.";

/// Longest prompt excerpt used in an implicit checkpoint message
const CHECKPOINT_PROMPT_CHARS: usize = 60;

const CANCELLED_RESULT: &str = "Cancelled before execution";
const ABORTED_RESULT: &str = "Not executed: the run stopped on an earlier error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    AwaitingModel,
    ExecutingTool,
    AwaitingApproval,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::AwaitingModel => "awaiting_model",
            AgentState::ExecutingTool => "executing_tool",
            AgentState::AwaitingApproval => "awaiting_approval",
            AgentState::Done => "done",
            AgentState::Failed => "failed",
            AgentState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Done { text: String },
    Failed { reason: String },
    Cancelled,
}

impl TerminalOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, TerminalOutcome::Done { .. })
    }

    fn state(&self) -> AgentState {
        match self {
            TerminalOutcome::Done { .. } => AgentState::Done,
            TerminalOutcome::Failed { .. } => AgentState::Failed,
            TerminalOutcome::Cancelled => AgentState::Cancelled,
        }
    }
}

/// Events emitted during agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StateChanged {
        state: AgentState,
    },

    /// Text delta from streaming
    TextDelta {
        text: String,
    },

    ToolStart {
        id: String,
        name: String,
        summary: String,
    },

    ToolEnd {
        id: String,
        name: String,
        output: String,
        success: bool,
    },

    /// Tool call blocked by permission rules
    PermissionDenied {
        id: String,
        name: String,
        reason: String,
    },

    ApprovalRequested {
        request: ApprovalRequest,
    },

    ApprovalResolved {
        id: String,
        approved: bool,
    },

    CheckpointCreated {
        id: String,
        message: String,
    },

    End {
        outcome: TerminalOutcome,
        usage: TokenUsage,
    },
}

/// Result of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: TerminalOutcome,
    /// Completed model round-trips
    pub iterations: usize,
    pub usage: TokenUsage,
    pub tool_calls: usize,
    /// Implicit checkpoint taken before the first mutation, if any
    pub checkpoint: Option<String>,
}

/// Result of one tool call as fed back to the model
struct ToolResult {
    content: String,
    is_error: bool,
}

impl ToolResult {
    fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Mutable state of a single run
struct RunState {
    history: Vec<Message>,
    usage: TokenUsage,
    iterations: usize,
    tool_calls: usize,
    checkpoint: Option<String>,
}

/// Agent loop executor
pub struct AgentLoop {
    llm_client: Arc<dyn LlmClient>,
    tool_executor: Arc<ToolExecutor>,
    permissions: Arc<PermissionManager>,
    checkpoints: Option<Arc<CheckpointManager>>,
    sessions: Option<(Arc<SessionManager>, String)>,
    approval: Option<Arc<dyn ApprovalHandler>>,
    event_tx: Option<mpsc::Sender<AgentEvent>>,
    cancel: CancellationToken,
    system_prompt: String,
}

impl AgentLoop {
    pub fn new(
        llm_client: Arc<dyn LlmClient>,
        tool_executor: Arc<ToolExecutor>,
        permissions: Arc<PermissionManager>,
    ) -> Self {
        let system_prompt = format!(
            "{SYSTEM_PROMPT}\n\nWorking directory: {}",
            tool_executor.sandbox().workdir().display()
        );
        Self {
            llm_client,
            tool_executor,
            permissions,
            checkpoints: None,
            sessions: None,
            approval: None,
            event_tx: None,
            cancel: CancellationToken::new(),
            system_prompt,
        }
    }

    /// Record mutations in the operation log
    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Load history from, and append turns to, a persisted session
    pub fn with_session(mut self, sessions: Arc<SessionManager>, session_id: impl Into<String>) -> Self {
        self.sessions = Some((sessions, session_id.into()));
        self
    }

    pub fn with_approval(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = Some(handler);
        self
    }

    /// Stream events; also switches the provider call to streaming
    pub fn with_events(mut self, tx: mpsc::Sender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Run `prompt` to a terminal outcome.
    ///
    /// Errors are reserved for problems the model cannot fix: invalid
    /// configuration and session or checkpoint store failures. Provider
    /// failures yield `TerminalOutcome::Failed`.
    pub async fn run(&self, prompt: &str, config: &AgentConfig) -> Result<RunReport> {
        config.validate()?;
        tracing::info!(
            mode = %config.mode,
            provider = %config.provider,
            model = %config.model,
            max_iterations = config.max_iterations,
            auto_approve = config.auto_approve,
            "Starting agent run"
        );
        if config.auto_approve {
            tracing::warn!("Auto-approve enabled: approval prompts will be bypassed");
        }

        let mut state = RunState {
            history: self.load_history()?,
            usage: TokenUsage::default(),
            iterations: 0,
            tool_calls: 0,
            checkpoint: None,
        };
        self.emit(AgentEvent::StateChanged {
            state: AgentState::Idle,
        })
        .await;

        self.persist(NewMessage::user(prompt))?;
        state.history.push(Message::user(prompt));

        let outcome = self.drive(prompt, config, &mut state).await?;

        self.set_state(outcome.state()).await;
        match &outcome {
            TerminalOutcome::Done { .. } => tracing::info!(
                iterations = state.iterations,
                tool_calls = state.tool_calls,
                "Agent run completed"
            ),
            TerminalOutcome::Failed { reason } => {
                tracing::warn!(iterations = state.iterations, "Agent run failed: {}", reason)
            }
            TerminalOutcome::Cancelled => tracing::info!("Agent run cancelled"),
        }
        self.emit(AgentEvent::End {
            outcome: outcome.clone(),
            usage: state.usage.clone(),
        })
        .await;

        Ok(RunReport {
            outcome,
            iterations: state.iterations,
            usage: state.usage,
            tool_calls: state.tool_calls,
            checkpoint: state.checkpoint,
        })
    }

    async fn drive(
        &self,
        prompt: &str,
        config: &AgentConfig,
        state: &mut RunState,
    ) -> Result<TerminalOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(TerminalOutcome::Cancelled);
            }
            if state.iterations >= config.max_iterations {
                return Ok(TerminalOutcome::Failed {
                    reason: format!("max iterations reached ({})", config.max_iterations),
                });
            }

            self.set_state(AgentState::AwaitingModel).await;
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(TerminalOutcome::Cancelled),
                response = self.call_model(&state.history) => response,
            };
            state.iterations += 1;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!("Model call failed: {}", e);
                    return Ok(TerminalOutcome::Failed {
                        reason: e.to_string(),
                    });
                }
            };
            state.usage.add(&response.usage);

            let tool_calls = response.tool_calls();
            let text = response.text();
            self.persist(NewMessage::assistant(text.clone(), tool_calls.clone()))?;
            state.history.push(response.message);

            if tool_calls.is_empty() {
                return Ok(TerminalOutcome::Done { text });
            }

            for (index, call) in tool_calls.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    self.abandon(&tool_calls[index..], CANCELLED_RESULT, state)?;
                    return Ok(TerminalOutcome::Cancelled);
                }
                state.tool_calls += 1;

                let result = match self.handle_tool_call(call, prompt, config, state).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(tool = %call.name, "Stopping run: {}", e);
                        let content = format!("Not executed: {e}");
                        let rest = &tool_calls[index + 1..];
                        let answered = self
                            .record_result(call, &ToolResult::error(content), state)
                            .and_then(|_| self.abandon(rest, ABORTED_RESULT, state));
                        if let Err(persist_err) = answered {
                            tracing::warn!("Could not record aborted tool calls: {}", persist_err);
                        }
                        return Err(e);
                    }
                };
                self.record_result(call, &result, state)?;

                if self.cancel.is_cancelled() {
                    self.abandon(&tool_calls[index + 1..], CANCELLED_RESULT, state)?;
                    return Ok(TerminalOutcome::Cancelled);
                }
            }
        }
    }

    fn record_result(&self, call: &ToolCall, result: &ToolResult, state: &mut RunState) -> Result<()> {
        self.persist(NewMessage::tool(&call.id, &result.content, result.is_error))?;
        state
            .history
            .push(Message::tool_result(&call.id, &result.content, result.is_error));
        Ok(())
    }

    /// Answer calls that will not run so the transcript stays replayable.
    fn abandon(&self, calls: &[ToolCall], content: &str, state: &mut RunState) -> Result<()> {
        for call in calls {
            self.record_result(call, &ToolResult::error(content), state)?;
        }
        Ok(())
    }

    async fn handle_tool_call(
        &self,
        call: &ToolCall,
        prompt: &str,
        config: &AgentConfig,
        state: &mut RunState,
    ) -> Result<ToolResult> {
        let invocation = match self.tool_executor.parse(&call.name, &call.args) {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::warn!(tool = %call.name, "Rejected tool call: {}", e);
                return Ok(ToolResult::error(e.to_string()));
            }
        };

        // Permission gate: every subject must be allowed, both as named and
        // as the file a symlink resolves to
        let sandbox = self.tool_executor.sandbox();
        let mut subjects = Vec::new();
        for (category, subject) in invocation.permission_subjects() {
            subjects.push((category, subject.to_string()));
            if category != PermissionCategory::ShellExecute {
                if let Some(target) = sandbox.resolve_link_target(subject) {
                    subjects.push((category, target));
                }
            }
        }

        let mut approval: Option<(PermissionCategory, String, PermissionDecision)> = None;
        for (category, subject) in subjects {
            let decision = self.permissions.check_action(category, &subject);
            if !decision.allowed {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "denied by permission rules".to_string());
                tracing::warn!(
                    tool = %call.name,
                    subject = %subject,
                    "Permission denied: {}",
                    reason
                );
                self.emit(AgentEvent::PermissionDenied {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    reason: reason.clone(),
                })
                .await;
                return Ok(ToolResult::error(
                    KeelError::PermissionDenied(format!("{subject}: {reason}")).to_string(),
                ));
            }
            if decision.requires_approval && approval.is_none() {
                approval = Some((category, subject, decision));
            }
        }

        let mut auto_approved = false;
        if let Some((category, subject, decision)) = approval {
            if config.auto_approve {
                tracing::warn!(
                    tool = %call.name,
                    subject = %subject,
                    "Approval bypassed by --auto-approve"
                );
                auto_approved = invocation.is_mutating();
            } else {
                let request = ApprovalRequest {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    category,
                    subject,
                    summary: invocation.summary(),
                    reason: decision.reason.unwrap_or_default(),
                };
                match self.request_approval(request).await {
                    ApprovalDecision::Approved => {}
                    ApprovalDecision::Rejected { reason } => {
                        return Ok(ToolResult::error(format!(
                            "The user declined this action: {reason}"
                        )));
                    }
                }
            }
        }

        if let Some(kind) = invocation.operation_kind() {
            if let Some(checkpoints) = &self.checkpoints {
                if config.auto_checkpoint && state.checkpoint.is_none() {
                    let message = format!("auto: before {}", excerpt(prompt));
                    let checkpoint = checkpoints.create_checkpoint(&message).await?;
                    self.emit(AgentEvent::CheckpointCreated {
                        id: checkpoint.id.clone(),
                        message: checkpoint.message.clone(),
                    })
                    .await;
                    state.checkpoint = Some(checkpoint.id);
                }

                if let Some(target) = self.operation_target(&invocation) {
                    let destination = invocation
                        .destination()
                        .and_then(|d| self.operation_path(d));
                    checkpoints
                        .record_operation(OperationRequest {
                            kind,
                            target,
                            destination,
                            tool_call_id: Some(call.id.clone()),
                            auto_approved,
                        })
                        .await?;
                }
            }
        }

        self.set_state(AgentState::ExecutingTool).await;
        self.emit(AgentEvent::ToolStart {
            id: call.id.clone(),
            name: call.name.clone(),
            summary: invocation.summary(),
        })
        .await;

        let output = tokio::select! {
            output = self.tool_executor.execute(&invocation) => output,
            _ = self.cancel.cancelled() => {
                crate::tools::ToolOutput::error("Cancelled while running")
            }
        };

        self.emit(AgentEvent::ToolEnd {
            id: call.id.clone(),
            name: call.name.clone(),
            output: output.content.clone(),
            success: output.success,
        })
        .await;

        Ok(ToolResult {
            content: output.content,
            is_error: !output.success,
        })
    }

    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        let Some(handler) = &self.approval else {
            return ApprovalDecision::rejected("approval required but no approver is attached");
        };

        self.set_state(AgentState::AwaitingApproval).await;
        self.emit(AgentEvent::ApprovalRequested {
            request: request.clone(),
        })
        .await;

        let decision = tokio::select! {
            decision = handler.decide(&request) => decision,
            _ = self.cancel.cancelled() => ApprovalDecision::rejected("run cancelled"),
        };
        tracing::info!(
            tool_call_id = %request.tool_call_id,
            approved = decision.is_approved(),
            "Approval resolved"
        );
        self.emit(AgentEvent::ApprovalResolved {
            id: request.tool_call_id.clone(),
            approved: decision.is_approved(),
        })
        .await;
        decision
    }

    /// Operation log target: working-directory-relative path, or the command
    fn operation_target(&self, invocation: &ToolInvocation) -> Option<String> {
        match invocation {
            ToolInvocation::ExecuteShell(args) => Some(args.command.clone()),
            other => self.operation_path(other.target()),
        }
    }

    /// `None` when the path escapes the sandbox; the tool itself will fail
    fn operation_path(&self, path: &str) -> Option<String> {
        let sandbox = self.tool_executor.sandbox();
        let resolved = sandbox.resolve_path(path).ok()?;
        Some(sandbox.relative(&resolved).to_string_lossy().to_string())
    }

    async fn call_model(&self, history: &[Message]) -> Result<LlmResponse> {
        let tools = self.tool_executor.definitions();
        let system = Some(self.system_prompt.as_str());

        let Some(tx) = &self.event_tx else {
            return self.llm_client.complete(history, system, &tools).await;
        };

        let mut stream = self
            .llm_client
            .complete_streaming(history, system, &tools)
            .await?;
        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::TextDelta(text) => {
                    tx.send(AgentEvent::TextDelta { text }).await.ok();
                }
                StreamEvent::ToolUseStart { .. } | StreamEvent::ToolUseInputDelta(_) => {}
                StreamEvent::Done(response) => return Ok(response),
                StreamEvent::Error(message) => {
                    return Err(KeelError::provider(self.llm_client.provider(), message))
                }
            }
        }
        Err(KeelError::provider(
            self.llm_client.provider(),
            "stream ended without a final response",
        ))
    }

    fn load_history(&self) -> Result<Vec<Message>> {
        let Some((sessions, id)) = &self.sessions else {
            return Ok(Vec::new());
        };
        let context = sessions.get_session_context(id)?;
        tracing::debug!(
            session = %id,
            messages = context.messages.len(),
            tokens = context.total_tokens,
            "Loaded session history"
        );
        Ok(context.messages.iter().filter_map(|m| m.to_llm()).collect())
    }

    fn persist(&self, message: NewMessage) -> Result<()> {
        if let Some((sessions, id)) = &self.sessions {
            sessions.append_message(id, message)?;
        }
        Ok(())
    }

    async fn set_state(&self, state: AgentState) {
        tracing::debug!(%state, "Agent state");
        self.emit(AgentEvent::StateChanged { state }).await;
    }

    async fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

fn excerpt(prompt: &str) -> String {
    let line = prompt.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= CHECKPOINT_PROMPT_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(CHECKPOINT_PROMPT_CHARS).collect();
    format!("{cut}...")
}
