//! Session persistence
//!
//! A session is a conversation bound to one working directory. Messages are
//! immutable once appended and carry a token count computed at write time;
//! the session total is always the sum of its messages.

mod export;
mod store;

pub use export::ExportFormat;

use crate::llm::{self, ContentBlock, ToolCall};
use chrono::{DateTime, Duration, Utc};
use keel_core::{AgentMode, KeelError, KeelPaths, Provider, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use store::SessionStore;

/// Rough token estimate: one token per four characters, at least one for
/// non-empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    if chars == 0 {
        0
    } else {
        chars.div_ceil(4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub git_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub model: String,
}

impl Session {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    /// Provider-facing form. System messages are carried separately and
    /// yield `None`.
    pub fn to_llm(&self) -> Option<llm::Message> {
        match self.role {
            Role::System => None,
            Role::User => Some(llm::Message::user(&self.content)),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !self.content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: self.content.clone(),
                    });
                }
                blocks.extend(self.tool_calls.iter().map(|call| ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.args.clone(),
                }));
                Some(llm::Message::assistant(blocks))
            }
            Role::Tool => Some(llm::Message::tool_result(
                self.tool_call_id.as_deref().unwrap_or_default(),
                &self.content,
                self.is_error,
            )),
        }
    }
}

/// Message to append; token count and timestamp are filled in on write
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub is_error: bool,
}

impl NewMessage {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            is_error: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            is_error,
            ..Self::with_role(Role::Tool, content)
        }
    }

    /// Tokens counted for this message: content plus serialized tool calls
    fn token_count(&self) -> u64 {
        let calls: u64 = self
            .tool_calls
            .iter()
            .map(|call| estimate_tokens(&call.name) + estimate_tokens(&call.args.to_string()))
            .sum();
        (estimate_tokens(&self.content) + calls).max(1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub name: Option<String>,
    pub working_directory: PathBuf,
    pub mode: AgentMode,
    pub provider: Provider,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub session: Session,
    pub messages: Vec<Message>,
    pub total_tokens: u64,
}

/// Persists sessions under `<keel home>/sessions`
#[derive(Debug, Clone)]
pub struct SessionManager {
    store: SessionStore,
}

impl SessionManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: SessionStore::new(root),
        }
    }

    pub fn open(paths: &KeelPaths) -> Self {
        Self::new(paths.sessions_dir())
    }

    pub fn create_session(&self, opts: CreateSessionOptions) -> Result<Session> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let name = opts
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("session {}", now.format("%Y-%m-%d %H:%M")));
        let session = Session {
            id,
            name,
            git_branch: current_branch(&opts.working_directory),
            working_directory: opts.working_directory,
            created_at: now,
            updated_at: now,
            total_tokens: 0,
            message_count: 0,
            mode: opts.mode,
            provider: opts.provider,
            model: opts.model,
        };
        self.store.write_meta(&session)?;
        tracing::info!(session = %session.id, "Created session '{}'", session.name);
        Ok(session)
    }

    /// Look up a session by id or unique id prefix. Totals are reconciled
    /// with the message log.
    pub fn get_session(&self, id: &str) -> Result<Session> {
        Ok(self.get_session_context(id)?.session)
    }

    pub fn get_session_context(&self, id: &str) -> Result<SessionContext> {
        let id = self.resolve_id(id)?;
        let _lock = self.store.lock(&id)?;
        let mut session = self.store.read_meta(&id)?;
        let messages = self.store.read_messages(&id)?;

        let total_tokens: u64 = messages.iter().map(|m| m.token_count).sum();
        if session.total_tokens != total_tokens || session.message_count != messages.len() {
            tracing::debug!(
                session = %id,
                recorded = session.total_tokens,
                actual = total_tokens,
                "Reconciling session totals with message log"
            );
            session.total_tokens = total_tokens;
            session.message_count = messages.len();
            self.store.write_meta(&session)?;
        }

        Ok(SessionContext {
            session,
            messages,
            total_tokens,
        })
    }

    /// Sessions ordered by most recent activity. Sessions whose metadata
    /// cannot be read are skipped with a warning.
    pub fn list_sessions(&self, limit: Option<usize>) -> Result<Vec<Session>> {
        let mut sessions = self.load_all()?;
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    pub fn delete_session(&self, id: &str) -> Result<Session> {
        let id = self.resolve_id(id)?;
        let session = self.store.read_meta(&id)?;
        self.store.remove(&id)?;
        tracing::info!(session = %id, "Deleted session");
        Ok(session)
    }

    /// Append a message, updating totals, activity time and git branch.
    pub fn append_message(&self, session_id: &str, message: NewMessage) -> Result<Message> {
        if !self.store.exists(session_id) {
            return Err(KeelError::SessionNotFound(session_id.to_string()));
        }
        let _lock = self.store.lock(session_id)?;
        let mut session = self.store.read_meta(session_id)?;

        // Keep created_at non-decreasing within the session
        let created_at = Utc::now().max(session.updated_at);
        let message = Message {
            session_id: session.id.clone(),
            role: message.role,
            token_count: message.token_count(),
            content: message.content,
            created_at,
            tool_call_id: message.tool_call_id,
            tool_calls: message.tool_calls,
            is_error: message.is_error,
        };
        self.store.append_message(&message)?;

        session.total_tokens += message.token_count;
        session.message_count += 1;
        session.updated_at = created_at;
        session.git_branch = current_branch(&session.working_directory);
        self.store.write_meta(&session)?;
        Ok(message)
    }

    /// Resume `id`, or the most recently active session in `workdir`.
    pub fn resume(&self, id: Option<&str>, workdir: &Path) -> Result<Session> {
        if let Some(id) = id {
            return self.get_session(id);
        }
        let latest = self
            .list_sessions(None)?
            .into_iter()
            .find(|s| s.working_directory == workdir)
            .ok_or_else(|| {
                KeelError::SessionNotFound(format!("no session for {}", workdir.display()))
            })?;
        self.get_session(&latest.id)
    }

    pub fn export(&self, id: &str, format: ExportFormat) -> Result<String> {
        let context = self.get_session_context(id)?;
        export::render(&context, format)
    }

    /// Remove sessions idle longer than `max_age_days`, then the least
    /// recently active ones until at most `max_count` remain. Returns the
    /// removed ids in removal order.
    pub fn cleanup_old_sessions(&self, max_age_days: u32, max_count: usize) -> Result<Vec<String>> {
        let mut sessions = self.load_all()?;
        sessions.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));

        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let (expired, mut remaining): (Vec<_>, Vec<_>) =
            sessions.into_iter().partition(|s| s.updated_at < cutoff);

        let mut removed = Vec::new();
        for session in expired {
            self.store.remove(&session.id)?;
            removed.push(session.id);
        }

        let excess = remaining.len().saturating_sub(max_count);
        for session in remaining.drain(..excess) {
            self.store.remove(&session.id)?;
            removed.push(session.id);
        }

        if !removed.is_empty() {
            tracing::info!(
                removed = removed.len(),
                kept = remaining.len(),
                "Cleaned up sessions"
            );
        }
        Ok(removed)
    }

    fn load_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for id in self.store.ids()? {
            match self.store.read_meta(&id) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(session = %id, "Skipping unreadable session: {}", e),
            }
        }
        Ok(sessions)
    }

    fn resolve_id(&self, id: &str) -> Result<String> {
        if id.is_empty() {
            return Err(KeelError::SessionNotFound(id.to_string()));
        }
        if self.store.exists(id) {
            return Ok(id.to_string());
        }
        let matches: Vec<String> = self
            .store
            .ids()?
            .into_iter()
            .filter(|candidate| candidate.starts_with(id))
            .collect();
        match matches.as_slice() {
            [single] => Ok(single.clone()),
            [] => Err(KeelError::SessionNotFound(id.to_string())),
            _ => Err(KeelError::SessionNotFound(format!(
                "'{id}' matches {} sessions, use a longer prefix",
                matches.len()
            ))),
        }
    }
}

/// Current branch of the git repository containing `dir`, if any.
fn current_branch(dir: &Path) -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!branch.is_empty()).then_some(branch)
}
