//! Keel Code - local coding-agent runtime
//!
//! ## Architecture
//!
//! ```text
//! prompt → AgentLoop ──→ LlmClient (anthropic | openai | google)
//!             │
//!             ├─ ToolRegistry::parse      typed ToolInvocation
//!             ├─ PermissionManager        deny / allow / requireApproval
//!             ├─ ApprovalHandler          human confirmation
//!             ├─ CheckpointManager        snapshot + operation log (git)
//!             ├─ ToolExecutor → Sandbox   none | basic | container
//!             └─ SessionManager           transcript + token accounting
//! ```
//!
//! ## Permission System
//!
//! Rules live in a global file and an optional project override. Project
//! rules are evaluated first; within a scope `deny` beats `allow`, and
//! anything unmatched is denied.
//!
//! ## Checkpoints
//!
//! Snapshots are commits in a shadow git repository outside the project.
//! Every mutating tool call is logged with its pre-image so the latest one
//! can be undone without a full restore.

pub mod agent;
pub mod approval;
pub mod checkpoint;
pub mod llm;
pub mod permissions;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod tools;

pub use agent::{AgentEvent, AgentLoop, AgentState, RunReport, TerminalOutcome};
pub use approval::{ApprovalDecision, ApprovalHandler, ApprovalRequest, ConfirmationManager};
pub use checkpoint::{Checkpoint, CheckpointManager, Operation, OperationKind, OperationStatus};
pub use permissions::{PermissionCategory, PermissionDecision, PermissionManager, PermissionScope};
pub use sandbox::Sandbox;
pub use session::{ExportFormat, Message, NewMessage, Role, Session, SessionManager};
pub use tools::{ToolExecutor, ToolInvocation};
