//! Approval gate for tool calls matching `requireApproval` rules
//!
//! The agent loop asks an [`ApprovalHandler`] and blocks until it answers.
//! [`ConfirmationManager`] is the channel-based handler: requests are
//! published on an mpsc channel and answered with [`ConfirmationManager::confirm`].

use crate::permissions::PermissionCategory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Default time to wait for an answer before rejecting
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    pub category: PermissionCategory,
    /// Path or command that matched the approval rule
    pub subject: String,
    /// One-line description of the action
    pub summary: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: String },
}

impl ApprovalDecision {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ApprovalDecision::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved)
    }
}

#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Channel-backed approval handler with a timeout.
pub struct ConfirmationManager {
    timeout: Duration,
    requests: mpsc::Sender<ApprovalRequest>,
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
}

impl ConfirmationManager {
    /// Returns the manager and the receiver on which requests arrive.
    pub fn new(timeout: Duration) -> (Self, mpsc::Receiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::channel(16);
        let manager = Self {
            timeout,
            requests: tx,
            pending: Mutex::new(HashMap::new()),
        };
        (manager, rx)
    }

    /// Answer a pending request. Returns false when nothing is waiting on
    /// `tool_call_id` (already answered or timed out).
    pub fn confirm(&self, tool_call_id: &str, decision: ApprovalDecision) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tool_call_id);
        match sender {
            Some(sender) => sender.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn forget(&self, tool_call_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tool_call_id);
    }
}

#[async_trait]
impl ApprovalHandler for ConfirmationManager {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.tool_call_id.clone(), tx);

        if self.requests.send(request.clone()).await.is_err() {
            self.forget(&request.tool_call_id);
            return ApprovalDecision::rejected("no one is listening for approval requests");
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => ApprovalDecision::rejected("approval channel closed"),
            Err(_) => {
                self.forget(&request.tool_call_id);
                tracing::warn!(
                    tool_call_id = %request.tool_call_id,
                    "Approval timed out after {:?}, rejecting",
                    self.timeout
                );
                ApprovalDecision::rejected(format!(
                    "timed out after {}s waiting for approval",
                    self.timeout.as_secs()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest {
            tool_call_id: id.to_string(),
            tool_name: "execute_shell".to_string(),
            category: PermissionCategory::ShellExecute,
            subject: "git push origin main".to_string(),
            summary: "execute_shell: git push origin main".to_string(),
            reason: "matches approval rule 'git push*'".to_string(),
        }
    }

    #[tokio::test]
    async fn test_confirm_approves() {
        let (manager, mut rx) = ConfirmationManager::new(Duration::from_secs(5));
        let manager = Arc::new(manager);

        let responder = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let req = rx.recv().await.unwrap();
                assert!(manager.confirm(&req.tool_call_id, ApprovalDecision::Approved));
            })
        };

        let decision = manager.decide(&request("call_1")).await;
        responder.await.unwrap();
        assert!(decision.is_approved());
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_rejects() {
        let (manager, _rx) = ConfirmationManager::new(Duration::from_millis(20));
        let decision = manager.decide(&request("call_2")).await;
        match decision {
            ApprovalDecision::Rejected { reason } => assert!(reason.contains("timed out")),
            other => panic!("unexpected decision: {other:?}"),
        }
        assert!(!manager.confirm("call_2", ApprovalDecision::Approved));
    }

    #[tokio::test]
    async fn test_dropped_receiver_rejects() {
        let (manager, rx) = ConfirmationManager::new(Duration::from_secs(5));
        drop(rx);
        assert!(!manager.decide(&request("call_3")).await.is_approved());
        assert_eq!(manager.pending_count(), 0);
    }
}
