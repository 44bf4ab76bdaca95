//! Interactive confirmation on the controlling terminal.

use std::io::{self, BufRead, IsTerminal, Write};

use async_trait::async_trait;
use keel_code::approval::{ApprovalDecision, ApprovalHandler, ApprovalRequest};

/// Ask a yes/no question on stderr. Anything but `y`/`yes` is a no, and
/// so is a non-interactive stdin.
pub fn confirm(question: &str) -> io::Result<bool> {
    if !io::stdin().is_terminal() {
        return Ok(false);
    }

    let mut stderr = io::stderr();
    write!(stderr, "{question} [y/N] ")?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Approval handler that asks the person at the terminal.
pub struct ConsoleApproval;

#[async_trait]
impl ApprovalHandler for ConsoleApproval {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let question = format!("Allow {}? ({})", request.summary, request.reason);
        match tokio::task::spawn_blocking(move || confirm(&question)).await {
            Ok(Ok(true)) => ApprovalDecision::Approved,
            Ok(Ok(false)) => ApprovalDecision::rejected("declined by user"),
            Ok(Err(e)) => ApprovalDecision::rejected(format!("could not read answer: {e}")),
            Err(e) => ApprovalDecision::rejected(format!("prompt failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no"));
        assert!(!is_yes("yep"));
    }
}
