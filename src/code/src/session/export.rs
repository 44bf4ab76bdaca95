use super::{Role, SessionContext};
use keel_core::{KeelError, Result};
use serde::Serialize;
use std::fmt::Write;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Markdown,
}

impl FromStr for ExportFormat {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            other => Err(KeelError::Config(format!(
                "unknown export format '{other}' (expected json or markdown)"
            ))),
        }
    }
}

#[derive(Serialize)]
struct JsonExport<'a> {
    session: &'a super::Session,
    messages: &'a [super::Message],
    total_tokens: u64,
}

pub(super) fn render(context: &SessionContext, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(&JsonExport {
            session: &context.session,
            messages: &context.messages,
            total_tokens: context.total_tokens,
        })?),
        ExportFormat::Markdown => Ok(markdown(context)),
    }
}

fn markdown(context: &SessionContext) -> String {
    let session = &context.session;
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", session.name);
    let _ = writeln!(out, "- Session: `{}`", session.id);
    let _ = writeln!(out, "- Directory: `{}`", session.working_directory.display());
    if let Some(branch) = &session.git_branch {
        let _ = writeln!(out, "- Branch: `{branch}`");
    }
    let _ = writeln!(out, "- Model: {} / {}", session.provider, session.model);
    let _ = writeln!(out, "- Created: {}", session.created_at.to_rfc3339());
    let _ = writeln!(out, "- Tokens: {}", context.total_tokens);

    for message in &context.messages {
        let heading = match message.role {
            Role::System => "System".to_string(),
            Role::User => "User".to_string(),
            Role::Assistant => "Assistant".to_string(),
            Role::Tool => match &message.tool_call_id {
                Some(id) => format!("Tool result `{id}`"),
                None => "Tool result".to_string(),
            },
        };
        let _ = writeln!(out, "\n## {heading}\n");

        if message.role == Role::Tool {
            let _ = writeln!(out, "```\n{}\n```", message.content.trim_end());
        } else if !message.content.is_empty() {
            let _ = writeln!(out, "{}", message.content.trim_end());
        }

        for call in &message.tool_calls {
            let _ = writeln!(out, "\n- `{}` `{}`", call.name, call.args);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CreateSessionOptions, NewMessage, SessionManager};
    use tempfile::TempDir;

    fn populated() -> (TempDir, SessionManager, String) {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(dir.path().join("sessions"));
        let session = manager
            .create_session(CreateSessionOptions {
                name: Some("fix parser".to_string()),
                working_directory: dir.path().to_path_buf(),
                model: "gpt-4o".to_string(),
                ..Default::default()
            })
            .unwrap();
        manager
            .append_message(&session.id, NewMessage::user("Why does parsing fail?"))
            .unwrap();
        manager
            .append_message(&session.id, NewMessage::tool("call_1", "error: eof", true))
            .unwrap();
        (dir, manager, session.id)
    }

    #[test]
    fn test_export_markdown() {
        let (_dir, manager, id) = populated();
        let md = manager.export(&id, ExportFormat::Markdown).unwrap();
        assert!(md.starts_with("# fix parser"));
        assert!(md.contains("## User\n\nWhy does parsing fail?"));
        assert!(md.contains("## Tool result `call_1`"));
        assert!(md.contains("```\nerror: eof\n```"));
    }

    #[test]
    fn test_export_json() {
        let (_dir, manager, id) = populated();
        let json: serde_json::Value =
            serde_json::from_str(&manager.export(&id, ExportFormat::Json).unwrap()).unwrap();
        assert_eq!(json["session"]["name"], "fix parser");
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
        assert_eq!(json["messages"][1]["role"], "tool");
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("md".parse::<ExportFormat>().unwrap(), ExportFormat::Markdown);
        assert!("yaml".parse::<ExportFormat>().is_err());
    }
}
