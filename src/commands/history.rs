use crate::cli::HistoryCommand;
use crate::config::StorageConfig;
use crate::error::Result;
use crate::providers::Role;
use crate::storage::{SessionStore, StoredMessage, StoredSession};
use colored::Colorize;
use prettytable::{format, Table};

/// Handle history commands
pub fn handle_history(command: HistoryCommand, config: &StorageConfig) -> Result<()> {
    let store = SessionStore::open(config)?;

    match command {
        HistoryCommand::List => {
            let sessions = store.list_sessions()?;

            if sessions.is_empty() {
                println!("{}", "No conversation history found.".yellow());
                return Ok(());
            }

            println!("\nConversation History:");
            sessions_table(&sessions).printstd();
            println!();
            println!(
                "Use {} to read a session.",
                "kestrel history show <ID>".cyan()
            );
            println!();
        }
        HistoryCommand::Show { id } => {
            let id = store.resolve_session_id(&id)?;
            let messages = store.load_messages(&id)?;
            if messages.is_empty() {
                println!("{}", format!("Session {} has no messages.", id).yellow());
                return Ok(());
            }
            for message in &messages {
                println!("{}", render_message(message));
            }
        }
        HistoryCommand::Delete { id } => {
            let id = store.resolve_session_id(&id)?;
            store.delete_session(&id)?;
            println!("{}", format!("Deleted conversation {}", id).green());
        }
    }

    Ok(())
}

fn sessions_table(sessions: &[StoredSession]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);

    table.add_row(prettytable::row![
        "ID".bold(),
        "Title".bold(),
        "Messages".bold(),
        "Last Updated".bold()
    ]);

    for session in sessions {
        let id_short: String = session.id.chars().take(8).collect();
        let updated = session.updated_at.format("%Y-%m-%d %H:%M").to_string();
        table.add_row(prettytable::row![
            id_short.cyan(),
            shorten(&session.title, 40),
            session.message_count,
            updated
        ]);
    }
    table
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

fn render_message(stored: &StoredMessage) -> String {
    let message = &stored.message;
    let label = match message.role {
        Role::User => "user".green().bold(),
        Role::Assistant => "assistant".cyan().bold(),
        Role::Tool => "tool".magenta().bold(),
        Role::System => "system".dimmed(),
    };

    let mut out = format!("[{}] {}", stored.id, label);
    if let Some(call_id) = &message.tool_call_id {
        out.push_str(&format!(" ({})", call_id.dimmed()));
    }
    if !message.reasoning.is_empty() {
        out.push_str(&format!("\n  {}", shorten(&message.reasoning, 200).dimmed()));
    }
    if !message.content.is_empty() {
        out.push_str(&format!("\n  {}", message.content));
    }
    for call in &message.tool_calls {
        out.push_str(&format!("\n  -> {} {}", call.name.yellow(), call.arguments));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Message, ToolCall};
    use serde_json::json;

    #[test]
    fn test_shorten_is_char_safe() {
        assert_eq!(shorten("short", 40), "short");
        let long = "é".repeat(50);
        let short = shorten(&long, 40);
        assert_eq!(short.chars().count(), 40);
        assert!(short.ends_with("..."));
    }

    #[test]
    fn test_render_message_includes_tool_calls() {
        colored::control::set_override(false);
        let stored = StoredMessage {
            id: 3,
            session_id: "s".to_string(),
            message: Message::assistant_with_tools(
                "checking",
                vec![ToolCall::new("c1", "grep", json!({"pattern": "fn"}))],
            ),
        };
        let rendered = render_message(&stored);
        assert!(rendered.starts_with("[3] assistant"));
        assert!(rendered.contains("checking"));
        assert!(rendered.contains("-> grep"));
    }

    #[test]
    fn test_handle_history_on_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            db_path: dir.path().join("k.db"),
            ..StorageConfig::default()
        };
        assert!(handle_history(HistoryCommand::List, &config).is_ok());
        assert!(handle_history(HistoryCommand::Show { id: "nope".into() }, &config).is_err());
    }
}
