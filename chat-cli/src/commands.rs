//! Command handlers.
//!
//! Handlers write their regular output to the given writer so they can be
//! driven from tests; notifications go through the controller's notifier.

use anyhow::{Context, Result};
use chat_common::config::Config;
use chat_session::{
    ChatController, Conversation, Notifier, PendingReply, RelayClient, ReplyOutcome,
    SessionStore, StreamStatus, SubmitError,
};
use std::io::Write;
use std::sync::Arc;

use crate::cli::Commands;

const TITLE_WIDTH: usize = 60;

/// Everything a command needs.
pub struct App {
    pub store: Arc<SessionStore>,
    pub client: Arc<RelayClient>,
    pub controller: ChatController,
}

impl App {
    pub fn new(store: Arc<SessionStore>, client: Arc<RelayClient>, notifier: Arc<dyn Notifier>) -> Self {
        let controller = ChatController::new(store.clone(), client.clone(), notifier);
        Self {
            store,
            client,
            controller,
        }
    }

    /// Open the configured store and relay client.
    pub fn from_config(config: &Config, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let store = SessionStore::from_config(&config.store).with_context(|| {
            format!("Failed to open chat store in {}", config.store.dir().display())
        })?;
        Ok(Self::new(
            Arc::new(store),
            Arc::new(RelayClient::from_config(config)),
            notifier,
        ))
    }
}

/// Run one command. Returns `false` when it failed in a way already
/// reported to the user (no model, failed reply).
pub async fn run<W: Write>(app: &App, command: Commands, out: &mut W) -> Result<bool> {
    match command {
        Commands::Send {
            message,
            conversation,
            images,
            model,
        } => {
            if let Some(model) = model {
                app.store.select_model(model);
            }
            let submitted = app
                .controller
                .submit(conversation.as_deref(), &message, images);
            match submitted {
                Ok(pending) => stream_reply(pending, out).await,
                Err(SubmitError::NoModelSelected) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }

        Commands::List { search } => {
            let conversations = match search.as_deref() {
                Some(query) => app.store.search(query),
                None => app.store.list(),
            };
            if conversations.is_empty() {
                writeln!(out, "No conversations.")?;
            }
            for conversation in &conversations {
                writeln!(out, "{}", list_line(conversation))?;
            }
            Ok(true)
        }

        Commands::Show { id } => {
            let conversation = app
                .store
                .conversation(&id)
                .with_context(|| format!("conversation '{}' not found", id))?;
            write_conversation(&conversation, out)?;
            Ok(true)
        }

        Commands::Delete { id, all } => {
            if all {
                let count = app.store.list().len();
                app.store.clear();
                writeln!(out, "Deleted {} conversation(s).", count)?;
            } else if let Some(id) = id {
                let existed = app.store.conversation(&id).is_some();
                app.controller.delete(&id, None);
                if existed {
                    writeln!(out, "Deleted {}.", id)?;
                } else {
                    writeln!(out, "No conversation {}.", id)?;
                }
            }
            Ok(true)
        }

        Commands::Model { name } => {
            if let Some(name) = name {
                app.store.select_model(name);
            }
            match app.store.current_model() {
                Some(model) => writeln!(out, "{}", model)?,
                None => writeln!(out, "No model selected.")?,
            }
            Ok(true)
        }

        Commands::Models => {
            let current = app.store.current_model();
            let models = app.client.list_models().await?;
            if models.is_empty() {
                writeln!(out, "No models installed.")?;
            }
            for model in models {
                let marker = if current.as_deref() == Some(model.as_str()) {
                    "*"
                } else {
                    " "
                };
                writeln!(out, "{} {}", marker, model)?;
            }
            Ok(true)
        }

        Commands::Regenerate { id } => match app.controller.regenerate(&id) {
            Ok(pending) => stream_reply(pending, out).await,
            Err(SubmitError::NoModelSelected) => Ok(false),
            Err(e) => Err(e.into()),
        },

        Commands::Category { id, label } => {
            app.store.set_category(&id, label.clone())?;
            match label.filter(|l| !l.trim().is_empty()) {
                Some(label) => writeln!(out, "Category of {} set to '{}'.", id, label.trim())?,
                None => writeln!(out, "Category of {} cleared.", id)?,
            }
            Ok(true)
        }
    }
}

/// Print fragments as they arrive until the reply ends. Ctrl-C stops it.
pub async fn stream_reply<W: Write>(mut pending: PendingReply, out: &mut W) -> Result<bool> {
    let token = pending.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    while let Some(fragment) = pending.next().await {
        write!(out, "{}", fragment)?;
        out.flush()?;
    }
    interrupt.abort();

    let ReplyOutcome {
        conversation_id,
        status,
        ..
    } = pending.finish().await;

    if status == StreamStatus::Cancelled {
        writeln!(out, " [stopped]")?;
    } else {
        writeln!(out)?;
    }
    writeln!(out, "conversation: {}", conversation_id)?;

    Ok(!matches!(status, StreamStatus::Failed(_)))
}

fn list_line(conversation: &Conversation) -> String {
    let mut line = format!(
        "{}  {}",
        conversation.id,
        conversation.created_at.format("%Y-%m-%d %H:%M")
    );
    if let Some(category) = &conversation.category {
        line.push_str(&format!("  [{}]", category));
    }
    line.push_str("  ");
    line.push_str(&truncate(conversation.title().unwrap_or("(empty)"), TITLE_WIDTH));
    line
}

fn write_conversation<W: Write>(conversation: &Conversation, out: &mut W) -> Result<()> {
    write!(
        out,
        "{} ({})",
        conversation.id,
        conversation.created_at.format("%Y-%m-%d %H:%M UTC")
    )?;
    if let Some(category) = &conversation.category {
        write!(out, " [{}]", category)?;
    }
    writeln!(out)?;

    for turn in &conversation.turns {
        writeln!(out)?;
        if turn.interrupted {
            writeln!(out, "{} (interrupted): {}", turn.role, turn.content)?;
        } else {
            writeln!(out, "{}: {}", turn.role, turn.content)?;
        }
        for image in &turn.images {
            writeln!(out, "  image: {}", image)?;
        }
    }
    Ok(())
}

/// Shorten to `width` characters, marking the cut with an ellipsis.
fn truncate(text: &str, width: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= width && first_line.len() == text.len() {
        return first_line.to_string();
    }
    let mut short: String = first_line.chars().take(width.saturating_sub(1)).collect();
    short.push('…');
    short
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_session::Turn;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("Hello", 10), "Hello");
        assert_eq!(truncate("Hello world", 6), "Hello…");
        assert_eq!(truncate("line one\nline two", 60), "line one…");
        assert_eq!(truncate("héllo wörld", 5), "héll…");
    }

    #[test]
    fn test_list_line() {
        let mut conversation = Conversation::new("c1");
        conversation.turns.push(Turn::user("Hello", vec![]));
        conversation.category = Some("work".into());

        let line = list_line(&conversation);
        assert!(line.starts_with("c1  "));
        assert!(line.ends_with("  [work]  Hello"));
    }

    #[test]
    fn test_write_conversation_marks_interrupted() {
        let mut conversation = Conversation::new("c1");
        conversation
            .turns
            .push(Turn::user("What is this?", vec!["https://example.com/a.png".into()]));
        conversation.turns.push(Turn::interrupted("A ca"));

        let mut out = Vec::new();
        write_conversation(&conversation, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("user: What is this?\n  image: https://example.com/a.png\n"));
        assert!(text.contains("assistant (interrupted): A ca\n"));
    }
}
