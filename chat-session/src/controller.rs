//! Chat controller.
//!
//! Drives a submission from user input to a persisted reply: the user turn is
//! stored, the relay is started with the conversation history, fragments are
//! accumulated into a pending assistant turn, and whatever the stream produced
//! is written back when it ends.

use chat_common::wire::{RelayData, RelayMessage, RelayRequest};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::ReplySource;
use crate::store::{SessionStore, StoreError};
use crate::stream::{ReplyHandle, StreamStatus};
use crate::types::{Role, Turn};

/// Severity of a user notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Transient user-facing notifications (toasts, status lines).
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotificationLevel, message: &str);
}

/// Submissions rejected before any request is sent.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Please select a model before sending a message")]
    NoModelSelected,

    #[error("Message is empty")]
    EmptyInput,

    #[error("conversation '{0}' not found")]
    NotFound(String),

    #[error("conversation '{0}' has no user turn to answer")]
    NothingToRegenerate(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a finished or stopped reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyOutcome {
    pub conversation_id: String,
    pub status: StreamStatus,
    /// The assistant turn written to the store, if any
    pub turn: Option<Turn>,
}

/// Submission controller shared by the front ends.
pub struct ChatController {
    store: Arc<SessionStore>,
    source: Arc<dyn ReplySource>,
    notifier: Arc<dyn Notifier>,
}

impl ChatController {
    pub fn new(
        store: Arc<SessionStore>,
        source: Arc<dyn ReplySource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Submit a new user turn and start streaming the reply.
    ///
    /// Without a conversation id a new conversation is created.
    pub fn submit(
        &self,
        conversation_id: Option<&str>,
        input: &str,
        images: Vec<String>,
    ) -> Result<PendingReply, SubmitError> {
        let model = self.require_model()?;
        if input.trim().is_empty() {
            return Err(SubmitError::EmptyInput);
        }

        let conversation_id = conversation_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let failures = self.store.persist_failures();
        self.store
            .append(&conversation_id, vec![Turn::user(input, images.clone())])?;
        self.warn_on_persist_failure(failures);

        tracing::info!(
            conversation_id = %conversation_id,
            model = %model,
            images = images.len(),
            "Submitting message"
        );
        Ok(self.start_reply(conversation_id, model, images))
    }

    /// Drop a trailing assistant turn and ask for a new reply to the last
    /// user turn.
    pub fn regenerate(&self, conversation_id: &str) -> Result<PendingReply, SubmitError> {
        let model = self.require_model()?;

        let mut turns = self.store.get_turns(conversation_id);
        if turns.is_empty() {
            return Err(SubmitError::NotFound(conversation_id.to_string()));
        }
        let trailing_reply = turns.last().is_some_and(|t| t.role == Role::Assistant);
        if trailing_reply {
            turns.pop();
        }
        let images = match turns.last() {
            Some(last) if last.role == Role::User => last.images.clone(),
            _ => return Err(SubmitError::NothingToRegenerate(conversation_id.to_string())),
        };

        if trailing_reply {
            let failures = self.store.persist_failures();
            self.store.pop_last_turn(conversation_id);
            self.warn_on_persist_failure(failures);
        }

        tracing::info!(conversation_id, model = %model, "Regenerating reply");
        Ok(self.start_reply(conversation_id.to_string(), model, images))
    }

    /// Delete a conversation. Returns `true` when it was the one on display
    /// and the caller has to navigate away.
    pub fn delete(&self, conversation_id: &str, displayed: Option<&str>) -> bool {
        let failures = self.store.persist_failures();
        self.store.delete(conversation_id);
        self.warn_on_persist_failure(failures);
        displayed == Some(conversation_id)
    }

    fn require_model(&self) -> Result<String, SubmitError> {
        self.store.current_model().ok_or_else(|| {
            let err = SubmitError::NoModelSelected;
            self.notifier
                .notify(NotificationLevel::Error, &err.to_string());
            err
        })
    }

    fn warn_on_persist_failure(&self, failures_before: u64) {
        warn_on_persist_failure(&self.store, self.notifier.as_ref(), failures_before);
    }

    fn start_reply(&self, conversation_id: String, model: String, images: Vec<String>) -> PendingReply {
        let messages = self
            .store
            .get_turns(&conversation_id)
            .into_iter()
            .map(|t| RelayMessage::new(t.role.as_str(), t.content))
            .collect();

        let request = RelayRequest {
            messages,
            selected_model: model,
            data: (!images.is_empty()).then_some(RelayData { images }),
        };

        PendingReply {
            conversation_id,
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            handle: self.source.start(request),
            partial: String::new(),
        }
    }
}

fn warn_on_persist_failure(store: &SessionStore, notifier: &dyn Notifier, failures_before: u64) {
    if store.persist_failures() > failures_before {
        let reason = store.last_persist_error().unwrap_or_default();
        notifier.notify(
            NotificationLevel::Warning,
            &format!("Conversation could not be saved: {}", reason),
        );
    }
}

/// The assistant turn while its reply is still streaming.
pub struct PendingReply {
    conversation_id: String,
    store: Arc<SessionStore>,
    notifier: Arc<dyn Notifier>,
    handle: ReplyHandle,
    partial: String,
}

impl PendingReply {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Content received so far.
    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// Token that stops this reply, e.g. from a Ctrl-C handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.handle.cancellation_token()
    }

    /// Consume the next fragment and add it to the partial content.
    pub async fn next(&mut self) -> Option<String> {
        let fragment = self.handle.next_fragment().await?;
        self.partial.push_str(&fragment);
        Some(fragment)
    }

    /// Cancel the reply and keep what has arrived.
    pub async fn stop(self) -> ReplyOutcome {
        self.handle.cancel();
        self.settle(StreamStatus::Cancelled)
    }

    /// Drive the reply to its end and persist the result.
    pub async fn finish(mut self) -> ReplyOutcome {
        while self.next().await.is_some() {}
        let status = self
            .handle
            .status()
            .cloned()
            .unwrap_or_else(|| StreamStatus::Failed("reply stream closed unexpectedly".into()));
        self.settle(status)
    }

    fn settle(self, status: StreamStatus) -> ReplyOutcome {
        let turn = match &status {
            StreamStatus::Completed => Some(Turn::assistant(self.partial.as_str())),
            StreamStatus::Cancelled => {
                tracing::info!(
                    conversation_id = %self.conversation_id,
                    received = self.partial.len(),
                    "Reply stopped"
                );
                (!self.partial.is_empty()).then(|| Turn::interrupted(self.partial.as_str()))
            }
            StreamStatus::Failed(reason) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    reason = %reason,
                    "Reply failed"
                );
                self.notifier.notify(NotificationLevel::Error, reason);
                (!self.partial.is_empty()).then(|| Turn::interrupted(self.partial.as_str()))
            }
        };

        let turn = turn.and_then(|turn| {
            let failures = self.store.persist_failures();
            match self.store.append(&self.conversation_id, vec![turn.clone()]) {
                Ok(()) => {
                    warn_on_persist_failure(&self.store, self.notifier.as_ref(), failures);
                    Some(turn)
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        error = %e,
                        "Reply could not be stored"
                    );
                    None
                }
            }
        });

        ReplyOutcome {
            conversation_id: self.conversation_id.clone(),
            status,
            turn,
        }
    }
}
