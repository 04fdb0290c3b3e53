//! Persisted conversation store.
//!
//! Holds the mapping of conversation id to [`Conversation`] plus the selected
//! model. Every operation is synchronous. A mutation re-reads the stored
//! record under the backend's lock, applies itself to that record and writes
//! it back, so stores in other processes sharing the backend keep each
//! other's changes. A failed write is logged and remembered but the
//! in-memory state keeps the change.

use anyhow::Result;
use chat_common::config::StoreConfig;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::backend::{open_backend, MemoryBackend, StateBackend};
use crate::types::{Conversation, PersistedState, Role, Turn};

/// Rejected store mutations. Nothing is changed when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("conversation id must not be empty")]
    EmptyConversationId,

    #[error("conversation '{0}' must start with a user turn")]
    FirstTurnNotUser(String),

    #[error("turn id '{turn_id}' already exists in conversation '{conversation_id}'")]
    DuplicateTurnId {
        conversation_id: String,
        turn_id: String,
    },

    #[error("conversation '{0}' not found")]
    NotFound(String),
}

struct StoreState {
    record: PersistedState,
    /// The last write failed, so the backend is behind `record`.
    unsynced: bool,
    persist_failures: u64,
    last_persist_error: Option<String>,
}

/// Conversation store shared by the controller and the CLI.
pub struct SessionStore {
    backend: Box<dyn StateBackend>,
    namespace: String,
    state: Mutex<StoreState>,
}

impl SessionStore {
    /// Open the store, loading the record saved under `namespace`.
    ///
    /// A missing record starts empty. An unreadable or corrupt one is logged
    /// and also starts empty; it is left on disk until the next mutation.
    pub fn open(backend: Box<dyn StateBackend>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let record = match backend.load(&namespace) {
            Ok(Some(raw)) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        backend = backend.name(),
                        namespace = %namespace,
                        error = %e,
                        "Stored chat state is corrupt, starting empty"
                    );
                    PersistedState::default()
                }
            },
            Ok(None) => PersistedState::default(),
            Err(e) => {
                tracing::warn!(
                    backend = backend.name(),
                    namespace = %namespace,
                    error = %e,
                    "Failed to load chat state, starting empty"
                );
                PersistedState::default()
            }
        };

        tracing::debug!(
            backend = backend.name(),
            namespace = %namespace,
            conversations = record.chats.len(),
            "Session store opened"
        );

        Self {
            backend,
            namespace,
            state: Mutex::new(StoreState {
                record,
                unsynced: false,
                persist_failures: 0,
                last_persist_error: None,
            }),
        }
    }

    /// Open the store described by the configuration.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Ok(Self::open(open_backend(config)?, config.namespace.clone()))
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryBackend::new()), "chat-state")
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `op` to the stored record and write the result back.
    ///
    /// The base is the record currently in the backend, so changes made by
    /// other stores since this one last looked are kept. While an earlier
    /// write is still missing the in-memory record is the base instead, and
    /// an unreadable stored record falls back to it as well. A rejected `op`
    /// writes nothing.
    fn mutate<T>(
        &self,
        mut op: impl FnMut(&mut PersistedState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.lock();
        let cached = &state.record;
        let unsynced = state.unsynced;
        let mut applied: Option<(PersistedState, Result<T, StoreError>)> = None;

        let saved = self.backend.update(&self.namespace, &mut |raw| {
            let mut record = match raw {
                _ if unsynced => cached.clone(),
                None => PersistedState::default(),
                Some(raw) => self.parse_stored(raw).unwrap_or_else(|| cached.clone()),
            };
            let outcome = op(&mut record);
            let write = match &outcome {
                Ok(_) => Some(serde_json::to_string(&record)?),
                Err(_) => None,
            };
            applied = Some((record, outcome));
            Ok(write)
        });

        match (saved, applied) {
            (_, Some((_, Err(rejected)))) => Err(rejected),
            (Ok(()), Some((record, Ok(value)))) => {
                state.record = record;
                state.unsynced = false;
                Ok(value)
            }
            (Err(e), Some((record, Ok(value)))) => {
                state.record = record;
                self.record_failure(&mut state, e);
                Ok(value)
            }
            // The backend failed before it could hand over the stored record
            (saved, None) => {
                if let Err(e) = saved {
                    self.record_failure(&mut state, e);
                }
                op(&mut state.record)
            }
        }
    }

    fn parse_stored(&self, raw: &str) -> Option<PersistedState> {
        serde_json::from_str(raw)
            .inspect_err(|e| {
                tracing::warn!(
                    backend = self.backend.name(),
                    namespace = %self.namespace,
                    error = %e,
                    "Stored chat state is corrupt, keeping the in-memory copy"
                );
            })
            .ok()
    }

    fn record_failure(&self, state: &mut StoreState, e: anyhow::Error) {
        state.unsynced = true;
        state.persist_failures += 1;
        tracing::warn!(
            backend = self.backend.name(),
            namespace = %self.namespace,
            failures = state.persist_failures,
            error = %e,
            "Failed to persist chat state"
        );
        state.last_persist_error = Some(format!("{e:#}"));
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Append `turns` to the conversation, creating it if absent.
    pub fn append(&self, conversation_id: &str, turns: Vec<Turn>) -> Result<(), StoreError> {
        if conversation_id.trim().is_empty() {
            return Err(StoreError::EmptyConversationId);
        }

        self.mutate(|record| {
            let existing = record
                .chats
                .get(conversation_id)
                .map(|c| c.turns.as_slice())
                .unwrap_or_default();
            check_append(conversation_id, existing, &turns)?;

            record
                .chats
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation::new(conversation_id))
                .turns
                .extend(turns.iter().cloned());
            Ok(())
        })?;

        tracing::debug!(conversation_id, turns = turns.len(), "Appended turns");
        Ok(())
    }

    /// Current turns, or empty if the conversation does not exist.
    pub fn get_turns(&self, conversation_id: &str) -> Vec<Turn> {
        self.lock()
            .record
            .chats
            .get(conversation_id)
            .map(|c| c.turns.clone())
            .unwrap_or_default()
    }

    /// The full conversation, metadata included.
    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.lock().record.chats.get(conversation_id).cloned()
    }

    /// Remove the conversation. Returns whether it existed.
    pub fn delete(&self, conversation_id: &str) -> bool {
        let removed = self
            .mutate(|record| match record.chats.remove(conversation_id) {
                Some(_) => Ok(true),
                None => Err(StoreError::NotFound(conversation_id.to_string())),
            })
            .is_ok();
        if removed {
            tracing::debug!(conversation_id, "Deleted conversation");
        }
        removed
    }

    /// All conversations, newest first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> =
            self.lock().record.chats.values().cloned().collect();
        sort_newest_first(&mut conversations);
        conversations
    }

    /// Conversations whose first turn contains `query`, ignoring case.
    /// An empty query matches everything.
    pub fn search(&self, query: &str) -> Vec<Conversation> {
        let needle = query.trim().to_lowercase();
        let mut conversations: Vec<Conversation> = self
            .lock()
            .record
            .chats
            .values()
            .filter(|c| {
                needle.is_empty()
                    || c.title()
                        .is_some_and(|title| title.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        sort_newest_first(&mut conversations);
        conversations
    }

    /// Set or clear the category label.
    pub fn set_category(
        &self,
        conversation_id: &str,
        category: Option<String>,
    ) -> Result<(), StoreError> {
        let category = category
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        self.mutate(|record| {
            let conversation = record
                .chats
                .get_mut(conversation_id)
                .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
            conversation.category = category.clone();
            Ok(())
        })
    }

    /// Remove and return the latest turn.
    pub fn pop_last_turn(&self, conversation_id: &str) -> Option<Turn> {
        self.mutate(|record| {
            record
                .chats
                .get_mut(conversation_id)
                .and_then(|c| c.turns.pop())
                .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))
        })
        .ok()
    }

    /// Delete every conversation. The selected model is kept.
    pub fn clear(&self) {
        let _ = self.mutate(|record| {
            record.chats.clear();
            Ok(())
        });
    }

    // ------------------------------------------------------------------
    // Model selection
    // ------------------------------------------------------------------

    /// Select the model used for new submissions. A blank id clears it.
    pub fn select_model(&self, model: impl Into<String>) {
        let model = Some(model.into().trim().to_string()).filter(|m| !m.is_empty());
        let _ = self.mutate(|record| {
            record.selected_model = model.clone();
            Ok(())
        });
    }

    pub fn current_model(&self) -> Option<String> {
        self.lock().record.selected_model.clone()
    }

    // ------------------------------------------------------------------
    // Persistence health
    // ------------------------------------------------------------------

    /// The most recent write failure, if any write has failed.
    pub fn last_persist_error(&self) -> Option<String> {
        self.lock().last_persist_error.clone()
    }

    /// Number of failed writes since the store was opened.
    pub fn persist_failures(&self) -> u64 {
        self.lock().persist_failures
    }

    /// Snapshot of the whole record.
    pub fn snapshot(&self) -> PersistedState {
        self.lock().record.clone()
    }
}

/// Reject `turns` if appending them to `existing` would break the
/// conversation's invariants.
fn check_append(
    conversation_id: &str,
    existing: &[Turn],
    turns: &[Turn],
) -> Result<(), StoreError> {
    let first_role = existing.first().or(turns.first()).map(|t| t.role);
    if matches!(first_role, Some(role) if role != Role::User) {
        return Err(StoreError::FirstTurnNotUser(conversation_id.to_string()));
    }

    for (index, turn) in turns.iter().enumerate() {
        let duplicate = existing.iter().any(|t| t.id == turn.id)
            || turns[..index].iter().any(|t| t.id == turn.id);
        if duplicate {
            return Err(StoreError::DuplicateTurnId {
                conversation_id: conversation_id.to_string(),
                turn_id: turn.id.clone(),
            });
        }
    }
    Ok(())
}

fn sort_newest_first(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
