//! Chat Session - Conversation state and reply streaming for the chat client.
//!
//! This crate provides:
//! - The persisted conversation store ([`SessionStore`]) and its storage backends
//! - A relay client that streams replies through a cancellable [`ReplyHandle`]
//! - The [`ChatController`] driving submissions, cancellation and persistence

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod backend;
pub mod client;
pub mod controller;
pub mod store;
pub mod stream;
pub mod types;

pub use backend::{
    open_backend, JsonFileBackend, MemoryBackend, SqliteBackend, StateBackend, UpdateFn,
};
pub use client::{RelayClient, ReplySource};
pub use controller::{
    ChatController, NotificationLevel, Notifier, PendingReply, ReplyOutcome, SubmitError,
};
pub use store::{SessionStore, StoreError};
pub use stream::{ReplyHandle, ReplySender, StreamStatus};
pub use types::{Conversation, PersistedState, Role, Turn};
