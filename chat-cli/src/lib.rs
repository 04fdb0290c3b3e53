//! Chat CLI - terminal front end for the chat relay and session store.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod cli;
pub mod commands;
pub mod notifier;

pub use cli::{Cli, Commands};
pub use commands::{run, stream_reply, App};
pub use notifier::ConsoleNotifier;
