//! Command line definition.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Chat with local models from the terminal.
#[derive(Parser, Debug)]
#[command(name = "chat-cli")]
#[command(version)]
#[command(about = "Chat with local Ollama models through the chat relay.", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ~/.ollama-chat/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Show debug logs on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Send a message and stream the reply (Ctrl-C stops it)
    Send {
        /// Message text
        message: String,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Attach an image by URL (repeatable)
        #[arg(short, long = "image")]
        images: Vec<String>,

        /// Select this model before sending
        #[arg(short, long)]
        model: Option<String>,
    },

    /// List conversations, newest first
    List {
        /// Only conversations whose first message contains this text
        #[arg(short, long)]
        search: Option<String>,
    },

    /// Print a conversation
    Show {
        /// Conversation id
        id: String,
    },

    /// Delete a conversation
    Delete {
        /// Conversation id
        #[arg(required_unless_present = "all")]
        id: Option<String>,

        /// Delete every conversation
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Show or change the selected model
    Model {
        /// Model to select
        name: Option<String>,
    },

    /// List models installed on the inference server
    Models,

    /// Replace the last reply of a conversation
    Regenerate {
        /// Conversation id
        id: String,
    },

    /// Set or clear a conversation's category
    Category {
        /// Conversation id
        id: String,

        /// Category label; omit to clear
        label: Option<String>,
    },
}
