//! Command-line argument structures and enums

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mdreader-sync")]
#[command(version)]
#[command(about = "Inspect and drive the MDReader offline-first sync engine", long_about = None)]
pub struct Cli {
    /// Use this config file instead of ~/.config/mdreader/sync.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the local data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Never replicate, whatever the environment says
    #[arg(long, global = true)]
    pub offline: bool,

    /// Log more (repeat for trace output)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the detected environment, storage and replication policy
    Env,

    /// Inspect and replay the offline change queue
    #[command(alias = "q")]
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Folder operations on a workspace
    #[command(alias = "f")]
    Folders {
        #[command(subcommand)]
        command: FolderCommands,
    },

    /// Read and edit documents
    #[command(alias = "d")]
    Doc {
        #[command(subcommand)]
        command: DocCommands,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List pending changes in replay order
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay pending changes now
    Flush,

    /// List changes the remote refused
    DeadLetters {
        /// Re-queue the dead-lettered change with this sequence number
        #[arg(long, conflicts_with = "discard")]
        retry: Option<u64>,

        /// Drop the dead-lettered change with this sequence number
        #[arg(long)]
        discard: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum FolderCommands {
    /// List folders of a workspace as a tree
    List {
        /// Workspace id
        workspace: String,
    },

    /// Create a folder
    Create {
        /// Workspace id
        workspace: String,

        /// Folder name
        name: String,

        /// Parent folder id (default: workspace root)
        #[arg(short, long)]
        parent: Option<String>,

        /// Icon (emoji)
        #[arg(long)]
        icon: Option<String>,

        /// Color as #rrggbb
        #[arg(long)]
        color: Option<String>,
    },

    /// Rename a folder
    Rename {
        /// Workspace id
        workspace: String,

        /// Folder id
        id: String,

        /// New name
        name: String,
    },

    /// Move a folder under another parent
    Move {
        /// Workspace id
        workspace: String,

        /// Folder id
        id: String,

        /// New parent id (omit for the workspace root)
        #[arg(short, long)]
        parent: Option<String>,

        /// Position among the new siblings
        #[arg(long, default_value_t = 0)]
        position: i64,
    },

    /// Delete an empty folder
    Delete {
        /// Workspace id
        workspace: String,

        /// Folder id
        id: String,
    },

    /// Merge the server's folder list into the local cache
    Refresh {
        /// Workspace id
        workspace: String,
    },
}

#[derive(Subcommand)]
pub enum DocCommands {
    /// Print a document's content
    Show {
        /// Document id
        id: String,

        /// Also print title, metadata and replication status
        #[arg(short, long)]
        info: bool,
    },

    /// Append text to a document
    Append {
        /// Document id
        id: String,

        /// Text to append (reads stdin when omitted)
        text: Option<String>,

        /// Keep the session open this many seconds so replication can catch up
        #[arg(long, default_value_t = 0)]
        linger: u64,
    },
}
