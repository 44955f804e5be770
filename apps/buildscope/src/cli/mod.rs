//! # buildscope CLI Module
//!
//! This module implements the CLI interface for buildscope.
//!
//! ## Available Commands
//!
//! - `init` - Create an empty workspace file
//! - `ingest` - Import a captured build manifest
//! - `status` - Show graph and history status
//! - `rm-path`, `rm-path-tree` - Delete paths
//! - `rm-action`, `rm-action-tree` - Delete actions
//! - `merge` - Merge sibling actions
//! - `make-atomic` - Flatten a composite action
//! - `move` - Move members into a package
//! - `undo`, `redo` - Walk the refactoring history
//! - `reap` - Physically drop trashed objects

mod commands;

use crate::config::Config;
use buildscope_core::{GraphError, RefactorError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// buildscope - refactor captured build graphs
///
/// Every refactoring is recorded in the workspace file and can be undone.
#[derive(Parser, Debug)]
#[command(name = "buildscope")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress informational output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the workspace file (overrides buildscope.toml)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Path to a configuration file (default: ./buildscope.toml if present)
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new empty workspace
    Init {
        /// Force initialization even if the workspace exists
        #[arg(short, long)]
        force: bool,
    },

    /// Ingest a build manifest (JSON)
    Ingest {
        /// Path to the manifest file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show graph status
    Status {
        /// Also print the snapshot checksum
        #[arg(long)]
        checksum: bool,
    },

    /// Delete a path
    RmPath {
        /// Absolute path text or numeric path id
        path: String,

        /// Also delete the actions that generate it
        #[arg(long)]
        cascade: bool,
    },

    /// Delete a path and everything below it
    RmPathTree {
        /// Absolute path text or numeric path id
        path: String,

        /// Also delete the actions that generate it
        #[arg(long)]
        cascade: bool,
    },

    /// Delete an action, keeping its children
    RmAction {
        /// Action id
        action: u64,
    },

    /// Delete an action and all its descendants
    RmActionTree {
        /// Action id
        action: u64,
    },

    /// Merge sibling atomic actions into one
    Merge {
        /// Action ids, in command order
        #[arg(required = true)]
        actions: Vec<u64>,
    },

    /// Flatten a composite action into a single atomic action
    MakeAtomic {
        /// Action id
        action: u64,
    },

    /// Move paths, actions and file groups into a package
    Move {
        /// Destination package name
        #[arg(short, long)]
        package: String,

        /// Members as `path:<id|/abs/path>`, `action:<id>` or `group:<id>`
        #[arg(short, long = "member", required = true)]
        members: Vec<String>,
    },

    /// Undo the most recent refactoring
    Undo,

    /// Redo the most recently undone refactoring
    Redo,

    /// Physically drop trashed objects (clears history)
    Reap,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors surfaced by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Refactor(#[from] RefactorError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Invalid argument: {0}")]
    Usage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl CliError {
    /// Process exit code: 2 when the graph can no longer be trusted,
    /// 1 for everything else.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Refactor(e) if e.is_fatal() => 2,
            _ => 1,
        }
    }
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli, config: &Config) -> Result<(), CliError> {
    let db = cli
        .database
        .clone()
        .unwrap_or_else(|| config.database_path());
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&db, force),
        Some(Commands::Ingest { file }) => cmd_ingest(&db, json_mode, &file),
        Some(Commands::Status { checksum }) => cmd_status(&db, json_mode, checksum),
        Some(Commands::RmPath { path, cascade }) => {
            cmd_rm_path(&db, json_mode, &path, cascade, false)
        }
        Some(Commands::RmPathTree { path, cascade }) => {
            cmd_rm_path(&db, json_mode, &path, cascade, true)
        }
        Some(Commands::RmAction { action }) => cmd_rm_action(&db, json_mode, action, false),
        Some(Commands::RmActionTree { action }) => cmd_rm_action(&db, json_mode, action, true),
        Some(Commands::Merge { actions }) => cmd_merge(&db, json_mode, &actions),
        Some(Commands::MakeAtomic { action }) => cmd_make_atomic(&db, json_mode, action),
        Some(Commands::Move { package, members }) => {
            cmd_move(&db, json_mode, &package, &members)
        }
        Some(Commands::Undo) => cmd_undo(&db, json_mode),
        Some(Commands::Redo) => cmd_redo(&db, json_mode),
        Some(Commands::Reap) => cmd_reap(&db, json_mode),
        None => {
            // No subcommand - show status by default
            cmd_status(&db, json_mode, false)
        }
    }
}
