use auth_perms::NodeRef;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Perms Engine operator CLI
#[derive(Parser, Debug)]
#[command(name = "permsctl")]
#[command(about = "Inspect permission decisions and membership graphs", version)]
pub struct Cli {
    /// Configuration file (YAML, TOML or JSON); PERMS_* variables override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Load an in-memory store from a fixture instead of the database
    #[arg(long, global = true)]
    pub fixture: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decide whether a principal holds a permission
    Check {
        #[arg(long)]
        principal: String,

        #[arg(long)]
        permission: String,

        /// Scope the question to one object
        #[arg(long)]
        object: Option<String>,

        /// Report which grant source decided
        #[arg(long)]
        explain: bool,
    },

    /// List every group reachable from a node (user:<id> or group:<id>)
    Groups {
        #[arg(long)]
        node: NodeRef,
    },

    /// Load the data source and report what it holds
    Validate,
}
