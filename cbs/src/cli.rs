//! CLI argument parsing for callstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cbs")]
#[command(author, version = env!("GIT_DESCRIBE"), about = "Inspect a callstore database", long_about = None)]
pub struct Cli {
    /// Path to the store file (default: the callbackd store)
    #[arg(short, long)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List record ids in a collection
    List {
        /// Collection name
        #[arg(required = true)]
        collection: String,
    },

    /// Print a record as pretty JSON
    Show {
        /// Collection name
        #[arg(required = true)]
        collection: String,

        /// Record ID
        #[arg(required = true)]
        id: String,
    },

    /// Show record counts per collection
    Stats,
}
