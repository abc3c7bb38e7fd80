pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "estuary")]
#[command(about = "A multi-user feed aggregator", long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.config/estuary/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Poll feeds and process updates until interrupted
    Serve,
    /// Add a feed, or the feed advertised by a page
    Add {
        /// URL of the feed or page
        url: String,

        /// Subscribe this user to the feed
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Remove a feed
    Remove {
        /// URL of the feed to remove
        url: String,
    },
    /// Find feeds for a URL or search query
    Discover {
        /// URL or search terms
        query: String,
    },
    /// List feeds or articles
    List {
        /// Show articles instead of feeds
        #[arg(long)]
        articles: bool,
    },
    /// Manage users
    User {
        #[command(subcommand)]
        action: UserAction,
    },
}

#[derive(Subcommand)]
pub enum UserAction {
    /// Create a user
    Add {
        /// Login of the new user
        login: String,
    },
}
