//! # notectx CLI
//!
//! The `notectx` binary indexes exported notes into vector collections and
//! serves cited context to AI tools.
//!
//! ## Usage
//!
//! ```bash
//! notectx --config ./config/notectx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `notectx init` | Create the SQLite database and run schema migrations |
//! | `notectx index <collection>` | Index one configured collection |
//! | `notectx index --all` | Index every configured collection |
//! | `notectx search "<query>"` | Retrieve cited context |
//! | `notectx collections` | List indexed collections |
//! | `notectx serve mcp` | Start the HTTP + MCP server |
//!
//! ## Logging
//!
//! Logs go to stderr; command output goes to stdout. Set `RUST_LOG` to
//! override the default `notectx=info` filter.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use notectx::search::SearchArgs;
use notectx::{config, ingest, migrate, search, server, stats};

/// notectx: index personal notes and serve cited context to AI tools.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/notectx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "notectx",
    about = "notectx: index personal notes and serve cited context to AI tools",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/notectx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Safe to
    /// run repeatedly.
    Init,

    /// Index a configured collection from its notes file.
    ///
    /// Unchanged notes are skipped, changed notes are re-embedded, and notes
    /// missing from the file are removed. With `--force` the collection is
    /// rebuilt from scratch and swapped in atomically.
    Index {
        /// Collection name from a `[[collections]]` entry.
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        collection: Option<String>,

        /// Index every configured collection.
        #[arg(long)]
        all: bool,

        /// Rebuild the collection instead of updating it incrementally.
        #[arg(long)]
        force: bool,
    },

    /// Retrieve cited context for a query.
    Search {
        /// The search query string.
        query: String,

        /// Restrict to a collection (repeatable). Defaults to all.
        #[arg(long = "collection")]
        collections: Vec<String>,

        /// Maximum number of context items.
        #[arg(long)]
        limit: Option<usize>,

        /// Keep notes carrying this tag (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Keep only this note id (repeatable).
        #[arg(long = "note")]
        notes: Vec<String>,

        /// Only notes updated on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List indexed collections.
    Collections {
        /// Print the list as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the HTTP tool server with the MCP endpoint at `/mcp`.
    Mcp,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("notectx=info,notectx_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            collection,
            all: _,
            force,
        } => {
            ingest::run_index_cmd(&cfg, collection.as_deref(), force).await?;
        }
        Commands::Search {
            query,
            collections,
            limit,
            tags,
            notes,
            since,
            json,
        } => {
            let args = SearchArgs {
                query,
                collections,
                limit,
                tags,
                notes,
                since,
                json,
            };
            search::run_search(&cfg, &args).await?;
        }
        Commands::Collections { json } => {
            stats::run_collections(&cfg, json).await?;
        }
        Commands::Serve { service } => match service {
            ServeService::Mcp => {
                server::run_server(&cfg).await?;
            }
        },
    }

    Ok(())
}
