//! # Snapshot Harness CLI (`snap`)
//!
//! Thin wrapper over the library: every command loads the configuration,
//! calls one library operation and prints JSON on stdout. Logs and progress
//! go to stderr.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `snap init` | Create the SQLite database and run schema migrations |
//! | `snap stage <project> <filename>` | Upload one file into the project's staging area |
//! | `snap staging <project>` | List staged files |
//! | `snap clear-staging <project>` | Remove staged files |
//! | `snap process <project> --vendor-id <id>` | Run the pipeline over staging or a clone URL |
//! | `snap query <project>` | Snapshots of a project, by type and/or path |
//! | `snap manifest <project>` | Stored snapshot counts for a project |
//! | `snap notebook <project>` | All snapshots of a project grouped by file |
//! | `snap delete <project>` | Delete a project's snapshots, staging and clone |
//! | `snap stats` | Cross-project store statistics |
//!
//! ## Examples
//!
//! ```bash
//! snap init --config ./config/snap.toml
//! snap stage alpha src/app.py --file ./app.py
//! snap process alpha --vendor-id acme
//! snap process beta --vendor-id acme --url https://github.com/acme/widgets --branch main
//! snap query alpha --type functions --path src/app.py
//! ```

use anyhow::Context;
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use snapshot_harness::config::{self, Config};
use snapshot_harness::progress::ProgressMode;
use snapshot_harness::query;
use snapshot_harness::staging::{Encoding, StagingArea};
use snapshot_harness::stats;
use snapshot_harness::store::{SnapshotStore, SqliteSnapshotStore};
use snapshot_harness::{CancelToken, Pipeline, ProjectId, SnapshotFilter, SnapshotType, Source};

/// Snapshot Harness: route project artifacts through parsers into typed,
/// per-project snapshots.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/snap.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "snap", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/snap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Stage one file for a project.
    ///
    /// Content comes from `--file` or `--content`. Files that are not valid
    /// UTF-8 are uploaded base64-encoded.
    Stage {
        project: ProjectId,
        /// Relative path the file is staged under.
        filename: String,
        /// Read content from this local file.
        #[arg(long, conflicts_with = "content")]
        file: Option<PathBuf>,
        /// Inline content.
        #[arg(long)]
        content: Option<String>,
        /// Encoding of `--content`: utf-8 or base64.
        #[arg(long, default_value = "utf-8")]
        encoding: String,
    },

    /// List a project's staged files.
    Staging { project: ProjectId },

    /// Remove a project's staged files.
    ClearStaging { project: ProjectId },

    /// Process a project's staged files, or a repository clone.
    Process {
        project: ProjectId,
        /// Clone this https repository URL instead of using staging.
        #[arg(long)]
        url: Option<String>,
        /// Branch to clone (with `--url`).
        #[arg(long, requires = "url")]
        branch: Option<String>,
        /// Caller identifier recorded in logs and the manifest.
        #[arg(long)]
        vendor_id: String,
        /// Progress output on stderr.
        #[arg(long, value_enum, default_value_t = ProgressArg::Auto)]
        progress: ProgressArg,
    },

    /// Query a project's snapshots.
    Query {
        project: ProjectId,
        /// Snapshot type, e.g. `functions` or `csv_schema`.
        #[arg(long = "type")]
        snapshot_type: Option<SnapshotType>,
        /// Source path relative to the staging root.
        #[arg(long)]
        path: Option<String>,
    },

    /// Stored snapshot counts and last processing time for a project.
    Manifest { project: ProjectId },

    /// All snapshots of a project grouped by source file.
    Notebook { project: ProjectId },

    /// Delete a project's snapshots, staged files and clone.
    Delete { project: ProjectId },

    /// Cross-project store statistics.
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Human,
    Json,
    Off,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[derive(Serialize)]
struct Cleared {
    project_id: ProjectId,
    removed: u64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SNAP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<SqliteSnapshotStore> {
    SqliteSnapshotStore::open(cfg)
        .await
        .with_context(|| format!("Failed to open database {}", cfg.db.path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = open_store(&cfg).await?;
            store.pool().close().await;
            println!("Database initialized successfully.");
        }
        Commands::Stage {
            project,
            filename,
            file,
            content,
            encoding,
        } => {
            let (content, encoding) = match (file, content) {
                (Some(path), _) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    match String::from_utf8(bytes) {
                        Ok(text) => (text, Encoding::Utf8),
                        Err(e) => (
                            base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
                            Encoding::Base64,
                        ),
                    }
                }
                (None, Some(text)) => (text, encoding.parse::<Encoding>()?),
                (None, None) => anyhow::bail!("one of --file or --content is required"),
            };
            let staging = StagingArea::new(&cfg)?;
            print_json(&staging.stage_file(&project, &filename, &content, encoding)?)?;
        }
        Commands::Staging { project } => {
            let staging = StagingArea::new(&cfg)?;
            print_json(&staging.staging_info(&project)?)?;
        }
        Commands::ClearStaging { project } => {
            let pipeline = Pipeline::open(cfg).await?;
            let removed = pipeline.clear_staging(&project)?;
            print_json(&Cleared {
                project_id: project,
                removed,
            })?;
        }
        Commands::Process {
            project,
            url,
            branch,
            vendor_id,
            progress,
        } => {
            let pipeline = Pipeline::open(cfg)
                .await?
                .with_progress(progress.mode().reporter());
            let source = match url {
                Some(url) => Source::Clone { url, branch },
                None => Source::Staged,
            };

            let cancel = CancelToken::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling run");
                    watcher.cancel();
                }
            });

            let manifest = pipeline
                .process(&project, source, Some(&vendor_id), &cancel)
                .await?;
            print_json(&manifest)?;
        }
        Commands::Query {
            project,
            snapshot_type,
            path,
        } => {
            let store = open_store(&cfg).await?;
            let filter = SnapshotFilter {
                snapshot_type,
                source_path: path,
            };
            print_json(&query::query_snapshots(&store, &project, filter).await?)?;
        }
        Commands::Manifest { project } => {
            let store = open_store(&cfg).await?;
            print_json(&store.manifest(&project).await?)?;
        }
        Commands::Notebook { project } => {
            let store = open_store(&cfg).await?;
            print_json(&query::notebook(&store, &project).await?)?;
        }
        Commands::Delete { project } => {
            let pipeline = Pipeline::open(cfg).await?;
            print_json(&pipeline.delete_project(&project).await?)?;
        }
        Commands::Stats => {
            let store = open_store(&cfg).await?;
            let metrics = store.system_metrics().await?;
            print!("{}", stats::render_stats(&cfg, &metrics));
        }
    }

    Ok(())
}
