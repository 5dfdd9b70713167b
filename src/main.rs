mod cli;
mod shutdown;

use crawl_frontier::config::{Config, ConfigError, FrontierConfig, QueueStoreKind, UniqFilterKind};
use crawl_frontier::context::CrawlContext;
use crawl_frontier::journal::JournalError;
use crawl_frontier::logging::init_logging_in_data_dir;
use crawl_frontier::queue_store::StoreError;
use crawl_frontier::recovery::replay;
use crawl_frontier::seeder::FileSeedSource;
use crawl_frontier::{Frontier, FrontierError};

use cli::{Cli, Commands};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MainError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Frontier error: {0}")]
    Frontier(#[from] FrontierError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Usage(String),
}

impl MainError {
    fn exit_code(&self) -> i32 {
        match self {
            MainError::Usage(_) => 2,
            _ => 3,
        }
    }
}

/// Load the configuration and make every component durable; CLI commands
/// always work against state on disk.
fn load_config(path: Option<&str>) -> Result<FrontierConfig, ConfigError> {
    let mut config = match path {
        Some(path) => FrontierConfig::from_json_file(path)?,
        None => FrontierConfig::default(),
    };
    if config.queue_store != QueueStoreKind::Persistent {
        tracing::info!("Using the persistent queue store");
        config.queue_store = QueueStoreKind::Persistent;
    }
    if config.uniq_filter == UniqFilterKind::Memory {
        tracing::info!("Using the persistent dedup filter");
        config.uniq_filter = UniqFilterKind::Persistent;
    }
    Ok(config)
}

/// Resume from the checkpoint under `data_dir` if there is one, else start fresh.
fn open_frontier(data_dir: &str, config: FrontierConfig) -> Result<Arc<Frontier>, MainError> {
    let ctx = CrawlContext::new(data_dir, &config)?;
    let frontier = if ctx.checkpoint_path().exists() {
        Frontier::resume(config, ctx)?
    } else {
        Frontier::new(config, ctx)?
    };
    Ok(Arc::new(frontier))
}

fn resume_frontier(data_dir: &str, config: FrontierConfig) -> Result<Arc<Frontier>, MainError> {
    let ctx = CrawlContext::new(data_dir, &config)?;
    Ok(Arc::new(Frontier::resume(config, ctx)?))
}

/// Replaying a journal into itself would read lines as they are written.
fn check_distinct_journal(source: &Path, data_dir: &Path) -> Result<PathBuf, MainError> {
    let source = std::fs::canonicalize(source)?;
    let target = std::fs::canonicalize(data_dir)?.join(Config::JOURNAL_FILENAME);
    if source == target {
        return Err(MainError::Usage(format!(
            "{} is the journal this recovery would write; copy it elsewhere first",
            source.display()
        )));
    }
    Ok(source)
}

fn finish(frontier: &Frontier) -> Result<(), MainError> {
    let path = frontier.checkpoint()?;
    frontier.close()?;
    println!("{}", frontier.report());
    println!("Checkpoint: {}", path.display());
    Ok(())
}

async fn run(cli: Cli) -> Result<(), MainError> {
    match cli.command {
        Commands::Seed {
            data_dir,
            seeds,
            config,
        } => {
            let _logging = init_logging_in_data_dir(&data_dir).map_err(|e| MainError::Logging(e.to_string()))?;
            let config = load_config(config.as_deref())?;
            let frontier = open_frontier(&data_dir, config)?;
            shutdown::setup_shutdown_handler(Arc::clone(&frontier));

            tokio::task::spawn_blocking(move || {
                let offered = frontier.load_seeds(&FileSeedSource::new(&seeds));
                println!("Offered {} seeds from {}", offered, seeds);
                finish(&frontier)
            })
            .await?
        }

        Commands::Recover {
            data_dir,
            journal,
            retain_failures,
            config,
        } => {
            let _logging = init_logging_in_data_dir(&data_dir).map_err(|e| MainError::Logging(e.to_string()))?;
            let mut config = load_config(config.as_deref())?;
            config.retain_failures |= retain_failures;
            let ctx = CrawlContext::new(&data_dir, &config)?;
            let source = check_distinct_journal(Path::new(&journal), ctx.data_dir())?;
            let retain = config.retain_failures;
            let frontier = Arc::new(Frontier::new(config, ctx)?);
            shutdown::setup_shutdown_handler(Arc::clone(&frontier));

            tokio::task::spawn_blocking(move || {
                let stats = replay(Arc::clone(&frontier), &source, retain)?.join()?;
                println!(
                    "Replayed {} lines: {} completed, {} adds offered{}",
                    stats.completion_lines,
                    stats.completed,
                    stats.scheduled,
                    if stats.truncated { " (journal truncated)" } else { "" }
                );
                finish(&frontier)
            })
            .await?
        }

        Commands::Report {
            data_dir,
            json,
            config,
        } => {
            let mut config = load_config(config.as_deref())?;
            config.journal = false;
            let frontier = resume_frontier(&data_dir, config)?;
            if json {
                let stats = serde_json::to_string_pretty(&frontier.stats()).map_err(FrontierError::from)?;
                println!("{}", stats);
            } else {
                println!("{}", frontier.report());
            }
            Ok(())
        }

        Commands::Delete {
            data_dir,
            pattern,
            config,
        } => {
            let _logging = init_logging_in_data_dir(&data_dir).map_err(|e| MainError::Logging(e.to_string()))?;
            let config = load_config(config.as_deref())?;
            let frontier = resume_frontier(&data_dir, config)?;
            shutdown::setup_shutdown_handler(Arc::clone(&frontier));

            tokio::task::spawn_blocking(move || {
                let deleted = frontier.delete_matching(&pattern)?;
                println!("Deleted {} pending URIs matching {}", deleted, pattern);
                finish(&frontier)
            })
            .await?
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
