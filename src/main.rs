use clap::{Parser, Subcommand};
use movies_etl::backoff::Backoff;
use movies_etl::config::{CursorStoreKind, EtlConfig};
use movies_etl::db;
use movies_etl::error::EtlError;
use movies_etl::search::{DocumentSink, ElasticsearchService, IndexLoader};
use movies_etl::state::{
    AnyCursorStore, CURRENT_TIME_KEY, CursorStore, EPOCH, LAST_EXTRACTED_KEY,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "movies-etl",
    about = "Synchronize the movie catalogue from Postgres into Elasticsearch"
)]
struct Cli {
    /// Target index (overrides ELASTICSEARCH_INDEX).
    #[arg(long, global = true)]
    index: Option<String>,

    /// Watermark backend: postgres, file or memory (overrides ETL_STATE_BACKEND).
    #[arg(long, global = true)]
    state_backend: Option<CursorStoreKind>,

    /// Watermark file for the file backend (overrides ETL_STATE_PATH).
    #[arg(long, global = true)]
    state_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one synchronization pass.
    Run,
    /// Create the index with its schema if it does not exist.
    EnsureIndex,
    /// Apply database migrations.
    Migrate,
    /// Inspect or rewind the stored watermark.
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand, Debug)]
enum StateAction {
    /// Print the stored timestamps.
    Show,
    /// Rewind the baseline to the epoch so the next pass reindexes everything.
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    movies_etl::init_logger();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<(), EtlError> {
    let mut config = EtlConfig::from_env()?;
    if let Some(index) = cli.index {
        config.elasticsearch.index = index;
    }
    if let Some(backend) = cli.state_backend {
        config.state_backend = backend;
    }
    if let Some(path) = cli.state_path {
        config.state_path = path;
    }

    match cli.command {
        Command::Run => {
            let pipeline = movies_etl::build_pipeline(&config).await?;
            let report = pipeline.run_once().await?;
            println!(
                "synchronized {} documents into '{}' ({} created, {} updated, {} unchanged) in {} batches",
                report.documents,
                pipeline.index(),
                report.loaded.created,
                report.loaded.updated,
                report.loaded.unchanged,
                report.batches
            );
        }
        Command::EnsureIndex => {
            let backoff = Backoff::new(config.backoff);
            let service = ElasticsearchService::new(&config.elasticsearch)?;
            let loader = IndexLoader::new(service, backoff);
            loader.ensure_index(&config.elasticsearch.index).await?;
            let count = loader.service().count(&config.elasticsearch.index).await?;
            println!("index '{}' ready ({count} documents)", config.elasticsearch.index);
        }
        Command::Migrate => {
            let pool = db::connect(config.require_database_url()?).await?;
            db::run_migrations(&pool).await?;
        }
        Command::State { action } => {
            let pool = match config.state_backend {
                CursorStoreKind::Postgres => {
                    Some(db::connect(config.require_database_url()?).await?)
                }
                _ => None,
            };
            let store = AnyCursorStore::from_config(&config, pool.as_ref())?;

            match action {
                StateAction::Show => {
                    for key in [CURRENT_TIME_KEY, LAST_EXTRACTED_KEY] {
                        let value = store.get(key).await?;
                        println!("{key}: {}", value.as_deref().unwrap_or("<unset>"));
                    }
                }
                StateAction::Reset => {
                    store.set(LAST_EXTRACTED_KEY, EPOCH).await?;
                    println!("{LAST_EXTRACTED_KEY} reset to {EPOCH}");
                }
            }
        }
    }

    Ok(())
}
