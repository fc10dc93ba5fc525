use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info, info_span};

use uppe_ingest::broker::ZmqSource;
use uppe_ingest::config::{Config, ExecutionMode, Namespace};
use uppe_ingest::database::fixtures::reference_targets;
use uppe_ingest::database::{Outcome, Storage, open_pool};
use uppe_ingest::pipeline::IngestionPipeline;

#[derive(Parser, Debug)]
#[command(author, version, about = "Measurement ingestion for the uppe monitor", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the testing namespace
    #[arg(long, global = true)]
    testing: bool,

    /// Print schema and seed statements instead of executing them
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the target and measurement tables
    Provision,
    /// Drop the measurement and target tables
    Teardown,
    /// Insert the reference targets
    Seed,
    /// List enabled targets
    Targets,
    /// Drain measurement events from ZeroMQ into the database
    Ingest,
    /// Print the effective configuration
    Config,
}

fn report(operation: &str, outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Planned(statements) => {
            for statement in statements {
                println!("{statement};");
            }
            Ok(())
        }
        Outcome::Applied => {
            info!("{} applied", operation);
            Ok(())
        }
        Outcome::Failed(kind) => bail!("{operation} failed: {kind}"),
    }
}

async fn ingest(config: &Config, storage: &Storage) -> Result<()> {
    let context = zmq::Context::new();
    let source = ZmqSource::bind(&context, &config.zeromq.endpoint())
        .with_context(|| format!("failed to bind {}", config.zeromq.endpoint()))?;
    let span = info_span!("pipeline", endpoint = %config.zeromq.endpoint());
    let mut pipeline = IngestionPipeline::new(source, storage.measurements(), config.pipeline.clone(), span);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    let stats = pipeline.run(shutdown_rx).await?;
    info!(?stats, "Ingestion finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_config(args.config.as_ref())?;
    if args.testing {
        config.mode.namespace = Namespace::Testing;
    }
    if args.dry_run {
        config.mode.execution = ExecutionMode::DryRun;
    }

    logger::init(&config.logging);

    if let Command::Config = args.command {
        println!("{config}");
        return Ok(());
    }

    let pool = open_pool(&config.database).await?;
    let storage = Storage::from_pool(pool, &config.mode);

    let result = match args.command {
        Command::Provision => report("provision", storage.schema().provision().await),
        Command::Teardown => report("teardown", storage.schema().teardown().await),
        Command::Seed => report("seed", storage.registry().seed(&reference_targets(&config.seed.base_url)).await),
        Command::Targets => {
            let mut targets: Vec<_> = storage.registry().list_enabled().await.into_values().collect();
            targets.sort_by_key(|t| t.url_id);
            for target in targets {
                println!(
                    "{}\t{}s\t{}\t{}",
                    target.url_id,
                    target.sample_frequency_s,
                    target.url_path,
                    target.regex_pattern.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::Ingest => ingest(&config, &storage).await,
        Command::Config => Ok(()),
    };

    if let Err(err) = &result {
        error!("{:#}", err);
    }
    result
}
