//! Roundhouse CLI
//!
//! `serve` runs the scheduler and the API against an in-process ledger;
//! `simulate` and `verify` work offline on seeds.

use clap::{Parser, Subcommand};
use roundhouse::{
    api::{server::shutdown_signal, ApiServer},
    config::{generate_sample_config, ConfigLoader, EngineConfig},
    games::{GameKind, SeedCommitment, SeedReveal},
    ledger::{InMemoryLedger, LedgerAdapter},
    replay::{self, SimulationConfig},
    RoundEngine, Scheduler, SystemClock,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Roundhouse round engine
#[derive(Parser)]
#[command(name = "roundhouse")]
#[command(about = "Provably fair round engine for crash, coin flip and jackpot games")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the HTTP/WebSocket API
    Serve {
        /// Override api.host
        #[arg(long)]
        host: Option<String>,

        /// Override api.port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Play rounds offline and print outcome statistics
    Simulate {
        /// crash, flip or pool
        #[arg(short, long)]
        game: GameKind,

        #[arg(short, long, default_value = "1000")]
        rounds: u64,

        /// Passphrase for the deterministic seed source
        #[arg(short, long, default_value = "simulation")]
        seed: String,

        /// Bettors per round
        #[arg(long, default_value = "4")]
        participants: usize,
    },

    /// Verify a revealed seed against its commitment and re-derive the round
    Verify {
        /// Commitment JSON, or a path to a file containing it
        #[arg(long)]
        commitment: String,

        /// Reveal JSON, or a path to a file containing it
        #[arg(long)]
        reveal: String,

        /// Bets in round order as name=amount[@heads|@tails|@target]
        #[arg(long = "participant")]
        participants: Vec<String>,
    },

    /// Write a sample configuration file
    Config {
        #[arg(short, long, default_value = "roundhouse.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            serve(config).await
        }
        Commands::Simulate {
            game,
            rounds,
            seed,
            participants,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let report = replay::simulate(&SimulationConfig {
                kind: game,
                rounds,
                seed,
                participants: participants.max(1),
                rules: config.rules(game),
                round_duration_ms: config.games.get(game).round_duration_secs * 1_000,
            })?;
            report.print();
            Ok(())
        }
        Commands::Verify {
            commitment,
            reveal,
            participants,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let commitment: SeedCommitment = serde_json::from_str(&read_json_arg(&commitment)?)?;
            let reveal: SeedReveal = serde_json::from_str(&read_json_arg(&reveal)?)?;
            let bets = participants
                .iter()
                .enumerate()
                .map(|(i, raw)| replay::parse_bet(i as u32, raw))
                .collect::<Result<Vec<_>, _>>()?;

            let report = replay::audit(&commitment, &reveal, &bets, &config.rules(commitment.kind))?;
            println!("✅ Seed verified for {}#{}", report.kind, report.round_id);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Config { output } => {
            generate_sample_config(&output.to_string_lossy())?;
            println!("✅ Sample configuration written to {}", output.display());
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "roundhouse=debug,tower_http=debug"
    } else {
        "roundhouse=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

fn load_config(path: Option<&Path>) -> CliResult<EngineConfig> {
    let loader = match path {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };
    Ok(loader.load()?)
}

/// Inline JSON is used as is; anything else is read as a file path
fn read_json_arg(raw: &str) -> CliResult<String> {
    if raw.trim_start().starts_with('{') {
        return Ok(raw.to_string());
    }
    Ok(std::fs::read_to_string(raw)?)
}

async fn serve(config: EngineConfig) -> CliResult<()> {
    let ledger = Arc::new(InMemoryLedger::default());
    for kind in GameKind::ALL {
        ledger.set_config(kind, config.ledger_config_account(kind)).await;
    }
    let adapter = LedgerAdapter::new(ledger, config.engine.program_id.clone(), config.retry_policy());

    let engine = Arc::new(RoundEngine::new(
        Arc::new(adapter),
        config.seed_source()?,
        Arc::new(SystemClock),
        config.engine_settings(),
    ));
    info!(
        games = ?engine.settings().enabled_games(),
        seed_source = ?config.engine.seed_source,
        "round engine ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(engine.clone(), config.tick_interval()).spawn(shutdown_rx);

    if config.api.enabled {
        ApiServer::new(config.api.clone(), engine.clone())
            .run(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    let _ = shutdown_tx.send(true);
    scheduler.await?;
    info!("roundhouse stopped");
    Ok(())
}
