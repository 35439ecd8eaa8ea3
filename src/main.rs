mod args;

use anyhow::{Context, Result};
use args::{Args, Commands};
use chrono::Utc;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use sol_batch_transfer::config::{BatchConfig, LogFiles, SAMPLE_CONFIG};
use sol_batch_transfer::orchestrator::BatchOptions;
use sol_batch_transfer::report;
use sol_batch_transfer::solana::{SolanaRpc, token_mint};
use sol_batch_transfer::source::HttpFetcher;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

type BoxedLayer = Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync>;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let log_files = match args.command {
        Some(_) => LogFiles::default(),
        None => LogFiles::read(&args.config),
    };
    init_tracing(args.debug, &log_files)?;

    if let Some(Commands::GenerateConfig { output }) = &args.command {
        generate_config(output)?;
        return Ok(ExitCode::SUCCESS);
    }

    let fetcher = HttpFetcher::new(FETCH_TIMEOUT)?;
    let mut config = BatchConfig::load(&args.config, &fetcher)
        .await
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    info!(
        "Loaded {} transfers, {} keys, {} nodes, {} proxies",
        config.instructions.len(),
        config.keys.len(),
        config.nodes.len(),
        config.proxies.len()
    );

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config.to_json())?);
        return Ok(ExitCode::SUCCESS);
    }

    if let (Some(token), None) = (&config.token, config.token_decimals) {
        let route = config.routes()?.next_route();
        let decimals = SolanaRpc::new(None)
            .token_decimals(&token.pubkey(), &route)
            .await
            .with_context(|| format!("Failed to fetch decimals of token {token}"))?;
        info!("Token {token} has {decimals} decimals");
        config.set_token_decimals(decimals)?;
    }

    let mint = config.token.as_ref().zip(config.token_decimals);
    let rpc = SolanaRpc::new(mint.map(|(address, decimals)| token_mint(address, decimals)));

    if args.print_transfers {
        print!("{}", report::render_transfers(&config.instructions, &config.resolver()?));
        return Ok(ExitCode::SUCCESS);
    }

    if args.print_balances {
        let mut routes = config.routes()?;
        let table =
            report::render_balances(&config.instructions, &rpc, &mut routes, mint, config.round_ndigits).await;
        print!("{table}");
        return Ok(ExitCode::SUCCESS);
    }

    let options = BatchOptions {
        emulate: args.emulate,
        confirm: !args.no_confirmation,
        confirm_timeout: Duration::from_secs(args.confirm_timeout),
        round_ndigits: config.round_ndigits,
    };
    let ndigits = config.round_ndigits;
    let (orchestrator, instructions) = config.into_orchestrator(rpc, options)?;

    let progress = ProgressBar::new(instructions.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    let mut orchestrator = orchestrator.with_progress(progress);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, stopping after the current transfer...");
            shutdown.cancel();
        }
    });

    if args.emulate {
        info!("Emulation mode: nothing will be signed or sent");
    }
    info!("Batch started at {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
    let summary = orchestrator.run(&instructions, &cancel).await;
    info!("Batch finished at {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));

    println!("{}", report::render_summary(&summary, ndigits));

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Console logs at `info` by default, `debug` with `--debug`; `RUST_LOG` wins
/// over both. `log_debug`/`log_info` files get this crate's records at their level.
fn init_tracing(debug: bool, files: &LogFiles) -> Result<()> {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let mut layers: Vec<BoxedLayer> = vec![fmt::layer().with_target(false).with_filter(filter).boxed()];
    if let Some(path) = &files.log_debug {
        layers.push(file_layer(path, Level::DEBUG)?);
    }
    if let Some(path) = &files.log_info {
        layers.push(file_layer(path, Level::INFO)?);
    }
    tracing_subscriber::registry().with(layers).init();
    Ok(())
}

fn file_layer(path: &Path, level: Level) -> Result<BoxedLayer> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory {:?}", dir))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {:?}", path))?;
    Ok(fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(Targets::new().with_target("sol_batch_transfer", level))
        .boxed())
}

fn generate_config(output: &Path) -> Result<()> {
    std::fs::write(output, SAMPLE_CONFIG)
        .with_context(|| format!("Failed to create config file at {:?}", output))?;
    info!("Sample configuration file generated at {:?}", output);
    info!("Please edit the file with your actual configuration before running transfers.");
    Ok(())
}
