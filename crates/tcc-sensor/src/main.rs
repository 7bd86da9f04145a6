//! TCC Sensor - agent run batching and local observability
//!
//! Correlates AI SDK spans into runs, exports each run as one batch and
//! serves the reconciled run store to local observers.

mod pipeline;
mod sinks;

use clap::{Parser, Subcommand};
use pipeline::Pipeline;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;
use tcc_core::config::{ConfigLoader, TccConfig};
use tcc_core::generator::{SpanGenerator, SpanGeneratorConfig};
use tcc_core::span::SpanEvent;
use tcc_core::sync::StoreMirror;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tcc-sensor")]
#[command(author = "The Context Company")]
#[command(version)]
#[command(about = "Agent run span batching and local observability", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "TCC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run demo mode with generated agent runs
    Demo {
        /// Output file for JSONL batches
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Serve the local store over WebSocket
        #[arg(long, default_value = "true")]
        web: bool,

        /// Local transport port (defaults to the first free preferred port)
        #[arg(long)]
        port: Option<u16>,

        /// Run generation interval in milliseconds
        #[arg(long, default_value = "2000")]
        interval: u64,

        /// Number of runs to generate (0 = infinite)
        #[arg(long, default_value = "0")]
        count: u64,

        /// Every n-th run fails (0 = never)
        #[arg(long, default_value = "3")]
        fail_every: u64,
    },

    /// Feed recorded span events (JSONL) through the pipeline
    Replay {
        /// Input file, one span start/end event per line
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for JSONL batches
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep serving the local store after the replay
        #[arg(long)]
        web: bool,

        /// Local transport port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Mirror a running sensor's store and print updates
    Watch {
        /// WebSocket URL of the sensor
        #[arg(long, default_value = "ws://127.0.0.1:8081/ws")]
        url: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let tcc_config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match tcc_config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Demo {
            output,
            web,
            port,
            interval,
            count,
            fail_every,
        } => {
            demo_command(
                &tcc_config,
                DemoConfig {
                    output,
                    web,
                    port,
                    interval_ms: interval,
                    run_count: count,
                    fail_every,
                },
            )
            .await
        }
        Commands::Replay {
            input,
            output,
            web,
            port,
        } => replay_command(&tcc_config, &input, output, web, port).await,
        Commands::Watch { url } => watch_command(&url).await,
        Commands::Config => config_command(&tcc_config),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> TccConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not set up yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            TccConfig::default()
        }
    }
}

/// Serve the pipeline's local store if it has one; returns the bound port
async fn start_web(
    config: &TccConfig,
    pipeline: &Pipeline,
    port: Option<u16>,
) -> anyhow::Result<Option<u16>> {
    let Some(local) = pipeline.local() else {
        warn!("Local export disabled, not starting the web transport");
        return Ok(None);
    };

    let mut web_config = tcc_web::WebConfig::from(&config.web);
    if port.is_some() {
        web_config.port = port;
    }

    let listener = tcc_web::bind_listener(&web_config).await?;
    let bound = listener.local_addr()?.port();

    tokio::spawn(async move {
        if let Err(e) = tcc_web::serve(listener, local).await {
            error!("Web server error: {}", e);
        }
    });

    Ok(Some(bound))
}

struct DemoConfig {
    output: Option<PathBuf>,
    web: bool,
    port: Option<u16>,
    interval_ms: u64,
    run_count: u64,
    fail_every: u64,
}

/// Demo mode - generates fake agent runs to exercise the pipeline and observers
async fn demo_command(tcc_config: &TccConfig, config: DemoConfig) -> anyhow::Result<()> {
    println!();
    println!("  TCC Sensor v{} - DEMO MODE", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  Generating an agent run every {}ms", config.interval_ms);
    if config.run_count > 0 {
        println!("  Will generate {} runs total", config.run_count);
    } else {
        println!("  Generating runs indefinitely");
    }

    let pipeline = Pipeline::from_config(tcc_config, config.output.clone())?;
    if let Some(output) = &config.output {
        println!("  Output: {}", output.display());
    }
    if !pipeline.sink_names().is_empty() {
        println!("  Batch sinks: {}", pipeline.sink_names().join(", "));
    }

    let serving = if config.web && tcc_config.web.enabled {
        start_web(tcc_config, &pipeline, config.port).await?
    } else {
        None
    };
    if let Some(port) = serving {
        println!("  WebSocket: ws://127.0.0.1:{}/ws", port);
    }

    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    info!("Starting TCC Sensor in demo mode...");

    let generator = SpanGenerator::with_config(SpanGeneratorConfig {
        fail_every: config.fail_every,
        ..Default::default()
    });
    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if config.run_count > 0 && generator.runs_generated() >= config.run_count {
                    if serving.is_none() {
                        break;
                    }
                    continue;
                }
                for event in generator.generate_run() {
                    pipeline.handle(event);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    pipeline.shutdown().await?;
    info!("Demo stopped");

    Ok(())
}

async fn replay_command(
    tcc_config: &TccConfig,
    input: &PathBuf,
    output: Option<PathBuf>,
    web: bool,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(tcc_config, output)?;
    let serving = if web {
        start_web(tcc_config, &pipeline, port).await?
    } else {
        None
    };

    let reader = BufReader::new(std::fs::File::open(input)?);
    let mut replayed = 0u64;
    let mut skipped = 0u64;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<SpanEvent>(&line) {
            Ok(event) => {
                pipeline.handle(event);
                replayed += 1;
            }
            Err(e) => {
                warn!("Skipping line {}: {}", index + 1, e);
                skipped += 1;
            }
        }
    }

    println!("Replayed {} span events ({} skipped)", replayed, skipped);
    if pipeline.in_flight() > 0 {
        println!("{} spans never ended", pipeline.in_flight());
    }

    if let Some(port) = serving {
        println!("Serving the store at ws://127.0.0.1:{}/ws, press Ctrl+C to stop", port);
        tokio::signal::ctrl_c().await?;
    }

    // Shutdown clears the local store
    if let Some(local) = pipeline.local() {
        let store = local.snapshot();
        println!(
            "Local store: {} runs, {} failures",
            store.runs().len(),
            store.failures().len()
        );
    }
    pipeline.shutdown().await?;

    let stats = pipeline.stats();
    println!(
        "Exported {} batches ({} spans, {} dropped)",
        stats.batches_exported, stats.spans_batched, stats.spans_dropped
    );

    Ok(())
}

async fn watch_command(url: &str) -> anyhow::Result<()> {
    let watching = tcc_web::watch(url, |mirror: &StoreMirror| {
        print_summary(mirror);
        ControlFlow::Continue(())
    });

    tokio::select! {
        result = watching => {
            result?;
            println!("Connection closed");
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    Ok(())
}

fn print_summary(mirror: &StoreMirror) {
    let store = mirror.store();
    let runs = store.runs();
    let failures = store.failures();

    println!(
        "{} runs, {} tool calls, {} failures",
        runs.len(),
        store.tool_calls().len(),
        failures.len()
    );
    if let Some(latest) = runs.first() {
        let status = if latest.span.is_error() { "failed" } else { "ok" };
        println!(
            "  latest: {} [{}] {:.1}ms \"{}\"",
            latest.span.trace_id,
            status,
            latest.span.duration_ns as f64 / 1_000_000.0,
            latest.prompt
        );
    }
}

fn config_command(config: &TccConfig) -> anyhow::Result<()> {
    if let Some(path) = ConfigLoader::default_config_path() {
        println!("# Default config path: {}", path.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
