//! catalog-extract CLI - catalog-driven relational extracts.

use std::path::PathBuf;
use std::process::ExitCode;

use catalog_extract::{
    Catalog, ExecutionEngine, ExtractError, JobConfig, LocalEngine, Orchestrator,
    RuntimeParameters, SinkKind,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "catalog-extract")]
#[command(about = "Copy catalog-defined extracts from a relational source into warehouse tables")]
#[command(version)]
struct Cli {
    /// Path to YAML job configuration file
    #[arg(short, long, default_value = "job.yaml")]
    config: PathBuf,

    /// Override the configured sink: memory or postgres
    #[arg(long, value_name = "SINK", value_parser = parse_sink)]
    sink: Option<SinkKind>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and catalog and show the stages, without connecting
    Plan,

    /// Run every catalog entry as a full refresh of its output table
    Run {
        /// Runtime parameter value (repeatable)
        #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Maximum stages running at once [default: all]
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Resolve the source configuration and open one connection
    CheckConnection {
        /// Runtime parameter value (repeatable)
        #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ExtractError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = JobConfig::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);
    if let Some(sink) = cli.sink {
        info!("Using the {} sink instead of the configured {}", sink, config.target.sink);
        config.target.sink = sink;
    }
    let catalog = Catalog::load(&config.catalog)?;
    info!(
        "Loaded catalog {:?} with {} entries",
        config.catalog,
        catalog.len()
    );

    let mut params = RuntimeParameters::new();
    let orchestrator = Orchestrator::from_config(&config, &mut params)?;

    match cli.command {
        Commands::Plan => {
            let graph = orchestrator.build(&catalog)?;
            let plan = graph.plan();
            let unbound = params.unbound();

            if cli.output_json {
                let output = serde_json::json!({
                    "config_fingerprint": config.fingerprint(),
                    "catalog_fingerprint": catalog.fingerprint(),
                    "sink": config.target.sink.to_string(),
                    "parameters": unbound,
                    "stages": plan,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("Plan: {} stages ({} sink)", plan.len(), config.target.sink);
                for stage in &plan {
                    println!("  {} -> {}", stage.name, stage.table);
                    println!("    query:  {}", stage.query);
                    println!("    fields: {}", stage.fields.join(", "));
                }
                if !unbound.is_empty() {
                    println!("  Runtime parameters: {}", unbound.join(", "));
                }
            }
        }

        Commands::Run {
            params: values,
            concurrency,
        } => {
            let graph = orchestrator.build(&catalog)?;
            bind_params(&params, values)?;

            let cancel_token = setup_signal_handler();
            let engine = LocalEngine::new()
                .with_max_concurrent(concurrency.or(config.execution.max_concurrent_stages));
            let report = engine.execute(graph, cancel_token).await?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                println!("\nExtract completed!");
                println!("  Run ID: {}", report.run_id);
                println!("  Duration: {:.2}s", report.duration_seconds());
                for stage in &report.stages {
                    println!(
                        "  {}: {} rows{}",
                        stage.table,
                        stage.rows_written,
                        if stage.created { " (created)" } else { "" }
                    );
                }
                println!("  Rows: {}", report.rows_total);
            }
        }

        Commands::CheckConnection { params: values } => {
            bind_params(&params, values)?;
            let started = std::time::Instant::now();
            orchestrator.check_connection().await?;
            let latency_ms = started.elapsed().as_millis() as u64;

            if cli.output_json {
                let output = serde_json::json!({ "source_connected": true, "latency_ms": latency_ms });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("Source connection: OK ({}ms)", latency_ms);
            }
        }
    }

    Ok(())
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

fn parse_sink(s: &str) -> Result<SinkKind, String> {
    s.parse().map_err(|e: ExtractError| e.to_string())
}

fn bind_params(params: &RuntimeParameters, values: Vec<(String, String)>) -> Result<(), ExtractError> {
    for (name, value) in values {
        params.bind(&name, value)?;
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the run on SIGINT (Ctrl-C) or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Cancelling run...", name);
                    token.cancel();
                });
            }
            Err(e) => eprintln!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Cancel the run on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Cancelling run...");
            token.cancel();
        }
    });

    cancel_token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("db_password=a=b").unwrap(),
            ("db_password".to_string(), "a=b".to_string())
        );
        assert!(parse_param("no_equals").is_err());
        assert!(parse_param("=value").is_err());
    }

    #[test]
    fn test_parse_sink() {
        assert_eq!(parse_sink("memory").unwrap(), SinkKind::Memory);
        assert_eq!(parse_sink("Postgres").unwrap(), SinkKind::Postgres);
        assert!(parse_sink("bigquery").unwrap_err().contains("bigquery"));
    }
}
