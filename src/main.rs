// src/main.rs
// debug-agent CLI: analyze a report, serve the HTTP API, or check config

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use debug_agent::config::{AppConfig, EnvOverrides};
use debug_agent::report::Severity;
use debug_agent::server::{self, AppState};
use debug_agent::{Analyzer, BugReport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "debug-agent")]
#[command(about = "Incident triage: classify, gather evidence, reason, and propose a fix")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.debug-agent/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one incident report
    Analyze {
        /// Report JSON file ("-" for stdin)
        #[arg(short, long, conflicts_with = "error")]
        input: Option<PathBuf>,

        /// Error message, when no report file is given
        #[arg(short, long)]
        error: Option<String>,

        #[arg(long)]
        stack: Option<String>,

        #[arg(long)]
        trace_id: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// P0..P3
        #[arg(long, default_value = "P2")]
        severity: String,

        #[arg(short, long, value_enum, default_value = "json")]
        format: OutputFormat,
    },

    /// Run the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate configuration and print the report
    CheckConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load(),
    };
    EnvOverrides::from_env().apply(&mut config);
    Ok(config)
}

fn log_level(cli: &Cli, config: &AppConfig) -> Level {
    if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::from_str(config.log_level.trim()).unwrap_or(Level::INFO)
    }
}

fn read_report(
    input: Option<PathBuf>,
    error: Option<String>,
    stack: Option<String>,
    trace_id: Option<String>,
    description: Option<String>,
    severity: &str,
) -> Result<BugReport> {
    if let Some(path) = input {
        let text = if path.as_os_str() == "-" {
            std::io::read_to_string(std::io::stdin()).context("reading report from stdin")?
        } else {
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?
        };
        return serde_json::from_str(&text).context("report is not valid BugReport JSON");
    }

    let Some(error) = error else {
        bail!("either --input or --error is required");
    };
    let severity = Severity::from_str(severity).map_err(|_| anyhow::anyhow!("unknown severity '{}'", severity))?;
    let mut report = BugReport::from_error(error).with_severity(severity);
    if let Some(stack) = stack {
        report = report.with_stack_trace(stack);
    }
    if let Some(trace_id) = trace_id {
        report = report.with_trace_id(trace_id);
    }
    if let Some(description) = description {
        report = report.with_description(description);
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".debug-agent/.env"));
    }
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    // stdout carries results, logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(&cli, &config))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Analyze {
            input,
            error,
            stack,
            trace_id,
            description,
            severity,
            format,
        } => {
            let report = read_report(input, error, stack, trace_id, description, &severity)?;
            let analyzer = Analyzer::from_config(&config)?;
            let result = analyzer.analyze(report).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                OutputFormat::Text => print!("{}", result.render_text()),
            }
            analyzer.shutdown().await;
        }
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("invalid listen address {}:{}", host, port))?;

            let analyzer = Arc::new(Analyzer::from_config(&config)?);
            info!(model = ?analyzer.info().model, sources = ?analyzer.info().sources, "Analyzer ready");
            let state = AppState::new(analyzer.clone(), config.server.history_capacity);
            server::run(state, addr).await?;

            if let Ok(analyzer) = Arc::try_unwrap(analyzer) {
                analyzer.shutdown().await;
            }
        }
        Commands::CheckConfig => {
            let validation = config.validate();
            println!("Config file: {}", cli.config.unwrap_or_else(AppConfig::config_path).display());
            println!("{}", validation.report());
            if !validation.is_valid() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
