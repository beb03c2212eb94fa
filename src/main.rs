//! CLI entry point for beacon discovery.
//!
//! This binary runs in-process discovery simulations, checks rule programs
//! and manages configuration files.

use anyhow::Result;
use beacon_discovery::{
    app::NodeReport,
    build_topology,
    utils::{DiscoveryConfig, DEFAULT_CONFIG_FILE},
    App, NodeId, ScheduledStop, SimulationReport,
};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use tokio::signal;

/// Beacon Discovery - one-hop neighbor discovery simulator
#[derive(Parser)]
#[command(name = "beacon-discovery")]
#[command(about = "Simulate one-hop neighbor discovery driven by a declarative rule program")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process simulation and print every node's link table
    Simulate {
        /// Comma-separated node ids
        #[arg(short, long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
        /// Symmetric range edge, written A-B (repeatable)
        #[arg(short, long)]
        link: Vec<String>,
        /// Simulated time in time units
        #[arg(short, long, default_value = "20")]
        duration: u64,
        /// Stop a node at a time, written B@6 (repeatable)
        #[arg(short, long)]
        stop: Vec<String>,
        /// Output format (pretty, json)
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
    /// Parse and compile a rule program
    Check {
        /// Program file; the built-in program when omitted
        file: Option<PathBuf>,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet)?;

    // Load configuration
    let config = DiscoveryConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            nodes,
            link,
            duration,
            stop,
            format,
        } => handle_simulate_command(nodes, link, duration, stop, format, config).await,
        Commands::Check { file } => handle_check_command(file, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    Ok(())
}

async fn handle_simulate_command(
    nodes: Vec<String>,
    links: Vec<String>,
    duration: u64,
    stops: Vec<String>,
    format: String,
    config: DiscoveryConfig,
) -> Result<()> {
    if format != "pretty" && format != "json" {
        return Err(anyhow::anyhow!("Unsupported format: {}", format));
    }

    let nodes: Vec<NodeId> = nodes
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(NodeId::new)
        .collect();
    let stops = stops
        .iter()
        .map(|stop| stop.parse::<ScheduledStop>())
        .collect::<Result<Vec<_>, _>>()?;
    let topology = build_topology(&nodes, &links)?;

    info!(
        "Simulating {} nodes for {} time units of {} ms",
        nodes.len(),
        duration,
        config.runtime.time_unit_ms
    );

    let mut app = App::new(config, topology)?;
    info!(
        "Running {} rules with {} periodic sources",
        app.program().rules().len(),
        app.program().timers().len()
    );
    for node in nodes {
        app.start_node(node)?;
    }

    tokio::select! {
        result = app.run_until(duration, &stops) => result?,
        result = signal::ctrl_c() => {
            result?;
            info!("Interrupted, reporting current state");
        }
    }

    let report = app.report().await?;
    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_report(&report),
    }

    app.shutdown().await?;
    Ok(())
}

fn print_report(report: &SimulationReport) {
    let title = format!("Link tables at t={:.3}", report.at);
    println!("{title}");
    println!("{}", "=".repeat(title.len()));
    for node in &report.nodes {
        print_node(node);
    }
    let transport = &report.transport;
    println!(
        "Transport: {} sent, {} delivered, {} dropped, {} duplicated",
        transport.sent, transport.delivered, transport.dropped, transport.duplicated
    );
}

fn print_node(node: &NodeReport) {
    let state = if node.running { "running" } else { "stopped" };
    println!("Node {} ({})", node.node, state);
    if node.links.is_empty() {
        println!("  no links");
    }
    for link in &node.links {
        println!("  {link}");
    }
    println!(
        "  {} facts sent, {} rows learned, {} expired",
        node.stats.sent, node.stats.inserted, node.stats.expired
    );
}

fn handle_check_command(file: Option<PathBuf>, config: &DiscoveryConfig) -> Result<()> {
    let mut protocol = config.protocol.clone();
    if file.is_some() {
        protocol.program = file;
    }
    let program = App::load_program(&protocol).map_err(|e| {
        if e.is_load_error() {
            anyhow::anyhow!("✗ Program is invalid: {}", e)
        } else {
            e.into()
        }
    })?;

    println!("✓ Program is valid");
    println!("Rules:");
    for rule in program.rules() {
        println!("  {rule}");
    }
    println!("Periodic sources:");
    for timer in program.timers() {
        println!(
            "  every {} units after {}, jitter < {}, {}",
            timer.period,
            timer.initial_delay,
            timer.jitter,
            if timer.repeat == 0 {
                "forever".to_string()
            } else {
                format!("{} times", timer.repeat)
            }
        );
    }
    println!("Materialized relations:");
    for table in program.tables() {
        let limit = |value: Option<String>| value.unwrap_or_else(|| "infinity".to_string());
        println!(
            "  {} ttl={} size={} keys={:?}",
            table.name,
            limit(table.ttl.map(|ttl| ttl.to_string())),
            limit(table.max_size.map(|size| size.to_string())),
            table.keys
        );
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &DiscoveryConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = DiscoveryConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                DiscoveryConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let config_str = config.to_toml_string()?;

            if let Some(section_name) = section {
                let table: toml::Table = toml::from_str(&config_str)?;
                let section = table
                    .get(&section_name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown section: {}", section_name))?;
                println!("[{section_name}]");
                println!("{}", toml::to_string_pretty(section)?);
            } else {
                println!("{config_str}");
            }
        }
    }
    Ok(())
}
