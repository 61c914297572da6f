// bluest: BlueST host command line
//
// Decode advertisements, scan for boards and stream feature samples through the host
// Bluetooth adapter.

mod ble;
mod config;

use anyhow::{Context, Result};
use bluestsdk_core::{
    parse, DeviceRegistry, DiscoveryListener, Feature, FeatureListener, FeatureRegistry,
    NodeSession, NodeState, NodeStateListener, Sample,
};
use chrono::Local;
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bluest")]
#[command(about = "BlueST: host tools for BlueST BLE boards", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a raw advertisement given as hex
    Parse { hex: String },
    /// Scan for BlueST boards
    Scan {
        /// Seconds to scan (0 until interrupted); defaults to the configured value
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Connect to a board and print feature samples
    Monitor {
        address: String,
        /// Only stream these features (by name)
        #[arg(short, long)]
        feature: Vec<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _guard = init_logging(cli.verbose, config.log_dir.as_deref());

    match cli.command {
        Commands::Parse { hex } => cmd_parse(&hex),
        Commands::Scan { timeout } => cmd_scan(&config, timeout).await,
        Commands::Monitor { address, feature } => cmd_monitor(&config, &address, &feature).await,
        Commands::Config { action } => cmd_config(config, action),
    }
}

fn init_logging(verbose: bool, log_dir: Option<&str>) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "bluest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn cmd_parse(input: &str) -> Result<()> {
    let bytes = hex::decode(input.trim().trim_start_matches("0x"))
        .context("Advertisement must be hex encoded")?;
    let descriptor = parse(&bytes).context("Not a BlueST advertisement")?;

    println!("{}", "BlueST Advertisement".bold());
    println!(
        "  Name:        {}",
        descriptor.name.as_deref().unwrap_or("(none)").bright_cyan()
    );
    println!("  Board:       {}", descriptor.board_type);
    println!("  Device id:   {:#04x}", descriptor.device_type_id);
    println!("  Protocol:    v{}", descriptor.protocol_version);
    println!("  Tx power:    {} dBm", descriptor.tx_power);
    println!("  Sleeping:    {}", descriptor.is_sleeping);
    if let Some(address) = &descriptor.address {
        println!("  Address:     {}", address.bright_yellow());
    }
    println!("  Feature mask {:#010x}", descriptor.feature_mask);

    let features = FeatureRegistry::with_default_boards().build_for_device(&descriptor);
    if features.is_empty() {
        println!("  {}", "(no known features)".dimmed());
    }
    for feature in features {
        println!("  {} {:#010x} {}", "•".green(), feature.mask(), feature.name());
    }
    Ok(())
}

struct ScanPrinter;

impl DiscoveryListener for ScanPrinter {
    fn on_discovery_change(&self, _registry: &DeviceRegistry, enabled: bool) {
        let status = if enabled { "started" } else { "stopped" };
        println!("{} Discovery {}", "•".dimmed(), status);
    }

    fn on_node_discovered(&self, _registry: &DeviceRegistry, node: &NodeSession) {
        println!(
            "{} {} {} rssi {} ({} features)",
            "✓".green(),
            node.tag().bright_yellow(),
            node.name().unwrap_or("unnamed").bright_cyan(),
            node.last_rssi().unwrap_or_default(),
            node.features().len()
        );
    }
}

async fn open_registry(config: &config::Config) -> Result<DeviceRegistry> {
    let central = Arc::new(ble::BleCentral::open(config.adapter_index).await?);
    Ok(DeviceRegistry::new(
        central.clone(),
        central,
        Arc::new(FeatureRegistry::with_default_boards()),
        config.sdk.clone(),
    ))
}

async fn cmd_scan(config: &config::Config, timeout: Option<u64>) -> Result<()> {
    let registry = open_registry(config).await?;
    let printer: Arc<dyn DiscoveryListener> = Arc::new(ScanPrinter);
    registry.add_listener(&printer);

    let seconds = timeout.unwrap_or(config.scan_timeout);
    let timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
    println!("{}", "Scanning for BlueST boards...".bold());
    registry.start_discovery(timeout);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                registry.stop_discovery();
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if !registry.is_discovering() {
                    break;
                }
            }
        }
    }

    println!();
    println!("{} ({} boards)", "Scan complete".bold(), registry.nodes().len());
    Ok(())
}

struct SamplePrinter;

impl FeatureListener for SamplePrinter {
    fn on_update(&self, feature: &Feature, sample: &Sample) {
        let values: Vec<String> = feature
            .fields()
            .iter()
            .zip(sample.values.iter())
            .map(|(field, value)| format!("{}={}{}", field.name, value, field.unit))
            .collect();
        println!(
            "{} [{:>6}] {:<24} {}",
            Local::now().format("%H:%M:%S%.3f").to_string().dimmed(),
            sample.timestamp,
            feature.name().bright_cyan(),
            values.join(" ")
        );
    }
}

struct StatePrinter;

impl NodeStateListener for StatePrinter {
    fn on_state_change(&self, node: &NodeSession, new_state: NodeState, old_state: NodeState) {
        println!(
            "{} {}: {} → {}",
            "•".dimmed(),
            node.tag(),
            old_state,
            new_state.to_string().bold()
        );
    }
}

async fn cmd_monitor(config: &config::Config, address: &str, only: &[String]) -> Result<()> {
    let registry = open_registry(config).await?;
    println!("Looking for {}...", address.bright_yellow());
    registry.start_discovery(config.sdk.discovery_timeout());

    let node = loop {
        if let Some(node) = registry.node_with_tag(address) {
            break node;
        }
        if !registry.is_discovering() {
            anyhow::bail!("{} was not seen during discovery", address);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    registry.stop_discovery();

    let states: Arc<dyn NodeStateListener> = Arc::new(StatePrinter);
    node.add_state_listener(&states);
    let mut state = node.subscribe_state();
    if !node.connect() {
        anyhow::bail!("{} refused to connect from state {}", address, node.state());
    }
    let reached = state
        .wait_for(|s| matches!(s, NodeState::Connected | NodeState::Dead | NodeState::Unreachable))
        .await
        .map(|s| *s)
        .context("Session closed while connecting")?;
    if reached != NodeState::Connected {
        anyhow::bail!("Connection to {} ended in {}", address, reached);
    }

    let printer: Arc<dyn FeatureListener> = Arc::new(SamplePrinter);
    let mut streaming = 0;
    for feature in node.features().iter().filter(|f| f.is_enabled()) {
        if !only.is_empty() && !only.iter().any(|name| name == feature.name()) {
            continue;
        }
        feature.add_listener(&printer);
        if node.enable_notification(feature) {
            streaming += 1;
        }
    }
    println!(
        "{} Connected to {}, streaming {} features (Ctrl+C to stop)",
        "✓".green(),
        node,
        streaming
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = state.wait_for(|s| *s != NodeState::Connected) => {}
    }
    if node.disconnect() {
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| !s.is_linked()),
        )
        .await;
    }
    println!("{} Disconnected", "✓".green());
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
            println!();
            println!("Config file: {}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
