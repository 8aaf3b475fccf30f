use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use anywake::devices::{Clock, JsonFileStore};
use anywake::peer::LinkState;
use anywake::{Config, DeviceId, FieldValue, Node, Registry, WakeAddress, snapshot};

/// How long `wake` waits for a link to a wake-capable peer
const PEER_WAIT: Duration = Duration::from_secs(10);

/// anywake - Wake devices from any of your screens
#[derive(Parser)]
#[command(name = "anywake", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/anywake/config.toml)
    #[arg(short, long, env = "ANYWAKE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node in the foreground (default)
    Run,
    /// List known devices
    List,
    /// Add a device
    Add {
        /// Display name
        name: String,
        /// MAC address (aa:bb:cc:dd:ee:ff)
        mac: String,
        /// Broadcast address or hostname to send the packet to
        host: String,
        /// UDP port for the magic packet
        #[arg(short, long, default_value_t = anywake::devices::DEFAULT_WAKE_PORT)]
        port: u16,
    },
    /// Remove a device by ID or name
    Remove { device: String },
    /// Rename a device
    Rename { device: String, name: String },
    /// Pin a device to widgets and complications
    Pin { device: String },
    /// Unpin a device
    Unpin { device: String },
    /// Print the pinned-device snapshot as JSON
    Snapshot,
    /// Wake a device, through a peer if this host cannot
    Wake { device: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,anywake=info",
        1 => "info,anywake=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_node(&config).await,
        Command::List => cmd_list(&config),
        Command::Add {
            name,
            mac,
            host,
            port,
        } => cmd_add(&config, &name, &mac, &host, port),
        Command::Remove { device } => cmd_mutate(&config, &device, FieldValue::Removed),
        Command::Rename { device, name } => cmd_mutate(&config, &device, FieldValue::Name(name)),
        Command::Pin { device } => cmd_mutate(&config, &device, FieldValue::Pinned(true)),
        Command::Unpin { device } => cmd_mutate(&config, &device, FieldValue::Pinned(false)),
        Command::Snapshot => cmd_snapshot(&config),
        Command::Wake { device } => cmd_wake(&config, &device).await,
    }
}

async fn run_node(config: &Config) -> anyhow::Result<()> {
    tracing::info!(
        peer = %config.peer_id,
        data_dir = %config.data_dir.display(),
        wake_capable = config.wake_capable,
        "starting anywake node"
    );

    let (mut node, handle) = Node::from_config(config)?;
    node.start_transport(config.listen, &config.connect).await?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown().await;
        }
    });

    node.run().await;
    Ok(())
}

fn open_registry(config: &Config) -> anyhow::Result<Registry> {
    let store = JsonFileStore::new(config.registry_path());
    Registry::open(Box::new(store), Clock::system(config.peer_id.clone()))
        .with_context(|| format!("opening {}", config.registry_path().display()))
}

/// Match a device by exact ID, then by case-insensitive name
fn resolve_device(registry: &Registry, key: &str) -> anyhow::Result<DeviceId> {
    let id = DeviceId::from(key);
    if registry.get(&id).is_some() {
        return Ok(id);
    }

    let mut matches = registry
        .all()
        .into_iter()
        .filter(|d| d.name.eq_ignore_ascii_case(key));
    match (matches.next(), matches.next()) {
        (Some(device), None) => Ok(device.id.clone()),
        (Some(_), Some(_)) => anyhow::bail!("'{key}' matches several devices; use the ID"),
        (None, _) => anyhow::bail!("no device '{key}'"),
    }
}

fn cmd_list(config: &Config) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    if registry.is_empty() {
        println!("No devices");
        return Ok(());
    }
    for device in registry.all() {
        println!(
            "{}  {:<20} {}  {}:{}  {}{}",
            device.id,
            device.name,
            device.address.mac,
            device.address.host,
            device.address.port,
            device.status,
            if device.is_pinned { "  pinned" } else { "" },
        );
    }
    Ok(())
}

fn cmd_add(config: &Config, name: &str, mac: &str, host: &str, port: u16) -> anyhow::Result<()> {
    let mut registry = open_registry(config)?;
    let address = WakeAddress::new(mac, host, port)?;
    let (id, _) = registry.add(name, address)?;
    registry.flush()?;
    println!("{id}");
    Ok(())
}

fn cmd_mutate(config: &Config, key: &str, value: FieldValue) -> anyhow::Result<()> {
    let mut registry = open_registry(config)?;
    let id = resolve_device(&registry, key)?;
    let field = value.field();
    registry.mutate(&id, value)?;
    registry.flush()?;
    println!("{id}: {field} updated");
    Ok(())
}

fn cmd_snapshot(config: &Config) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    let entries: Vec<anywake::SnapshotEntry> = snapshot(&registry)
        .iter()
        .map(anywake::SnapshotEntry::from)
        .collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

async fn cmd_wake(config: &Config, key: &str) -> anyhow::Result<()> {
    let id = {
        let registry = open_registry(config)?;
        resolve_device(&registry, key)?
    };

    // A short-lived node: no listener, no status checks
    let mut config = config.clone();
    config.listen = None;
    config.status.interval = Duration::ZERO;

    let (mut node, handle) = Node::from_config(&config)?;
    node.start_transport(None, &config.connect).await?;
    let task = tokio::spawn(node.run());

    if !config.wake_capable {
        let deadline = tokio::time::Instant::now() + PEER_WAIT;
        loop {
            let peers = handle.peers().await?;
            if peers
                .iter()
                .any(|p| p.wake_capable && p.state == LinkState::Reachable)
            {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("no wake-capable peer connected");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let result = handle.request_wake(&id).await?;
    println!("{}: {}", result.outcome, result.outcome.hint());

    handle.shutdown().await;
    let _ = task.await;

    if result.outcome.is_success() {
        Ok(())
    } else {
        anyhow::bail!("wake {}", result.outcome)
    }
}
