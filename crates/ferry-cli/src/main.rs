//! Ferry CLI
//!
//! Circuit relay v2 tooling: identities, configuration and an in-process
//! relay walkthrough.

mod config;

use clap::{Parser, Subcommand};
use ferry_core::memory::{MemoryNetwork, MemoryTransport};
use ferry_core::{
    Connection, HandlerOptions, Host, HostEvent, Keypair, Multiaddr, Stream, StreamOptions,
};
use ferry_relay::{RelayClientConfig, RelayServer, RelayTransport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use config::Config;

const DEMO_PROTOCOL: &str = "/ferry/echo/1.0.0";

/// Ferry - reach peers behind NATs through circuit relays
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity keypair
    Keygen {
        /// Output file for the hex-encoded seed
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run a relay, a reserving peer and a dialer in-process and echo data
    /// across the circuit
    Demo {
        /// Bytes to send through the circuit
        #[arg(short, long, default_value_t = 64 * 1024)]
        bytes: usize,

        /// Seconds to wait for the echo before giving up
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Check the configuration file
    Validate,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    match cli.command {
        Commands::Keygen { output } => generate_keypair(output)?,
        Commands::Config { action } => run_config(action, &config_path, &config)?,
        Commands::Demo { bytes, timeout } => {
            config.validate()?;
            run_demo(bytes, Duration::from_secs(timeout), &config).await?;
        }
    }

    Ok(())
}

/// Generate a new identity keypair
fn generate_keypair(output: Option<PathBuf>) -> anyhow::Result<()> {
    let keypair = Keypair::generate();
    println!("Peer ID: {}", keypair.peer_id());
    println!("Public key: {}", hex::encode(keypair.public_key()));

    match output {
        Some(path) => {
            config::write_keypair(&keypair, &path)?;
            println!("Seed saved to: {}", path.display());
            println!("Set node.key_file to this path to use the identity.");
        }
        None => println!("Seed not saved (use --output to save)"),
    }
    Ok(())
}

fn run_config(action: ConfigAction, path: &Path, config: &Config) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show { json: true } => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigAction::Show { json: false } => {
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Validate => {
            config.validate()?;
            println!("{} is valid", path.display());
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            Config::default().save(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

/// Relay a payload from a dialer to a reserved peer and back
async fn run_demo(bytes: usize, timeout: Duration, config: &Config) -> anyhow::Result<()> {
    let network = MemoryNetwork::new();

    let relay = Host::builder()
        .transport(Arc::new(MemoryTransport::new(network.clone())))
        .build();
    relay.start().await?;
    relay.listen(&["/memory/0".parse()?]).await?;
    let server = RelayServer::new(config.relay.clone())?;
    server.start(&relay).await;
    let relay_addr = relay
        .addresses()
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("relay has no listen address"))?;
    println!("Relay:    {} at {}", relay.peer_id().short(), relay_addr);

    let client = RelayClientConfig {
        discover_relays: config.client.discover_relays.max(1),
        ..config.client.clone()
    };
    let listener = peer(&network, client, config.keypair()?, config.node.identify_transient)?;
    listener.start().await?;
    listener.handle(
        DEMO_PROTOCOL,
        Arc::new(|stream: Stream, _connection: Connection| async move {
            let (mut reader, mut writer) = tokio::io::split(stream);
            if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                tracing::debug!("Echo stream ended: {}", e);
            }
        }),
        HandlerOptions::transient(),
    );

    let mut events = listener.subscribe();
    listener.dial(&relay_addr).await?;
    let circuit = tokio::time::timeout(timeout, wait_for_circuit(&mut events))
        .await
        .map_err(|_| anyhow::anyhow!("no reservation within {:?}", timeout))??;
    println!("Listener: {} reachable at {}", listener.peer_id().short(), circuit);

    let dialer = peer(
        &network,
        RelayClientConfig::default(),
        Keypair::generate(),
        config.node.identify_transient,
    )?;
    dialer.start().await?;
    let connection = dialer.dial(&circuit).await?;
    if let Some(limits) = connection.limits() {
        println!(
            "Circuit limits: data={:?} duration={:?}",
            limits.data, limits.duration
        );
    }

    let stream = connection
        .new_stream(DEMO_PROTOCOL, StreamOptions::transient())
        .await?;
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, echo_roundtrip(stream, bytes)).await;

    match result {
        Ok(Ok(())) => println!(
            "Echoed {} bytes through the relay in {:?}",
            bytes,
            started.elapsed()
        ),
        Ok(Err(e)) => println!("Circuit closed before the echo completed: {e}"),
        Err(_) => println!("Echo timed out after {timeout:?}"),
    }

    let metrics = server.metrics();
    println!();
    println!("Relay metrics:");
    println!("  Reservations accepted: {}", metrics.reservations_accepted);
    println!("  Circuits opened:       {}", metrics.circuits_opened);
    println!("  Circuits failed:       {}", metrics.circuits_failed);
    println!("  Data limit closures:   {}", metrics.data_limit_closures);
    println!("  Bytes forwarded:       {}", metrics.bytes_forwarded);

    dialer.stop().await;
    listener.stop().await;
    server.stop(&relay).await;
    relay.stop().await;
    Ok(())
}

fn peer(
    network: &MemoryNetwork,
    client: RelayClientConfig,
    keypair: Keypair,
    identify_transient: bool,
) -> anyhow::Result<Host> {
    let transport = RelayTransport::new(client)?;
    Ok(Host::builder()
        .keypair(keypair)
        .transport(Arc::new(MemoryTransport::new(network.clone())))
        .transport(Arc::new(transport))
        .identify_transient(identify_transient)
        .build())
}

async fn wait_for_circuit(
    events: &mut tokio::sync::broadcast::Receiver<HostEvent>,
) -> anyhow::Result<Multiaddr> {
    loop {
        if let HostEvent::SelfAddressesChanged(addrs) = events.recv().await? {
            if let Some(addr) = addrs.into_iter().find(Multiaddr::is_circuit) {
                return Ok(addr);
            }
        }
    }
}

async fn echo_roundtrip(stream: Stream, bytes: usize) -> anyhow::Result<()> {
    let payload: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
    let (mut reader, mut writer) = tokio::io::split(stream);

    let expected = payload.clone();
    let send = async move {
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok::<_, std::io::Error>(writer)
    };
    let receive = async move {
        let mut echoed = vec![0u8; expected.len()];
        reader.read_exact(&mut echoed).await?;
        Ok::<_, std::io::Error>(echoed == expected)
    };

    let (_writer, matched) = tokio::try_join!(send, receive)?;
    if !matched {
        anyhow::bail!("echoed data differs from what was sent");
    }
    Ok(())
}
