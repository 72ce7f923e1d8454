use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use brewcast_core::config::Config;
use brewcast_core::core_signal::{self, SignalKind, SignalRecord};
use brewcast_core::core_store::{MemoryStore, StoreHandle, UserProfile};
use brewcast_core::core_transport::BroadcastBus;
use brewcast_core::core_wire::{DeviceId, Role};
use brewcast_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use brewcast_core::Session;

#[derive(Parser, Debug)]
#[command(name = "brewcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run three local sessions through one order lifecycle
    Demo,

    /// Encode a connection offer token for out-of-band exchange
    Offer {
        /// Address the offering side listens on
        #[arg(long)]
        sdp: String,

        /// Device id to embed
        #[arg(long)]
        peer_id: String,
    },

    /// Decode a signaling token and print its contents
    Inspect {
        /// The token to decode
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = LogLevel::from_str(&args.log_level).unwrap_or_else(|| {
        eprintln!("Invalid log level '{}', using 'info'", args.log_level);
        LogLevel::Info
    });
    let log_config = LogConfig::new(log_level).json_format(args.json_logs);
    init_logging_with_config(log_config)?;

    let config = Config::from_env()?;

    match args.command {
        Some(Command::Demo) => run_demo(config).await?,
        Some(Command::Offer { sdp, peer_id }) => {
            let token = core_signal::encode(&SignalRecord {
                kind: SignalKind::Offer,
                sdp,
                peer_id: DeviceId(peer_id),
                secret: config.mesh.shared_secret.clone(),
            });
            println!("{}", token);
        }
        Some(Command::Inspect { token }) => {
            let record = match core_signal::decode(&token, &config.mesh.shared_secret) {
                Ok(record) => record,
                Err(e) => bail!("token rejected: {}", e),
            };
            println!(
                "{}",
                serde_json::json!({
                    "kind": match record.kind {
                        SignalKind::Offer => "offer",
                        SignalKind::Answer => "answer",
                    },
                    "sdp": record.sdp,
                    "peer_id": record.peer_id.as_str(),
                })
            );
        }
        None => {
            info!("No command specified. Use --help for usage information.");
        }
    }

    Ok(())
}

/// Three sessions on one bus: cashier takes an order, barista completes
/// it, manager reads the converged stats.
async fn run_demo(config: Config) -> Result<()> {
    let bus = BroadcastBus::new(&config.mesh.channel_name);

    let (cashier, _cashier_events) = Session::connect(
        config.clone(),
        StoreHandle::new(Arc::new(MemoryStore::new())),
        Some(&bus),
        Some(UserProfile {
            display_name: "Cashier-1".to_string(),
            role: Role::Cashier,
        }),
    )
    .await?;
    let (barista, _barista_events) = Session::connect(
        config.clone(),
        StoreHandle::new(Arc::new(MemoryStore::new())),
        Some(&bus),
        Some(UserProfile {
            display_name: "Barista-1".to_string(),
            role: Role::Barista,
        }),
    )
    .await?;
    let (manager, _manager_events) = Session::connect(
        config,
        StoreHandle::new(Arc::new(MemoryStore::new())),
        Some(&bus),
        Some(UserProfile {
            display_name: "Manager-1".to_string(),
            role: Role::Manager,
        }),
    )
    .await?;

    // Let mutual discovery settle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!(peers = cashier.peers().await?.len(), "cashier sees the room");

    let order = cashier
        .publish_order("oat milk latte, extra shot", vec![
            "latte (oat, +shot)".to_string(),
        ])
        .await?;
    info!(order_id = order.id, "order published");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let pending = barista.orders().await?;
    info!(orders = pending.len(), "barista queue");
    barista.complete_order(order.id).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = manager.stats().await?;
    println!(
        "orders: {} total, {} completed, avg {} ms, efficiency {}%",
        stats.total, stats.completed, stats.avg_completion_ms, stats.efficiency_pct
    );

    cashier.disconnect().await?;
    barista.disconnect().await?;
    manager.disconnect().await?;
    Ok(())
}
