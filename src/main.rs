//! Binary entrypoint for the meshmsg maintenance CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `stores` - list persisted message stores with bucket and message counts
//! - `show --device <id> (--node <n> --peer <m> | --channel <c>)` - print one bucket
//! - `clear` - wipe all persisted message data
//!
//! See the library crate docs for module-level details: `meshmsg::`.
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use meshmsg::config::{Config, StorageBackend};
use meshmsg::logutil::{escape_log, init_logging};
use meshmsg::messaging::{BucketSelector, MessageStoreManager};
use meshmsg::storage::open_backend;

#[derive(Parser)]
#[command(name = "meshmsg")]
#[command(about = "Inspect and maintain persisted Meshtastic message stores")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// List persisted message stores
    Stores,
    /// Print the messages of one conversation or channel
    Show {
        /// Device (store) id
        #[arg(short, long)]
        device: u32,
        /// Local node number of the direct conversation
        #[arg(long, requires = "peer", conflicts_with = "channel")]
        node: Option<u32>,
        /// Remote node number of the direct conversation
        #[arg(long, requires = "node")]
        peer: Option<u32>,
        /// Broadcast channel index
        #[arg(long)]
        channel: Option<u32>,
    },
    /// Delete every persisted store
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&Default::default(), cli.verbose);
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Stores => {
            let manager = open_manager(&cli.config, cli.verbose).await?;
            let stores = manager.list_stores();
            if stores.is_empty() {
                println!("No persisted message stores.");
            }
            for store in stores {
                let node = store
                    .my_node_num()
                    .map(|n| format!("!{:08x}", n))
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "device {:>10}  node {}  conversations {:>3}  channels {:>2}  messages {}",
                    store.id(),
                    node,
                    store.conversation_ids().len(),
                    store.channels().len(),
                    store.message_count()
                );
            }
        }
        Commands::Show {
            device,
            node,
            peer,
            channel,
        } => {
            let selector = match (node, peer, channel) {
                (Some(node), Some(peer), None) => BucketSelector::direct(node, peer),
                (None, None, Some(channel)) => BucketSelector::broadcast(channel),
                _ => bail!("specify either --node and --peer, or --channel"),
            };
            let manager = open_manager(&cli.config, cli.verbose).await?;
            let Some(store) = manager.get_store(device) else {
                bail!("no persisted store for device {}", device);
            };
            let messages = store.get_messages(selector);
            println!("{} ({} messages)", selector, messages.len());
            for m in messages {
                println!(
                    "{} #{:<10} {:>10} -> {:<10} [{}] {}",
                    m.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    m.message_id,
                    m.from,
                    m.to,
                    m.state,
                    escape_log(&m.content)
                );
            }
        }
        Commands::Clear => {
            let manager = open_manager(&cli.config, cli.verbose).await?;
            let count = manager.store_count();
            manager.clear_all_data().await;
            println!("Cleared {} message store(s).", count);
        }
    }
    Ok(())
}

/// Load the config, start logging and open the configured backend with persistence on.
async fn open_manager(path: &str, verbosity: u8) -> Result<MessageStoreManager> {
    let config = Config::load(path).await?;
    init_logging(&config.logging, verbosity);
    config.validate()?;

    if config.storage.backend == StorageBackend::Memory {
        warn!("Storage backend is 'memory'; nothing is persisted between runs");
    }
    let storage = open_backend(&config.storage)?;
    let mut messaging = config.messaging.clone();
    messaging.enable_persistence = true;
    let manager = MessageStoreManager::open(messaging, Some(storage)).await;
    if !manager.is_persistence_enabled() {
        bail!("storage backend '{}' could not be opened", config.storage.backend);
    }
    Ok(manager)
}
