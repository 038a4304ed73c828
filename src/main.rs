mod config;
mod crypto;
mod event;
mod filter;
mod inbox;
mod keys;
mod relay;
mod router;
mod store;
mod subscription;
mod wire;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::Settings;
use event::PubKey;
use inbox::InboxModel;
use store::{Store, Timeline};

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "nestr", author, version, about = "Relay-pool inbox engine for Nostr")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run the inbox engine until interrupted.
    Start,
    /// Rebuild derived tables by replaying stored events.
    Reindex,
    /// Print newest-first post timeline event ids for an author.
    DumpPosts {
        author: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print newest-first chat timeline event ids for a participant.
    DumpChats {
        participant: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print the stored profile for a pubkey.
    DumpProfile { pubkey: String },
    /// Print the stored relay lists for a pubkey.
    DumpRelays { pubkey: String },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::open(&cfg.data_dir)?;
    match cli.command {
        Commands::Start => {
            let identity = keys::load_identity(&cfg)?;
            let connect_timeout = cfg.connect_timeout;
            let mut model = InboxModel::start(cfg, store, identity).await?;
            if !model.await_at_least_one_connected(connect_timeout).await {
                model.stop().await;
                anyhow::bail!("no relay reached connected state");
            }
            tokio::signal::ctrl_c().await?;
            model.stop().await;
        }
        Commands::Reindex => {
            let identity = keys::load_identity(&cfg)?;
            inbox::rebuild_indexes(&store, &identity)?;
        }
        Commands::DumpPosts { author, limit } => {
            let author: PubKey = author.parse()?;
            for id in store.get_timeline_ids(Timeline::Posts, &author, limit)? {
                println!("{id}");
            }
        }
        Commands::DumpChats { participant, limit } => {
            let participant: PubKey = participant.parse()?;
            for id in store.get_timeline_ids(Timeline::Chats, &participant, limit)? {
                println!("{id}");
            }
        }
        Commands::DumpProfile { pubkey } => {
            let pubkey: PubKey = pubkey.parse()?;
            let (profile, updated_at) = store.get_profile(&pubkey)?;
            let out = serde_json::json!({ "profile": profile, "updated_at": updated_at });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::DumpRelays { pubkey } => {
            let pubkey: PubKey = pubkey.parse()?;
            let out = serde_json::json!({
                "general": store.get_general_relays(&pubkey)?,
                "dm": store.get_dm_relays(&pubkey)?,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nestr=info,warn".into()),
        )
        .init();
    run(Cli::parse()).await
}
