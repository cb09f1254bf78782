// src/main.rs
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crabkv::{Store, client, config, expire, server};

#[derive(Parser)]
#[command(name = "crabkv", version, about = "In-memory key-value server speaking RESP")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the server
    Serve {
        /// JSON config file, created with defaults when missing
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
        /// Overrides the listen address from the config file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Subscribe to channels on a running server and print every message
    Subscribe {
        #[arg(long, default_value = "127.0.0.1:6380")]
        addr: String,
        #[arg(short = 'c', long = "channel")]
        channels: Vec<String>,
        #[arg(short = 'p', long = "pattern")]
        patterns: Vec<String>,
    },
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Cmd::Serve { config: path, bind } => {
            let (mut cfg, created) = config::load(&path)?;
            init_tracing(&cfg.log_filter);
            if created {
                info!(path = ?path, "default config created");
            }
            if let Some(bind) = bind {
                cfg.bind = bind;
            }

            let store = Arc::new(Store::new(cfg.store_options()));
            // 后台定时清理过期 key
            tokio::spawn(expire::start_cleaner(
                store.clone(),
                cfg.sweep_interval(),
                cfg.sweep_keys_per_shard,
            ));
            server::start(&cfg, store).await?;
        }
        Cmd::Subscribe { addr, channels, patterns } => {
            init_tracing("warn");
            if channels.is_empty() && patterns.is_empty() {
                anyhow::bail!("nothing to subscribe to, pass --channel or --pattern");
            }
            client::subscribe(&addr, &channels, &patterns, |_, payload| {
                println!("{}", String::from_utf8_lossy(payload));
            })
            .await?;
        }
    }
    Ok(())
}
