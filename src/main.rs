mod api;
mod app;
mod cache;
mod config;
mod db;
mod event;
mod logging;
mod queue;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stayline")]
#[command(about = "Offline cache and durable action queue for the citizen assistant")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stayline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch the critical resources into a fresh namespace and retire old ones
  Install,
  /// Serve a request through the cache
  Get {
    /// Path relative to the origin, or an absolute URL
    path: String,
    /// Treat the request as a page navigation (network-first)
    #[arg(long)]
    navigate: bool,
    /// HTTP method; anything but GET bypasses the cache
    #[arg(short = 'X', long)]
    method: Option<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Inspect the cache
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
  /// Queue an action for later delivery
  Enqueue {
    /// Action type, e.g. apply or upload
    kind: String,
    /// JSON payload
    payload: String,
  },
  /// List pending actions
  Queue,
  /// Remove a pending action by id
  Dequeue { id: String },
  /// Deliver every pending action once
  Flush {
    #[arg(long)]
    max_retries: Option<u32>,
  },
  /// Flush whenever connectivity comes back, until interrupted
  Watch,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// List namespaces and the entries of the current one
  Ls,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging, &config.data_dir()?)?;

  let app = app::App::new(config)?;

  match args.command {
    Command::Install => app.install().await?,
    Command::Get {
      path,
      navigate,
      method,
      data,
    } => {
      let method = method
        .map(|m| {
          Method::from_bytes(m.to_uppercase().as_bytes())
            .map_err(|e| eyre!("Invalid HTTP method '{}': {}", m, e))
        })
        .transpose()?;
      app.get(&path, navigate, method, data).await?
    }
    Command::Cache {
      command: CacheCommand::Ls,
    } => app.show_cache()?,
    Command::Enqueue { kind, payload } => app.enqueue(&kind, &payload)?,
    Command::Queue => app.show_queue()?,
    Command::Dequeue { id } => app.dequeue(&id)?,
    Command::Flush { max_retries } => app.flush(max_retries).await?,
    Command::Watch => app.watch().await?,
  }

  Ok(())
}
