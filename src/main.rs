//! Confluence CLI entry point.
//!
//! Provides `init`, `add-maildir`, `list`, `remove`, and `watch` subcommands
//! for setting the master key, managing droplets, and running the feed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tracing::{info, warn};

use confluence::aggregator::Aggregator;
use confluence::config::{load_config_or_default, runtime_paths, RuntimePaths};
use confluence::credentials::load_credentials;
use confluence::dispatch::CoreEvent;
use confluence::droplet::mail::maildir::MAILDIR_PROVIDER;
use confluence::droplet::{ProviderCatalog, Settings};
use confluence::identifier::Identifier;
use confluence::ripple::TaggedRipple;
use confluence::state::{load_state, save_state};
use confluence::{interactive, logging};

/// Confluence: one feed from many mailboxes.
#[derive(Parser)]
#[command(name = "confluence", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Set (or change) the master key.
    Init,
    /// Add a droplet reading a local Maildir.
    AddMaildir {
        /// Display name.
        #[arg(long)]
        name: String,
        /// Maildir directory (containing `new/` and `cur/`).
        #[arg(long)]
        path: PathBuf,
        /// Account address; defaults to the path.
        #[arg(long)]
        address: Option<String>,
        /// Poll interval override in seconds.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List configured droplets.
    List,
    /// Remove a droplet by identifier.
    Remove {
        /// Droplet identifier as shown by `list`.
        id: Identifier,
    },
    /// Initialize every droplet and print the merged feed until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = runtime_paths()?;
    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("failed to create {}", paths.root.display()))?;

    let _interactive = interactive::enter();

    match cli.command {
        Command::Init => {
            logging::init_cli();
            handle_init(&paths)
        }
        Command::AddMaildir {
            name,
            path,
            address,
            interval,
        } => {
            logging::init_cli();
            handle_add_maildir(&paths, name, path, address, interval)
        }
        Command::List => {
            logging::init_cli();
            handle_list(&paths)
        }
        Command::Remove { id } => {
            logging::init_cli();
            handle_remove(&paths, id).await
        }
        Command::Watch => handle_watch(&paths).await,
    }
}

/// Build the core from disk. The vault is still locked on return.
fn open_core(paths: &RuntimePaths) -> anyhow::Result<Arc<Aggregator>> {
    let config = load_config_or_default(&paths.config_toml)?;
    let document = load_state(&paths.state_json)?;
    let core = Aggregator::restore(
        ProviderCatalog::builtin(),
        document,
        config.polling,
        Handle::current(),
    )
    .context("state file is invalid")?;
    Ok(Arc::new(core))
}

/// Master key from the environment or `.env`, else one line from stdin.
fn read_master_key(paths: &RuntimePaths) -> anyhow::Result<String> {
    let credentials = load_credentials(&paths.env_file)?;
    if let Some(key) = credentials.master_key() {
        return Ok(key);
    }
    eprint!("master key: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read master key from stdin")?;
    let key = line.trim_end_matches(['\r', '\n']).to_owned();
    if key.is_empty() {
        anyhow::bail!("master key must not be empty");
    }
    Ok(key)
}

fn unlock(core: &Aggregator, paths: &RuntimePaths) -> anyhow::Result<()> {
    let key = read_master_key(paths)?;
    if !core.unlock(&key) {
        anyhow::bail!("master key does not match");
    }
    Ok(())
}

/// Open the core and unlock it with the master key.
fn unlocked_core(paths: &RuntimePaths) -> anyhow::Result<Arc<Aggregator>> {
    let core = open_core(paths)?;
    if !core.vault().has_key() {
        anyhow::bail!("no master key set; run `confluence init` first");
    }
    unlock(&core, paths)?;
    Ok(core)
}

fn persist(core: &Aggregator, paths: &RuntimePaths) -> anyhow::Result<()> {
    let document = core.state_document()?;
    save_state(&paths.state_json, &document)
}

/// Set the master key, unlocking with the current one first if it exists.
fn handle_init(paths: &RuntimePaths) -> anyhow::Result<()> {
    let core = open_core(paths)?;
    if core.vault().has_key() {
        eprintln!("a master key is already set; enter it to change it");
        unlock(&core, paths)?;
    }
    eprintln!("new key:");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read new key from stdin")?;
    core.set_key(line.trim_end_matches(['\r', '\n']))?;
    persist(&core, paths)?;
    println!("master key set");
    Ok(())
}

fn handle_add_maildir(
    paths: &RuntimePaths,
    name: String,
    path: PathBuf,
    address: Option<String>,
    interval: Option<u64>,
) -> anyhow::Result<()> {
    let core = unlocked_core(paths)?;
    let endpoint = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("maildir path is not valid UTF-8"))?
        .to_owned();
    let mut settings = Settings::new(name)
        .with_field("address", address.unwrap_or_else(|| endpoint.clone()))
        .with_field("endpoint", endpoint);
    if let Some(secs) = interval {
        settings = settings.with_poll_interval(secs);
    }
    let id = core.add_droplet(MAILDIR_PROVIDER, settings)?;
    persist(&core, paths)?;
    println!("added droplet {id}");
    Ok(())
}

fn handle_list(paths: &RuntimePaths) -> anyhow::Result<()> {
    let core = unlocked_core(paths)?;
    let records = core.vault().records()?;
    if records.is_empty() {
        println!("no droplets configured");
        return Ok(());
    }
    for (id, record) in records {
        let interval = record
            .settings
            .poll_interval_secs
            .map_or_else(|| "default".to_owned(), |secs| format!("{secs}s"));
        let loaded = if core.registry().get(id).is_some() {
            ""
        } else {
            " (invalid settings)"
        };
        println!(
            "{id:>4}  {:<10} {:<24} every {interval}{loaded}",
            record.provider, record.settings.display_name
        );
    }
    Ok(())
}

async fn handle_remove(paths: &RuntimePaths, id: Identifier) -> anyhow::Result<()> {
    let core = unlocked_core(paths)?;
    core.remove_droplet(id)?;
    persist(&core, paths)?;
    core.shutdown().await;
    println!("removed droplet {id}");
    Ok(())
}

fn print_ripple(tagged: &TaggedRipple) {
    let ripple = &tagged.ripple;
    let when = chrono::DateTime::from_timestamp_millis(ripple.received_date())
        .map_or_else(|| ripple.received_date().to_string(), |at| at.format("%Y-%m-%d %H:%M").to_string());
    println!(
        "{when}  [{}] {}: {}",
        tagged.source,
        ripple.sender(),
        ripple.subject()
    );
}

fn report(event: &CoreEvent) {
    match event {
        CoreEvent::Ripples { ripples, .. } => ripples.iter().for_each(print_ripple),
        CoreEvent::Initialized { droplet } => info!(droplet = %droplet, "droplet ready"),
        CoreEvent::InitFailed { droplet, error } => {
            warn!(droplet = %droplet, error = %error, "droplet failed to initialize");
        }
        CoreEvent::PollFailed { droplet, error } => {
            warn!(droplet = %droplet, error = %error, "poll failed");
        }
        CoreEvent::ConfigRejected { droplet, error } => {
            warn!(droplet = %droplet, error = %error, "stored settings rejected");
        }
        _ => {}
    }
}

async fn handle_watch(paths: &RuntimePaths) -> anyhow::Result<()> {
    let _logging_guard = logging::init_production(&paths.logs_dir)?;
    let core = unlocked_core(paths)?;
    core.events().core.subscribe(report);

    let mut events = core
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event stream already taken"))?;

    let init = core.spawn_initialize_all();
    let polling = core.start_polling();
    info!(droplets = core.registry().len(), "watching");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                core.events().core.dispatch(&event);
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                info!("ctrl-c received, shutting down");
                break;
            }
        }
    }

    polling.stop().await;
    init.abort();
    core.shutdown().await;
    Ok(())
}
