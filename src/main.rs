mod blob;
mod error;
mod settings;
mod store;
mod sync;
#[cfg(test)]
mod tests;
mod vault;
mod web;

use clap::{Parser, Subcommand};
use log::{error, info};
use std::error::Error;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::blob::BlobStore;
use crate::settings::{Settings, SyncConfig};
use crate::store::{MailAccount, Store};
use crate::sync::worker::{self, BatchOutcome};
use crate::vault::Vault;

/// Shared handles threaded through the web layer and the worker. Planner
/// and worker invocations hold no other state; everything they coordinate
/// on lives in the store.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<Store>>,
    pub vault: Arc<Vault>,
    pub blob: Arc<BlobStore>,
    pub sync: SyncConfig,
}

#[derive(Parser)]
#[command(name = "mailspool", about = "Incremental IMAP mailbox ingestion service")]
struct Cli {
    /// Path to the YAML settings file
    #[arg(long, default_value = "settings.yaml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and the background sweep
    Serve,
    /// Store or replace the mailbox account for an owner
    AccountAdd {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 993)]
        port: u16,
        #[arg(long)]
        username: String,
    },
}

fn setup_logger() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_logger()?;
    let cli = Cli::parse();
    let settings = settings::load_settings(&cli.config)?;

    let vault = Vault::from_settings(&settings.vault)?;
    let store = Store::open(Path::new(&settings.database.path))?;
    let state = AppState {
        store: Arc::new(Mutex::new(store)),
        vault: Arc::new(vault),
        blob: Arc::new(BlobStore::new(settings.blobs.path.clone())),
        sync: settings.sync.clone(),
    };

    match cli.command {
        Some(Command::AccountAdd {
            owner,
            host,
            port,
            username,
        }) => add_account(&state, owner, host, port, username),
        Some(Command::Serve) | None => serve(state, &settings).await,
    }
}

fn add_account(
    state: &AppState,
    owner: String,
    host: String,
    port: u16,
    username: String,
) -> Result<(), Box<dyn Error>> {
    let password = rpassword::prompt_password("Enter the mailbox password: ")?;
    let secret = state.vault.encrypt(&password)?;
    state
        .store
        .lock()
        .expect("store mutex poisoned")
        .upsert_account(&MailAccount {
            owner_id: owner.clone(),
            host,
            port,
            username,
            password_ciphertext: secret.ciphertext,
            password_nonce: secret.nonce,
        })?;
    info!("stored mail account for {}", owner);
    Ok(())
}

async fn serve(state: AppState, settings: &Settings) -> Result<(), Box<dyn Error>> {
    start_sweep(state.clone(), settings.sync.sweep_interval_secs).await?;
    web::start_web_server(state, &settings.server.host, settings.server.port).await?;
    Ok(())
}

// Periodically runs one worker invocation so a pending job stranded by a
// crash or restart resumes without a manual trigger.
async fn start_sweep(state: AppState, interval_secs: u64) -> Result<(), Box<dyn Error>> {
    let scheduler = JobScheduler::new().await?;
    let schedule = format!("*/{} * * * * *", interval_secs.clamp(1, 59));

    let sweep = Job::new_async(schedule.as_str(), move |_id, _scheduler| {
        let state = state.clone();
        Box::pin(async move {
            let reclaim = {
                let store = state.store.lock().expect("store mutex poisoned");
                store.reclaim_stale(state.sync.stale_after_secs)
            };
            match reclaim {
                Ok(0) => {}
                Ok(n) => info!("sweep returned {} stalled job(s) to pending", n),
                Err(e) => error!("sweep could not reclaim stalled jobs: {}", e),
            }
            match worker::process_batch(state).await {
                Ok(BatchOutcome::Idle) => {}
                Ok(outcome) => info!("sweep ran a batch: {:?}", outcome),
                Err(e) => error!("sweep batch failed: {}", e),
            }
        })
    })?;
    scheduler.add(sweep).await?;
    scheduler.start().await?;
    Ok(())
}
