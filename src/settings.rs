use serde::Deserialize;

use backtrace::Backtrace;
use log::error;
use serde_yaml::Error;
use std::fs::File;
use std::io::BufReader;

// Main configuration struct
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub blobs: BlobConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub vault: VaultConfig,
}

// REST server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

// Root directory of the attachment blob store
#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Identifiers attempted per worker invocation.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on any single IMAP network call.
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,
    /// How often the sweep picks up stranded pending jobs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How long a job may sit in processing without progress before the
    /// sweep hands it back to the pending queue.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            batch_size: default_batch_size(),
            network_timeout_secs: default_network_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VaultConfig {
    /// Base64-encoded 256-bit master key. The MAILSPOOL_MASTER_KEY
    /// environment variable takes precedence when set.
    pub master_key: Option<String>,
}

fn default_batch_size() -> usize {
    5
}

fn default_network_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    300
}

pub fn load_settings(path: &str) -> Result<Settings, Error> {
    // Open the YAML file
    let file = File::open(path);
    let file = match file {
        Ok(file) => file,
        Err(err) => {
            error!("Error: {}", err);

            // Capture and print the backtrace
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            panic!("Cannot find settings at {}", path)
        }
    };

    let reader = BufReader::new(file);

    // Parse the YAML file into the Settings struct
    let settings_result = serde_yaml::from_reader(reader);
    let settings: Settings = match settings_result {
        Ok(settings) => settings,
        Err(err) => {
            error!("Error: {}", err);

            // Capture and print the backtrace
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            panic!("Cannot deserialize settings")
        }
    };

    Ok(settings)
}
