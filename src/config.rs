use std::time::Duration;

use clap::Parser;

use crate::{
    classifier::DEFAULT_SEEK_THRESHOLD_MILLIS, debounce::DEFAULT_DEBOUNCE_WINDOW_MILLIS,
    refresh::DEFAULT_REFRESH_INTERVAL,
};

/// Synchost playback relay
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// admin password
    #[arg(short, long, default_value = "password")]
    pub admin_pw: String,

    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// name announced when attaching to the local player
    #[arg(long, default_value = "Synchost Host")]
    pub device_label: String,

    /// position drift above which a jump counts as a seek
    #[arg(long, default_value_t = DEFAULT_SEEK_THRESHOLD_MILLIS)]
    pub seek_threshold_ms: u64,

    #[arg(long, default_value_t = DEFAULT_DEBOUNCE_WINDOW_MILLIS)]
    pub debounce_window_ms: u64,

    #[arg(long, default_value_t = DEFAULT_REFRESH_INTERVAL.as_secs())]
    pub refresh_interval_secs: u64,

    /// how long a player handshake may take before it counts as failed
    #[arg(long, default_value_t = 10_000)]
    pub handshake_timeout_ms: u64,

    /// how long stop waits for the disconnect broadcast
    #[arg(long, default_value_t = 2000)]
    pub teardown_timeout_ms: u64,

    /// period of the local player's position ticks
    #[arg(long, default_value_t = 1000)]
    pub tick_interval_ms: u64,

    #[arg(long)]
    pub refresh_token: Option<String>,

    /// consecutive refresh failures before asking for a new login
    #[arg(long, default_value_t = 3)]
    pub max_refresh_failures: u32,

    /// CORS origins to allow; any origin is reflected when none are given
    #[arg(long = "allowed-origin")]
    pub allowed_origins: Vec<String>,
}

impl Args {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            device_label: self.device_label.clone(),
            seek_threshold_millis: self.seek_threshold_ms,
            debounce_window_millis: self.debounce_window_ms,
            refresh_interval: Duration::from_secs(self.refresh_interval_secs.max(1)),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            teardown_timeout: Duration::from_millis(self.teardown_timeout_ms),
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
        }
    }
}

/// Tunables for one synchronization controller.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub device_label: String,
    pub seek_threshold_millis: u64,
    pub debounce_window_millis: u64,
    pub refresh_interval: Duration,
    pub handshake_timeout: Duration,
    pub teardown_timeout: Duration,
    /// How often the relay's player re-reports its state
    pub tick_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_label: "Synchost Host".to_string(),
            seek_threshold_millis: DEFAULT_SEEK_THRESHOLD_MILLIS,
            debounce_window_millis: DEFAULT_DEBOUNCE_WINDOW_MILLIS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            handshake_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(2),
            tick_interval: Duration::from_secs(1),
        }
    }
}
