use clap::{Parser, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Command-line flags. Only flags actually passed are layered over the
/// config file and environment; unset flags leave lower layers alone.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "huddle-server", version, about = "Huddle realtime chat server")]
pub struct Cli {
    /// Port to listen on
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./huddle.toml")]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Backend for presence keys and the broadcast job queue
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordination_store: Option<StoreBackend>,
}

/// Where presence keys, the scheduler queue and the scheduler lock live.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Tables in the shared SQLite file; every process on that file coordinates
    #[default]
    Sqlite,
    /// Process-local maps; single instance only
    Memory,
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default)]
    pub generate_config: bool,
    pub data_dir: String,
    #[serde(default)]
    pub coordination_store: StoreBackend,
    #[serde(default)]
    pub realtime: RealtimeSettings,
    #[serde(default)]
    pub presence: PresenceSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

/// Websocket connection limits and timings (`[realtime]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    /// Largest accepted inbound text frame in bytes (default: 65536)
    pub max_message_bytes: usize,
    /// Outbound frames buffered per connection before it is evicted (default: 256)
    pub outbound_queue_capacity: usize,
    /// Application messages allowed per window (default: 60)
    pub rate_limit_messages: u32,
    pub rate_limit_window_secs: u64,
    /// Deadline for a single socket write (default: 10)
    pub write_wait_secs: u64,
    /// Read deadline, refreshed by heartbeats (default: 60)
    pub pong_wait_secs: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            max_message_bytes: 65536,
            outbound_queue_capacity: 256,
            rate_limit_messages: 60,
            rate_limit_window_secs: 60,
            write_wait_secs: 10,
            pong_wait_secs: 60,
        }
    }
}

impl RealtimeSettings {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Heartbeat probe interval: 9/10 of the read deadline.
    pub fn ping_interval(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

/// `[presence]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    /// Lifetime of the online key without a heartbeat (default: 300)
    pub online_ttl_secs: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self { online_ttl_secs: 300 }
    }
}

impl PresenceSettings {
    pub fn online_ttl(&self) -> Duration {
        Duration::from_secs(self.online_ttl_secs)
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    /// Poll interval for due jobs (default: 1000)
    pub poll_interval_ms: u64,
    /// Claim lock lifetime (default: 30)
    pub lock_ttl_secs: u64,
    /// Worker tasks running the send pipeline (default: 4)
    pub workers: usize,
    /// Jobs buffered between the poller and the workers (default: 64)
    pub job_channel_capacity: usize,
    /// Delay before a job that found every worker busy is retried (default: 10)
    pub requeue_delay_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1000,
            lock_ttl_secs: 30,
            workers: 4,
            job_channel_capacity: 64,
            requeue_delay_secs: 10,
        }
    }
}

impl SchedulerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            coordination_store: StoreBackend::Sqlite,
            realtime: RealtimeSettings::default(),
            presence: PresenceSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (HUDDLE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Cli::parse();
        Self::figment(&cli).extract()
    }

    /// Nested keys come from env with a double underscore,
    /// e.g. `HUDDLE_REALTIME__MAX_MESSAGE_BYTES`.
    pub fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("HUDDLE_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Huddle Server Configuration
# Place this file at ./huddle.toml or specify with --config <path>
# All settings can be overridden via environment variables (HUDDLE_PORT,
# HUDDLE_REALTIME__MAX_MESSAGE_BYTES, etc.) or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and JWT signing key
# data_dir = "./data"

# Backend for presence keys and the broadcast queue: "sqlite" or "memory".
# Use sqlite when several server processes share one data directory.
# coordination_store = "sqlite"

# ---- Realtime connections ----
# [realtime]
# max_message_bytes = 65536      # Larger frames get a message_too_large error
# outbound_queue_capacity = 256  # Full queue evicts the connection
# rate_limit_messages = 60       # Per connection, per window; heartbeats excluded
# rate_limit_window_secs = 60
# write_wait_secs = 10
# pong_wait_secs = 60            # Heartbeat probes go out at 9/10 of this

# ---- Presence ----
# [presence]
# online_ttl_secs = 300

# ---- Broadcast scheduler ----
# [scheduler]
# enabled = true
# poll_interval_ms = 1000
# lock_ttl_secs = 30
# workers = 4
# job_channel_capacity = 64
# requeue_delay_secs = 10
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Figment {
        Figment::new().merge(Serialized::defaults(Config::default()))
    }

    #[test]
    fn test_defaults() {
        let config: Config = base().extract().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.realtime.outbound_queue_capacity, 256);
        assert_eq!(config.realtime.ping_interval(), Duration::from_secs(54));
        assert_eq!(config.presence.online_ttl(), Duration::from_secs(300));
        assert_eq!(config.scheduler.requeue_delay(), Duration::from_secs(10));
        assert_eq!(config.coordination_store, StoreBackend::Sqlite);
    }

    #[test]
    fn test_toml_sections_override_defaults() {
        let config: Config = base()
            .merge(Toml::string(
                r#"
                port = 9000
                coordination_store = "memory"

                [realtime]
                rate_limit_messages = 5

                [scheduler]
                workers = 2
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.coordination_store, StoreBackend::Memory);
        assert_eq!(config.realtime.rate_limit_messages, 5);
        assert_eq!(config.realtime.max_message_bytes, 65536);
        assert_eq!(config.scheduler.workers, 2);
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn test_unset_cli_flags_do_not_clobber_file() {
        let cli = Cli {
            port: Some(7000),
            ..Cli::default()
        };
        let config: Config = base()
            .merge(Toml::string("data_dir = \"/srv/huddle\"\nport = 9000"))
            .merge(Serialized::defaults(&cli))
            .extract()
            .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.data_dir, "/srv/huddle");
    }

    #[test]
    fn test_template_parses() {
        let config: Config = base()
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();
        assert_eq!(config.port, 8080);
    }
}
