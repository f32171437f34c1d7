// src/config/mod.rs
// All tunables load from the environment (.env supported), with defaults
// that work against a local blob emulator.

use once_cell::sync::Lazy;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct RepairSyncConfig {
    // ── Blob Store Configuration
    pub blob_base_url: String,
    pub blob_bucket: String,
    pub blob_timeout: u64,
    pub blob_transport_retries: u32,
    pub blob_retry_base_delay_ms: u64,

    // ── Deduplication Configuration
    pub dedup_verify_after_store: bool,

    // ── Consolidation Configuration
    pub commit_max_retries: u32,
    pub commit_retry_base_delay_ms: u64,

    // ── WebSocket Notification Settings
    pub ws_outbound_queue_capacity: usize,
    pub ws_heartbeat_interval: u64,
    pub ws_connection_timeout: u64,
    pub ws_auth_token: String,

    // ── Client Reconnect Policy (served to consumers, tested here)
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,

    // ── Server Configuration
    pub host: String,
    pub port: u16,

    // ── CORS Settings
    pub cors_origin: String,

    // ── Logging Configuration
    pub log_level: String,
}

// Handles values with trailing comments and extra whitespace.
fn env_var_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(val) => {
            let clean_val = val.split('#').next().unwrap_or("").trim();
            match clean_val.parse::<T>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    eprintln!("Config: {} = '{}' (parse failed, using default)", key, val);
                    default
                }
            }
        }
        Err(_) => default,
    }
}

impl RepairSyncConfig {
    pub fn from_env() -> Self {
        if dotenvy::dotenv().is_err() {
            eprintln!("Warning: .env file not found. Using environment variables and defaults.");
        }

        Self {
            blob_base_url: env_var_or("RSYNC_BLOB_BASE_URL", "http://localhost:9000".to_string()),
            blob_bucket: env_var_or("RSYNC_BLOB_BUCKET", "repair-sessions".to_string()),
            blob_timeout: env_var_or("RSYNC_BLOB_TIMEOUT", 15),
            blob_transport_retries: env_var_or("RSYNC_BLOB_TRANSPORT_RETRIES", 3),
            blob_retry_base_delay_ms: env_var_or("RSYNC_BLOB_RETRY_BASE_DELAY_MS", 200),
            dedup_verify_after_store: env_var_or("RSYNC_DEDUP_VERIFY_AFTER_STORE", false),
            commit_max_retries: env_var_or("RSYNC_COMMIT_MAX_RETRIES", 4),
            commit_retry_base_delay_ms: env_var_or("RSYNC_COMMIT_RETRY_BASE_DELAY_MS", 25),
            ws_outbound_queue_capacity: env_var_or("RSYNC_WS_QUEUE_CAPACITY", 32),
            ws_heartbeat_interval: env_var_or("RSYNC_WS_HEARTBEAT_INTERVAL", 30),
            ws_connection_timeout: env_var_or("RSYNC_WS_CONNECTION_TIMEOUT", 300),
            // Empty means every handshake is rejected; set it explicitly.
            ws_auth_token: env_var_or("RSYNC_WS_AUTH_TOKEN", String::new()),
            reconnect_base_delay_ms: env_var_or("RSYNC_RECONNECT_BASE_DELAY_MS", 500),
            reconnect_max_delay_ms: env_var_or("RSYNC_RECONNECT_MAX_DELAY_MS", 30_000),
            reconnect_max_attempts: env_var_or("RSYNC_RECONNECT_MAX_ATTEMPTS", 8),
            host: env_var_or("RSYNC_HOST", "0.0.0.0".to_string()),
            port: env_var_or("RSYNC_PORT", 3020),
            cors_origin: env_var_or("RSYNC_CORS_ORIGIN", "http://localhost:3000".to_string()),
            log_level: env_var_or("RSYNC_LOG_LEVEL", "info".to_string()),
        }
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get blob request timeout as a Duration
    pub fn blob_timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.blob_timeout)
    }

    /// Check if debug logging is enabled
    pub fn is_debug(&self) -> bool {
        self.log_level.to_lowercase() == "debug"
    }
}

// Global config instance - loaded once at startup
pub static CONFIG: Lazy<RepairSyncConfig> = Lazy::new(RepairSyncConfig::from_env);
