//! Configuration schema for the chat server (C13).
//!
//! Every knob named in the external-interfaces section is represented here as
//! a `#[serde(default)]` field so that a config file only needs to override
//! what it wants to change; [`crate::loader::apply_env_overrides`] layers
//! environment variables on top of file-sourced values.

use std::collections::HashSet;

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_message_rate_window_ms() -> u64 {
    10_000
}

fn default_message_rate_max_count() -> u32 {
    5
}

fn default_connect_rate_window_ms() -> u64 {
    10_000
}

fn default_connect_rate_max_count() -> u32 {
    20
}

fn default_max_connections_per_user() -> u32 {
    3
}

fn default_history_limit() -> usize {
    200
}

fn default_history_persist_every_n() -> u32 {
    1
}

fn default_github_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_rust_log() -> String {
    "info".to_string()
}

fn default_session_ttl_ms() -> u64 {
    3_600_000
}

fn default_ping_interval_ms() -> u64 {
    20_000
}

fn default_pong_timeout_ms() -> u64 {
    60_000
}

/// Root configuration for the chat server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// `CHAT_BIND_ADDR`.
    pub bind_addr: String,
    /// `CHAT_DATA_DIR`; `None` defers to the platform config dir.
    pub data_dir: Option<String>,
    /// `SESSION_SECRET`, required, >=32 bytes. Wrapped so it never prints via
    /// `Debug`.
    #[serde(skip_serializing)]
    pub session_secret: Option<Secret<String>>,
    /// Session ticket lifetime in milliseconds.
    pub session_ttl_ms: u64,
    /// `MODERATOR_ACCOUNT_IDS`.
    pub moderator_account_ids: HashSet<String>,
    /// `DENY_ACCOUNT_IDS`.
    pub deny_account_ids: HashSet<String>,
    pub message_rate_window_ms: u64,
    pub message_rate_max_count: u32,
    pub connect_rate_window_ms: u64,
    pub connect_rate_max_count: u32,
    pub max_connections_per_user: u32,
    pub max_connections_per_room: Option<u32>,
    pub history_limit: usize,
    pub history_persist_every_n_messages: u32,
    /// Socket liveness ping interval.
    pub ping_interval_ms: u64,
    /// Socket liveness pong timeout; must be `>= ping_interval_ms`.
    pub pong_timeout_ms: u64,
    /// `RUST_LOG`.
    pub rust_log: String,
    /// `GITHUB_API_BASE_URL`, override for tests.
    pub github_api_base_url: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: None,
            session_secret: None,
            session_ttl_ms: default_session_ttl_ms(),
            moderator_account_ids: HashSet::new(),
            deny_account_ids: HashSet::new(),
            message_rate_window_ms: default_message_rate_window_ms(),
            message_rate_max_count: default_message_rate_max_count(),
            connect_rate_window_ms: default_connect_rate_window_ms(),
            connect_rate_max_count: default_connect_rate_max_count(),
            max_connections_per_user: default_max_connections_per_user(),
            max_connections_per_room: None,
            history_limit: default_history_limit(),
            history_persist_every_n_messages: default_history_persist_every_n(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            rust_log: default_rust_log(),
            github_api_base_url: default_github_api_base_url(),
        }
    }
}

impl ChatConfig {
    /// Whether `bind_addr`'s host component is loopback.
    pub fn is_loopback_bind(&self) -> bool {
        let host = self
            .bind_addr
            .rsplit_once(':')
            .map_or(self.bind_addr.as_str(), |(host, _)| host)
            .trim_start_matches('[')
            .trim_end_matches(']');
        matches!(host, "localhost" | "127.0.0.1" | "::1") || host.ends_with(".localhost")
    }

    /// Exposes the session secret, or `None` if unset.
    pub fn session_secret_str(&self) -> Option<&str> {
        self.session_secret.as_ref().map(|s| s.expose_secret().as_str())
    }
}
