use std::{collections::HashSet, path::PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::ChatConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["chat.toml", "chat.yaml", "chat.yml", "chat.json"];

/// Discover and load config from standard locations, then layer environment
/// variables on top. Search order:
/// 1. `./chat.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/moltis-chat/chat.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `ChatConfig::default()` if no file is found.
pub fn discover_and_load() -> ChatConfig {
    let mut config = if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                ChatConfig::default()
            },
        }
    } else {
        debug!("no config file found, using defaults");
        ChatConfig::default()
    };
    apply_env_overrides(&mut config);
    config
}

/// Load config from the given path (any supported format), without env
/// overrides.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<ChatConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

fn parse_config(raw: &str, path: &std::path::Path) -> anyhow::Result<ChatConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }
    if let Some(dir) = config_dir() {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Returns the user-global config directory (`~/.config/moltis-chat/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "moltis-chat").map(|d| d.config_dir().to_path_buf())
}

/// Returns the user-global data directory (`~/.local/share/moltis-chat/` on
/// Linux), used as the default `CHAT_DATA_DIR`.
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "moltis-chat").map(|d| d.data_dir().to_path_buf())
}

fn parse_id_list(raw: &str) -> HashSet<String> {
    raw.split(|c| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Apply environment-variable overrides on top of a file-sourced (or
/// default) [`ChatConfig`], mutating it in place.
pub fn apply_env_overrides(config: &mut ChatConfig) {
    if let Ok(v) = std::env::var("CHAT_BIND_ADDR") {
        config.bind_addr = v;
    }
    if let Ok(v) = std::env::var("CHAT_DATA_DIR") {
        config.data_dir = Some(v);
    }
    if let Ok(v) = std::env::var("SESSION_SECRET") {
        config.session_secret = Some(secrecy::Secret::new(v));
    }
    if let Ok(v) = std::env::var("MODERATOR_ACCOUNT_IDS") {
        config.moderator_account_ids = parse_id_list(&v);
    }
    if let Ok(v) = std::env::var("DENY_ACCOUNT_IDS") {
        config.deny_account_ids = parse_id_list(&v);
    }
    apply_u64_env("CHAT_MESSAGE_RATE_WINDOW_MS", &mut config.message_rate_window_ms);
    apply_u32_env("CHAT_MESSAGE_RATE_MAX_COUNT", &mut config.message_rate_max_count);
    apply_u64_env("CHAT_CONNECT_RATE_WINDOW_MS", &mut config.connect_rate_window_ms);
    apply_u32_env("CHAT_CONNECT_RATE_MAX_COUNT", &mut config.connect_rate_max_count);
    apply_u32_env("CHAT_MAX_CONNECTIONS_PER_USER", &mut config.max_connections_per_user);
    if let Ok(v) = std::env::var("CHAT_MAX_CONNECTIONS_PER_ROOM") {
        config.max_connections_per_room = v.parse().ok();
    }
    apply_usize_env("CHAT_HISTORY_LIMIT", &mut config.history_limit);
    apply_u32_env(
        "CHAT_HISTORY_PERSIST_EVERY_N_MESSAGES",
        &mut config.history_persist_every_n_messages,
    );
    apply_u64_env("CHAT_PING_INTERVAL_MS", &mut config.ping_interval_ms);
    apply_u64_env("CHAT_PONG_TIMEOUT_MS", &mut config.pong_timeout_ms);
    if let Ok(v) = std::env::var("RUST_LOG") {
        config.rust_log = v;
    }
    if let Ok(v) = std::env::var("GITHUB_API_BASE_URL") {
        config.github_api_base_url = v;
    }
}

fn apply_u64_env(name: &str, field: &mut u64) {
    if let Ok(v) = std::env::var(name)
        && let Ok(parsed) = v.parse()
    {
        *field = parsed;
    }
}

fn apply_u32_env(name: &str, field: &mut u32) {
    if let Ok(v) = std::env::var(name)
        && let Ok(parsed) = v.parse()
    {
        *field = parsed;
    }
}

fn apply_usize_env(name: &str, field: &mut usize) {
    if let Ok(v) = std::env::var(name)
        && let Ok(parsed) = v.parse()
    {
        *field = parsed;
    }
}
