//! Configuration validation for [`crate::schema::ChatConfig`].
//!
//! Produces a `Vec<Diagnostic>` rather than panicking on the first bad value,
//! so a misconfigured deployment gets a complete report instead of a single
//! opaque failure.

use crate::schema::ChatConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub path: String,
    pub message: String,
}

/// Result of validating a [`ChatConfig`].
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }
}

/// Validate every numeric knob and the session secret. `SESSION_SECRET` is
/// checked for minimum length here (at load time), not lazily at first
/// handshake, so a misconfigured deployment fails fast with a clear message.
#[must_use]
pub fn validate(config: &ChatConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();

    match config.session_secret_str() {
        None => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: "SESSION_SECRET".into(),
            message: "SESSION_SECRET is required".into(),
        }),
        Some(secret) if secret.len() < 32 => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: "SESSION_SECRET".into(),
            message: format!(
                "SESSION_SECRET must be at least 32 bytes, got {}",
                secret.len()
            ),
        }),
        Some(_) => {},
    }

    check_positive(
        "CHAT_MESSAGE_RATE_WINDOW_MS",
        config.message_rate_window_ms,
        &mut diagnostics,
    );
    check_positive(
        "CHAT_MESSAGE_RATE_MAX_COUNT",
        config.message_rate_max_count,
        &mut diagnostics,
    );
    check_positive(
        "CHAT_CONNECT_RATE_WINDOW_MS",
        config.connect_rate_window_ms,
        &mut diagnostics,
    );
    check_positive(
        "CHAT_CONNECT_RATE_MAX_COUNT",
        config.connect_rate_max_count,
        &mut diagnostics,
    );
    check_positive(
        "CHAT_MAX_CONNECTIONS_PER_USER",
        config.max_connections_per_user,
        &mut diagnostics,
    );
    if config.history_limit == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: "CHAT_HISTORY_LIMIT".into(),
            message: "CHAT_HISTORY_LIMIT must be a positive integer".into(),
        });
    }
    check_positive(
        "CHAT_HISTORY_PERSIST_EVERY_N_MESSAGES",
        config.history_persist_every_n_messages,
        &mut diagnostics,
    );

    check_positive("CHAT_PING_INTERVAL_MS", config.ping_interval_ms, &mut diagnostics);
    if config.pong_timeout_ms < config.ping_interval_ms {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: "CHAT_PONG_TIMEOUT_MS".into(),
            message: "CHAT_PONG_TIMEOUT_MS must be >= CHAT_PING_INTERVAL_MS".into(),
        });
    }

    if let Some(cap) = config.max_connections_per_room
        && cap == 0
    {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: "CHAT_MAX_CONNECTIONS_PER_ROOM".into(),
            message: "CHAT_MAX_CONNECTIONS_PER_ROOM must be a positive integer if set".into(),
        });
    }

    if config.bind_addr.parse::<std::net::SocketAddr>().is_err() {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: "CHAT_BIND_ADDR".into(),
            message: format!("CHAT_BIND_ADDR {:?} is not a valid socket address", config.bind_addr),
        });
    } else if !config.is_loopback_bind() {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            path: "CHAT_BIND_ADDR".into(),
            message: "binding to a non-loopback address exposes the chat server directly".into(),
        });
    }

    ValidationResult { diagnostics }
}

fn check_positive(name: &'static str, value: impl Into<u64>, diagnostics: &mut Vec<Diagnostic>) {
    if value.into() == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: name.into(),
            message: format!("{name} must be a positive integer"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ChatConfig {
        ChatConfig {
            session_secret: Some(secrecy::Secret::new("x".repeat(32))),
            ..ChatConfig::default()
        }
    }

    #[test]
    fn default_secret_missing_is_error() {
        let result = validate(&ChatConfig::default());
        assert!(result.has_errors());
    }

    #[test]
    fn short_secret_is_error() {
        let mut cfg = base_config();
        cfg.session_secret = Some(secrecy::Secret::new("short".into()));
        let result = validate(&cfg);
        assert!(result.has_errors());
    }

    #[test]
    fn valid_config_has_no_errors() {
        let result = validate(&base_config());
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn zero_rate_window_is_error() {
        let mut cfg = base_config();
        cfg.message_rate_window_ms = 0;
        let result = validate(&cfg);
        assert!(result.has_errors());
    }

    #[test]
    fn non_loopback_bind_is_warning_not_error() {
        let mut cfg = base_config();
        cfg.bind_addr = "0.0.0.0:8787".into();
        let result = validate(&cfg);
        assert!(!result.has_errors());
        assert!(result.diagnostics.iter().any(|d| d.severity == Severity::Warning));
    }
}
