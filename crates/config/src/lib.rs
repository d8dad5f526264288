//! Configuration loading, validation, and env substitution for the chat
//! server (C13).
//!
//! Config files: `chat.toml`, `chat.yaml`, or `chat.json`.
//! Searched in `./` then `~/.config/moltis-chat/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values, then layers
//! environment-variable overrides on top of the file-sourced config.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, config_dir, data_dir, discover_and_load, find_config_file,
        load_config,
    },
    schema::ChatConfig,
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
