pub mod parse;
pub mod types;

pub use parse::{parse_community_literal, parse_config, ParseError};
pub use types::{
    BgpAdvertisement, Config, Labels, NodeSelector, PeerConfig, Pool, Protocol,
    SelectorOperator, SelectorRequirement, DEFAULT_BGP_PORT, DEFAULT_HOLD_TIME,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ParseError(#[from] ParseError),
}

// ============================================================================
// I/O wrapper - thin layer over pure functions
// ============================================================================

/// Expand `~` in a user-supplied config path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

/// Load and validate a configuration file from disk.
/// This is the I/O boundary - it reads the file and delegates to pure parsing functions.
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(expand_path(path))?;
    let config = parse_config(&content)?;
    Ok(config)
}
