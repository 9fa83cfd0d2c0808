//! PIN resolution.
//!
//! The PIN comes either inline (`--pin`) or from a file that is read once
//! and then deleted (`--pin-file`), so it does not linger on disk.

use crate::error::ConfigError;
use secrecy::SecretString;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Resolve the token PIN from exactly one of the two sources.
pub fn resolve_pin(
    pin: Option<&str>,
    pin_file: Option<&Path>,
) -> Result<SecretString, ConfigError> {
    match (pin, pin_file) {
        (Some(_), Some(_)) => Err(ConfigError::ConflictingPin),
        (None, None) => Err(ConfigError::MissingPin),
        (Some(pin), None) if pin.is_empty() => Err(ConfigError::MissingPin),
        (Some(pin), None) => Ok(SecretString::from(pin.to_string())),
        (None, Some(path)) => read_and_remove(path),
    }
}

fn read_and_remove(path: &Path) -> Result<SecretString, ConfigError> {
    let pin_file_error = |source| ConfigError::PinFile {
        path: path.to_path_buf(),
        source,
    };

    let contents = fs::read_to_string(path).map_err(pin_file_error)?;
    fs::remove_file(path).map_err(pin_file_error)?;
    debug!("Read PIN from {} and removed the file", path.display());

    Ok(SecretString::from(contents.trim().to_string()))
}
