//! Server private key file.

use std::io::Write;
use std::path::Path;

use wgpilot_wireguard::PrivateKey;

use crate::error::{EngineError, Result};

/// Reads a base64 private key from `path`.
///
/// # Errors
///
/// Returns [`EngineError::Config`] if the file is missing or malformed.
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!(
            "failed to read server key '{}': {e} (run `wgpilotd init-keys` first)",
            path.display()
        ))
    })?;
    PrivateKey::from_base64(content.trim()).map_err(|e| {
        EngineError::Config(format!("invalid server key in '{}': {e}", path.display()))
    })
}

/// Writes `key` to `path` readable by the owner only.
///
/// # Errors
///
/// Returns [`EngineError::ConfigPersistence`] if the file exists and `force`
/// is not set, or if writing fails.
pub fn write_private_key(path: &Path, key: &PrivateKey, force: bool) -> Result<()> {
    let persist = |e: std::io::Error| {
        EngineError::ConfigPersistence(format!("failed to write '{}': {e}", path.display()))
    };
    if path.exists() && !force {
        return Err(EngineError::ConfigPersistence(format!(
            "'{}' already exists (use --force to overwrite)",
            path.display()
        )));
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(persist)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(persist)?;
    writeln!(file, "{}", key.to_base64()).map_err(persist)?;
    Ok(())
}
