//! Permanent key files.
//!
//! A key file holds the 32-byte secret key as 64 hex characters. The
//! public key is derived on load.

use std::path::{Path, PathBuf};

use salty_types::KeyPair;

use crate::error::{RelayError, Result};

/// Load every key file, in order. The first becomes the primary key.
pub fn load_permanent_keys(paths: &[PathBuf]) -> Result<Vec<KeyPair>> {
    paths.iter().map(|path| load_key_file(path)).collect()
}

/// Load one key file.
pub fn load_key_file(path: &Path) -> Result<KeyPair> {
    let content = std::fs::read_to_string(path).map_err(|e| RelayError::Key {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let keys = KeyPair::from_hex(&content).map_err(|e| RelayError::Key {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    tracing::info!(
        "Loaded permanent key {} from {}",
        keys.public_hex(),
        path.display()
    );
    Ok(keys)
}

/// Generate a key pair and write its secret half to `path`.
///
/// Refuses to overwrite an existing file.
pub fn generate_key_file(path: &Path) -> Result<KeyPair> {
    let keys = KeyPair::generate();
    let encoded = hex::encode(keys.secret_key().to_bytes());

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| RelayError::Key {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    std::io::Write::write_all(&mut file, format!("{encoded}\n").as_bytes())?;
    Ok(keys)
}
