//! Client credential table.
//!
//! Loaded once at startup from a `id,base64-secret` file and never mutated
//! afterwards. Secrets are wiped from memory on drop.

use base64::{engine::general_purpose, Engine as _};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Error)]
pub enum ClientsFileError {
    #[error("could not read clients file: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad data on line {line} of clients file: {content:?}")]
    BadLine { line: usize, content: String },
}

/// A per-client shared secret, zeroized on drop.
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
struct ClientSecret(Vec<u8>);

/// Immutable client id → shared secret table.
#[derive(Debug, Default)]
pub struct ClientTable {
    inner: HashMap<u64, ClientSecret>,
}

impl ClientTable {
    /// Parse table content.
    ///
    /// Format: one `id,base64secret` pair per line; `#` comments and blank
    /// lines are skipped.
    pub fn parse(content: &str) -> Result<Self, ClientsFileError> {
        let mut inner = HashMap::new();
        for (idx, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bad = || ClientsFileError::BadLine {
                line: idx + 1,
                content: raw_line.to_string(),
            };
            let (id_part, key_part) = line.split_once(',').ok_or_else(bad)?;
            let id: u64 = id_part.trim().parse().map_err(|_| bad())?;
            let key = general_purpose::STANDARD
                .decode(key_part.trim())
                .map_err(|_| bad())?;
            inner.insert(id, ClientSecret(key));
        }
        Ok(Self { inner })
    }

    pub fn load(path: &Path) -> Result<Self, ClientsFileError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn lookup(&self, id: u64) -> Option<&[u8]> {
        self.inner.get(&id).map(|s| s.0.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}
