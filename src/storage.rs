//! Key/value persistence for the token set and the pending PKCE verifier.
//!
//! [`MemoryStorage`] lives as long as the process and stands in for page-scoped
//! storage; [`FileStorage`] survives restarts. Concurrent writers to the same
//! file are last-writer-wins.

use crate::error::{AppError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, error, info};

pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    fn name(&self) -> &str {
        "unknown"
    }
}

fn poisoned<T>(_: T) -> AppError {
    AppError::Storage("storage lock poisoned".into())
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().map_err(poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[derive(Debug)]
pub struct FileStorage {
    entries: RwLock<HashMap<String, String>>,
    path: PathBuf,
}

impl FileStorage {
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("valentine-spotify").join("storage.json"))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::Storage(format!("Failed to create storage dir: {}", e)))?;
        }

        let entries = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<HashMap<String, String>>(&data) {
                Ok(entries) => {
                    info!("Loaded {} stored entries from {}", entries.len(), path.display());
                    entries
                }
                Err(e) => {
                    error!("Ignoring unreadable storage file {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No existing storage file found");
                HashMap::new()
            }
            Err(e) => {
                return Err(AppError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            entries: RwLock::new(entries),
            path,
        })
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<()> {
        let data = serde_json::to_string_pretty(entries)
            .map_err(|e| AppError::Storage(format!("Failed to serialize storage: {}", e)))?;
        fs::write(&self.path, data)
            .map_err(|e| AppError::Storage(format!("Failed to write storage: {}", e)))?;
        debug!("Saved {} entries to disk", entries.len());
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().map_err(poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}
