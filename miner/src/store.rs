//! Persistence for stats and bet history.
//!
//! Stats and the ledger are independent documents: either may be missing
//! (first run, or cleared by hand) and loads as its default.
//!
//! [JsonStore] writes each document to a temporary file, syncs it and renames
//! it into place, so a crash mid-write leaves the previous version intact.

use orebot_types::{Ledger, LedgerError, Stats};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use thiserror::Error;

const STATS_FILE: &str = "stats.json";
const LEDGER_FILE: &str = "history.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid history in {path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: LedgerError,
    },
    #[error("could not encode {0}: {1}")]
    Encode(&'static str, #[source] serde_json::Error),
}

/// Settings-and-history store.
pub trait Store: Send + Sync + 'static {
    fn load_stats(&self) -> Result<Stats, StoreError>;
    fn save_stats(&self, stats: &Stats) -> Result<(), StoreError>;
    fn load_ledger(&self) -> Result<Ledger, StoreError>;
    fn save_ledger(&self, ledger: &Ledger) -> Result<(), StoreError>;
}

/// JSON documents in a data directory.
#[derive(Clone, Debug)]
pub struct JsonStore {
    directory: PathBuf,
}

impl JsonStore {
    /// Open (creating if needed) the data directory.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(|source| StoreError::Io {
            path: directory.clone(),
            source,
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn load<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, StoreError> {
        let path = self.directory.join(name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode { path, source })
    }

    fn save<T: Serialize>(&self, name: &'static str, value: &T) -> Result<(), StoreError> {
        let data =
            serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode(name, source))?;
        let path = self.directory.join(name);
        let temp_path = path.with_extension("tmp");
        let io = |source| StoreError::Io {
            path: temp_path.clone(),
            source,
        };
        {
            let mut file = std::fs::File::create(&temp_path).map_err(io)?;
            file.write_all(&data).map_err(io)?;
            file.sync_all().map_err(io)?;
        }
        std::fs::rename(&temp_path, &path).map_err(|source| StoreError::Io { path, source })
    }
}

impl Store for JsonStore {
    fn load_stats(&self) -> Result<Stats, StoreError> {
        self.load(STATS_FILE)
    }

    fn save_stats(&self, stats: &Stats) -> Result<(), StoreError> {
        self.save(STATS_FILE, stats)
    }

    fn load_ledger(&self) -> Result<Ledger, StoreError> {
        let ledger: Ledger = self.load(LEDGER_FILE)?;
        ledger.validate().map_err(|source| StoreError::Invalid {
            path: self.directory.join(LEDGER_FILE),
            source,
        })?;
        Ok(ledger)
    }

    fn save_ledger(&self, ledger: &Ledger) -> Result<(), StoreError> {
        self.save(LEDGER_FILE, ledger)
    }
}

/// In-memory store. Clones share contents.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<(Stats, Ledger)>>,
}

impl MemoryStore {
    pub fn new(stats: Stats, ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(Mutex::new((stats, ledger))),
        }
    }

    pub fn stats(&self) -> Stats {
        self.lock().0
    }

    pub fn ledger(&self) -> Ledger {
        self.lock().1.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (Stats, Ledger)> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Store for MemoryStore {
    fn load_stats(&self) -> Result<Stats, StoreError> {
        Ok(self.stats())
    }

    fn save_stats(&self, stats: &Stats) -> Result<(), StoreError> {
        self.lock().0 = *stats;
        Ok(())
    }

    fn load_ledger(&self) -> Result<Ledger, StoreError> {
        Ok(self.ledger())
    }

    fn save_ledger(&self, ledger: &Ledger) -> Result<(), StoreError> {
        self.lock().1 = ledger.clone();
        Ok(())
    }
}
