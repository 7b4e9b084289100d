//! Persisted session slots.
//!
//! Two slots survive a restart: the raw credential and the elevated-privilege
//! flag. Backends are synchronous so a write is durable before the in-memory
//! transition becomes visible.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use keyring::Entry;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Application name used for the cache directory and keychain service
const APP_NAME: &str = "sessionward";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Credential,
    Elevated,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::Credential, Slot::Elevated];

    fn key(self) -> &'static str {
        match self {
            Slot::Credential => "credential",
            Slot::Elevated => "elevated",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

pub trait SessionStorage: Send + Sync {
    fn read(&self, slot: Slot) -> Result<Option<String>, StorageError>;

    fn write(&self, slot: Slot, value: &str) -> Result<(), StorageError>;

    /// Removing an empty slot is not an error.
    fn remove(&self, slot: Slot) -> Result<(), StorageError>;
}

/// Which backend to persist into, as named in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl StorageBackend {
    pub fn open(self) -> Result<Arc<dyn SessionStorage>, StorageError> {
        let storage: Arc<dyn SessionStorage> = match self {
            StorageBackend::File => Arc::new(FileStorage::in_cache_dir()?),
            StorageBackend::Keyring => Arc::new(KeyringStorage::new(APP_NAME)),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        };
        Ok(storage)
    }
}

// ===== Memory =====

/// In-process storage. Clones share the same slots, which is how two
/// managers simulate two tabs of one browser profile.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    slots: Arc<Mutex<HashMap<Slot, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn read(&self, slot: Slot) -> Result<Option<String>, StorageError> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots.get(&slot).cloned())
    }

    fn write(&self, slot: Slot, value: &str) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(slot, value.to_string());
        Ok(())
    }

    fn remove(&self, slot: Slot) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(&slot);
        Ok(())
    }
}

// ===== File =====

/// One file per slot in a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// `<cache_dir>/sessionward`
    pub fn in_cache_dir() -> Result<Self, StorageError> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| StorageError::NoDirectory("Could not find cache directory".into()))?;
        Ok(Self::new(cache_dir.join(APP_NAME)))
    }

    fn slot_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(slot.key())
    }
}

impl SessionStorage for FileStorage {
    fn read(&self, slot: Slot) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.slot_path(slot)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { slot, source }),
        }
    }

    fn write(&self, slot: Slot, value: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StorageError::Io { slot, source })?;
        std::fs::write(self.slot_path(slot), value).map_err(|source| StorageError::Io { slot, source })
    }

    fn remove(&self, slot: Slot) -> Result<(), StorageError> {
        match std::fs::remove_file(self.slot_path(slot)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { slot, source }),
        }
    }
}

// ===== Keyring =====

/// OS keychain storage, one entry per slot under a single service name.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, slot: Slot) -> Result<Entry, StorageError> {
        Entry::new(&self.service, slot.key()).map_err(|source| StorageError::Keyring { slot, source })
    }
}

impl SessionStorage for KeyringStorage {
    fn read(&self, slot: Slot) -> Result<Option<String>, StorageError> {
        match self.entry(slot)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(source) => Err(StorageError::Keyring { slot, source }),
        }
    }

    fn write(&self, slot: Slot, value: &str) -> Result<(), StorageError> {
        self.entry(slot)?
            .set_password(value)
            .map_err(|source| StorageError::Keyring { slot, source })
    }

    fn remove(&self, slot: Slot) -> Result<(), StorageError> {
        match self.entry(slot)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(source) => Err(StorageError::Keyring { slot, source }),
        }
    }
}
