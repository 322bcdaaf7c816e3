//! Persistence bridge: snapshot store state to a durable local cache so a
//! restart does not replay the network.
//!
//! Records are `{version, state}` pairs, bincode-encoded and LZ4-compressed
//! under a store-specific key. On load, a version mismatch runs the store's
//! migration hook (over a JSON value, so old shapes stay readable); on any
//! read or write failure the bridge logs and degrades to a cold start — it
//! never throws out of the bridge.
//!
//! The medium is pluggable. `None` (no storage available in this context)
//! makes every call a pass-through no-op.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

/// Persistence errors. These never escape the bridge's load/store surface —
/// they exist for logging and for medium implementations.
#[derive(Debug, Clone)]
pub enum PersistError {
    Io(String),
    Serialization(String),
    Deserialization(String),
    Compression(String),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::Io(e.to_string())
    }
}

/// A durable byte store keyed by namespaced record names.
pub trait StorageMedium: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistError>;
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), PersistError>;
}

/// File-per-key medium rooted in a directory.
pub struct FileMedium {
    root: PathBuf,
}

impl FileMedium {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.snap"))
    }
}

impl StorageMedium for FileMedium {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), PersistError> {
        std::fs::write(self.path_for(key), bytes)?;
        Ok(())
    }
}

/// Versioned on-disk record. State is kept as a JSON value so migrations can
/// reshape it before the typed decode.
#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    version: u32,
    state: serde_json::Value,
}

/// Migration hook: `(persisted_version, persisted_state) -> migrated_state`.
pub type MigrateFn = fn(u32, serde_json::Value) -> serde_json::Value;

/// Snapshot serializer for one store's state.
pub struct SnapshotBridge<S> {
    medium: Option<Arc<dyn StorageMedium>>,
    key: String,
    version: u32,
    migrate: Option<MigrateFn>,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for SnapshotBridge<S> {
    fn clone(&self) -> Self {
        Self {
            medium: self.medium.clone(),
            key: self.key.clone(),
            version: self.version,
            migrate: self.migrate,
            _state: PhantomData,
        }
    }
}

impl<S: Serialize + DeserializeOwned> SnapshotBridge<S> {
    pub fn new(medium: Arc<dyn StorageMedium>, key: impl Into<String>, version: u32) -> Self {
        Self {
            medium: Some(medium),
            key: key.into(),
            version,
            migrate: None,
            _state: PhantomData,
        }
    }

    /// Bridge with no storage medium — every call is a no-op. Not an error:
    /// non-persistent contexts are expected.
    pub fn disabled(key: impl Into<String>, version: u32) -> Self {
        Self {
            medium: None,
            key: key.into(),
            version,
            migrate: None,
            _state: PhantomData,
        }
    }

    pub fn with_migration(mut self, migrate: MigrateFn) -> Self {
        self.migrate = Some(migrate);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the persisted snapshot, if any. Corrupt or unreadable records are
    /// logged and treated as a cold start.
    pub fn load(&self) -> Option<S> {
        let medium = self.medium.as_ref()?;
        let bytes = match medium.read(&self.key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Snapshot read failed for {}: {e}", self.key);
                return None;
            }
        };
        match self.decode(&bytes) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Snapshot decode failed for {}: {e}", self.key);
                None
            }
        }
    }

    /// Persist a snapshot. The caller passes already-partialized state — all
    /// optimistic entities stripped, pending flags cleared — so a crash
    /// mid-mutation never resurrects a ghost entity on reload.
    pub fn store(&self, state: &S) {
        let Some(medium) = self.medium.as_ref() else {
            return;
        };
        match self.encode(state) {
            Ok(bytes) => {
                if let Err(e) = medium.write(&self.key, &bytes) {
                    log::warn!("Snapshot write failed for {}: {e}", self.key);
                }
            }
            Err(e) => log::warn!("Snapshot encode failed for {}: {e}", self.key),
        }
    }

    fn encode(&self, state: &S) -> Result<Vec<u8>, PersistError> {
        let record = SnapshotRecord {
            version: self.version,
            state: serde_json::to_value(state)
                .map_err(|e| PersistError::Serialization(e.to_string()))?,
        };
        let raw = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| PersistError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Option<S>, PersistError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| PersistError::Compression(e.to_string()))?;
        let (record, _): (SnapshotRecord, _) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| PersistError::Deserialization(e.to_string()))?;

        let state_value = if record.version == self.version {
            record.state
        } else if let Some(migrate) = self.migrate {
            log::info!(
                "Migrating snapshot {} from v{} to v{}",
                self.key,
                record.version,
                self.version
            );
            migrate(record.version, record.state)
        } else {
            log::warn!(
                "Snapshot {} has version {} (want {}), discarding",
                self.key,
                record.version,
                self.version
            );
            return Ok(None);
        };

        let state = serde_json::from_value(state_value)
            .map_err(|e| PersistError::Deserialization(e.to_string()))?;
        Ok(Some(state))
    }
}
