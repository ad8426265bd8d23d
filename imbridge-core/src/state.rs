//! Persisted session state
//!
//! A minimal JSON blob with what is needed to resume a session without asking
//! for connection parameters again. It is read once when the connection is
//! built and written on checkpoint (session ready) and on shutdown.
//!
//! A missing blob means a fresh session. So does a corrupt one: it is logged
//! and ignored, never fatal.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::UserId;

/// State persistence failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("State I/O failed: {0}")]
    Io(String),

    #[error("State encoding failed: {0}")]
    Encoding(String),
}

/// Resumable connection parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub phone: Option<String>,
    pub server_address: Option<String>,
    pub server_port: Option<u16>,
    pub self_user_id: Option<UserId>,
    /// Hex-encoded engine session, present once authorized
    pub session_data: Option<String>,
}

impl PersistedState {
    pub fn decode(bytes: &[u8]) -> Result<Self, StateError> {
        serde_json::from_slice(bytes).map_err(|e| StateError::Encoding(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, StateError> {
        serde_json::to_vec_pretty(self).map_err(|e| StateError::Encoding(e.to_string()))
    }

    /// Engine session bytes; a malformed hex string counts as absent
    pub fn session_bytes(&self) -> Option<Vec<u8>> {
        let encoded = self.session_data.as_deref()?;
        match hex::decode(encoded) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed engine session in persisted state");
                None
            }
        }
    }

    pub fn set_session_bytes(&mut self, bytes: Option<&[u8]>) {
        self.session_data = bytes.map(hex::encode);
    }

    /// Whether a previous run finished sign-in
    pub fn is_authorized(&self) -> bool {
        self.session_bytes().is_some()
    }
}

/// Storage for the state blob
pub trait StateStore: Send + Sync {
    /// Load the blob; `None` for missing or unreadable state
    fn load(&self) -> Option<PersistedState>;

    fn save(&self, state: &PersistedState) -> Result<(), StateError>;
}

impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    fn load(&self) -> Option<PersistedState> {
        (**self).load()
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        (**self).save(state)
    }
}

/// State blob in a file, replaced atomically on save
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Option<PersistedState> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted state, starting fresh");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read persisted state");
                return None;
            }
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }

        match PersistedState::decode(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt persisted state");
                None
            }
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let bytes = state.encode()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StateError::Io(e.to_string()))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| StateError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StateError::Io(e.to_string()))?;

        debug!(path = %self.path.display(), "Persisted session state");
        Ok(())
    }
}

/// In-memory state, for tests and sessions without a state path
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with raw (possibly corrupt) bytes
    pub fn with_raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: Mutex::new(Some(bytes.into())),
        }
    }

    /// Raw bytes of the last save
    pub fn raw(&self) -> Option<Vec<u8>> {
        self.blob.lock().ok()?.clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Option<PersistedState> {
        let bytes = self.raw()?;
        match PersistedState::decode(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "Ignoring corrupt in-memory state");
                None
            }
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let bytes = state.encode()?;
        let mut blob = self
            .blob
            .lock()
            .map_err(|_| StateError::Io("state lock poisoned".to_string()))?;
        *blob = Some(bytes);
        Ok(())
    }
}
