//! Durable slot for the pronunciation history

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::PronunciationHistory;
use crate::Result;

/// Key-value slot holding the serialized history
pub trait HistoryStore: Send + Sync {
    /// Read the stored history; `Ok(None)` when nothing is stored yet
    ///
    /// # Errors
    ///
    /// Returns error if the slot exists but cannot be read or parsed
    fn load(&self) -> Result<Option<PronunciationHistory>>;

    /// Overwrite the stored history
    ///
    /// # Errors
    ///
    /// Returns error if the slot cannot be written
    fn save(&self, history: &PronunciationHistory) -> Result<()>;
}

/// JSON file on local disk
#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    path: PathBuf,
}

impl FileHistoryStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for FileHistoryStore {
    fn load(&self) -> Result<Option<PronunciationHistory>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn save(&self, history: &PronunciationHistory) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write then rename so a crash never leaves a truncated slot
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(history)?)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::trace!(path = %self.path.display(), entries = history.len(), "history saved");
        Ok(())
    }
}

/// In-process slot
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    slot: Mutex<Option<PronunciationHistory>>,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self) -> Result<Option<PronunciationHistory>> {
        Ok(self.slot.lock().ok().and_then(|slot| slot.clone()))
    }

    fn save(&self, history: &PronunciationHistory) -> Result<()> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(history.clone());
        }
        Ok(())
    }
}
