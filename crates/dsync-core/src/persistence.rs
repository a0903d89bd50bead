// ── Model persistence ──
//
// Snapshot storage for the apartment. The engine saves after topology
// changes and loads once at start; restored records stay unverified
// until the bus confirms them.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::CoreError;
use crate::model::Apartment;

/// Blocking snapshot store. Called from a blocking task, never from the
/// dispatcher itself.
pub trait ModelPersistence: Send + Sync {
    fn save(&self, apartment: &Apartment) -> Result<(), CoreError>;

    /// `Ok(None)` when no snapshot exists yet.
    fn load(&self) -> Result<Option<Apartment>, CoreError>;
}

/// Pretty-printed JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ModelPersistence for JsonFilePersistence {
    fn save(&self, apartment: &Apartment) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(apartment)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "apartment snapshot written");
        Ok(())
    }

    fn load(&self) -> Result<Option<Apartment>, CoreError> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut apartment: Apartment = serde_json::from_str(&json)?;
        apartment.mark_unverified();
        Ok(Some(apartment))
    }
}
