// Client-local memory of "which participant am I" per session, so a client
// that reconnects is recognized instead of joining twice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::debug;

use crate::model::{ParticipantId, SessionId};

pub trait ParticipantRefs: Send + Sync {
    fn load(&self, session: &SessionId) -> Result<Option<ParticipantId>>;
    fn save(&self, session: &SessionId, participant: ParticipantId) -> Result<()>;
    fn forget(&self, session: &SessionId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryRefs
// ---------------------------------------------------------------------------

/// Process-local slot; what a server-side connection uses, seeded from the
/// id the remote client presents.
#[derive(Default)]
pub struct MemoryRefs {
    slots: Mutex<HashMap<SessionId, ParticipantId>>,
}

impl MemoryRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(session: SessionId, participant: ParticipantId) -> Self {
        let refs = Self::default();
        refs.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session, participant);
        refs
    }
}

impl ParticipantRefs for MemoryRefs {
    fn load(&self, session: &SessionId) -> Result<Option<ParticipantId>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots.get(session).copied())
    }

    fn save(&self, session: &SessionId, participant: ParticipantId) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(session.clone(), participant);
        Ok(())
    }

    fn forget(&self, session: &SessionId) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(session);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileRefs
// ---------------------------------------------------------------------------

/// JSON file mapping session ids to participant ids. Rewritten in full on
/// every change; the file is tiny.
pub struct FileRefs {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRefs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `participants.json` in the platform data directory
    /// (e.g. `~/.local/share/pointr` on Linux).
    pub fn in_data_dir() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("dev", "pointr", "pointr")
            .context("no home directory to store participant references in")?;
        Ok(Self::new(dirs.data_dir().join("participants.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<SessionId, ParticipantId>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let map = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(map)
    }

    fn write_all(&self, map: &HashMap<SessionId, ParticipantId>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(map).context("failed to serialize references")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        debug!("wrote {} participant references to {}", map.len(), self.path.display());
        Ok(())
    }
}

impl ParticipantRefs for FileRefs {
    fn load(&self, session: &SessionId) -> Result<Option<ParticipantId>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_all()?.get(session).copied())
    }

    fn save(&self, session: &SessionId, participant: ParticipantId) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_all()?;
        map.insert(session.clone(), participant);
        self.write_all(&map)
    }

    fn forget(&self, session: &SessionId) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_all()?;
        if map.remove(session).is_some() {
            self.write_all(&map)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sid(name: &str) -> SessionId {
        SessionId::parse(name).unwrap()
    }

    #[test]
    fn memory_slot_is_per_session() {
        let refs = MemoryRefs::new();
        let me = Uuid::new_v4();
        assert_eq!(refs.load(&sid("a")).unwrap(), None);

        refs.save(&sid("a"), me).unwrap();
        assert_eq!(refs.load(&sid("a")).unwrap(), Some(me));
        assert_eq!(refs.load(&sid("b")).unwrap(), None);

        refs.forget(&sid("a")).unwrap();
        assert_eq!(refs.load(&sid("a")).unwrap(), None);
    }

    #[test]
    fn seeded_memory_slot() {
        let me = Uuid::new_v4();
        let refs = MemoryRefs::with(sid("a"), me);
        assert_eq!(refs.load(&sid("a")).unwrap(), Some(me));
    }

    #[test]
    fn file_slot_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("participants.json");
        let me = Uuid::new_v4();

        FileRefs::new(&path).save(&sid("a"), me).unwrap();
        FileRefs::new(&path).save(&sid("b"), Uuid::new_v4()).unwrap();

        let reopened = FileRefs::new(&path);
        assert_eq!(reopened.load(&sid("a")).unwrap(), Some(me));

        reopened.forget(&sid("a")).unwrap();
        assert_eq!(FileRefs::new(&path).load(&sid("a")).unwrap(), None);
        assert!(FileRefs::new(&path).load(&sid("b")).unwrap().is_some());
    }

    #[test]
    fn missing_file_means_first_visit() {
        let dir = tempfile::tempdir().unwrap();
        let refs = FileRefs::new(dir.path().join("absent.json"));
        assert_eq!(refs.load(&sid("a")).unwrap(), None);
        refs.forget(&sid("a")).unwrap();
        assert!(!refs.path().exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("participants.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(FileRefs::new(&path).load(&sid("a")).is_err());
    }
}
