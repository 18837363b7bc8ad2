use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use super::{KnowledgeBase, KnowledgeError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KnowledgeSource {
    Builtin,
    File(PathBuf),
}

impl KnowledgeSource {
    pub fn from_path(path: Option<PathBuf>) -> Self {
        path.map(Self::File).unwrap_or(Self::Builtin)
    }

    pub fn load(&self) -> Result<KnowledgeBase, KnowledgeError> {
        match self {
            Self::Builtin => KnowledgeBase::builtin(),
            Self::File(path) => KnowledgeBase::load(path),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Builtin => "builtin".to_owned(),
            Self::File(path) => path.display().to_string(),
        }
    }
}

/// Shared holder for the active knowledge snapshot. Requests take a
/// snapshot once and keep it for their whole run; `reload` swaps the Arc.
pub struct KnowledgeStore {
    source: KnowledgeSource,
    current: RwLock<Arc<KnowledgeBase>>,
    reload_lock: Mutex<()>,
}

impl KnowledgeStore {
    pub fn open(source: KnowledgeSource) -> Result<Self, KnowledgeError> {
        let knowledge = source.load()?;
        info!(
            event_name = "knowledge.loaded",
            source = %source.label(),
            fingerprint = %knowledge.fingerprint(),
            "knowledge base loaded"
        );
        Ok(Self::with_knowledge(source, knowledge))
    }

    pub fn with_knowledge(source: KnowledgeSource, knowledge: KnowledgeBase) -> Self {
        Self { source, current: RwLock::new(Arc::new(knowledge)), reload_lock: Mutex::new(()) }
    }

    pub fn source(&self) -> &KnowledgeSource {
        &self.source
    }

    pub fn snapshot(&self) -> Arc<KnowledgeBase> {
        match self.current.read() {
            Ok(current) => Arc::clone(&current),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-reads the source. On failure the previous snapshot stays active.
    pub fn reload(&self) -> Result<Arc<KnowledgeBase>, KnowledgeError> {
        let _guard = match self.reload_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let fresh = match self.source.load() {
            Ok(knowledge) => Arc::new(knowledge),
            Err(error) => {
                warn!(
                    event_name = "knowledge.reload_failed",
                    source = %self.source.label(),
                    error = %error,
                    "knowledge reload failed; keeping previous snapshot"
                );
                return Err(error);
            }
        };

        match self.current.write() {
            Ok(mut current) => *current = Arc::clone(&fresh),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&fresh),
        }
        info!(
            event_name = "knowledge.reloaded",
            source = %self.source.label(),
            fingerprint = %fresh.fingerprint(),
            "knowledge base reloaded"
        );
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{KnowledgeSource, KnowledgeStore};

    const SMALL: &str = r#"
[codes."31622"]
description = "Diagnostic bronchoscopy"
allowed = "140.00"
"#;

    const LARGER: &str = r#"
[codes."31622"]
description = "Diagnostic bronchoscopy"
allowed = "140.00"

[codes."31624"]
description = "BAL"
allowed = "152.00"
"#;

    #[test]
    fn reload_swaps_snapshot_without_touching_held_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("knowledge.toml");
        fs::write(&path, SMALL).expect("write knowledge");

        let store = KnowledgeStore::open(KnowledgeSource::File(path.clone())).expect("open");
        let held = store.snapshot();
        assert!(!held.is_valid("31624"));

        fs::write(&path, LARGER).expect("rewrite knowledge");
        store.reload().expect("reload");

        assert!(store.snapshot().is_valid("31624"));
        assert!(!held.is_valid("31624"), "held snapshot is immutable");
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("knowledge.toml");
        fs::write(&path, SMALL).expect("write knowledge");

        let store = KnowledgeStore::open(KnowledgeSource::File(path.clone())).expect("open");
        let before = store.snapshot().fingerprint().to_owned();

        fs::write(&path, "[codes.\"31622\"\nbroken").expect("corrupt knowledge");
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().fingerprint(), before);
    }

    #[test]
    fn builtin_source_is_the_default() {
        assert_eq!(KnowledgeSource::from_path(None), KnowledgeSource::Builtin);
        let store = KnowledgeStore::open(KnowledgeSource::Builtin).expect("builtin");
        assert!(store.snapshot().is_valid("31653"));
    }
}
