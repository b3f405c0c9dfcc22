//! JSON-file state store: one document per workflow under `.stageflow/state/`.

use fs2::FileExt;
use stageflow_common::WorkflowState;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{StateStore, stamped};
use crate::errors::{Result, StageflowError};
use crate::util::validate_id;

pub struct FileStateStore {
    state_dir: PathBuf,
    archive_dir: PathBuf,
}

impl FileStateStore {
    pub fn new(state_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    pub fn document_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!(".{}.lock", id))
    }

    /// Hold an exclusive advisory lock on the workflow for the lifetime of
    /// the returned handle.
    fn lock(&self, id: &str) -> Result<File> {
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| StageflowError::io(&self.state_dir, e))?;
        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StageflowError::io(&path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| StageflowError::io(&path, e))?;
        Ok(file)
    }

    fn read_document(&self, id: &str) -> Result<WorkflowState> {
        let path = self.document_path(id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StageflowError::NotFound { id: id.to_string() });
            }
            Err(e) => return Err(StageflowError::io(&path, e)),
        };
        serde_json::from_str(&content)
            .map_err(|source| StageflowError::MalformedState { path, source })
    }

    /// Write to a temp file in the same directory, fsync, then rename over
    /// the document.
    fn write_document(&self, state: &WorkflowState) -> Result<()> {
        let path = self.document_path(&state.id);
        let payload = serde_json::to_vec_pretty(state)
            .map_err(|e| anyhow::anyhow!("failed to serialize workflow '{}': {}", state.id, e))?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.state_dir)
            .map_err(|e| StageflowError::io(&self.state_dir, e))?;
        temp.write_all(&payload)
            .map_err(|e| StageflowError::io(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| StageflowError::io(temp.path(), e))?;
        temp.persist(&path)
            .map_err(|e| StageflowError::io(&path, e.error))?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn create(&self, state: &WorkflowState) -> Result<u64> {
        validate_id(&state.id)?;
        let _lock = self.lock(&state.id)?;
        if self.document_path(&state.id).exists() {
            return Err(StageflowError::AlreadyExists {
                id: state.id.clone(),
            });
        }
        self.write_document(&stamped(state, 1))?;
        info!(workflow = %state.id, "Created workflow state");
        Ok(1)
    }

    fn load(&self, id: &str) -> Result<WorkflowState> {
        validate_id(id)?;
        self.read_document(id)
    }

    fn save(&self, state: &WorkflowState, expected_version: u64) -> Result<u64> {
        validate_id(&state.id)?;
        let _lock = self.lock(&state.id)?;

        let current = self.read_document(&state.id)?;
        if current.version != expected_version {
            debug!(
                workflow = %state.id,
                expected = expected_version,
                actual = current.version,
                "Version conflict"
            );
            return Err(StageflowError::VersionConflict {
                id: state.id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let version = expected_version + 1;
        self.write_document(&stamped(state, version))?;
        debug!(workflow = %state.id, version, "Saved workflow state");
        Ok(version)
    }

    fn exists(&self, id: &str) -> bool {
        validate_id(id).is_ok() && self.document_path(id).exists()
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StageflowError::io(&self.state_dir, e)),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| document_id(&path))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn archive(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let lock = self.lock(id)?;
        let source = self.document_path(id);
        if !source.exists() {
            return Err(StageflowError::NotFound { id: id.to_string() });
        }

        std::fs::create_dir_all(&self.archive_dir)
            .map_err(|e| StageflowError::io(&self.archive_dir, e))?;
        let mut target = self.archive_dir.join(format!("{}.json", id));
        if target.exists() {
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
            target = self.archive_dir.join(format!("{}-{}.json", id, stamp));
        }
        std::fs::rename(&source, &target).map_err(|e| StageflowError::io(&source, e))?;

        drop(lock);
        let lock_path = self.lock_path(id);
        if let Err(e) = std::fs::remove_file(&lock_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %lock_path.display(), error = %e, "Could not remove lock file");
        }
        info!(workflow = %id, archive = %target.display(), "Archived workflow");
        Ok(())
    }
}

fn document_id(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    if stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageflow_common::{FeatureProfile, Phase};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn make_store(dir: &Path) -> FileStateStore {
        FileStateStore::new(dir.join("state"), dir.join("archive"))
    }

    fn state(id: &str) -> WorkflowState {
        WorkflowState::new(id, "test feature", FeatureProfile::default())
    }

    #[test]
    fn test_create_and_load() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());

        assert_eq!(store.create(&state("auth")).unwrap(), 1);
        let loaded = store.load("auth").unwrap();
        assert_eq!(loaded.id, "auth");
        assert_eq!(loaded.version, 1);
        assert!(store.exists("auth"));
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        store.create(&state("auth")).unwrap();
        assert!(matches!(
            store.create(&state("auth")),
            Err(StageflowError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        assert!(matches!(
            store.load("ghost"),
            Err(StageflowError::NotFound { .. })
        ));
    }

    #[test]
    fn test_save_bumps_version() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        store.create(&state("auth")).unwrap();

        let mut loaded = store.load("auth").unwrap();
        loaded.phase = Phase::Clarify;
        let v = store.save(&loaded, loaded.version).unwrap();
        assert_eq!(v, 2);

        let reloaded = store.load("auth").unwrap();
        assert_eq!(reloaded.version, 2);
        assert_eq!(reloaded.phase, Phase::Clarify);
    }

    #[test]
    fn test_stale_save_conflicts() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        store.create(&state("auth")).unwrap();

        let a = store.load("auth").unwrap();
        let b = store.load("auth").unwrap();
        store.save(&a, a.version).unwrap();

        match store.save(&b, b.version) {
            Err(StageflowError::VersionConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_writers_never_both_win() {
        let dir = tempdir().unwrap();
        let store = Arc::new(make_store(dir.path()));
        store.create(&state("race")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut s = store.load("race").unwrap();
                    s.signals.insert(format!("writer-{}", i), i as f64);
                    store.save(&s, s.version).is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        let final_state = store.load("race").unwrap();
        assert!(wins >= 1);
        assert_eq!(final_state.version, 1 + wins as u64);
    }

    #[test]
    fn test_malformed_document() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(store.document_path("broken"), "{ not json").unwrap();

        let err = store.load("broken").unwrap_err();
        assert!(matches!(err, StageflowError::MalformedState { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_list_skips_locks_and_temp_files() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        store.create(&state("b-feature")).unwrap();
        store.create(&state("a-feature")).unwrap();
        std::fs::write(dir.path().join("state/notes.txt"), "x").unwrap();

        assert_eq!(store.list().unwrap(), vec!["a-feature", "b-feature"]);
    }

    #[test]
    fn test_list_without_state_dir() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_archive_moves_document() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        store.create(&state("auth")).unwrap();

        store.archive("auth").unwrap();
        assert!(!store.exists("auth"));
        assert!(dir.path().join("archive/auth.json").exists());
        assert!(!store.lock_path("auth").exists());
        assert!(store.list().unwrap().is_empty());

        // A second workflow with the same id archives alongside the first
        store.create(&state("auth")).unwrap();
        store.archive("auth").unwrap();
        let archived = std::fs::read_dir(dir.path().join("archive")).unwrap().count();
        assert_eq!(archived, 2);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let store = make_store(dir.path());
        assert!(matches!(
            store.load("../secrets"),
            Err(StageflowError::InvalidSlug(_))
        ));
    }
}
