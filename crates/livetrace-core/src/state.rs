use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::tailer::TailerPosition;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    positions: Vec<TailerPosition>,
}

/// Periodic save/load of tailer positions keyed by file identity.
///
/// The file is written atomically (temp file, fsync, rename). A corrupt or
/// version-mismatched file is ignored and tailing starts fresh.
#[derive(Debug, Clone)]
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PositionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted positions. Missing or unreadable state yields an
    /// empty set; resumption is best effort by design.
    pub fn load(&self) -> Vec<TailerPosition> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "state file unreadable, starting fresh");
                return Vec::new();
            }
        };

        match serde_json::from_str::<StateFile>(&content) {
            Ok(state) if state.version == STATE_VERSION => state.positions,
            Ok(state) => {
                tracing::warn!(
                    path = %self.path.display(),
                    version = state.version,
                    "unsupported state file version, starting fresh"
                );
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "state file corrupt, starting fresh");
                Vec::new()
            }
        }
    }

    /// Look up the stored position for `path`.
    pub fn find<'a>(positions: &'a [TailerPosition], path: &Path) -> Option<&'a TailerPosition> {
        positions.iter().find(|p| p.path == path)
    }

    pub fn save(&self, positions: &[TailerPosition]) -> Result<()> {
        let state = StateFile {
            version: STATE_VERSION,
            positions: positions.to_vec(),
        };
        let payload = serde_json::to_string_pretty(&state)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(payload.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|err| {
            Error::State(format!(
                "failed to move state into place at {}: {}",
                self.path.display(),
                err
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(path: &str, offset: u64) -> TailerPosition {
        TailerPosition {
            path: PathBuf::from(path),
            device: 7,
            inode: 42,
            offset,
            last_modified_ns: 1_736_108_365_000_000_000,
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path().join("state.json"));

        let positions = vec![position("/a/s1.jsonl", 120), position("/a/s2.jsonl", 0)];
        store.save(&positions).unwrap();

        let loaded = store.load();
        assert_eq!(loaded, positions);
        assert_eq!(
            PositionStore::find(&loaded, Path::new("/a/s1.jsonl")).unwrap().offset,
            120
        );
    }

    #[test]
    fn missing_file_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path().join("absent.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupt_file_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{definitely not json").unwrap();
        assert!(PositionStore::new(&path).load().is_empty());
    }

    #[test]
    fn version_mismatch_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"version":99,"positions":[]}"#).unwrap();
        assert!(PositionStore::new(&path).load().is_empty());
    }

    #[test]
    fn save_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path().join("state.json"));
        store.save(&[position("/a/s1.jsonl", 10)]).unwrap();
        store.save(&[position("/a/s1.jsonl", 99)]).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].offset, 99);
        assert!(!store.path().with_extension("tmp").exists());
    }
}
