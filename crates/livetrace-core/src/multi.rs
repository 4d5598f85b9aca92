use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::tailer::{JsonlTailer, TailedLine, TailerPosition};

/// Coordinates tailers over a dynamic set of files.
///
/// One poll cycle visits files in path order, so output is deterministic
/// per file and stable relative to the set of paths known before the cycle
/// began. Ordering across files carries no meaning.
#[derive(Debug, Default)]
pub struct MultiTailer {
    tailers: BTreeMap<PathBuf, JsonlTailer>,
}

impl MultiTailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tailer: JsonlTailer) {
        self.tailers.insert(tailer.path().to_path_buf(), tailer);
    }

    pub fn remove(&mut self, path: &Path) -> Option<JsonlTailer> {
        self.tailers.remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.tailers.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.tailers.keys().map(|p| p.as_path())
    }

    pub fn len(&self) -> usize {
        self.tailers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tailers.is_empty()
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut JsonlTailer> {
        self.tailers.get_mut(path)
    }

    /// Read every file once, keeping per-file failures separate so a broken
    /// file does not hide progress on the others.
    pub fn poll_files(&mut self) -> Vec<(PathBuf, Result<Vec<TailedLine>>)> {
        self.tailers
            .iter_mut()
            .map(|(path, tailer)| (path.clone(), tailer.read_new()))
            .collect()
    }

    /// Flattened view of one poll cycle: `(path, line)` pairs in file order.
    /// Per-file errors are dropped here; callers that need them use
    /// [`MultiTailer::poll_files`].
    pub fn poll(&mut self) -> Vec<(PathBuf, TailedLine)> {
        self.poll_files()
            .into_iter()
            .filter_map(|(path, result)| result.ok().map(|lines| (path, lines)))
            .flat_map(|(path, lines)| lines.into_iter().map(move |line| (path.clone(), line)))
            .collect()
    }

    /// Checkpoints for every tailed file.
    pub fn positions(&self) -> Vec<TailerPosition> {
        self.tailers.values().map(|t| t.position()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_entry(path: &Path, uuid: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        writeln!(
            file,
            r#"{{"uuid":"{}","timestamp":"2025-01-05T20:19:25Z","type":"user","sessionId":"s","message":{{"role":"user","content":[{{"type":"text","text":"hi"}}]}}}}"#,
            uuid
        )
        .unwrap();
    }

    #[test]
    fn polls_all_files_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");
        File::create(&a).unwrap();
        File::create(&b).unwrap();
        write_entry(&a, "a1");
        write_entry(&b, "b1");

        let mut multi = MultiTailer::new();
        multi.add(JsonlTailer::open(&b).unwrap());
        multi.add(JsonlTailer::open(&a).unwrap());

        let batch = multi.poll();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].0, a);
        assert_eq!(batch[1].0, b);

        // No growth, nothing new.
        assert!(multi.poll().is_empty());
    }

    #[test]
    fn remove_stops_tailing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jsonl");
        File::create(&a).unwrap();

        let mut multi = MultiTailer::new();
        multi.add(JsonlTailer::open(&a).unwrap());
        assert!(multi.contains(&a));
        assert!(multi.remove(&a).is_some());
        assert!(multi.is_empty());

        write_entry(&a, "a1");
        assert!(multi.poll().is_empty());
    }
}
