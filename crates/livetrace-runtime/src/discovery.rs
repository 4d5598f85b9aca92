use notify::{Event, PollWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;
use walkdir::WalkDir;

use crate::error::Result;

/// One session file found under the base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    /// Name of the parent directory under `projects/`. Opaque; consumers
    /// may decode it, the watcher never does.
    pub project_slug: String,
    /// Filename stem. For main files this equals the session id; sidechain
    /// files are prefixed `agent-` and resolve their session from content.
    pub stem: String,
}

impl DiscoveredFile {
    pub fn is_sidechain_file(&self) -> bool {
        self.stem.starts_with("agent-")
    }
}

/// Scan `base_path/projects/*/*.jsonl`, sorted by path for deterministic
/// iteration.
pub fn scan_session_files(base_path: &Path) -> Vec<DiscoveredFile> {
    let projects = base_path.join("projects");
    if !projects.is_dir() {
        return Vec::new();
    }

    let mut files: Vec<DiscoveredFile> = WalkDir::new(&projects)
        .min_depth(2)
        .max_depth(2)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                return None;
            }
            let stem = path.file_stem()?.to_str()?.to_string();
            let project_slug = path.parent()?.file_name()?.to_str()?.to_string();
            Some(DiscoveredFile {
                path: path.to_path_buf(),
                project_slug,
                stem,
            })
        })
        .collect();

    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

/// Filesystem wakeup channel backed by a notify watcher.
///
/// Callbacks only enqueue; the poll loop drains them and stays the single
/// place where parsing and handler dispatch happen. With notify disabled
/// the listener degrades to a plain sleep.
pub struct ChangeListener {
    _watcher: Option<PollWatcher>,
    _tx: Sender<()>,
    rx: Receiver<()>,
}

impl ChangeListener {
    /// Watch `base_path` recursively for creates and modifications.
    pub fn start(base_path: &Path) -> Result<Self> {
        let (tx, rx) = channel();
        let tx_fs = tx.clone();

        let config = notify::Config::default().with_poll_interval(Duration::from_millis(250));
        let mut watcher = PollWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res
                    && matches!(
                        event.kind,
                        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                    )
                {
                    let _ = tx_fs.send(());
                }
            },
            config,
        )?;
        watcher.watch(base_path, RecursiveMode::Recursive)?;

        Ok(ChangeListener {
            _watcher: Some(watcher),
            _tx: tx,
            rx,
        })
    }

    /// A listener that never wakes early.
    pub fn disabled() -> Self {
        let (tx, rx) = channel();
        ChangeListener {
            _watcher: None,
            _tx: tx,
            rx,
        }
    }

    /// Sleep for up to `timeout`, returning early when a filesystem event
    /// arrives. Queued wakeups are drained so bursts collapse into one tick.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => {
                while self.rx.try_recv().is_ok() {}
                true
            }
            Err(_) => false,
        }
    }
}
