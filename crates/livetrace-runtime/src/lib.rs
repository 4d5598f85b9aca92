pub mod config;
pub mod discovery;
pub mod emitter;
pub mod error;
pub mod filter;
pub mod live;
pub mod watcher;

pub use config::WatcherConfig;
pub use discovery::{scan_session_files, ChangeListener, DiscoveredFile};
pub use emitter::EventEmitter;
pub use error::{Error, Result};
pub use filter::{EventFilter, FilterPipeline};
pub use live::{HandleOutcome, LiveSession, LiveSessionMap, RetentionPolicy};
pub use watcher::{SessionWatcher, StopHandle, WatcherHandle};
