use std::fmt;

/// Result type for livetrace-runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the watcher layer
#[derive(Debug)]
pub enum Error {
    /// Tailing/parsing layer error
    Core(livetrace_core::Error),

    /// IO operation failed
    Io(std::io::Error),

    /// Filesystem notification backend failed
    Notify(notify::Error),

    /// Configuration error
    Config(String),

    /// Watcher could not be brought up at all
    Setup(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Core(err) => write!(f, "Core error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Notify(err) => write!(f, "Notify error: {}", err),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Setup(msg) => write!(f, "Setup error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Core(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Notify(err) => Some(err),
            Error::Config(_) | Error::Setup(_) => None,
        }
    }
}

impl From<livetrace_core::Error> for Error {
    fn from(err: livetrace_core::Error) -> Self {
        Error::Core(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Notify(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
