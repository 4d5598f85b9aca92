pub mod error;
pub mod multi;
pub mod parser;
pub mod state;
pub mod tailer;

pub use error::{Error, Result};
pub use multi::MultiTailer;
pub use parser::EntryParser;
pub use state::PositionStore;
pub use tailer::{FileIdentity, JsonlTailer, TailedLine, TailerPosition};
