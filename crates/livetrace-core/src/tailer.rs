use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Upper bound on bytes read from one file per poll, so a fast writer
/// cannot starve the other tailed files.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Consecutive-failure backoff is capped at this many skipped poll ticks.
const MAX_BACKOFF_TICKS: u32 = 16;

/// Stable identity of an inode, used to decide whether a resume position
/// still refers to the same underlying file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        FileIdentity {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn of(_metadata: &Metadata) -> Self {
        FileIdentity {
            device: 0,
            inode: 0,
        }
    }
}

/// Checkpointed read position for one file. The offset always points at the
/// first unread byte; buffered partial-line bytes are excluded until their
/// line completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailerPosition {
    pub path: PathBuf,
    pub device: u64,
    pub inode: u64,
    pub offset: u64,
    pub last_modified_ns: u64,
}

/// One complete line yielded by the tailer.
#[derive(Debug, Clone)]
pub enum TailedLine {
    /// Line decoded as a JSON object.
    Entry(Value),
    /// Line that failed JSON decoding; the parser turns this into an
    /// `error` event and tailing continues.
    Malformed { raw: String, error: String },
}

/// Incremental reader over one append-only JSONL file.
///
/// Handles partial writes (unterminated trailing lines are buffered),
/// rotation (inode change resets to offset 0), truncation (size below the
/// committed offset resets to 0), and transient IO errors (exponential
/// poll-tick backoff, reset on the next successful read).
#[derive(Debug)]
pub struct JsonlTailer {
    path: PathBuf,
    identity: FileIdentity,
    offset: u64,
    partial: Vec<u8>,
    chunk_size: usize,
    last_modified_ns: u64,
    failures: u32,
    skip_ticks: u32,
}

impl JsonlTailer {
    /// Open a tailer at offset 0.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path)?;
        Ok(Self::from_parts(path, &metadata, 0))
    }

    /// Open a tailer positioned at the current end of the file, so only
    /// entries appended after this call are yielded.
    pub fn open_at_end(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path)?;
        let offset = last_line_boundary(&path, &metadata)?;
        Ok(Self::from_parts(path, &metadata, offset))
    }

    /// Open a tailer, adopting `position` when its device and inode still
    /// match the file on disk. A stale or mismatched position falls back to
    /// offset 0.
    pub fn resume(path: impl Into<PathBuf>, position: &TailerPosition) -> Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path)?;
        let identity = FileIdentity::of(&metadata);
        let offset = if identity.device == position.device
            && identity.inode == position.inode
            && position.offset <= metadata.len()
        {
            position.offset
        } else {
            0
        };
        Ok(Self::from_parts(path, &metadata, offset))
    }

    fn from_parts(path: PathBuf, metadata: &Metadata, offset: u64) -> Self {
        JsonlTailer {
            path,
            identity: FileIdentity::of(metadata),
            offset,
            partial: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            last_modified_ns: modified_ns(metadata),
            failures: 0,
            skip_ticks: 0,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current checkpoint, suitable for persistence.
    pub fn position(&self) -> TailerPosition {
        TailerPosition {
            path: self.path.clone(),
            device: self.identity.device,
            inode: self.identity.inode,
            offset: self.offset,
            last_modified_ns: self.last_modified_ns,
        }
    }

    /// Read any newly appended complete lines. Returns an empty batch when
    /// the file has not grown or a backoff window is active.
    pub fn read_new(&mut self) -> Result<Vec<TailedLine>> {
        if self.skip_ticks > 0 {
            self.skip_ticks -= 1;
            return Ok(Vec::new());
        }

        match self.read_inner() {
            Ok(lines) => {
                self.failures = 0;
                Ok(lines)
            }
            Err(err) => {
                self.failures = self.failures.saturating_add(1);
                self.skip_ticks = (1u32 << (self.failures - 1).min(4)).min(MAX_BACKOFF_TICKS);
                Err(err)
            }
        }
    }

    fn read_inner(&mut self) -> Result<Vec<TailedLine>> {
        let metadata = std::fs::metadata(&self.path)?;
        let identity = FileIdentity::of(&metadata);

        // Rotation: new inode, or the file shrank below the committed
        // offset. Either way the old checkpoint is meaningless.
        if identity != self.identity || metadata.len() < self.offset {
            self.identity = identity;
            self.offset = 0;
            self.partial.clear();
        }
        self.last_modified_ns = modified_ns(&metadata);

        // Buffered partial bytes that the file no longer contains were
        // rolled back by the writer; drop them and re-read from the
        // committed offset.
        if metadata.len() < self.offset + self.partial.len() as u64 {
            self.partial.clear();
        }

        let read_from = self.offset + self.partial.len() as u64;
        if metadata.len() <= read_from {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(read_from))?;
        let mut buf = Vec::new();
        file.take(self.chunk_size as u64).read_to_end(&mut buf)?;
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=newline).collect();
            self.offset += line.len() as u64;

            let text = trim_line(&line);
            if text.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Value>(text) {
                Ok(value) => lines.push(TailedLine::Entry(value)),
                Err(err) => lines.push(TailedLine::Malformed {
                    raw: String::from_utf8_lossy(text).into_owned(),
                    error: err.to_string(),
                }),
            }
        }

        Ok(lines)
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    let mut start = 0;
    while start < end && line[start].is_ascii_whitespace() {
        start += 1;
    }
    &line[start..end]
}

/// Offset just past the last terminated line, so tailers opened at the end
/// of a file still pick up an in-flight partial line once it completes.
fn last_line_boundary(path: &Path, metadata: &Metadata) -> Result<u64> {
    let len = metadata.len();
    if len == 0 {
        return Ok(0);
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }
    // Walk back to the previous newline.
    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    Ok(contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|pos| pos as u64 + 1)
        .unwrap_or(0))
}

fn modified_ns(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
