use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, stream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::transfer_engine::StrategyKind;
use super::validator;

/// Granularity of body pieces handed to the transport, and therefore of
/// byte-progress callbacks.
const STREAM_PIECE_SIZE: usize = 64 * 1024;

/// Stream of body pieces for an upload request.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// Opaque task identifier. Time-ordered (UUID v7) and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a file's bytes live.
#[derive(Debug, Clone)]
pub enum ContentHandle {
    /// Already in memory.
    Memory(Bytes),
    /// On disk; read lazily by byte range for each request.
    Path(PathBuf),
}

impl ContentHandle {
    /// Stream `len` bytes starting at `offset`.
    ///
    /// A fresh stream is produced on every call so a retried request can
    /// re-send the same range.
    pub async fn stream_range(&self, offset: u64, len: u64) -> io::Result<ByteStream> {
        match self {
            ContentHandle::Memory(data) => {
                let slice = slice_checked(data, offset, len)?;
                let pieces: Vec<io::Result<Bytes>> = (0..slice.len())
                    .step_by(STREAM_PIECE_SIZE)
                    .map(|start| {
                        let end = (start + STREAM_PIECE_SIZE).min(slice.len());
                        Ok(slice.slice(start..end))
                    })
                    .collect();
                Ok(Box::pin(stream::iter(pieces)))
            }
            ContentHandle::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(io::SeekFrom::Start(offset)).await?;
                let reader = ReaderStream::with_capacity(file.take(len), STREAM_PIECE_SIZE);
                Ok(Box::pin(reader))
            }
        }
    }
}

fn slice_checked(data: &Bytes, offset: u64, len: u64) -> io::Result<Bytes> {
    let end = offset.checked_add(len).filter(|end| *end <= data.len() as u64);
    match end {
        Some(end) => Ok(data.slice(offset as usize..end as usize)),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "range {}+{} is outside a {} byte buffer",
                offset,
                len,
                data.len()
            ),
        )),
    }
}

/// Immutable descriptor of a user-selected file.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub name: String,
    pub byte_size: u64,
    pub mime_type: String,
    pub content: ContentHandle,
    /// Explicit request for the resumable chunked strategy.
    pub prefer_resumable: bool,
}

impl FileRef {
    pub fn new(
        name: impl Into<String>,
        byte_size: u64,
        mime_type: impl Into<String>,
        content: ContentHandle,
    ) -> Self {
        Self {
            name: name.into(),
            byte_size,
            mime_type: mime_type.into(),
            content,
            prefer_resumable: false,
        }
    }

    /// In-memory file; the byte size is taken from the buffer.
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self::new(name, data.len() as u64, mime_type, ContentHandle::Memory(data))
    }

    /// File on disk. Size comes from metadata, the content type is guessed
    /// from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self::new(
            name,
            metadata.len(),
            validator::mime_for_path(path),
            ContentHandle::Path(path.to_path_buf()),
        ))
    }

    pub fn resumable(mut self, prefer: bool) -> Self {
        self.prefer_resumable = prefer;
        self
    }

    /// Lowercased extension without the dot, if the name has one.
    pub fn extension(&self) -> Option<String> {
        validator::extension_of(&self.name)
    }
}

/// Content category accepted by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Text,
    Image,
    Audio,
    Video,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Text,
        Category::Image,
        Category::Audio,
        Category::Video,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Text => "text",
            Category::Image => "image",
            Category::Audio => "audio",
            Category::Video => "video",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Active,
    FinalizingRemote,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Holding an active slot.
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Active | TaskStatus::FinalizingRemote)
    }
}

/// Reason attached to a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: String,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Terminal result of a task, as resolved by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { remote_object_id: String },
    Failed(TaskFailure),
    Cancelled,
    /// The id was never issued or the task has already been evicted.
    Unknown,
}

/// Read-only copy of a task for display.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub name: String,
    pub byte_size: u64,
    pub mime_type: String,
    pub category: Category,
    pub status: TaskStatus,
    pub strategy: Option<StrategyKind>,
    pub progress_percent: u8,
    pub bytes_per_sec: Option<f64>,
    pub eta_secs: Option<u64>,
    pub error: Option<TaskFailure>,
    pub remote_object_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
