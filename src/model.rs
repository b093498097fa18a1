use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::error::truncate_utf8_safe;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("file name cannot be empty")]
    EmptyFileName,

    #[error("file name exceeds {max} bytes (got {len})")]
    FileNameTooLong { len: usize, max: usize },

    #[error("file name contains control characters")]
    InvalidFileName,

    #[error("file is empty")]
    EmptyFile,

    #[error("file size {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("file content ({detected}) does not match declared type {declared}")]
    ContentMismatch { declared: String, detected: String },
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Task identifier, assigned by the store and stable for the task's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an item record owned by the backend.
///
/// Backends hand these out as either JSON strings or integers; both
/// deserialize into the same textual form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ItemId(String);

impl ItemId {
    const MAX_LENGTH: usize = 256;

    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(ValidationError::InvalidId("ItemId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ValidationError::InvalidId(format!(
                "ItemId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ValidationError::InvalidId(
                "ItemId contains control characters".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => ItemId::new(s).map_err(serde::de::Error::custom),
            Raw::Number(n) => Ok(ItemId::from(n)),
        }
    }
}

// ============================================================================
// Source files
// ============================================================================

/// Handle to the source image. Never carries the bytes themselves.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub size_bytes: u64,
    pub content_type: String,
    pub digest_hex: String,
}

/// An image picked by the user, ready to be uploaded.
#[derive(Clone, Debug)]
pub struct SourceFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl SourceFile {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into().trim().to_ascii_lowercase(),
            bytes: bytes.into(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn file_ref(&self) -> FileRef {
        FileRef {
            size_bytes: self.size_bytes(),
            content_type: self.content_type.clone(),
            digest_hex: blake3::hash(&self.bytes).to_hex().to_string(),
        }
    }
}

/// User-supplied fields sent along with the image when creating the item.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// The record the backend creates for an analysed image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl ItemRecord {
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            name: None,
            category: None,
            image_url: None,
            attributes: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Uploading,
    Analyzing,
    Success,
    Error,
}

impl TaskStatus {
    pub fn state_name(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error)
    }

    /// Whether the progress surface should be showing a task in this status.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Uploading | TaskStatus::Analyzing)
    }

    /// The only walk is `queued -> uploading -> analyzing* -> success`;
    /// `error` is reachable from any non-terminal status.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::{Analyzing, Error, Queued, Success, Uploading};
        match (self, next) {
            (Success | Error, _) => false,
            (_, Error) | (Queued, Uploading) | (Uploading, Analyzing) | (Analyzing, Success) => {
                true
            }
            (current, next) => current == next,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// What a caller hands the store to register a new task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub file_name: String,
    pub file_ref: FileRef,
}

impl TaskDescriptor {
    const MAX_FILE_NAME_LENGTH: usize = 255;

    pub fn new(file_name: impl Into<String>, file_ref: FileRef) -> Self {
        Self {
            file_name: file_name.into(),
            file_ref,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let name = self.file_name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyFileName);
        }
        if name.len() > Self::MAX_FILE_NAME_LENGTH {
            return Err(ValidationError::FileNameTooLong {
                len: name.len(),
                max: Self::MAX_FILE_NAME_LENGTH,
            });
        }
        if name.chars().any(char::is_control) {
            return Err(ValidationError::InvalidFileName);
        }
        if self.file_ref.size_bytes == 0 {
            return Err(ValidationError::EmptyFile);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub file_name: String,
    pub file_ref: FileRef,
    pub status: TaskStatus,
    pub progress: u8,
    pub is_retrying: bool,
    pub retry_count: u32,
    pub created_item_id: Option<ItemId>,
    pub created_item_data: Option<ItemRecord>,
    pub error_message: Option<String>,
    pub created_at: UnixTimeMs,
    pub finished_at: Option<UnixTimeMs>,
    pub version: u64,
}

impl Task {
    pub(crate) const MAX_ERROR_MESSAGE_LENGTH: usize = 512;

    pub(crate) fn new(descriptor: TaskDescriptor, now: UnixTimeMs) -> Self {
        Self {
            id: TaskId::generate(),
            file_name: descriptor.file_name.trim().to_string(),
            file_ref: descriptor.file_ref,
            status: TaskStatus::Queued,
            progress: 0,
            is_retrying: false,
            retry_count: 0,
            created_item_id: None,
            created_item_data: None,
            error_message: None,
            created_at: now,
            finished_at: None,
            version: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A partial update to a task. Unset fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub is_retrying: Option<bool>,
    pub retry_count: Option<u32>,
    pub created_item: Option<ItemRecord>,
    pub error_message: Option<String>,
    pub expected_version: Option<u64>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    /// Moves the task to `Success`, recording the created item id and snapshot
    /// together.
    pub fn succeeded(record: ItemRecord) -> Self {
        Self {
            status: Some(TaskStatus::Success),
            progress: Some(100),
            is_retrying: Some(false),
            created_item: Some(record),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Task::MAX_ERROR_MESSAGE_LENGTH);
        Self {
            status: Some(TaskStatus::Error),
            is_retrying: Some(false),
            error_message: Some(message),
            ..Self::default()
        }
    }

    pub fn retrying(attempt: u32) -> Self {
        Self {
            status: Some(TaskStatus::Analyzing),
            is_retrying: Some(true),
            retry_count: Some(attempt),
            ..Self::default()
        }
    }

    /// Only apply when the task is still at `version`.
    #[must_use]
    pub fn if_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

// ============================================================================
// Edit intent
// ============================================================================

/// Ephemeral request to open the editor for an item. Not persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EditIntent {
    pub is_open: bool,
    pub item_id: Option<ItemId>,
}

impl EditIntent {
    pub fn open(item_id: ItemId) -> Self {
        Self {
            is_open: true,
            item_id: Some(item_id),
        }
    }

    pub fn closed() -> Self {
        Self::default()
    }
}
