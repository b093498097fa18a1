//! Seams to the outside world: the REST client, the notification host and the
//! editor host. The pipeline owns none of their implementations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::ServiceError;
use crate::model::{ItemId, ItemRecord, SourceFile, TaskId, TaskStatus, UploadMetadata};
use crate::resolver::EditIntentSender;

// ============================================================================
// Network collaborators
// ============================================================================

/// Receives transport progress as `(bytes_sent, bytes_total)`.
pub trait ProgressSink: Send + Sync {
    fn report(&self, sent: u64, total: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn report(&self, sent: u64, total: u64) {
        self(sent, total)
    }
}

/// Where the uploaded image ended up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedImage {
    pub url: String,
}

/// Payload for the item-creation endpoint, which runs the image analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateItemRequest {
    pub image_url: String,
    pub file_name: String,
    #[serde(flatten)]
    pub metadata: UploadMetadata,
}

#[async_trait::async_trait]
pub trait ImageTransport: Send + Sync {
    async fn upload(
        &self,
        file: &SourceFile,
        progress: &dyn ProgressSink,
    ) -> Result<UploadedImage, ServiceError>;
}

#[async_trait::async_trait]
pub trait ItemApi: Send + Sync {
    /// Analyses the uploaded image and creates the item record.
    async fn create_item(&self, request: &CreateItemRequest) -> Result<ItemRecord, ServiceError>;

    /// `Ok(None)` when the record is not (yet) visible on the read path.
    async fn get_item(&self, id: &ItemId) -> Result<Option<ItemRecord>, ServiceError>;
}

// ============================================================================
// Notification host
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

/// What the single progress surface displays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressView {
    pub task_id: TaskId,
    pub file_name: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub is_retrying: bool,
    pub retry_count: u32,
}

/// "Open editor" button attached to a notification.
#[derive(Clone)]
pub struct NotificationAction {
    pub label: String,
    pub item_id: ItemId,
    intents: EditIntentSender,
}

impl NotificationAction {
    pub fn edit_item(label: impl Into<String>, item_id: ItemId, intents: EditIntentSender) -> Self {
        Self {
            label: label.into(),
            item_id,
            intents,
        }
    }

    /// Raises the edit intent for the item.
    pub fn invoke(&self) {
        debug!(item_id = %self.item_id, "notification action invoked");
        self.intents.open(self.item_id.clone());
    }
}

impl fmt::Debug for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationAction")
            .field("label", &self.label)
            .field("item_id", &self.item_id)
            .finish()
    }
}

impl PartialEq for NotificationAction {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label && self.item_id == other.item_id
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub duration: Duration,
    pub level: NotificationLevel,
    pub action: Option<NotificationAction>,
}

/// Generic presentation primitive owned by the application shell.
///
/// Progress calls are made while the notifier holds its render lock, so an
/// implementation must not mutate the task store from inside them.
pub trait NotificationHost: Send + Sync {
    fn show_progress(&self, view: ProgressView);
    fn hide_progress(&self);
    fn notify(&self, notification: Notification);
}

// ============================================================================
// Editor host
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct EditorRequest {
    pub open: bool,
    pub item_id: ItemId,
    /// `None` while the record is still being fetched.
    pub item_snapshot: Option<ItemRecord>,
}

pub trait EditorHost: Send + Sync {
    fn open_editor(&self, request: EditorRequest);
    fn close_editor(&self);
}
