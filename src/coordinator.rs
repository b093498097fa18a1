use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::{AnalysisConfig, PipelineConfig, UploadConfig};
use crate::error::{PipelineError, PipelineResult, ServiceError};
use crate::model::{
    ItemRecord, SourceFile, TaskDescriptor, TaskId, TaskPatch, TaskStatus, UploadMetadata,
    ValidationError,
};
use crate::retry::{retry_with_backoff_notify, RetryDecision, RetryNotice};
use crate::service::{CreateItemRequest, ImageTransport, ItemApi, ProgressSink, UploadedImage};
use crate::store::TaskStore;

/// Checks a file before any task exists for it.
pub fn validate_file(config: &UploadConfig, file: &SourceFile) -> Result<(), ValidationError> {
    TaskDescriptor::new(file.file_name.clone(), file.file_ref()).validate()?;

    let size = file.size_bytes();
    if size > config.max_file_bytes {
        return Err(ValidationError::FileTooLarge {
            size,
            max: config.max_file_bytes,
        });
    }

    let declared = canonical_content_type(&file.content_type);
    if !config
        .allowed_content_types
        .iter()
        .any(|allowed| canonical_content_type(allowed) == declared)
    {
        return Err(ValidationError::UnsupportedContentType(file.content_type.clone()));
    }

    let detected = image::guess_format(&file.bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("unknown");
    if detected != declared {
        return Err(ValidationError::ContentMismatch {
            declared: file.content_type.clone(),
            detected: detected.to_string(),
        });
    }

    Ok(())
}

fn canonical_content_type(content_type: &str) -> &str {
    match content_type {
        "image/jpg" | "image/pjpeg" => "image/jpeg",
        other => other,
    }
}

fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (sent.min(total).saturating_mul(100) / total) as u8
}

/// Handle on a started upload. Dropping it does not cancel the task.
#[derive(Debug)]
pub struct UploadHandle {
    task_id: TaskId,
    join: JoinHandle<TaskStatus>,
}

impl UploadHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Waits for the task to reach a terminal status.
    pub async fn finished(self) -> TaskStatus {
        match self.join.await {
            Ok(status) => status,
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "upload job aborted");
                TaskStatus::Error
            }
        }
    }
}

/// Drives tasks through upload, analysis and a terminal state. Writes to the
/// task store only; never renders anything.
#[derive(Clone)]
pub struct UploadCoordinator {
    store: Arc<TaskStore>,
    transport: Arc<dyn ImageTransport>,
    items: Arc<dyn ItemApi>,
    upload: UploadConfig,
    analysis: AnalysisConfig,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<TaskStore>,
        transport: Arc<dyn ImageTransport>,
        items: Arc<dyn ItemApi>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            items,
            upload: config.upload.clone(),
            analysis: config.analysis.clone(),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Validates the file, registers a task and starts it in the background.
    pub fn start(&self, file: SourceFile, metadata: UploadMetadata) -> PipelineResult<TaskId> {
        self.start_tracked(file, metadata)
            .map(|handle| handle.task_id().clone())
    }

    /// Like [`UploadCoordinator::start`], returning a handle that resolves
    /// once the task is terminal.
    #[instrument(skip(self, file, metadata), fields(file_name = %file.file_name))]
    pub fn start_tracked(
        &self,
        file: SourceFile,
        metadata: UploadMetadata,
    ) -> PipelineResult<UploadHandle> {
        validate_file(&self.upload, &file)?;
        let runtime = Handle::try_current().map_err(|_| PipelineError::Runtime)?;

        let descriptor = TaskDescriptor::new(file.file_name.clone(), file.file_ref());
        let task_id = self.store.create_task(descriptor)?;
        self.store
            .update_task(&task_id, TaskPatch::status(TaskStatus::Uploading));
        counter!("pipeline.tasks.started").increment(1);
        info!(task_id = %task_id, size = file.size_bytes(), "upload started");

        let job = UploadJob {
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            items: Arc::clone(&self.items),
            upload: self.upload.clone(),
            analysis: self.analysis.clone(),
            task_id: task_id.clone(),
            file,
            metadata,
        };
        let join = runtime.spawn(job.run());

        Ok(UploadHandle { task_id, join })
    }
}

struct UploadJob {
    store: Arc<TaskStore>,
    transport: Arc<dyn ImageTransport>,
    items: Arc<dyn ItemApi>,
    upload: UploadConfig,
    analysis: AnalysisConfig,
    task_id: TaskId,
    file: SourceFile,
    metadata: UploadMetadata,
}

impl UploadJob {
    #[instrument(skip(self), fields(task_id = %self.task_id))]
    async fn run(self) -> TaskStatus {
        let start = Instant::now();

        let status = match self.upload_image().await {
            Err(e) => self.fail(format!("Upload failed: {e}")),
            Ok(uploaded) => {
                self.store
                    .update_task(&self.task_id, TaskPatch::status(TaskStatus::Analyzing));

                match self.analyze(uploaded).await {
                    Ok(record) => {
                        info!(item_id = %record.id, "item created");
                        self.store
                            .update_task(&self.task_id, TaskPatch::succeeded(record));
                        counter!("pipeline.tasks.succeeded").increment(1);
                        TaskStatus::Success
                    }
                    Err(e) => self.fail(format!("Image analysis failed: {e}")),
                }
            }
        };

        histogram!("pipeline.task.duration_ms").record(start.elapsed().as_millis() as f64);
        status
    }

    async fn upload_image(&self) -> Result<UploadedImage, ServiceError> {
        let store = &self.store;
        let task_id = &self.task_id;
        let report_progress = |sent: u64, total: u64| {
            store.update_task(task_id, TaskPatch::progress(percent(sent, total)));
        };

        let transport = &*self.transport;
        let file = &self.file;
        let sink: &dyn ProgressSink = &report_progress;
        let limit = self.upload.timeout();

        let uploaded = retry_with_backoff_notify(
            &self.upload.retry,
            || async move {
                tokio::time::timeout(limit, transport.upload(file, sink))
                    .await
                    .unwrap_or_else(|_| Err(ServiceError::timeout("upload timed out")))
            },
            |notice| {
                warn!(attempt = notice.attempt, error = %notice.error, "upload attempt failed");
                retry_if_transient(notice)
            },
        )
        .await?;

        self.store
            .update_task(&self.task_id, TaskPatch::progress(100));
        Ok(uploaded)
    }

    async fn analyze(
        &self,
        uploaded: UploadedImage,
    ) -> Result<ItemRecord, ServiceError> {
        let request = CreateItemRequest {
            image_url: uploaded.url,
            file_name: self.file.file_name.clone(),
            metadata: self.metadata.clone(),
        };

        let items = &*self.items;
        let request = &request;
        let limit = self.analysis.attempt_timeout();

        retry_with_backoff_notify(
            &self.analysis.retry,
            || async move {
                tokio::time::timeout(limit, items.create_item(request))
                    .await
                    .unwrap_or_else(|_| Err(ServiceError::timeout("analysis timed out")))
            },
            |notice| {
                let decision = retry_if_transient(notice);
                if decision == RetryDecision::Retry {
                    counter!("pipeline.analysis.retries").increment(1);
                    warn!(
                        attempt = notice.attempt,
                        delay_ms = notice.delay.as_millis() as u64,
                        error = %notice.error,
                        "analysis failed, retrying"
                    );
                    self.store
                        .update_task(&self.task_id, TaskPatch::retrying(notice.attempt));
                }
                decision
            },
        )
        .await
    }

    fn fail(&self, message: String) -> TaskStatus {
        error!(error = %message, "task failed");
        counter!("pipeline.tasks.failed").increment(1);
        self.store
            .update_task(&self.task_id, TaskPatch::failed(message));
        TaskStatus::Error
    }
}

fn retry_if_transient(notice: &RetryNotice<'_, ServiceError>) -> RetryDecision {
    if notice.error.is_retryable() {
        RetryDecision::Retry
    } else {
        RetryDecision::GiveUp
    }
}
