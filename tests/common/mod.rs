#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use item_pipeline::service::{
    CreateItemRequest, EditorHost, EditorRequest, ImageTransport, ItemApi, Notification,
    NotificationHost, ProgressSink, ProgressView, UploadedImage,
};
use item_pipeline::{
    edit_intent_channel, EditIntentReceiver, EditIntentResolver, ItemId, ItemRecord,
    PipelineConfig, ProgressNotifier, NotifierHandle, ServiceError, SourceFile, TaskStore,
    UploadCoordinator,
};

/// One scripted backend answer.
#[derive(Clone, Debug)]
pub enum Reply {
    Json(serde_json::Value),
    Status(u16),
    Missing,
}

impl Reply {
    fn into_record(self) -> Result<Option<ItemRecord>, ServiceError> {
        match self {
            Reply::Json(body) => serde_json::from_value(body)
                .map(Some)
                .map_err(|e| ServiceError::from_http_status(500, Some(e.to_string().as_bytes()))),
            Reply::Status(status) => Err(ServiceError::from_http_status(status, None)),
            Reply::Missing => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct Backend {
    creates: Mutex<VecDeque<Reply>>,
    reads: Mutex<VecDeque<Reply>>,
    pub create_requests: Mutex<Vec<CreateItemRequest>>,
    pub read_requests: Mutex<Vec<ItemId>>,
    pub uploads: Mutex<Vec<String>>,
}

impl Backend {
    pub fn script_creates(&self, replies: impl IntoIterator<Item = Reply>) {
        self.creates.lock().unwrap().extend(replies);
    }

    pub fn script_reads(&self, replies: impl IntoIterator<Item = Reply>) {
        self.reads.lock().unwrap().extend(replies);
    }

    pub fn create_count(&self) -> usize {
        self.create_requests.lock().unwrap().len()
    }

    pub fn read_count(&self) -> usize {
        self.read_requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ImageTransport for Backend {
    async fn upload(
        &self,
        file: &SourceFile,
        progress: &dyn ProgressSink,
    ) -> Result<UploadedImage, ServiceError> {
        self.uploads.lock().unwrap().push(file.file_name.clone());
        let total = file.size_bytes();
        for step in 1..=4 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            progress.report(total * step / 4, total);
        }
        Ok(UploadedImage {
            url: format!("https://images.test/{}", file.file_name),
        })
    }
}

#[async_trait::async_trait]
impl ItemApi for Backend {
    async fn create_item(&self, request: &CreateItemRequest) -> Result<ItemRecord, ServiceError> {
        self.create_requests.lock().unwrap().push(request.clone());
        let reply = self
            .creates
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Status(503));
        match reply.into_record()? {
            Some(record) => Ok(record),
            None => Err(ServiceError::from_http_status(404, None)),
        }
    }

    async fn get_item(&self, id: &ItemId) -> Result<Option<ItemRecord>, ServiceError> {
        self.read_requests.lock().unwrap().push(id.clone());
        let reply = self.reads.lock().unwrap().pop_front().unwrap_or(Reply::Missing);
        reply.into_record()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    Progress(ProgressView),
    HideProgress,
    Notify(Notification),
    OpenEditor(EditorRequest),
    CloseEditor,
}

/// Records everything the pipeline asks the shell to display.
#[derive(Default)]
pub struct Shell {
    events: Mutex<Vec<UiEvent>>,
}

impl Shell {
    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Notify(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn editor_requests(&self) -> Vec<EditorRequest> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::OpenEditor(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: UiEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl NotificationHost for Shell {
    fn show_progress(&self, view: ProgressView) {
        self.push(UiEvent::Progress(view));
    }

    fn hide_progress(&self) {
        self.push(UiEvent::HideProgress);
    }

    fn notify(&self, notification: Notification) {
        self.push(UiEvent::Notify(notification));
    }
}

impl EditorHost for Shell {
    fn open_editor(&self, request: EditorRequest) {
        self.push(UiEvent::OpenEditor(request));
    }

    fn close_editor(&self) {
        self.push(UiEvent::CloseEditor);
    }
}

pub fn jpeg(name: &str) -> SourceFile {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE1];
    bytes.resize(4096, 0x20);
    SourceFile::new(name, "image/jpeg", bytes)
}

/// Everything wired together the way an application shell would.
pub struct Pipeline {
    pub store: Arc<TaskStore>,
    pub backend: Arc<Backend>,
    pub shell: Arc<Shell>,
    pub coordinator: UploadCoordinator,
    pub resolver: Arc<EditIntentResolver>,
    pub intents: Option<EditIntentReceiver>,
    pub notifier: NotifierHandle,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let store = TaskStore::shared(config.store.clone());
        let backend = Arc::new(Backend::default());
        let shell = Arc::new(Shell::default());
        let (sender, receiver) = edit_intent_channel();

        let coordinator =
            UploadCoordinator::new(store.clone(), backend.clone(), backend.clone(), &config);
        let notifier = ProgressNotifier::mount(
            &store,
            shell.clone(),
            sender.clone(),
            config.notifier.clone(),
        )
        .unwrap();
        let resolver = Arc::new(EditIntentResolver::new(
            store.clone(),
            backend.clone(),
            shell.clone(),
            shell.clone(),
            sender,
            config.resolver.clone(),
        ));

        Self {
            store,
            backend,
            shell,
            coordinator,
            resolver,
            intents: Some(receiver),
            notifier,
        }
    }
}
