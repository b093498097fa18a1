//! In-memory collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::ServiceError;
use crate::model::{ItemId, ItemRecord, SourceFile};
use crate::service::{
    CreateItemRequest, EditorHost, EditorRequest, ImageTransport, ItemApi, Notification,
    NotificationHost, ProgressSink, ProgressView, UploadedImage,
};

pub fn jpeg_bytes() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
    bytes.resize(64, 0);
    bytes
}

pub fn png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.resize(64, 0);
    bytes
}

#[derive(Default)]
pub struct FakeTransport {
    failure: Mutex<Option<ServiceError>>,
    calls: AtomicU32,
}

impl FakeTransport {
    pub fn fail_with(&self, error: ServiceError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ImageTransport for FakeTransport {
    async fn upload(
        &self,
        file: &SourceFile,
        progress: &dyn ProgressSink,
    ) -> Result<UploadedImage, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        let total = file.size_bytes();
        progress.report(total / 2, total);
        progress.report(total, total);
        Ok(UploadedImage {
            url: format!("https://cdn.test/{}", file.file_name),
        })
    }
}

#[derive(Default)]
pub struct FakeItemApi {
    creates: Mutex<VecDeque<Result<serde_json::Value, ServiceError>>>,
    gets: Mutex<VecDeque<Result<Option<ItemRecord>, ServiceError>>>,
    create_calls: AtomicU32,
    get_calls: AtomicU32,
    hang_creates: AtomicBool,
    hang_gets: AtomicBool,
}

impl FakeItemApi {
    pub fn push_create(&self, response: Result<serde_json::Value, ServiceError>) {
        self.creates.lock().unwrap().push_back(response);
    }

    pub fn push_get(&self, response: Result<Option<ItemRecord>, ServiceError>) {
        self.gets.lock().unwrap().push_back(response);
    }

    pub fn hang_creates(&self) {
        self.hang_creates.store(true, Ordering::SeqCst);
    }

    pub fn hang_gets(&self) {
        self.hang_gets.store(true, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> u32 {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ItemApi for FakeItemApi {
    async fn create_item(&self, _request: &CreateItemRequest) -> Result<ItemRecord, ServiceError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_creates.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let next = self.creates.lock().unwrap().pop_front();
        match next {
            Some(Ok(body)) => Ok(serde_json::from_value(body).unwrap()),
            Some(Err(e)) => Err(e),
            None => Ok(ItemRecord::new(ItemId::from(1))),
        }
    }

    async fn get_item(&self, _id: &ItemId) -> Result<Option<ItemRecord>, ServiceError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_gets.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let next = self.gets.lock().unwrap().pop_front();
        next.unwrap_or(Ok(None))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
    Show(ProgressView),
    Hide,
    Notify(Notification),
}

#[derive(Default)]
pub struct RecordingHost {
    events: Mutex<Vec<HostEvent>>,
}

impl RecordingHost {
    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl NotificationHost for RecordingHost {
    fn show_progress(&self, view: ProgressView) {
        self.events.lock().unwrap().push(HostEvent::Show(view));
    }

    fn hide_progress(&self) {
        self.events.lock().unwrap().push(HostEvent::Hide);
    }

    fn notify(&self, notification: Notification) {
        self.events.lock().unwrap().push(HostEvent::Notify(notification));
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EditorEvent {
    Open(EditorRequest),
    Close,
}

#[derive(Default)]
pub struct RecordingEditor {
    events: Mutex<Vec<EditorEvent>>,
}

impl RecordingEditor {
    pub fn events(&self) -> Vec<EditorEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EditorHost for RecordingEditor {
    fn open_editor(&self, request: EditorRequest) {
        self.events.lock().unwrap().push(EditorEvent::Open(request));
    }

    fn close_editor(&self) {
        self.events.lock().unwrap().push(EditorEvent::Close);
    }
}
