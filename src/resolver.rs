//! Turns "open the editor for item X" into an editor session, hiding the
//! window in which a freshly created item is not yet visible on the read path.

use metrics::counter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::ResolverConfig;
use crate::error::{ErrorCategory, ServiceError};
use crate::model::{EditIntent, ItemId, ItemRecord};
use crate::retry::{retry_with_backoff_notify, RetryDecision};
use crate::service::{
    EditorHost, EditorRequest, ItemApi, Notification, NotificationHost, NotificationLevel,
};
use crate::store::TaskStore;

// ============================================================================
// Intent channel
// ============================================================================

/// Creates the channel edit intents travel on. Starts closed.
pub fn edit_intent_channel() -> (EditIntentSender, EditIntentReceiver) {
    let (tx, rx) = watch::channel(EditIntent::closed());
    (
        EditIntentSender { tx: Arc::new(tx) },
        EditIntentReceiver { rx },
    )
}

#[derive(Clone, Debug)]
pub struct EditIntentSender {
    tx: Arc<watch::Sender<EditIntent>>,
}

impl EditIntentSender {
    /// Raises an intent for `item_id`. Re-raising the current intent is a
    /// no-op; returns whether the channel changed.
    pub fn open(&self, item_id: ItemId) -> bool {
        let intent = EditIntent::open(item_id);
        self.tx.send_if_modified(|current| {
            if *current == intent {
                false
            } else {
                *current = intent;
                true
            }
        })
    }

    pub fn close(&self) {
        self.tx.send_if_modified(|current| {
            if current.is_open {
                *current = EditIntent::closed();
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> EditIntent {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> EditIntentReceiver {
        EditIntentReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EditIntentReceiver {
    rx: watch::Receiver<EditIntent>,
}

impl EditIntentReceiver {
    pub fn current(&self) -> EditIntent {
        self.rx.borrow().clone()
    }
}

// ============================================================================
// Resolver
// ============================================================================

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ResolveError {
    #[error("item {0} did not become visible in time")]
    NotFound(ItemId),

    #[error("item lookup failed: {0}")]
    Exhausted(#[source] ServiceError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// Served from a task snapshot without touching the network.
    FromCache(ItemRecord),
    Fetched { record: ItemRecord, attempts: u32 },
    Failed(ResolveError),
}

impl Resolution {
    pub fn record(&self) -> Option<&ItemRecord> {
        match self {
            Resolution::FromCache(record) | Resolution::Fetched { record, .. } => Some(record),
            Resolution::Failed(_) => None,
        }
    }
}

pub struct EditIntentResolver {
    store: Arc<TaskStore>,
    items: Arc<dyn ItemApi>,
    notifications: Arc<dyn NotificationHost>,
    editor: Arc<dyn EditorHost>,
    intents: EditIntentSender,
    config: ResolverConfig,
    /// Intent raised by a direct `open_edit_intent` call that `run` has not
    /// observed yet.
    claimed: Mutex<Option<ItemId>>,
    editor_open: AtomicBool,
}

impl EditIntentResolver {
    pub fn new(
        store: Arc<TaskStore>,
        items: Arc<dyn ItemApi>,
        notifications: Arc<dyn NotificationHost>,
        editor: Arc<dyn EditorHost>,
        intents: EditIntentSender,
        config: ResolverConfig,
    ) -> Self {
        Self {
            store,
            items,
            notifications,
            editor,
            intents,
            config,
            claimed: Mutex::new(None),
            editor_open: AtomicBool::new(false),
        }
    }

    pub fn intents(&self) -> &EditIntentSender {
        &self.intents
    }

    /// Opens the editor for `item_id`, preferring the snapshot of the task
    /// that created it and falling back to a retried read.
    ///
    /// The intent is raised on the channel so other observers see it, but it
    /// is served here; a concurrent [`run`](Self::run) skips it.
    pub async fn open_edit_intent(&self, item_id: ItemId) -> Resolution {
        {
            let mut claimed = self.claimed();
            if self.intents.open(item_id.clone()) {
                *claimed = Some(item_id.clone());
            }
        }
        self.serve(item_id).await
    }

    pub fn close_edit_intent(&self) {
        self.intents.close();
        self.hide_editor();
    }

    /// Looks the item up without opening or closing anything.
    pub async fn resolve(&self, item_id: &ItemId) -> Resolution {
        match self.store.find_created_item(item_id) {
            Some(record) => Resolution::FromCache(record),
            None => self.fetch(item_id).await,
        }
    }

    /// Serves intents raised on the channel. A newer intent or a close
    /// abandons the read in flight.
    pub async fn run(&self, mut intents: EditIntentReceiver) {
        loop {
            let (EditIntent { is_open, item_id }, claim) = {
                let mut claimed = self.claimed();
                (intents.rx.borrow_and_update().clone(), claimed.take())
            };
            match item_id.filter(|_| is_open) {
                Some(item_id) if claim.as_ref() == Some(&item_id) => {
                    debug!(item_id = %item_id, "intent already served by caller");
                }
                Some(item_id) => {
                    tokio::select! {
                        biased;
                        _ = self.serve(item_id) => {}
                        changed = intents.rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            debug!("edit intent superseded");
                            continue;
                        }
                    }
                }
                None => self.hide_editor(),
            }

            if intents.rx.changed().await.is_err() {
                return;
            }
        }
    }

    #[instrument(skip(self), fields(item_id = %item_id))]
    async fn serve(&self, item_id: ItemId) -> Resolution {
        if let Some(record) = self.store.find_created_item(&item_id) {
            counter!("pipeline.resolver.cache_hits").increment(1);
            debug!("serving item from task snapshot");
            self.show_editor(item_id, Some(record.clone()));
            return Resolution::FromCache(record);
        }

        self.show_editor(item_id.clone(), None);
        let resolution = self.fetch(&item_id).await;

        if self.intents.current() != EditIntent::open(item_id.clone()) {
            debug!("intent changed while loading, result dropped");
            return resolution;
        }
        match &resolution {
            Resolution::Failed(error) => {
                counter!("pipeline.resolver.failures").increment(1);
                warn!(error = %error, "could not load item for editing");
                self.notifications.notify(Notification {
                    title: "Couldn't open item".into(),
                    description: error.to_string(),
                    duration: Duration::from_millis(self.config.error_notification_ms),
                    level: NotificationLevel::Error,
                    action: None,
                });
                self.close_edit_intent();
            }
            Resolution::FromCache(record) | Resolution::Fetched { record, .. } => {
                self.show_editor(item_id, Some(record.clone()));
            }
        }
        resolution
    }

    fn show_editor(&self, item_id: ItemId, item_snapshot: Option<ItemRecord>) {
        self.editor_open.store(true, Ordering::SeqCst);
        self.editor.open_editor(EditorRequest {
            open: true,
            item_id,
            item_snapshot,
        });
    }

    fn hide_editor(&self) {
        if self.editor_open.swap(false, Ordering::SeqCst) {
            self.editor.close_editor();
        }
    }

    fn claimed(&self) -> MutexGuard<'_, Option<ItemId>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(&self, item_id: &ItemId) -> Resolution {
        counter!("pipeline.resolver.fetches").increment(1);
        let items = &*self.items;
        let limit = self.config.attempt_timeout();
        let mut attempts = 0u32;

        let result = retry_with_backoff_notify(
            &self.config.retry,
            || {
                attempts += 1;
                async move {
                    match tokio::time::timeout(limit, items.get_item(item_id)).await {
                        Err(_) => Err(ServiceError::timeout("item lookup timed out")),
                        Ok(Ok(Some(record))) => Ok(record),
                        Ok(Ok(None)) => Err(ServiceError::not_found(format!(
                            "item {item_id} not found"
                        ))),
                        Ok(Err(e)) => Err(e),
                    }
                }
            },
            |notice| {
                // A miss right after creation is expected; keep polling.
                if notice.error.category == ErrorCategory::NotFound || notice.error.is_retryable()
                {
                    debug!(attempt = notice.attempt, error = %notice.error, "item not readable yet");
                    RetryDecision::Retry
                } else {
                    RetryDecision::GiveUp
                }
            },
        )
        .await;

        match result {
            Ok(record) => {
                info!(attempts, "item loaded");
                Resolution::Fetched { record, attempts }
            }
            Err(e) if e.category == ErrorCategory::NotFound => {
                Resolution::Failed(ResolveError::NotFound(item_id.clone()))
            }
            Err(e) => Resolution::Failed(ResolveError::Exhausted(e)),
        }
    }
}
