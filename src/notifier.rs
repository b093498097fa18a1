//! Projects task-store state onto the notification host.
//!
//! One progress surface follows the active task while it is uploading or
//! analysing. Tasks that succeed get a one-shot notification carrying an
//! edit action and are removed from the store once their time-to-live
//! expires.

use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ErrorSurfacing, NotifierConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{Task, TaskId, TaskStatus};
use crate::resolver::EditIntentSender;
use crate::service::{
    Notification, NotificationAction, NotificationHost, NotificationLevel, ProgressView,
};
use crate::store::{StoreEvent, Subscription, TaskChange, TaskStore};

fn view_of(task: &Task) -> ProgressView {
    ProgressView {
        task_id: task.id.clone(),
        file_name: task.file_name.clone(),
        status: task.status,
        progress: task.progress,
        is_retrying: task.is_retrying,
        retry_count: task.retry_count,
    }
}

pub struct ProgressNotifier;

impl ProgressNotifier {
    /// Subscribes to `store` and renders the current state right away.
    /// Needs a tokio runtime for the removal timers.
    pub fn mount(
        store: &Arc<TaskStore>,
        host: Arc<dyn NotificationHost>,
        intents: EditIntentSender,
        config: NotifierConfig,
    ) -> PipelineResult<NotifierHandle> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::Runtime)?;

        let inner = Arc::new(Inner {
            store: Arc::downgrade(store),
            host,
            intents,
            config,
            runtime,
            shown: Mutex::new(None),
            timers: Mutex::new(HashMap::new()),
        });

        let listener = Arc::clone(&inner);
        let subscription = store.subscribe(move |event| listener.on_event(event));
        inner.render();
        debug!("progress notifier mounted");

        Ok(NotifierHandle {
            inner,
            _subscription: subscription,
        })
    }
}

/// Keeps the notifier subscribed. Dropping it unsubscribes and cancels every
/// pending removal.
pub struct NotifierHandle {
    inner: Arc<Inner>,
    _subscription: Subscription,
}

impl NotifierHandle {
    pub fn pending_removals(&self) -> usize {
        self.inner.timers().len()
    }

    pub fn shown_progress(&self) -> Option<ProgressView> {
        self.inner.shown().clone()
    }
}

impl Drop for NotifierHandle {
    fn drop(&mut self) {
        for (_, timer) in self.inner.timers().drain() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for NotifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierHandle")
            .field("pending_removals", &self.pending_removals())
            .finish()
    }
}

struct Inner {
    store: Weak<TaskStore>,
    host: Arc<dyn NotificationHost>,
    intents: EditIntentSender,
    config: NotifierConfig,
    runtime: Handle,
    shown: Mutex<Option<ProgressView>>,
    timers: Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl Inner {
    fn shown(&self) -> std::sync::MutexGuard<'_, Option<ProgressView>> {
        self.shown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_event(self: &Arc<Self>, event: &StoreEvent) {
        self.render();

        match &event.change {
            TaskChange::Updated { after, .. } => match event.change.entered_status() {
                Some(TaskStatus::Success) => self.on_success(after),
                Some(TaskStatus::Error) => self.on_error(after),
                _ => {}
            },
            TaskChange::Removed(task) => self.cancel_removal(&task.id),
            TaskChange::Created(_) => {}
        }
    }

    /// Renders the store's current active task. Events may reach listeners
    /// out of commit order, so the snapshot they carry is not trusted; the
    /// host is driven under the `shown` lock so renders cannot interleave.
    fn render(&self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };

        let mut shown = self.shown();
        let next = store
            .get_active_task()
            .filter(|t| t.status.is_in_flight())
            .map(|t| view_of(&t));
        if *shown == next {
            return;
        }

        match &next {
            Some(view) => self.host.show_progress(view.clone()),
            None => self.host.hide_progress(),
        }
        *shown = next;
    }

    fn on_success(self: &Arc<Self>, task: &Task) {
        counter!("pipeline.notifier.success_notifications").increment(1);
        info!(task_id = %task.id, "task succeeded");

        let title = task
            .created_item_data
            .as_ref()
            .and_then(|record| record.name.clone())
            .unwrap_or_else(|| "Item created".to_string());
        let action = task.created_item_id.clone().map(|item_id| {
            NotificationAction::edit_item(
                self.config.edit_action_label.clone(),
                item_id,
                self.intents.clone(),
            )
        });

        self.host.notify(Notification {
            title,
            description: format!("{} was analysed and added", task.file_name),
            duration: Duration::from_millis(self.config.success_notification_ms),
            level: NotificationLevel::Success,
            action,
        });

        self.schedule_removal(task.id.clone());
    }

    fn on_error(&self, task: &Task) {
        let message = task.error_message.as_deref().unwrap_or("unknown error");
        warn!(task_id = %task.id, error = %message, "task failed");

        if self.config.error_surfacing == ErrorSurfacing::Notify {
            self.host.notify(Notification {
                title: "Upload failed".into(),
                description: message.to_string(),
                duration: Duration::from_millis(self.config.error_notification_ms),
                level: NotificationLevel::Error,
                action: None,
            });
        }
    }

    fn schedule_removal(self: &Arc<Self>, task_id: TaskId) {
        let ttl = self.config.success_ttl();
        let weak = Arc::downgrade(self);
        let id = task_id.clone();

        // Held across the spawn so the timer cannot fire before it is tracked.
        let mut timers = self.timers();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.timers().remove(&id);
            if let Some(store) = inner.store.upgrade() {
                if store.remove_task(&id).is_some() {
                    debug!(task_id = %id, "finished task expired");
                }
            }
        });

        if let Some(previous) = timers.insert(task_id, timer) {
            previous.abort();
        }
    }

    fn cancel_removal(&self, task_id: &TaskId) {
        if let Some(timer) = self.timers().remove(task_id) {
            debug!(task_id = %task_id, "removal timer cancelled");
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileRef, ItemId, ItemRecord, TaskDescriptor, TaskPatch};
    use crate::resolver::edit_intent_channel;
    use crate::test_support::{HostEvent, RecordingHost};
    use assert_matches::assert_matches;

    fn descriptor(name: &str) -> TaskDescriptor {
        TaskDescriptor::new(
            name,
            FileRef {
                size_bytes: 2048,
                content_type: "image/png".into(),
                digest_hex: "cd".into(),
            },
        )
    }

    fn succeed(store: &TaskStore, id: &TaskId, record: ItemRecord) {
        store.update_task(id, TaskPatch::status(TaskStatus::Uploading));
        store.update_task(id, TaskPatch::status(TaskStatus::Analyzing));
        assert!(store.update_task(id, TaskPatch::succeeded(record)).is_applied());
    }

    fn mount(config: NotifierConfig) -> (Arc<TaskStore>, Arc<RecordingHost>, NotifierHandle) {
        let store = Arc::new(TaskStore::default());
        let host = Arc::new(RecordingHost::default());
        let (intents, _rx) = edit_intent_channel();
        let handle = ProgressNotifier::mount(&store, host.clone(), intents, config).unwrap();
        (store, host, handle)
    }

    #[test]
    fn mount_requires_runtime() {
        let store = Arc::new(TaskStore::default());
        let (intents, _rx) = edit_intent_channel();
        let result = ProgressNotifier::mount(
            &store,
            Arc::new(RecordingHost::default()),
            intents,
            NotifierConfig::default(),
        );
        assert_matches!(result, Err(PipelineError::Runtime));
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_follows_active_task_without_duplicate_renders() {
        let (store, host, handle) = mount(NotifierConfig::default());
        let id = store.create_task(descriptor("a.png")).unwrap();
        assert!(host.events().is_empty());

        store.update_task(&id, TaskPatch::status(TaskStatus::Uploading));
        store.update_task(&id, TaskPatch::progress(40));
        store.update_task(&id, TaskPatch::progress(40));
        store.update_task(&id, TaskPatch::retrying(1));

        let shown: Vec<_> = host
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::Show(view) => Some((view.status, view.progress, view.is_retrying)),
                _ => None,
            })
            .collect();
        assert_eq!(
            shown,
            vec![
                (TaskStatus::Uploading, 0, false),
                (TaskStatus::Uploading, 40, false),
                (TaskStatus::Analyzing, 40, true),
            ]
        );
        assert_eq!(handle.shown_progress().map(|v| v.retry_count), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn success_notifies_once_and_expires_task() {
        let (store, host, handle) = mount(NotifierConfig::default());
        let id = store.create_task(descriptor("shirt.png")).unwrap();
        succeed(&store, &id, ItemRecord::new(ItemId::from(42)).with_name("Shirt"));
        store.update_task(&id, TaskPatch::progress(50));

        let events = host.events();
        assert_matches!(
            events.as_slice(),
            [HostEvent::Show(uploading), HostEvent::Show(analyzing), HostEvent::Hide, HostEvent::Notify(_)]
                if uploading.status == TaskStatus::Uploading && analyzing.status == TaskStatus::Analyzing
        );
        let notifications: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                HostEvent::Notify(n) => Some(n.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].level, NotificationLevel::Success);
        assert_eq!(notifications[0].title, "Shirt");
        let action = notifications[0].action.as_ref().unwrap();
        assert_eq!(action.label, "Edit item");
        assert_eq!(action.item_id, ItemId::from(42));
        assert_eq!(handle.pending_removals(), 1);

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert!(store.get_task(&id).is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.get_task(&id).is_none());
        assert_eq!(handle.pending_removals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_action_raises_intent() {
        let store = Arc::new(TaskStore::default());
        let host = Arc::new(RecordingHost::default());
        let (intents, rx) = edit_intent_channel();
        let _handle =
            ProgressNotifier::mount(&store, host.clone(), intents, NotifierConfig::default())
                .unwrap();

        let id = store.create_task(descriptor("shirt.png")).unwrap();
        succeed(&store, &id, ItemRecord::new(ItemId::from(8)));

        let notification = host
            .events()
            .into_iter()
            .find_map(|e| match e {
                HostEvent::Notify(n) => Some(n),
                _ => None,
            })
            .unwrap();
        notification.action.unwrap().invoke();

        let intent = rx.current();
        assert!(intent.is_open);
        assert_eq!(intent.item_id, Some(ItemId::from(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_removal_cancels_timer() {
        let (store, _host, handle) = mount(NotifierConfig::default());
        let id = store.create_task(descriptor("a.png")).unwrap();
        succeed(&store, &id, ItemRecord::new(ItemId::from(1)));
        assert_eq!(handle.pending_removals(), 1);

        assert!(store.remove_task(&id).is_some());
        assert_eq!(handle.pending_removals(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_logged_only_by_default() {
        let (store, host, _handle) = mount(NotifierConfig::default());
        let id = store.create_task(descriptor("a.png")).unwrap();
        store.update_task(&id, TaskPatch::status(TaskStatus::Uploading));
        store.update_task(&id, TaskPatch::failed("boom"));

        let events = host.events();
        assert_eq!(events.last(), Some(&HostEvent::Hide));
        assert!(!events.iter().any(|e| matches!(e, HostEvent::Notify(_))));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.get_task(&id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_can_be_surfaced() {
        let config = NotifierConfig {
            error_surfacing: ErrorSurfacing::Notify,
            ..NotifierConfig::default()
        };
        let (store, host, _handle) = mount(config);
        let id = store.create_task(descriptor("a.png")).unwrap();
        store.update_task(&id, TaskPatch::failed("boom"));

        assert_matches!(
            host.events().last(),
            Some(HostEvent::Notify(n)) if n.level == NotificationLevel::Error && n.description == "boom"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_unsubscribes_and_aborts_timers() {
        let (store, host, handle) = mount(NotifierConfig::default());
        let id = store.create_task(descriptor("a.png")).unwrap();
        succeed(&store, &id, ItemRecord::new(ItemId::from(1)));
        assert_eq!(store.subscriber_count(), 1);

        drop(handle);
        assert_eq!(store.subscriber_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.get_task(&id).is_some());

        let before = host.events().len();
        store.create_task(descriptor("b.png")).unwrap();
        assert_eq!(host.events().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn surface_moves_to_next_in_flight_task() {
        let (store, host, _handle) = mount(NotifierConfig::default());
        let a = store.create_task(descriptor("a.png")).unwrap();
        let b = store.create_task(descriptor("b.png")).unwrap();
        store.update_task(&a, TaskPatch::status(TaskStatus::Uploading));
        store.update_task(&b, TaskPatch::status(TaskStatus::Uploading));
        store.update_task(&a, TaskPatch::status(TaskStatus::Analyzing));
        assert!(store
            .update_task(&a, TaskPatch::succeeded(ItemRecord::new(ItemId::from(1))))
            .is_applied());

        let last_show = host
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::Show(view) => Some(view),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_show.task_id, b);
    }

    #[tokio::test(start_paused = true)]
    async fn mount_shows_task_already_in_flight() {
        let store = Arc::new(TaskStore::default());
        let id = store.create_task(descriptor("a.png")).unwrap();
        store.update_task(&id, TaskPatch::status(TaskStatus::Uploading));
        let host = Arc::new(RecordingHost::default());
        let (intents, _rx) = edit_intent_channel();

        let handle =
            ProgressNotifier::mount(&store, host.clone(), intents, NotifierConfig::default())
                .unwrap();

        assert_matches!(host.events().as_slice(), [HostEvent::Show(view)] if view.task_id == id);
        assert_eq!(store.subscriber_count(), 1);

        store.update_task(&id, TaskPatch::progress(30));
        assert_eq!(handle.shown_progress().map(|v| v.progress), Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn late_event_does_not_bring_back_finished_progress() {
        let (store, host, handle) = mount(NotifierConfig::default());
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let _sub = store.subscribe(move |event: &StoreEvent| {
            sink.lock().unwrap().push(event.clone());
        });

        let id = store.create_task(descriptor("a.png")).unwrap();
        store.update_task(&id, TaskPatch::status(TaskStatus::Uploading));
        store.update_task(&id, TaskPatch::progress(60));
        store.update_task(&id, TaskPatch::status(TaskStatus::Analyzing));
        store.update_task(&id, TaskPatch::failed("boom"));
        assert_eq!(host.events().last(), Some(&HostEvent::Hide));

        // Replay the progress event as if it had been delivered after the failure.
        let late = captured
            .lock()
            .unwrap()
            .iter()
            .find(|e| matches!(&e.change, TaskChange::Updated { after, .. } if after.progress == 60))
            .cloned()
            .unwrap();
        assert!(late.active.as_ref().unwrap().status.is_in_flight());
        let before = host.events().len();
        handle.inner.on_event(&late);

        assert_eq!(host.events().len(), before);
        assert!(handle.shown_progress().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_removal_leaves_no_stale_timer() {
        let config = NotifierConfig {
            success_ttl_ms: 0,
            ..NotifierConfig::default()
        };
        let (store, _host, handle) = mount(config);
        let id = store.create_task(descriptor("a.png")).unwrap();
        succeed(&store, &id, ItemRecord::new(ItemId::from(1)));

        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(store.get_task(&id).is_none());
        assert_eq!(handle.pending_removals(), 0);
    }
}
