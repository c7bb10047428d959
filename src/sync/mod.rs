mod dispatch;
pub(crate) mod optimistic;
pub mod view;

use crate::attachments::{object_path, object_path_from_public_url, ImageAttachment};
use crate::backend::{Backend, SubscriptionHandle};
use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, ChangeEvent, CreateOutcome, FeedFilter, MutationOutcome, NewTodo, RecordFilter, SortOrder, User,
    ViewSnapshot,
};
use crate::sync::dispatch::SyncMessage;
use crate::sync::optimistic::Optimistic;
use crate::sync::view::{LocalChange, Snapshot, TodoField, ViewCell};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct Activation {
    owner_id: String,
    feed: Option<(SubscriptionHandle, JoinHandle<()>)>,
}

/// Keeps one owner's task list in step with the remote store.
///
/// Local operations are applied optimistically and confirmed remotely; the
/// change feed is the only path by which new records enter the list. Feed events
/// and auth-state changes are handled one at a time by the dispatcher started
/// with [`start`](Self::start).
#[derive(Clone)]
pub struct TodoSync {
    backend: Backend,
    settings: AppSettings,
    view: Arc<ViewCell>,
    staged_image: Arc<Mutex<Option<ImageAttachment>>>,
    activation: Arc<tokio::sync::Mutex<Option<Activation>>>,
    queue_tx: mpsc::UnboundedSender<SyncMessage>,
    queue_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<SyncMessage>>>>,
}

impl TodoSync {
    pub fn new(backend: Backend, settings: AppSettings) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            view: Arc::new(ViewCell::new(settings.feed_park_capacity)),
            settings,
            staged_image: Arc::new(Mutex::new(None)),
            activation: Arc::new(tokio::sync::Mutex::new(None)),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(Some(queue_rx))),
        }
    }

    /// Spawns the dispatcher. Calling it again is a no-op.
    pub fn start(&self) {
        let receiver = self
            .queue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(receiver) = receiver else {
            return;
        };
        dispatch::spawn_auth_forwarder(
            self.backend.session.on_auth_state_change(),
            self.backend.session.clone(),
            self.queue_tx.clone(),
        );
        tokio::spawn(dispatch::run_loop(self.clone(), receiver));
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ViewSnapshot> {
        self.view.subscribe()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.view.read(|view| view.snapshot())
    }

    pub fn owner_id(&self) -> Option<String> {
        self.view.read(|view| view.owner_id().map(str::to_string))
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    /// Activates the list for whoever the provider already has signed in.
    pub async fn restore_session(&self) -> AppResult<Option<User>> {
        let user = self.backend.session.current_user().await?;
        if let Some(user) = &user {
            self.activate(user).await;
        }
        Ok(user)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> AppResult<User> {
        let user = self.backend.session.sign_in_with_password(email, password).await?;
        self.activate(&user).await;
        Ok(user)
    }

    pub async fn sign_out(&self) -> AppResult<()> {
        self.deactivate().await;
        self.backend.session.sign_out().await
    }

    /// Reads every record of `owner_id`, newest first, and replaces the list.
    ///
    /// The feed is (re)subscribed before the read so nothing committed in between
    /// is missed; events that overlap the read merge idempotently. A failed read
    /// leaves an empty list. Returns the number of records loaded.
    pub async fn load(&self, owner_id: &str) -> usize {
        let mut activation = self.activation.lock().await;
        self.attach(&mut activation, owner_id).await
    }

    async fn activate(&self, user: &User) {
        let mut activation = self.activation.lock().await;
        self.activate_locked(&mut activation, &user.id).await;
    }

    async fn activate_locked(&self, slot: &mut Option<Activation>, owner_id: &str) {
        if slot.as_ref().is_some_and(|active| active.owner_id == owner_id) {
            return;
        }
        tracing::info!(owner_id = %owner_id, "activating todo list");
        self.attach(slot, owner_id).await;
    }

    async fn attach(&self, slot: &mut Option<Activation>, owner_id: &str) -> usize {
        if let Some(previous) = slot.take() {
            self.detach_feed(previous).await;
        }
        let epoch = self.view.mutate(|view| {
            view.activate(owner_id);
            view.set_loading(true);
            view.epoch()
        });

        let subscription = match self.backend.feed.subscribe(FeedFilter::owner(owner_id)).await {
            Ok(subscription) => Some(subscription),
            Err(error) => {
                tracing::warn!(owner_id = %owner_id, error = %error, "change feed subscription failed");
                None
            }
        };

        let todos = match self
            .backend
            .records
            .select(&RecordFilter::owner(owner_id), SortOrder::CreatedDesc)
            .await
        {
            Ok(todos) => todos,
            Err(error) => {
                tracing::warn!(owner_id = %owner_id, error = %error, "failed to load todos");
                Vec::new()
            }
        };
        let count = todos.len();
        self.view.mutate(|view| {
            view.replace_all(todos);
            view.set_loading(false);
        });
        tracing::debug!(owner_id = %owner_id, count, "todos loaded");

        let feed = subscription.map(|subscription| {
            let forwarder = dispatch::spawn_feed_forwarder(subscription.events, epoch, self.queue_tx.clone());
            (subscription.handle, forwarder)
        });
        *slot = Some(Activation {
            owner_id: owner_id.to_string(),
            feed,
        });
        count
    }

    /// Auth-event path: activates only if `user` is still the signed-in user.
    async fn activate_if_current(&self, user: &User) -> AppResult<()> {
        let mut activation = self.activation.lock().await;
        let current = self.backend.session.current_user().await?;
        if current.as_ref().map(|current| current.id.as_str()) != Some(user.id.as_str()) {
            tracing::debug!(owner_id = %user.id, "stale sign-in event ignored");
            return Ok(());
        }
        self.activate_locked(&mut activation, &user.id).await;
        Ok(())
    }

    /// Auth-event path: deactivates only if nobody has signed in since.
    async fn deactivate_if_signed_out(&self) -> AppResult<()> {
        let mut activation = self.activation.lock().await;
        if self.backend.session.current_user().await?.is_some() {
            return Ok(());
        }
        self.release(&mut activation).await;
        Ok(())
    }

    async fn deactivate(&self) {
        let mut activation = self.activation.lock().await;
        self.release(&mut activation).await;
    }

    async fn release(&self, slot: &mut Option<Activation>) {
        let Some(active) = slot.take() else {
            return;
        };
        tracing::info!(owner_id = %active.owner_id, "deactivating todo list");
        self.detach_feed(active).await;
        self.view.mutate(|view| view.deactivate());
        self.discard_staged_image();
    }

    async fn detach_feed(&self, active: Activation) {
        if let Some((handle, forwarder)) = active.feed {
            forwarder.abort();
            self.backend.feed.unsubscribe(handle).await;
        }
    }

    /// Merges one change-feed event into the list. Returns whether the list changed.
    pub fn apply_feed_event(&self, event: ChangeEvent) -> bool {
        let id = event.record.id.clone();
        let kind = event.kind;
        let changed = self.view.mutate(|view| view.apply_change(event));
        tracing::debug!(todo_id = %id, kind = kind.as_str(), changed, "feed event merged");
        changed
    }

    /// Holds `attachment` for the next [`submit`](Self::submit). Returns a preview data URL.
    pub fn stage_image(&self, attachment: ImageAttachment) -> AppResult<String> {
        attachment.validate(self.settings.max_image_bytes)?;
        let preview = attachment.preview_data_url();
        *self
            .staged_image
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(attachment);
        Ok(preview)
    }

    pub fn discard_staged_image(&self) {
        self.staged_image
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    pub fn staged_image(&self) -> Option<ImageAttachment> {
        self.staged_image
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Creates a task with the staged image, if any. The image stays staged unless the task was stored.
    pub async fn submit(&self, text: &str) -> AppResult<CreateOutcome> {
        let outcome = self.create(text, self.staged_image()).await?;
        if matches!(outcome, CreateOutcome::Submitted { .. }) {
            self.discard_staged_image();
        }
        Ok(outcome)
    }

    /// Uploads the image (if any), then inserts the record. Nothing is added
    /// locally: the record shows up when the feed delivers its insert.
    pub async fn create(&self, text: &str, image: Option<ImageAttachment>) -> AppResult<CreateOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Task text cannot be empty".to_string()));
        }
        if let Some(image) = &image {
            image.validate(self.settings.max_image_bytes)?;
        }
        let Some(owner_id) = self.owner_id() else {
            return Ok(CreateOutcome::AuthRequired);
        };

        let mut uploaded = None;
        if let Some(image) = image {
            let path = object_path(&owner_id, &image);
            if let Err(error) = self
                .backend
                .blobs
                .upload(&path, image.bytes, &image.content_type)
                .await
            {
                tracing::warn!(owner_id = %owner_id, error = %error, "image upload failed");
                return Ok(CreateOutcome::UploadFailed {
                    message: error.message().to_string(),
                });
            }
            uploaded = Some(path);
        }

        let record = NewTodo {
            text: text.to_string(),
            user_id: owner_id.clone(),
            completed: false,
            image_url: uploaded.as_deref().map(|path| self.backend.blobs.public_url(path)),
        };
        match self.backend.records.insert(record).await {
            Ok(todo) => {
                tracing::info!(todo_id = %todo.id, owner_id = %owner_id, "todo created");
                Ok(CreateOutcome::Submitted { id: todo.id })
            }
            Err(error) => {
                tracing::warn!(owner_id = %owner_id, error = %error, "todo insert failed");
                if let Some(path) = uploaded {
                    self.remove_blob(path).await;
                }
                Ok(CreateOutcome::InsertFailed {
                    message: error.message().to_string(),
                })
            }
        }
    }

    pub async fn toggle_complete(&self, id: &str) -> MutationOutcome {
        let Some(owner_id) = self.owner_id() else {
            return MutationOutcome::Skipped;
        };
        let result = optimistic::run(
            &self.view,
            id,
            |todo| Some(LocalChange::Set(TodoField::Completed(!todo.completed))),
            |change| self.push_change(id, &owner_id, change),
        )
        .await;
        mutation_outcome(result).0
    }

    pub async fn edit(&self, id: &str, text: &str) -> AppResult<MutationOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Task text cannot be empty".to_string()));
        }
        let Some(owner_id) = self.owner_id() else {
            return Ok(MutationOutcome::Skipped);
        };
        let result = optimistic::run(
            &self.view,
            id,
            |_| Some(LocalChange::Set(TodoField::Text(text.to_string()))),
            |change| self.push_change(id, &owner_id, change),
        )
        .await;
        Ok(mutation_outcome(result).0)
    }

    /// Removes the record locally, then remotely. A failed delete puts the record
    /// back at the head of the list. The image is removed once the delete succeeds.
    pub async fn delete(&self, id: &str) -> MutationOutcome {
        let Some(owner_id) = self.owner_id() else {
            return MutationOutcome::Skipped;
        };
        let result = optimistic::run(
            &self.view,
            id,
            |_| Some(LocalChange::Remove),
            |change| self.push_change(id, &owner_id, change),
        )
        .await;
        let (outcome, replaced) = mutation_outcome(result);
        if let Some(Snapshot::Record(todo)) = replaced {
            self.remove_image_blob(todo.image_url.as_deref()).await;
        }
        outcome
    }

    pub async fn remove_image(&self, id: &str) -> MutationOutcome {
        let Some(owner_id) = self.owner_id() else {
            return MutationOutcome::Skipped;
        };
        let result = optimistic::run(
            &self.view,
            id,
            |todo| {
                todo.image_url
                    .as_ref()
                    .map(|_| LocalChange::Set(TodoField::ImageUrl(None)))
            },
            |change| self.push_change(id, &owner_id, change),
        )
        .await;
        let (outcome, replaced) = mutation_outcome(result);
        if let Some(Snapshot::Field(TodoField::ImageUrl(url))) = replaced {
            self.remove_image_blob(url.as_deref()).await;
        }
        outcome
    }

    async fn push_change(&self, id: &str, owner_id: &str, change: LocalChange) -> AppResult<()> {
        match change {
            LocalChange::Set(field) => self.backend.records.update(id, owner_id, field.to_patch()).await,
            LocalChange::Remove => self.backend.records.delete(id, owner_id).await,
        }
    }

    async fn remove_image_blob(&self, image_url: Option<&str>) {
        let Some(url) = image_url else {
            return;
        };
        match object_path_from_public_url(url, &self.settings.bucket) {
            Some(path) => self.remove_blob(path).await,
            None => tracing::warn!(image_url = %url, "image url does not point into the bucket"),
        }
    }

    async fn remove_blob(&self, path: String) {
        if let Err(error) = self.backend.blobs.remove(std::slice::from_ref(&path)).await {
            tracing::warn!(path = %path, error = %error, "failed to remove image");
        }
    }
}

fn mutation_outcome(result: Optimistic) -> (MutationOutcome, Option<Snapshot>) {
    match result {
        Optimistic::Applied(snapshot) => (MutationOutcome::Applied, Some(snapshot)),
        Optimistic::Reverted(error) => (
            MutationOutcome::Reverted {
                message: error.message().to_string(),
            },
            None,
        ),
        Optimistic::Skipped => (MutationOutcome::Skipped, None),
    }
}
