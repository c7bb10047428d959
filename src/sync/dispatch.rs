use crate::backend::SessionProvider;
use crate::models::{AuthEvent, ChangeEvent};
use crate::sync::TodoSync;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Everything the dispatcher reacts to, in arrival order.
#[derive(Debug)]
pub(crate) enum SyncMessage {
    /// A feed event tagged with the session epoch its subscription belongs to.
    Feed { epoch: u64, event: ChangeEvent },
    Auth(AuthEvent),
}

/// Handles one message to completion before taking the next.
pub(crate) async fn run_loop(sync: TodoSync, mut receiver: mpsc::UnboundedReceiver<SyncMessage>) {
    while let Some(message) = receiver.recv().await {
        handle_message(&sync, message).await;
    }
    tracing::debug!("sync dispatcher stopped");
}

async fn handle_message(sync: &TodoSync, message: SyncMessage) {
    match message {
        SyncMessage::Feed { epoch, event } => {
            let current = sync.view.read(|view| view.epoch());
            if current != epoch {
                tracing::debug!(todo_id = %event.record.id, "feed event from a previous session dropped");
                return;
            }
            sync.apply_feed_event(event);
        }
        SyncMessage::Auth(AuthEvent::SignedIn(user)) => {
            if let Err(error) = sync.activate_if_current(&user).await {
                tracing::warn!(owner_id = %user.id, error = %error, "failed to activate after sign-in");
            }
        }
        SyncMessage::Auth(AuthEvent::SignedOut) => {
            if let Err(error) = sync.deactivate_if_signed_out().await {
                tracing::warn!(error = %error, "failed to deactivate after sign-out");
            }
        }
    }
}

pub(crate) fn spawn_feed_forwarder(
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    epoch: u64,
    queue: mpsc::UnboundedSender<SyncMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if queue.send(SyncMessage::Feed { epoch, event }).is_err() {
                break;
            }
        }
    })
}

pub(crate) fn spawn_auth_forwarder(
    mut events: broadcast::Receiver<AuthEvent>,
    session: Arc<dyn SessionProvider>,
    queue: mpsc::UnboundedSender<SyncMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed transitions collapse into the provider's current state.
                    tracing::warn!(skipped, "auth events lagged, resyncing from session");
                    match session.current_user().await {
                        Ok(Some(user)) => AuthEvent::SignedIn(user),
                        Ok(None) => AuthEvent::SignedOut,
                        Err(error) => {
                            tracing::warn!(error = %error, "failed to read session after lag");
                            continue;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if queue.send(SyncMessage::Auth(event)).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::SyncMessage;
    use crate::backend::local::LocalPlatform;
    use crate::backend::{Backend, SessionProvider};
    use crate::models::{ChangeEvent, Todo};
    use crate::sync::TodoSync;
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn feed_events_from_an_old_epoch_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let platform = LocalPlatform::open(dir.path()).expect("platform");
        platform
            .update_settings(serde_json::json!({ "requireEmailConfirmation": false }))
            .expect("settings");
        let client = platform.connect();
        let user = client.sign_up("q@example.com", "password", "/").await.expect("sign up").user;
        let sync = TodoSync::new(Backend::from_client(client), platform.settings());
        sync.restore_session().await.expect("restore");

        let now = Utc::now();
        let record = Todo {
            id: "ghost".to_string(),
            user_id: user.id.clone(),
            text: "from before".to_string(),
            completed: false,
            image_url: None,
            created_at: now,
            updated_at: now,
        };
        let epoch = sync.view.read(|view| view.epoch());
        super::handle_message(
            &sync,
            SyncMessage::Feed {
                epoch: epoch - 1,
                event: ChangeEvent::insert(record.clone()),
            },
        )
        .await;
        assert!(sync.snapshot().todos.is_empty());

        super::handle_message(
            &sync,
            SyncMessage::Feed {
                epoch,
                event: ChangeEvent::insert(record),
            },
        )
        .await;
        assert!(sync.snapshot().contains("ghost"));
    }

    #[tokio::test]
    async fn auth_events_drive_activation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let platform = LocalPlatform::open(dir.path()).expect("platform");
        platform
            .update_settings(serde_json::json!({ "requireEmailConfirmation": false }))
            .expect("settings");
        let client = platform.connect();
        let sync = TodoSync::new(Backend::from_client(client.clone()), platform.settings());
        sync.start();
        sync.start();
        let mut view = sync.subscribe_view();

        let user = client.sign_up("r@example.com", "password", "/").await.expect("sign up").user;
        let active = tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|snapshot| {
                snapshot.owner_id.as_deref() == Some(user.id.as_str()) && !snapshot.loading
            }),
        )
        .await
        .expect("activated in time")
        .expect("sender alive")
        .clone();
        assert!(active.todos.is_empty());

        client.sign_out().await.expect("sign out");
        tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|snapshot| snapshot.owner_id.is_none()),
        )
        .await
        .expect("deactivated in time")
        .expect("sender alive");
    }
}
