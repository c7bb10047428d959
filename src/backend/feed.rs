use crate::backend::SubscriptionHandle;
use crate::models::{ChangeEvent, FeedFilter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct Subscriber {
    filter: FeedFilter,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

/// Fan-out of committed row changes to filtered subscribers.
#[derive(Clone, Default)]
pub struct FeedHub {
    subscribers: Arc<Mutex<HashMap<SubscriptionHandle, Subscriber>>>,
    next_handle: Arc<AtomicU64>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, filter: FeedFilter) -> (SubscriptionHandle, mpsc::UnboundedReceiver<ChangeEvent>) {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = mpsc::unbounded_channel::<ChangeEvent>();
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.insert(handle, Subscriber { filter, sender });
        (handle, receiver)
    }

    /// Delivers to every matching subscriber and drops subscribers whose receiver is gone.
    pub fn publish(&self, table: &str, event: &ChangeEvent) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut delivered = 0usize;
        subscribers.retain(|handle, subscriber| {
            if !subscriber.filter.matches(table, &event.record) {
                return !subscriber.sender.is_closed();
            }
            match subscriber.sender.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    tracing::debug!(handle = handle.0, "dropping closed feed subscriber");
                    false
                }
            }
        });
        delivered
    }

    pub fn close(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.remove(&handle).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
