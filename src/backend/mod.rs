pub mod feed;
pub mod local;

use crate::errors::AppResult;
use crate::models::{
    AuthEvent, ChangeEvent, FeedFilter, NewTodo, OtpType, RecordFilter, SignUpReceipt, SortOrder, Todo,
    TodoPatch, User,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current_user(&self) -> AppResult<Option<User>>;
    async fn sign_up(&self, email: &str, password: &str, redirect_to: &str) -> AppResult<SignUpReceipt>;
    async fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<User>;
    async fn sign_out(&self) -> AppResult<()>;
    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent>;
    async fn exchange_code_for_session(&self, code: &str) -> AppResult<User>;
    async fn verify_otp(&self, token_hash: &str, otp_type: OtpType) -> AppResult<User>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn select(&self, filter: &RecordFilter, order: SortOrder) -> AppResult<Vec<Todo>>;
    async fn insert(&self, record: NewTodo) -> AppResult<Todo>;
    async fn update(&self, id: &str, owner_id: &str, patch: TodoPatch) -> AppResult<()>;
    async fn delete(&self, id: &str, owner_id: &str) -> AppResult<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> AppResult<()>;
    fn public_url(&self, path: &str) -> String;
    async fn remove(&self, paths: &[String]) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

#[derive(Debug)]
pub struct FeedSubscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: FeedFilter) -> AppResult<FeedSubscription>;
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// The four platform capabilities the sync loop talks to.
#[derive(Clone)]
pub struct Backend {
    pub session: Arc<dyn SessionProvider>,
    pub records: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Backend {
    /// Uses one value for every capability, as a hosted client library does.
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: SessionProvider + RecordStore + BlobStore + ChangeFeed + 'static,
    {
        Self {
            session: client.clone(),
            records: client.clone(),
            blobs: client.clone(),
            feed: client,
        }
    }
}
