//! Self-contained platform: SQLite rows, files on disk for blobs, an in-process
//! change feed and password sessions. One [`LocalPlatform`] plays the server;
//! every [`LocalClient`] is one signed-in (or anonymous) browser session.

use crate::attachments::{encode_path, object_path_from_public_url};
use crate::backend::feed::FeedHub;
use crate::backend::{BlobStore, ChangeFeed, FeedSubscription, RecordStore, SessionProvider, SubscriptionHandle};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, AuthEvent, ChangeEvent, FeedFilter, NewTodo, OtpType, RecordFilter, SignUpReceipt, SortOrder,
    Todo, TodoPatch, User, TODOS_TABLE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

const MIN_PASSWORD_LEN: usize = 6;
const PASSWORD_SCHEME: &str = "pbkdf2-sha256";
const PASSWORD_ROUNDS: u32 = 100_000;
const PKCE_TOKEN_KIND: &str = "pkce";
const RLS_VIOLATION: &str = "new row violates row-level security policy";

/// A confirmation mail the platform would have sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationMessage {
    pub email: String,
    pub redirect_to: String,
    pub code: String,
    pub token_hash: String,
    pub otp_type: OtpType,
    pub created_at: DateTime<Utc>,
}

pub struct LocalPlatform {
    db: Arc<Database>,
    blob_root: PathBuf,
    settings: RwLock<AppSettings>,
    feed: FeedHub,
    commit_gate: Mutex<()>,
    outbox: Mutex<Vec<ConfirmationMessage>>,
}

impl LocalPlatform {
    pub fn open(data_dir: &Path) -> AppResult<Arc<Self>> {
        std::fs::create_dir_all(data_dir)?;
        let db = Database::new(&data_dir.join("justo.db"))?;
        let settings = db.get_settings()?;
        let blob_root = data_dir.join("storage");
        std::fs::create_dir_all(&blob_root)?;
        tracing::info!(path = %db.path().display(), "local platform opened");

        Ok(Arc::new(Self {
            db: Arc::new(db),
            blob_root,
            settings: RwLock::new(settings),
            feed: FeedHub::new(),
            commit_gate: Mutex::new(()),
            outbox: Mutex::new(Vec::new()),
        }))
    }

    pub fn connect(self: &Arc<Self>) -> Arc<LocalClient> {
        let (auth_events, _) = broadcast::channel(32);
        Arc::new(LocalClient {
            platform: self.clone(),
            session: RwLock::new(None),
            auth_events,
            faults: Mutex::new(HashSet::new()),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    pub fn settings(&self) -> AppSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let settings = self.db.update_settings(update)?;
        let mut writer = self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *writer = settings.clone();
        Ok(settings)
    }

    pub fn outbox(&self) -> Vec<ConfirmationMessage> {
        self.outbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn latest_confirmation(&self, email: &str) -> Option<ConfirmationMessage> {
        let email = normalize_email(email);
        self.outbox()
            .into_iter()
            .rev()
            .find(|message| message.email == email)
    }

    /// Reads a blob the way an anonymous HTTP GET on its public URL would.
    pub fn fetch_public(&self, url: &str) -> AppResult<Option<Vec<u8>>> {
        let bucket = self.settings().bucket;
        let Some(path) = object_path_from_public_url(url, &bucket) else {
            return Ok(None);
        };
        if self.db.blob_owner(&bucket, &path)?.is_none() {
            return Ok(None);
        }
        let file = self.blob_file(&bucket, &path)?;
        match std::fs::read(file) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub fn blob_count(&self) -> AppResult<u64> {
        self.db.count_blobs(&self.settings().bucket)
    }

    pub fn get_todo(&self, id: &str) -> AppResult<Option<Todo>> {
        self.db.get_todo(id)
    }

    pub fn feed_subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    fn blob_file(&self, bucket: &str, path: &str) -> AppResult<PathBuf> {
        validate_object_path(path)?;
        Ok(self.blob_root.join(bucket).join(path))
    }

    fn commit_insert(&self, record: &NewTodo) -> AppResult<Todo> {
        let _gate = self.commit_gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let todo = self.db.insert_todo(record)?;
        self.feed.publish(TODOS_TABLE, &ChangeEvent::insert(todo.clone()));
        Ok(todo)
    }

    fn commit_update(&self, id: &str, owner_id: &str, patch: &TodoPatch) -> AppResult<Todo> {
        let _gate = self.commit_gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let todo = self
            .db
            .update_todo(id, owner_id, patch)?
            .ok_or_else(|| AppError::NotFound(format!("Todo {} not found", id)))?;
        self.feed.publish(TODOS_TABLE, &ChangeEvent::update(todo.clone()));
        Ok(todo)
    }

    fn commit_delete(&self, id: &str, owner_id: &str) -> AppResult<Todo> {
        let _gate = self.commit_gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let todo = self
            .db
            .delete_todo(id, owner_id)?
            .ok_or_else(|| AppError::NotFound(format!("Todo {} not found", id)))?;
        self.feed.publish(TODOS_TABLE, &ChangeEvent::delete(todo.clone()));
        Ok(todo)
    }

    fn record_confirmation(&self, message: ConfirmationMessage) {
        self.outbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }
}

/// Remote calls a client can be told to fail, to simulate a flaky network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Upload,
    Remove,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Select,
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
        Operation::Upload,
        Operation::Remove,
    ];
}

pub struct LocalClient {
    platform: Arc<LocalPlatform>,
    session: RwLock<Option<User>>,
    auth_events: broadcast::Sender<AuthEvent>,
    faults: Mutex<HashSet<Operation>>,
    latency: Mutex<Duration>,
}

impl LocalClient {
    pub fn platform(&self) -> &Arc<LocalPlatform> {
        &self.platform
    }

    pub fn set_failing(&self, operation: Operation, failing: bool) {
        let mut faults = self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if failing {
            faults.insert(operation);
        } else {
            faults.remove(&operation);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        for operation in Operation::ALL {
            self.set_failing(operation, offline);
        }
    }

    /// Delay applied before every record and blob call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    async fn round_trip(&self, operation: Operation) -> AppResult<()> {
        let latency = *self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&operation);
        if failing {
            return Err(AppError::Transport(format!(
                "network request failed ({:?})",
                operation
            )));
        }
        Ok(())
    }

    fn session_user(&self) -> Option<User> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn require_owner(&self, owner_id: &str) -> AppResult<User> {
        let user = self
            .session_user()
            .ok_or_else(|| AppError::AccessDenied("No active session".to_string()))?;
        if user.id != owner_id {
            return Err(AppError::AccessDenied(format!(
                "{} for table \"{}\"",
                RLS_VIOLATION, TODOS_TABLE
            )));
        }
        Ok(user)
    }

    fn establish_session(&self, user: User) -> User {
        *self.session.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(user.clone());
        let _ = self.auth_events.send(AuthEvent::SignedIn(user.clone()));
        user
    }
}

#[async_trait]
impl SessionProvider for LocalClient {
    async fn current_user(&self) -> AppResult<Option<User>> {
        Ok(self.session_user())
    }

    async fn sign_up(&self, email: &str, password: &str, redirect_to: &str) -> AppResult<SignUpReceipt> {
        let email = normalize_email(email);
        if !EMAIL_RE.is_match(&email) {
            return Err(AppError::Validation(
                "Unable to validate email address: invalid format".to_string(),
            ));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::Validation(format!(
                "Password should be at least {} characters.",
                MIN_PASSWORD_LEN
            )));
        }

        let salt = random_hex();
        let password_hash = hash_password(salt.clone(), password.to_string()).await?;
        let user = self.platform.db.insert_user(&email, &salt, &password_hash)?;

        if !self.platform.settings().require_email_confirmation {
            let user = self.platform.db.confirm_user(&user.id)?;
            let user = self.establish_session(user);
            return Ok(SignUpReceipt {
                user,
                confirmation_required: false,
            });
        }

        let code = random_hex();
        let token_hash = sha256_hex(random_hex().as_bytes());
        self.platform
            .db
            .insert_auth_token(&sha256_hex(code.as_bytes()), &user.id, PKCE_TOKEN_KIND)?;
        self.platform
            .db
            .insert_auth_token(&token_hash, &user.id, OtpType::Signup.as_str())?;
        self.platform.record_confirmation(ConfirmationMessage {
            email: email.clone(),
            redirect_to: redirect_to.to_string(),
            code,
            token_hash,
            otp_type: OtpType::Signup,
            created_at: Utc::now(),
        });
        tracing::info!(user_id = %user.id, "sign-up pending email confirmation");

        Ok(SignUpReceipt {
            user,
            confirmation_required: true,
        })
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<User> {
        let invalid = || AppError::Auth("Invalid login credentials".to_string());
        let credentials = self
            .platform
            .db
            .find_credentials(&normalize_email(email))?
            .ok_or_else(invalid)?;
        let matches = verify_password(
            credentials.password_salt.clone(),
            password.to_string(),
            credentials.password_hash.clone(),
        )
        .await?;
        if !matches {
            return Err(invalid());
        }
        if self.platform.settings().require_email_confirmation && credentials.user.confirmed_at.is_none() {
            return Err(AppError::Auth("Email not confirmed".to_string()));
        }
        Ok(self.establish_session(credentials.user))
    }

    async fn sign_out(&self) -> AppResult<()> {
        *self.session.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        let _ = self.auth_events.send(AuthEvent::SignedOut);
        Ok(())
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }

    async fn exchange_code_for_session(&self, code: &str) -> AppResult<User> {
        let user_id = self
            .platform
            .db
            .consume_auth_token(&sha256_hex(code.trim().as_bytes()), PKCE_TOKEN_KIND)?;
        let user = self.platform.db.confirm_user(&user_id)?;
        Ok(self.establish_session(user))
    }

    async fn verify_otp(&self, token_hash: &str, otp_type: OtpType) -> AppResult<User> {
        let user_id = self
            .platform
            .db
            .consume_auth_token(token_hash.trim(), otp_type.as_str())?;
        let user = self.platform.db.confirm_user(&user_id)?;
        Ok(self.establish_session(user))
    }
}

#[async_trait]
impl RecordStore for LocalClient {
    async fn select(&self, filter: &RecordFilter, order: SortOrder) -> AppResult<Vec<Todo>> {
        self.round_trip(Operation::Select).await?;
        self.require_owner(&filter.owner_id)?;
        self.platform.db.select_todos(&filter.owner_id, order)
    }

    async fn insert(&self, record: NewTodo) -> AppResult<Todo> {
        self.round_trip(Operation::Insert).await?;
        self.require_owner(&record.user_id)?;
        self.platform.commit_insert(&record)
    }

    async fn update(&self, id: &str, owner_id: &str, patch: TodoPatch) -> AppResult<()> {
        self.round_trip(Operation::Update).await?;
        self.require_owner(owner_id)?;
        if patch.is_empty() {
            return Ok(());
        }
        self.platform.commit_update(id, owner_id, &patch).map(|_| ())
    }

    async fn delete(&self, id: &str, owner_id: &str) -> AppResult<()> {
        self.round_trip(Operation::Delete).await?;
        self.require_owner(owner_id)?;
        self.platform.commit_delete(id, owner_id).map(|_| ())
    }
}

#[async_trait]
impl BlobStore for LocalClient {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> AppResult<()> {
        self.round_trip(Operation::Upload).await?;
        let user = self
            .session_user()
            .ok_or_else(|| AppError::Upload("No active session".to_string()))?;
        if !path.starts_with(&format!("{}/", user.id)) {
            return Err(AppError::Upload(RLS_VIOLATION.to_string()));
        }
        let settings = self.platform.settings();
        let file = self
            .platform
            .blob_file(&settings.bucket, path)
            .map_err(|error| AppError::Upload(error.message().to_string()))?;
        let cache_control = settings.upload_cache_control_seconds.to_string();
        self.platform.db.insert_blob(
            &settings.bucket,
            path,
            &user.id,
            content_type,
            bytes.len() as u64,
            Some(&cache_control),
        )?;

        let written = match file.parent() {
            Some(parent) => std::fs::create_dir_all(parent).and_then(|_| std::fs::write(&file, &bytes)),
            None => std::fs::write(&file, &bytes),
        };
        if let Err(error) = written {
            if let Err(cleanup) = self.platform.db.delete_blob(&settings.bucket, path) {
                tracing::warn!(path = %path, error = %cleanup, "failed to drop metadata of unwritten blob");
            }
            return Err(AppError::Upload(error.to_string()));
        }
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        let settings = self.platform.settings();
        format!(
            "{}/storage/v1/object/public/{}/{}",
            settings.public_url_base.trim_end_matches('/'),
            encode_path(&settings.bucket),
            encode_path(path)
        )
    }

    async fn remove(&self, paths: &[String]) -> AppResult<()> {
        self.round_trip(Operation::Remove).await?;
        let user = self
            .session_user()
            .ok_or_else(|| AppError::AccessDenied("No active session".to_string()))?;
        let bucket = self.platform.settings().bucket;
        for path in paths {
            let file = self.platform.blob_file(&bucket, path)?;
            match self.platform.db.blob_owner(&bucket, path)? {
                Some(owner) if owner == user.id => {}
                // Other owners' objects and missing objects are silently skipped.
                _ => continue,
            }
            self.platform.db.delete_blob(&bucket, path)?;
            if let Err(error) = std::fs::remove_file(&file) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for LocalClient {
    async fn subscribe(&self, filter: FeedFilter) -> AppResult<FeedSubscription> {
        self.require_owner(&filter.owner_id)?;
        let (handle, events) = self.platform.feed.open(filter);
        Ok(FeedSubscription { handle, events })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.platform.feed.close(handle);
    }
}

fn validate_object_path(path: &str) -> AppResult<()> {
    let candidate = Path::new(path);
    let clean = !path.is_empty()
        && !path.contains('\\')
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if clean {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid object path '{}'", path)))
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn random_hex() -> String {
    let bytes: [u8; 16] = rand::random();
    hex(&bytes)
}

/// Stored as `pbkdf2-sha256$<rounds>$<hex digest>`.
async fn hash_password(salt: String, password: String) -> AppResult<String> {
    tokio::task::spawn_blocking(move || {
        format!(
            "{}${}${}",
            PASSWORD_SCHEME,
            PASSWORD_ROUNDS,
            derive_key(&salt, &password, PASSWORD_ROUNDS)
        )
    })
    .await
    .map_err(|error| AppError::Internal(error.to_string()))
}

async fn verify_password(salt: String, password: String, stored: String) -> AppResult<bool> {
    tokio::task::spawn_blocking(move || {
        let mut parts = stored.splitn(3, '$');
        let (Some(scheme), Some(rounds), Some(expected)) = (parts.next(), parts.next(), parts.next()) else {
            return false;
        };
        let Ok(rounds) = rounds.parse::<u32>() else {
            return false;
        };
        scheme == PASSWORD_SCHEME && rounds > 0 && derive_key(&salt, &password, rounds) == expected
    })
    .await
    .map_err(|error| AppError::Internal(error.to_string()))
}

fn derive_key(salt: &str, password: &str, rounds: u32) -> String {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), rounds, &mut key);
    hex(&key)
}

fn sha256_hex(input: &[u8]) -> String {
    hex(&Sha256::digest(input))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

#[cfg(test)]
mod tests {
    use super::{hash_password, validate_object_path, verify_password, LocalPlatform, Operation};
    use crate::backend::{BlobStore, ChangeFeed, RecordStore, SessionProvider};
    use crate::models::{AuthEvent, FeedFilter, NewTodo, OtpType, RecordFilter, SortOrder, TodoPatch};

    fn new_todo(owner: &str, text: &str) -> NewTodo {
        NewTodo {
            text: text.to_string(),
            user_id: owner.to_string(),
            completed: false,
            image_url: None,
        }
    }

    #[tokio::test]
    async fn sign_up_requires_confirmation_before_password_sign_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        let platform = LocalPlatform::open(dir.path()).expect("platform");
        let client = platform.connect();

        let receipt = client
            .sign_up("Ada@Example.com", "hunter22", "http://localhost:3000/auth/confirm")
            .await
            .expect("sign up");
        assert!(receipt.confirmation_required);

        let err = client
            .sign_in_with_password("ada@example.com", "hunter22")
            .await
            .expect_err("unconfirmed");
        assert!(err.to_string().contains("Email not confirmed"));

        let message = platform.latest_confirmation("ada@example.com").expect("mail");
        let user = client
            .verify_otp(&message.token_hash, OtpType::Signup)
            .await
            .expect("verify");
        assert!(user.confirmed_at.is_some());
        assert!(client
            .verify_otp(&message.token_hash, OtpType::Signup)
            .await
            .is_err());

        client.sign_out().await.expect("sign out");
        let wrong = client.sign_in_with_password("ada@example.com", "nope").await;
        assert!(wrong.is_err());
        client
            .sign_in_with_password("ada@example.com", "hunter22")
            .await
            .expect("sign in");
    }

    #[tokio::test]
    async fn code_exchange_signs_in_and_notifies_listeners() {
        let dir = tempfile::tempdir().expect("tempdir");
        let platform = LocalPlatform::open(dir.path()).expect("platform");
        let client = platform.connect();
        let mut events = client.on_auth_state_change();

        client
            .sign_up("bob@example.com", "secret1", "/auth/confirm")
            .await
            .expect("sign up");
        let message = platform.latest_confirmation("bob@example.com").expect("mail");
        let user = client
            .exchange_code_for_session(&message.code)
            .await
            .expect("exchange");

        assert_eq!(events.recv().await.expect("event"), AuthEvent::SignedIn(user.clone()));
        assert_eq!(client.current_user().await.expect("current"), Some(user));
    }

    #[tokio::test]
    async fn records_are_scoped_to_the_session_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let platform = LocalPlatform::open(dir.path()).expect("platform");
        platform
            .update_settings(serde_json::json!({ "requireEmailConfirmation": false }))
            .expect("settings");
        let alice = platform.connect();
        let bob = platform.connect();
        let alice_user = alice
            .sign_up("alice@example.com", "password", "/")
            .await
            .expect("alice")
            .user;
        let bob_user = bob.sign_up("bob@example.com", "password", "/").await.expect("bob").user;

        let todo = alice.insert(new_todo(&alice_user.id, "mine")).await.expect("insert");
        assert!(bob.insert(new_todo(&alice_user.id, "forged")).await.is_err());
        assert!(bob
            .update(&todo.id, &alice_user.id, TodoPatch::completed(true))
            .await
            .is_err());
        assert!(bob.delete(&todo.id, &bob_user.id).await.is_err());
        assert!(bob.subscribe(FeedFilter::owner(alice_user.id.clone())).await.is_err());

        let listed = alice
            .select(&RecordFilter::owner(alice_user.id.clone()), SortOrder::CreatedDesc)
            .await
            .expect("select");
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].completed);
    }

    #[tokio::test]
    async fn committed_writes_reach_feed_subscribers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let platform = LocalPlatform::open(dir.path()).expect("platform");
        platform
            .update_settings(serde_json::json!({ "requireEmailConfirmation": false }))
            .expect("settings");
        let client = platform.connect();
        let user = client.sign_up("c@example.com", "password", "/").await.expect("user").user;
        let mut subscription = client
            .subscribe(FeedFilter::owner(user.id.clone()))
            .await
            .expect("subscribe");

        let todo = client.insert(new_todo(&user.id, "watch me")).await.expect("insert");
        client
            .update(&todo.id, &user.id, TodoPatch::text("watched"))
            .await
            .expect("update");
        client.delete(&todo.id, &user.id).await.expect("delete");

        let kinds = [
            subscription.events.recv().await.expect("insert event"),
            subscription.events.recv().await.expect("update event"),
            subscription.events.recv().await.expect("delete event"),
        ]
        .iter()
        .map(|event| event.kind.as_str())
        .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["INSERT", "UPDATE", "DELETE"]);

        client.unsubscribe(subscription.handle).await;
        assert_eq!(platform.feed_subscriber_count(), 0);
    }

    #[tokio::test]
    async fn blobs_are_owner_namespaced_and_publicly_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let platform = LocalPlatform::open(dir.path()).expect("platform");
        platform
            .update_settings(serde_json::json!({ "requireEmailConfirmation": false }))
            .expect("settings");
        let client = platform.connect();
        let user = client.sign_up("d@example.com", "password", "/").await.expect("user").user;

        let foreign = client.upload("someone/x.png", vec![1], "image/png").await;
        assert!(foreign.is_err());

        let path = format!("{}/1-abc.png", user.id);
        client.upload(&path, vec![7, 7, 7], "image/png").await.expect("upload");
        assert!(client.upload(&path, vec![1], "image/png").await.is_err());

        let url = client.public_url(&path);
        assert!(url.contains("/todo%20list/"));
        assert_eq!(platform.fetch_public(&url).expect("fetch"), Some(vec![7, 7, 7]));

        client.remove(&[path.clone()]).await.expect("remove");
        assert_eq!(platform.fetch_public(&url).expect("fetch"), None);
        assert_eq!(platform.blob_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn faults_fail_only_the_selected_operation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let platform = LocalPlatform::open(dir.path()).expect("platform");
        platform
            .update_settings(serde_json::json!({ "requireEmailConfirmation": false }))
            .expect("settings");
        let client = platform.connect();
        let user = client.sign_up("e@example.com", "password", "/").await.expect("user").user;

        client.set_failing(Operation::Insert, true);
        let err = client.insert(new_todo(&user.id, "x")).await.expect_err("insert fails");
        assert!(err.to_string().starts_with("TRANSPORT"));
        client
            .select(&RecordFilter::owner(user.id.clone()), SortOrder::CreatedDesc)
            .await
            .expect("select still works");

        client.set_failing(Operation::Insert, false);
        client.insert(new_todo(&user.id, "x")).await.expect("insert recovers");
    }

    #[tokio::test]
    async fn failed_blob_write_leaves_no_metadata_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let platform = LocalPlatform::open(dir.path()).expect("platform");
        platform
            .update_settings(serde_json::json!({ "requireEmailConfirmation": false }))
            .expect("settings");
        let client = platform.connect();
        let user = client.sign_up("f@example.com", "password", "/").await.expect("user").user;

        let path = format!("{}/2-def.png", user.id);
        let target = platform
            .blob_file(&platform.settings().bucket, &path)
            .expect("blob file");
        std::fs::create_dir_all(&target).expect("directory in the way");
        let err = client.upload(&path, vec![1], "image/png").await.expect_err("write fails");
        assert!(err.to_string().starts_with("UPLOAD"));
        assert_eq!(platform.blob_count().expect("count"), 0);

        std::fs::remove_dir(&target).expect("clear the way");
        client.upload(&path, vec![1], "image/png").await.expect("retry succeeds");
        assert_eq!(platform.blob_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn passwords_are_stored_as_derived_keys() {
        let salt = "0123456789abcdef".to_string();
        let stored = hash_password(salt.clone(), "hunter22".to_string()).await.expect("hash");
        assert!(stored.starts_with("pbkdf2-sha256$100000$"));
        assert!(!stored.contains("hunter22"));

        assert!(verify_password(salt.clone(), "hunter22".to_string(), stored.clone())
            .await
            .expect("verify"));
        assert!(!verify_password(salt.clone(), "hunter23".to_string(), stored.clone())
            .await
            .expect("verify"));
        assert!(!verify_password("other".to_string(), "hunter22".to_string(), stored)
            .await
            .expect("verify"));
        assert!(!verify_password(salt, "hunter22".to_string(), "garbage".to_string())
            .await
            .expect("verify"));
    }

    #[test]
    fn rejects_escaping_object_paths() {
        assert!(validate_object_path("u1/a.png").is_ok());
        assert!(validate_object_path("../a.png").is_err());
        assert!(validate_object_path("/etc/passwd").is_err());
        assert!(validate_object_path("u1\\a.png").is_err());
        assert!(validate_object_path("").is_err());
    }
}
