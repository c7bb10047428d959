use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the `todos` table. Field names follow the store's column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub completed: bool,
    #[serde(default)]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTodo {
    pub text: String,
    pub user_id: String,
    pub completed: bool,
    pub image_url: Option<String>,
}

/// Partial update. `image_url: Some(None)` nulls the column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Option<String>>,
}

impl TodoPatch {
    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Self::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn clear_image() -> Self {
        Self {
            image_url: Some(None),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.completed.is_none() && self.image_url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "user", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    SignedIn(User),
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpType {
    Signup,
    Email,
    Magiclink,
    Recovery,
    Invite,
    EmailChange,
}

impl OtpType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::Email => "email",
            Self::Magiclink => "magiclink",
            Self::Recovery => "recovery",
            Self::Invite => "invite",
            Self::EmailChange => "email_change",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "signup" => Some(Self::Signup),
            "email" => Some(Self::Email),
            "magiclink" => Some(Self::Magiclink),
            "recovery" => Some(Self::Recovery),
            "invite" => Some(Self::Invite),
            "email_change" => Some(Self::EmailChange),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpReceipt {
    pub user: User,
    pub confirmation_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Row-level change pushed by the feed. Deletes carry the last known row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    pub record: Todo,
}

impl ChangeEvent {
    pub fn insert(record: Todo) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
        }
    }

    pub fn update(record: Todo) -> Self {
        Self {
            kind: ChangeKind::Update,
            record,
        }
    }

    pub fn delete(record: Todo) -> Self {
        Self {
            kind: ChangeKind::Delete,
            record,
        }
    }
}

pub const TODOS_TABLE: &str = "todos";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedFilter {
    pub table: String,
    pub owner_id: String,
}

impl FeedFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            table: TODOS_TABLE.to_string(),
            owner_id: owner_id.into(),
        }
    }

    pub fn matches(&self, table: &str, record: &Todo) -> bool {
        self.table == table && self.owner_id == record.user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilter {
    pub owner_id: String,
}

impl RecordFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortOrder {
    #[default]
    CreatedDesc,
    CreatedAsc,
}

/// What observers of the list see after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSnapshot {
    pub version: u64,
    pub owner_id: Option<String>,
    pub loading: bool,
    pub todos: Vec<Todo>,
}

impl ViewSnapshot {
    pub fn get(&self, id: &str) -> Option<&Todo> {
        self.todos.iter().find(|todo| todo.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.todos.iter().map(|todo| todo.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CreateOutcome {
    /// Stored remotely; the row enters the view when the feed delivers it.
    Submitted { id: String },
    AuthRequired,
    UploadFailed { message: String },
    InsertFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum MutationOutcome {
    Applied,
    Reverted { message: String },
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub bucket: String,
    pub max_image_bytes: u64,
    pub upload_cache_control_seconds: u32,
    pub public_url_base: String,
    pub site_url: String,
    pub require_email_confirmation: bool,
    pub feed_park_capacity: usize,
    pub log_filter: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            bucket: "todo list".to_string(),
            max_image_bytes: 5 * 1024 * 1024,
            upload_cache_control_seconds: 3600,
            public_url_base: "http://127.0.0.1:54321".to_string(),
            site_url: "http://localhost:3000".to_string(),
            require_email_confirmation: true,
            feed_park_capacity: 256,
            log_filter: "info".to_string(),
        }
    }
}
