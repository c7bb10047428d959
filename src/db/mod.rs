use crate::errors::{AppError, AppResult};
use crate::models::{AppSettings, NewTodo, SortOrder, Todo, TodoPatch, User};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const TODO_COLUMNS: &str = "id, user_id, text, completed, image_url, created_at, updated_at";

/// Stored credentials for one account.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: User,
    pub password_salt: String,
    pub password_hash: String,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'app'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<AppSettings>(&raw).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: AppSettings = serde_json::from_value(merged)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('app', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, format_time(Utc::now())],
        )?;

        Ok(settings)
    }

    pub fn insert_user(&self, email: &str, password_salt: &str, password_hash: &str) -> AppResult<User> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        let exists = conn
            .query_row("SELECT 1 FROM users WHERE email = ?1", [email], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            return Err(AppError::Auth("User already registered".to_string()));
        }
        conn.execute(
            "INSERT INTO users (id, email, password_salt, password_hash, confirmed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![id, email, password_salt, password_hash, format_time(now)],
        )?;
        Ok(User {
            id,
            email: email.to_string(),
            confirmed_at: None,
            created_at: now,
        })
    }

    pub fn find_credentials(&self, email: &str) -> AppResult<Option<Credentials>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, email, confirmed_at, created_at, password_salt, password_hash
             FROM users WHERE email = ?1",
            [email],
            |row| {
                Ok(Credentials {
                    user: parse_user_row(row)?,
                    password_salt: row.get(4)?,
                    password_hash: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_user(&self, user_id: &str) -> AppResult<Option<User>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, email, confirmed_at, created_at FROM users WHERE id = ?1",
            [user_id],
            parse_user_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn confirm_user(&self, user_id: &str) -> AppResult<User> {
        {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE users SET confirmed_at = COALESCE(confirmed_at, ?1) WHERE id = ?2",
                params![format_time(Utc::now()), user_id],
            )?;
        }
        self.get_user(user_id)?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
    }

    pub fn insert_auth_token(&self, token_hash: &str, user_id: &str, kind: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO auth_tokens (token_hash, user_id, kind, created_at, consumed_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![token_hash, user_id, kind, format_time(Utc::now())],
        )?;
        Ok(())
    }

    /// Marks a token used and returns its user. Each token is accepted once.
    pub fn consume_auth_token(&self, token_hash: &str, kind: &str) -> AppResult<String> {
        let conn = self.lock()?;
        let user_id = conn
            .query_row(
                "SELECT user_id FROM auth_tokens
                 WHERE token_hash = ?1 AND kind = ?2 AND consumed_at IS NULL",
                params![token_hash, kind],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| AppError::Auth("Token has expired or is invalid".to_string()))?;
        conn.execute(
            "UPDATE auth_tokens SET consumed_at = ?1 WHERE token_hash = ?2",
            params![format_time(Utc::now()), token_hash],
        )?;
        Ok(user_id)
    }

    pub fn select_todos(&self, owner_id: &str, order: SortOrder) -> AppResult<Vec<Todo>> {
        let direction = match order {
            SortOrder::CreatedDesc => "DESC",
            SortOrder::CreatedAsc => "ASC",
        };
        let sql = format!(
            "SELECT {} FROM todos WHERE user_id = ?1 ORDER BY created_at {dir}, rowid {dir}",
            TODO_COLUMNS,
            dir = direction
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([owner_id], parse_todo_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_todo(&self, id: &str) -> AppResult<Option<Todo>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM todos WHERE id = ?1", TODO_COLUMNS),
            [id],
            parse_todo_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn insert_todo(&self, new_todo: &NewTodo) -> AppResult<Todo> {
        let text = new_todo.text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Task text cannot be empty".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO todos (id, user_id, text, completed, image_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    id,
                    new_todo.user_id,
                    text,
                    new_todo.completed,
                    new_todo.image_url,
                    format_time(Utc::now()),
                ],
            )?;
        }
        // Read back so timestamps carry the stored precision.
        self.get_todo(&id)?
            .ok_or_else(|| AppError::Internal(format!("Todo {} vanished after insert", id)))
    }

    /// Applies `patch` to the row owned by `owner_id`. `None` when no row matched.
    pub fn update_todo(&self, id: &str, owner_id: &str, patch: &TodoPatch) -> AppResult<Option<Todo>> {
        if let Some(text) = &patch.text {
            if text.trim().is_empty() {
                return Err(AppError::Validation("Task text cannot be empty".to_string()));
            }
        }
        let now = format_time(Utc::now());
        let changed = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE todos SET
                   text = COALESCE(?1, text),
                   completed = COALESCE(?2, completed),
                   image_url = CASE WHEN ?3 THEN ?4 ELSE image_url END,
                   updated_at = ?5
                 WHERE id = ?6 AND user_id = ?7",
                params![
                    patch.text.as_deref().map(str::trim),
                    patch.completed,
                    patch.image_url.is_some(),
                    patch.image_url.clone().flatten(),
                    now,
                    id,
                    owner_id,
                ],
            )?
        };
        if changed == 0 {
            return Ok(None);
        }
        self.get_todo(id)
    }

    /// Deletes the row owned by `owner_id` and returns it. `None` when no row matched.
    pub fn delete_todo(&self, id: &str, owner_id: &str) -> AppResult<Option<Todo>> {
        let conn = self.lock()?;
        let existing = conn
            .query_row(
                &format!("SELECT {} FROM todos WHERE id = ?1 AND user_id = ?2", TODO_COLUMNS),
                params![id, owner_id],
                parse_todo_row,
            )
            .optional()?;
        if existing.is_some() {
            conn.execute(
                "DELETE FROM todos WHERE id = ?1 AND user_id = ?2",
                params![id, owner_id],
            )?;
        }
        Ok(existing)
    }

    pub fn insert_blob(
        &self,
        bucket: &str,
        path: &str,
        owner_id: &str,
        content_type: &str,
        size_bytes: u64,
        cache_control: Option<&str>,
    ) -> AppResult<()> {
        let conn = self.lock()?;
        let exists = conn
            .query_row(
                "SELECT 1 FROM blobs WHERE bucket = ?1 AND path = ?2",
                params![bucket, path],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(AppError::Upload("The resource already exists".to_string()));
        }
        conn.execute(
            "INSERT INTO blobs (bucket, path, owner_id, content_type, size_bytes, cache_control, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                bucket,
                path,
                owner_id,
                content_type,
                size_bytes as i64,
                cache_control,
                format_time(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn blob_owner(&self, bucket: &str, path: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT owner_id FROM blobs WHERE bucket = ?1 AND path = ?2",
            params![bucket, path],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn delete_blob(&self, bucket: &str, path: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM blobs WHERE bucket = ?1 AND path = ?2",
            params![bucket, path],
        )?;
        Ok(removed > 0)
    }

    pub fn count_blobs(&self, bucket: &str) -> AppResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blobs WHERE bucket = ?1",
            [bucket],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
            params![
                serde_json::to_string(&AppSettings::default())?,
                format_time(Utc::now())
            ],
        )?;
        Ok(())
    }
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        confirmed_at: row
            .get::<_, Option<String>>(2)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        created_at: parse_time(&row.get::<_, String>(3)?)?,
    })
}

fn parse_todo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get(0)?,
        user_id: row.get(1)?,
        text: row.get(2)?,
        completed: row.get(3)?,
        image_url: row.get(4)?,
        created_at: parse_time(&row.get::<_, String>(5)?)?,
        updated_at: parse_time(&row.get::<_, String>(6)?)?,
    })
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
