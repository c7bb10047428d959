pub mod attachments;
pub mod auth;
pub mod backend;
mod db;
pub mod errors;
pub mod models;
pub mod sync;

pub use crate::attachments::ImageAttachment;
pub use crate::auth::{AuthRedirect, ConfirmParams, LoginForm, SignUpForm};
pub use crate::backend::local::{LocalClient, LocalPlatform, Operation};
pub use crate::backend::{Backend, BlobStore, ChangeFeed, RecordStore, SessionProvider};
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{AppSettings, ChangeEvent, CreateOutcome, MutationOutcome, Todo, User, ViewSnapshot};
pub use crate::sync::TodoSync;

use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

const CONFIG_FILE: &str = "config.yaml";

/// A local platform, one client session on it, and the sync loop driving that client.
#[derive(Clone)]
pub struct TodoApp {
    platform: Arc<LocalPlatform>,
    client: Arc<LocalClient>,
    sync: TodoSync,
}

impl TodoApp {
    /// Opens (or creates) the data directory and applies `config.yaml` if present.
    /// The dispatcher is not started.
    pub fn open_local(app_data_dir: &Path) -> AppResult<Self> {
        let platform = LocalPlatform::open(app_data_dir)?;
        apply_config_file(&platform, app_data_dir)?;
        let client = platform.connect();
        let sync = TodoSync::new(Backend::from_client(client.clone()), platform.settings());
        Ok(Self {
            platform,
            client,
            sync,
        })
    }

    /// Like [`open_local`](Self::open_local), plus logging, the dispatcher and session restore.
    pub async fn bootstrap(app_data_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(app_data_dir)?;
        let app = Self::open_local(app_data_dir)?;
        if let Err(error) = init_tracing(app_data_dir, &app.platform.settings().log_filter) {
            tracing::warn!(error = %error, "tracing already initialized");
        }
        app.sync.start();
        if let Err(error) = app.sync.restore_session().await {
            tracing::warn!(error = %error, "session restore failed");
        }
        Ok(app)
    }

    pub fn platform(&self) -> &Arc<LocalPlatform> {
        &self.platform
    }

    pub fn client(&self) -> &Arc<LocalClient> {
        &self.client
    }

    pub fn sync(&self) -> &TodoSync {
        &self.sync
    }

    /// Confirmation links point at `<site_url>/auth/confirm`.
    pub async fn sign_up(&self, form: &SignUpForm) -> AppResult<AuthRedirect> {
        let redirect_to = format!(
            "{}/auth/confirm",
            self.platform.settings().site_url.trim_end_matches('/')
        );
        auth::sign_up(self.client.as_ref(), form, &redirect_to).await
    }

    pub async fn log_in(&self, form: &LoginForm) -> AppResult<AuthRedirect> {
        auth::log_in(self.client.as_ref(), form).await
    }

    pub async fn confirm(&self, params: &ConfirmParams) -> AuthRedirect {
        auth::confirm(self.client.as_ref(), params).await
    }
}

fn apply_config_file(platform: &LocalPlatform, app_data_dir: &Path) -> AppResult<()> {
    let path = app_data_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(&path)?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    if yaml.is_null() {
        return Ok(());
    }
    let update = serde_json::to_value(yaml)?;
    if !update.is_object() {
        return Err(AppError::Validation(format!(
            "{} must contain a mapping of settings",
            path.display()
        )));
    }
    platform.update_settings(update)?;
    tracing::info!(path = %path.display(), "settings applied from config file");
    Ok(())
}

pub fn init_tracing(app_data_dir: &Path, default_filter: &str) -> AppResult<()> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "justo.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::TodoApp;

    #[test]
    fn config_file_overrides_stored_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("config.yaml"),
            "bucket: attachments\nmaxImageBytes: 1048576\nrequireEmailConfirmation: false\n",
        )
        .expect("write config");

        let app = TodoApp::open_local(dir.path()).expect("open");
        let settings = app.platform().settings();
        assert_eq!(settings.bucket, "attachments");
        assert_eq!(settings.max_image_bytes, 1_048_576);
        assert!(!settings.require_email_confirmation);
        assert_eq!(app.sync().settings().bucket, "attachments");
        assert_eq!(settings.site_url, "http://localhost:3000");
    }

    #[test]
    fn config_file_must_be_a_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.yaml"), "- just\n- a list\n").expect("write config");
        let err = TodoApp::open_local(dir.path()).err().expect("rejected");
        assert!(err.to_string().starts_with("VALIDATION"));
    }
}
