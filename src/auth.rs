//! Sign-up, login and email-confirmation flows on top of a [`SessionProvider`].

use crate::backend::SessionProvider;
use crate::errors::{AppError, AppResult};
use crate::models::OtpType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpForm {
    pub email: String,
    pub password: String,
    pub repeat_password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

/// Query parameters of the confirmation link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmParams {
    pub code: Option<String>,
    pub token_hash: Option<String>,
    #[serde(rename = "type")]
    pub otp_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", content = "message", rename_all = "kebab-case")]
pub enum AuthRedirect {
    Home,
    SignUpSuccess,
    Error(String),
}

impl AuthRedirect {
    pub fn path(&self) -> String {
        match self {
            Self::Home => "/".to_string(),
            Self::SignUpSuccess => "/auth/sign-up-success".to_string(),
            Self::Error(message) => format!("/auth/error?error={}", urlencoding::encode(message)),
        }
    }
}

fn require(value: &str, field: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

/// Registers a new account. Errors carry the message the form shows.
pub async fn sign_up(provider: &dyn SessionProvider, form: &SignUpForm, redirect_to: &str) -> AppResult<AuthRedirect> {
    require(&form.email, "Email")?;
    require(&form.password, "Password")?;
    if form.password != form.repeat_password {
        return Err(AppError::Validation("Passwords do not match".to_string()));
    }
    let receipt = provider.sign_up(&form.email, &form.password, redirect_to).await?;
    tracing::info!(
        user_id = %receipt.user.id,
        confirmation_required = receipt.confirmation_required,
        "account registered"
    );
    Ok(AuthRedirect::SignUpSuccess)
}

pub async fn log_in(provider: &dyn SessionProvider, form: &LoginForm) -> AppResult<AuthRedirect> {
    require(&form.email, "Email")?;
    require(&form.password, "Password")?;
    let user = provider.sign_in_with_password(&form.email, &form.password).await?;
    tracing::info!(user_id = %user.id, "signed in");
    Ok(AuthRedirect::Home)
}

/// Handles the confirmation link. A `code` takes precedence over `token_hash` + `type`.
pub async fn confirm(provider: &dyn SessionProvider, params: &ConfirmParams) -> AuthRedirect {
    fn non_empty(value: &Option<String>) -> Option<&str> {
        value.as_deref().map(str::trim).filter(|value| !value.is_empty())
    }

    let result = if let Some(code) = non_empty(&params.code) {
        provider.exchange_code_for_session(code).await
    } else if let (Some(token_hash), Some(raw_type)) = (non_empty(&params.token_hash), non_empty(&params.otp_type)) {
        match OtpType::parse(raw_type) {
            Some(otp_type) => provider.verify_otp(token_hash, otp_type).await,
            None => Err(AppError::Validation(format!("Unsupported verification type '{}'", raw_type))),
        }
    } else {
        return AuthRedirect::Error("No verification code or token".to_string());
    };

    match result {
        Ok(user) => {
            tracing::info!(user_id = %user.id, "email confirmed");
            AuthRedirect::Home
        }
        Err(error) => {
            tracing::warn!(error = %error, "email confirmation failed");
            AuthRedirect::Error(error.message().to_string())
        }
    }
}
