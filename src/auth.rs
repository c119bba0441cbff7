use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::errors::{AppError, AppResult};

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> AppResult<AuthUser>;

    async fn sign_in(&self, email: &str, password: &str) -> AppResult<AuthUser>;

    async fn sign_out(&self) -> AppResult<()>;

    async fn restore_session(&self) -> AppResult<Option<AuthUser>>;

    fn subscribe(&self) -> watch::Receiver<Option<AuthUser>>;

    fn current_user(&self) -> Option<AuthUser>;
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn id_token(&self) -> AppResult<SecretString>;
}

pub fn validate_credentials(email: &str, password: &str) -> AppResult<()> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::Auth("Please enter a valid email address".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Auth(format!(
            "Password should be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}
