//! User directory collaborator.
//!
//! Steps only need four operations: look a user up by login id, create one,
//! check a password and replace it. The in-memory directory hashes passwords
//! with argon2 and is what the server runs with when no external directory is
//! wired in.

use anyhow::anyhow;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use ulid::Ulid;

use crate::authflow::error::{DomainError, StepError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginIdType {
    Email,
    Phone,
}

impl LoginIdType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

impl fmt::Display for LoginIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub login_id: String,
    pub login_id_type: LoginIdType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum UserDirectoryError {
    #[error("user already exists")]
    AlreadyExists,
    #[error("user not found")]
    NotFound,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<UserDirectoryError> for StepError {
    fn from(err: UserDirectoryError) -> Self {
        match err {
            UserDirectoryError::AlreadyExists => Self::Domain(DomainError::UserExists),
            UserDirectoryError::NotFound => Self::Domain(DomainError::UserNotFound),
            UserDirectoryError::Backend(err) => Self::Internal(err),
        }
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_login_id(&self, login_id: &str) -> Result<Option<User>, UserDirectoryError>;

    async fn create_user(
        &self,
        login_id: &str,
        login_id_type: LoginIdType,
        password: Option<&str>,
    ) -> Result<User, UserDirectoryError>;

    /// `Ok(false)` for a wrong password or a user without one.
    async fn verify_password(&self, user_id: &str, password: &str)
    -> Result<bool, UserDirectoryError>;

    async fn set_password(&self, user_id: &str, password: &str) -> Result<(), UserDirectoryError>;
}

#[derive(Debug)]
struct UserRecord {
    user: User,
    password_hash: Option<String>,
}

#[derive(Debug, Default)]
struct Directory {
    users: HashMap<String, UserRecord>,
    by_login_id: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    inner: Mutex<Directory>,
}

impl MemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn hash_password(password: &str) -> Result<String, UserDirectoryError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| UserDirectoryError::Backend(anyhow!("failed to hash password: {err}")))
}

fn password_matches(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_by_login_id(&self, login_id: &str) -> Result<Option<User>, UserDirectoryError> {
        let directory = self.inner.lock().await;
        Ok(directory
            .by_login_id
            .get(login_id)
            .and_then(|id| directory.users.get(id))
            .map(|record| record.user.clone()))
    }

    async fn create_user(
        &self,
        login_id: &str,
        login_id_type: LoginIdType,
        password: Option<&str>,
    ) -> Result<User, UserDirectoryError> {
        let password_hash = password.map(hash_password).transpose()?;
        let mut directory = self.inner.lock().await;
        if directory.by_login_id.contains_key(login_id) {
            return Err(UserDirectoryError::AlreadyExists);
        }
        let user = User {
            id: Ulid::new().to_string(),
            login_id: login_id.to_string(),
            login_id_type,
            created_at: Utc::now(),
        };
        directory
            .by_login_id
            .insert(login_id.to_string(), user.id.clone());
        directory.users.insert(
            user.id.clone(),
            UserRecord {
                user: user.clone(),
                password_hash,
            },
        );
        info!(user_id = %user.id, login_id_type = %login_id_type, "user created");
        Ok(user)
    }

    async fn verify_password(
        &self,
        user_id: &str,
        password: &str,
    ) -> Result<bool, UserDirectoryError> {
        let directory = self.inner.lock().await;
        let record = directory
            .users
            .get(user_id)
            .ok_or(UserDirectoryError::NotFound)?;
        Ok(record
            .password_hash
            .as_deref()
            .is_some_and(|hash| password_matches(hash, password)))
    }

    async fn set_password(&self, user_id: &str, password: &str) -> Result<(), UserDirectoryError> {
        let password_hash = hash_password(password)?;
        let mut directory = self.inner.lock().await;
        let record = directory
            .users
            .get_mut(user_id)
            .ok_or(UserDirectoryError::NotFound)?;
        record.password_hash = Some(password_hash);
        Ok(())
    }
}
