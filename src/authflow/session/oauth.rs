use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use super::SessionOptions;

/// An OAuth authorization request parked while the user authenticates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OAuthSession {
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub x_state: String,
    pub prompt: Vec<String>,
    pub ui_locales: String,
    pub id_token_hint: String,
    pub login_hint: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum OAuthSessionError {
    #[error("oauth session not found")]
    NotFound,
    #[error("oauth session expired")]
    Expired,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait OAuthSessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<OAuthSession, OAuthSessionError>;
}

/// Turns an authorization session into the options the UI needs.
#[async_trait]
pub trait UiInfoResolver: Send + Sync {
    async fn resolve(&self, session: &OAuthSession) -> anyhow::Result<SessionOptions>;
}

#[derive(Debug, Default)]
pub struct MemoryOAuthSessionStore {
    sessions: RwLock<HashMap<String, OAuthSession>>,
}

impl MemoryOAuthSessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: &str, session: OAuthSession) {
        self.sessions.write().await.insert(id.to_string(), session);
    }
}

#[async_trait]
impl OAuthSessionStore for MemoryOAuthSessionStore {
    async fn get(&self, id: &str) -> Result<OAuthSession, OAuthSessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or(OAuthSessionError::NotFound)?;
        if session.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(OAuthSessionError::Expired);
        }
        Ok(session.clone())
    }
}

/// Copies the authorization request parameters as they are.
#[derive(Clone, Debug, Default)]
pub struct DefaultUiInfoResolver;

#[async_trait]
impl UiInfoResolver for DefaultUiInfoResolver {
    async fn resolve(&self, session: &OAuthSession) -> anyhow::Result<SessionOptions> {
        Ok(SessionOptions {
            client_id: session.client_id.clone(),
            redirect_uri: session.redirect_uri.clone(),
            state: session.state.clone(),
            x_state: session.x_state.clone(),
            ui_locales: session.ui_locales.clone(),
            prompt: session.prompt.join(" "),
            id_token_hint: session.id_token_hint.clone(),
            login_hint: session.login_hint.clone(),
            ..SessionOptions::default()
        })
    }
}
