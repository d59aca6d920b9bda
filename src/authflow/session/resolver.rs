use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, warn};
use ulid::Ulid;

use super::oauth::{
    DefaultUiInfoResolver, MemoryOAuthSessionStore, OAuthSessionError, OAuthSessionStore,
    UiInfoResolver,
};
use super::{Cookie, SessionOptions};

pub const USER_AGENT_COOKIE: &str = "authflow_ua";
pub const OAUTH_SESSION_COOKIE: &str = "authflow_oauth_session";

const USER_AGENT_COOKIE_MAX_AGE: i64 = 400 * 24 * 60 * 60;

/// What the transport extracted from the create request.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionRequest<'a> {
    pub oauth_session_id: Option<&'a str>,
    pub user_agent_id: Option<&'a str>,
    pub url_query: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSession {
    pub options: SessionOptions,
    /// Always set, even when not bound into `options`.
    pub user_agent_id: String,
    pub cookies: Vec<Cookie>,
}

pub struct SessionOptionsResolver {
    oauth: Arc<dyn OAuthSessionStore>,
    ui: Arc<dyn UiInfoResolver>,
    bind_user_agent: bool,
    cookie_secure: bool,
}

impl std::fmt::Debug for SessionOptionsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptionsResolver")
            .field("bind_user_agent", &self.bind_user_agent)
            .field("cookie_secure", &self.cookie_secure)
            .finish_non_exhaustive()
    }
}

impl Default for SessionOptionsResolver {
    fn default() -> Self {
        Self::new(
            Arc::new(MemoryOAuthSessionStore::new()),
            Arc::new(DefaultUiInfoResolver),
        )
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

impl SessionOptionsResolver {
    #[must_use]
    pub fn new(oauth: Arc<dyn OAuthSessionStore>, ui: Arc<dyn UiInfoResolver>) -> Self {
        Self {
            oauth,
            ui,
            bind_user_agent: false,
            cookie_secure: false,
        }
    }

    #[must_use]
    pub fn with_bind_user_agent(mut self, bind: bool) -> Self {
        self.bind_user_agent = bind;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn bind_user_agent(&self) -> bool {
        self.bind_user_agent
    }

    /// Build the options for a new flow.
    ///
    /// An OAuth session that is missing or expired is dropped (its cookie is
    /// cleared) and creation continues with the query parameters alone.
    ///
    /// # Errors
    /// Returns an error when the OAuth session backend or UI resolver fails.
    pub async fn resolve(&self, request: SessionRequest<'_>) -> Result<ResolvedSession> {
        let mut cookies = Vec::new();

        let user_agent_id = non_empty(request.user_agent_id)
            .map_or_else(|| Ulid::new().to_string(), str::to_string);
        cookies.push(Cookie::new(
            USER_AGENT_COOKIE,
            &user_agent_id,
            USER_AGENT_COOKIE_MAX_AGE,
            self.cookie_secure,
        ));

        let mut options = SessionOptions::default();
        if let Some(id) = non_empty(request.oauth_session_id) {
            match self.oauth.get(id).await {
                Ok(session) => {
                    options = self
                        .ui
                        .resolve(&session)
                        .await
                        .context("failed to resolve ui info")?;
                    options.oauth_session_id = id.to_string();
                }
                Err(err @ (OAuthSessionError::NotFound | OAuthSessionError::Expired)) => {
                    debug!("dropping oauth session cookie: {err}");
                    cookies.push(Cookie::clear(OAUTH_SESSION_COOKIE, self.cookie_secure));
                }
                Err(OAuthSessionError::Backend(err)) => {
                    warn!("oauth session lookup failed: {err}");
                    return Err(err.context("failed to read oauth session"));
                }
            }
        }

        if let Some(query) = non_empty(request.url_query) {
            options = options.merge(SessionOptions::from_query(query));
        }

        if self.bind_user_agent {
            options.user_agent_id.clone_from(&user_agent_id);
        }

        Ok(ResolvedSession {
            options,
            user_agent_id,
            cookies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authflow::session::OAuthSession;
    use chrono::{Duration, Utc};

    async fn resolver_with_session() -> SessionOptionsResolver {
        let store = MemoryOAuthSessionStore::new();
        store
            .insert(
                "oauth-1",
                OAuthSession {
                    client_id: "a".to_string(),
                    state: "s1".to_string(),
                    prompt: vec!["login".to_string(), "consent".to_string()],
                    ..OAuthSession::default()
                },
            )
            .await;
        store
            .insert(
                "oauth-expired",
                OAuthSession {
                    client_id: "old".to_string(),
                    expires_at: Some(Utc::now() - Duration::seconds(1)),
                    ..OAuthSession::default()
                },
            )
            .await;
        SessionOptionsResolver::new(Arc::new(store), Arc::new(DefaultUiInfoResolver))
    }

    #[tokio::test]
    async fn query_overrides_oauth_session() -> anyhow::Result<()> {
        let resolver = resolver_with_session().await;
        let resolved = resolver
            .resolve(SessionRequest {
                oauth_session_id: Some("oauth-1"),
                user_agent_id: Some("ua-1"),
                url_query: Some("state=s2"),
            })
            .await?;
        assert_eq!(resolved.options.client_id, "a");
        assert_eq!(resolved.options.state, "s2");
        assert_eq!(resolved.options.prompt, "login consent");
        assert_eq!(resolved.options.oauth_session_id, "oauth-1");
        assert!(resolved.options.user_agent_id.is_empty());
        assert_eq!(resolved.user_agent_id, "ua-1");
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_expired_oauth_session_clears_cookie() -> anyhow::Result<()> {
        let resolver = resolver_with_session().await;
        for id in ["unknown", "oauth-expired"] {
            let resolved = resolver
                .resolve(SessionRequest {
                    oauth_session_id: Some(id),
                    url_query: Some("client_id=b"),
                    ..SessionRequest::default()
                })
                .await?;
            assert_eq!(resolved.options.client_id, "b");
            assert!(resolved.options.oauth_session_id.is_empty());
            assert!(
                resolved
                    .cookies
                    .iter()
                    .any(|cookie| cookie.name == OAUTH_SESSION_COOKIE && cookie.max_age == 0)
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn user_agent_is_created_and_optionally_bound() -> anyhow::Result<()> {
        let resolver = SessionOptionsResolver::default().with_bind_user_agent(true);
        let resolved = resolver.resolve(SessionRequest::default()).await?;
        assert!(!resolved.user_agent_id.is_empty());
        assert_eq!(resolved.options.user_agent_id, resolved.user_agent_id);
        assert!(
            resolved
                .cookies
                .iter()
                .any(|cookie| cookie.name == USER_AGENT_COOKIE
                    && cookie.value == resolved.user_agent_id)
        );
        Ok(())
    }
}
