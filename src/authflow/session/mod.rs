//! Session context carried by every workflow.
//!
//! [`SessionOptions`] is computed once when a flow is created (see
//! [`SessionOptionsResolver`]) and stored with the workflow. Steps read it on
//! every replay; nothing writes to it afterwards.

mod oauth;
mod resolver;

use serde::{Deserialize, Serialize};

pub use oauth::{
    DefaultUiInfoResolver, MemoryOAuthSessionStore, OAuthSession, OAuthSessionError,
    OAuthSessionStore, UiInfoResolver,
};
pub use resolver::{
    OAUTH_SESSION_COOKIE, ResolvedSession, SessionOptionsResolver, SessionRequest,
    USER_AGENT_COOKIE,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub x_state: String,
    pub ui_locales: String,
    pub user_agent_id: String,
    pub oauth_session_id: String,
    pub prompt: String,
    pub id_token_hint: String,
    pub user_id_hint: String,
    pub login_hint: String,
    pub suppress_idp_session_cookie: bool,
}

fn replace_if_set(target: &mut String, value: String) {
    if !value.is_empty() {
        *target = value;
    }
}

impl SessionOptions {
    /// Options a client may pass in the authorization URL query.
    /// `user_agent_id` and `oauth_session_id` are server-assigned and ignored.
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let mut options = Self::default();
        let query = query.trim_start_matches('?');
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim().to_string();
            match key.as_ref() {
                "client_id" => options.client_id = value,
                "redirect_uri" => options.redirect_uri = value,
                "state" => options.state = value,
                "x_state" => options.x_state = value,
                "ui_locales" => options.ui_locales = value,
                "prompt" => options.prompt = value,
                "id_token_hint" => options.id_token_hint = value,
                "user_id_hint" => options.user_id_hint = value,
                "login_hint" => options.login_hint = value,
                "suppress_idp_session_cookie" => {
                    options.suppress_idp_session_cookie = matches!(value.as_str(), "true" | "1");
                }
                _ => {}
            }
        }
        options
    }

    /// Overlay `overrides`: a non-empty field replaces, an empty one keeps.
    #[must_use]
    pub fn merge(mut self, overrides: Self) -> Self {
        replace_if_set(&mut self.client_id, overrides.client_id);
        replace_if_set(&mut self.redirect_uri, overrides.redirect_uri);
        replace_if_set(&mut self.state, overrides.state);
        replace_if_set(&mut self.x_state, overrides.x_state);
        replace_if_set(&mut self.ui_locales, overrides.ui_locales);
        replace_if_set(&mut self.user_agent_id, overrides.user_agent_id);
        replace_if_set(&mut self.oauth_session_id, overrides.oauth_session_id);
        replace_if_set(&mut self.prompt, overrides.prompt);
        replace_if_set(&mut self.id_token_hint, overrides.id_token_hint);
        replace_if_set(&mut self.user_id_hint, overrides.user_id_hint);
        replace_if_set(&mut self.login_hint, overrides.login_hint);
        self.suppress_idp_session_cookie |= overrides.suppress_idp_session_cookie;
        self
    }
}

/// A cookie the transport must set on the response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub max_age: i64,
    pub secure: bool,
}

impl Cookie {
    #[must_use]
    pub fn new(name: &str, value: &str, max_age: i64, secure: bool) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            max_age,
            secure,
        }
    }

    #[must_use]
    pub fn clear(name: &str, secure: bool) -> Self {
        Self::new(name, "", 0, secure)
    }

    /// `Set-Cookie` header value.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.name, self.value, self.max_age
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_overrides_only_non_empty_fields() {
        let from_cookie = SessionOptions {
            client_id: "a".to_string(),
            state: "s1".to_string(),
            ..SessionOptions::default()
        };
        let merged = from_cookie.merge(SessionOptions::from_query("state=s2&client_id="));
        assert_eq!(
            merged,
            SessionOptions {
                client_id: "a".to_string(),
                state: "s2".to_string(),
                ..SessionOptions::default()
            }
        );
    }

    #[test]
    fn from_query_ignores_server_assigned_fields() {
        let options = SessionOptions::from_query(
            "?user_agent_id=forged&oauth_session_id=forged&ui_locales=fr%20en&suppress_idp_session_cookie=true",
        );
        assert!(options.user_agent_id.is_empty());
        assert!(options.oauth_session_id.is_empty());
        assert_eq!(options.ui_locales, "fr en");
        assert!(options.suppress_idp_session_cookie);
    }

    #[test]
    fn cookie_header_values() {
        let cookie = Cookie::new("authflow_ua", "01ABC", 60, true);
        assert_eq!(
            cookie.to_header_value(),
            "authflow_ua=01ABC; Path=/; HttpOnly; SameSite=Lax; Max-Age=60; Secure"
        );
        assert_eq!(
            Cookie::clear("authflow_oauth_session", false).to_header_value(),
            "authflow_oauth_session=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0"
        );
    }
}
