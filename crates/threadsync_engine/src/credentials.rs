//! Access tokens for the sync API.

use crate::error::SyncResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Bearer tokens for one profile.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    /// Token sent as `Authorization: Bearer`.
    pub access_token: String,
    /// Refresh token, when the profile has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl AuthTokens {
    /// Builds tokens from raw input, trimming both values. Returns `None`
    /// when the access token is blank; a blank refresh token is dropped.
    pub fn from_raw(access_token: &str, refresh_token: Option<&str>) -> Option<Self> {
        Some(Self {
            access_token: normalize_token(access_token)?,
            refresh_token: refresh_token.and_then(normalize_token),
        })
    }
}

impl fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokens")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Trims a token; blank tokens are rejected.
pub fn normalize_token(token: &str) -> Option<String> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Keychain-style account name for a token.
pub fn account_name(profile_id: &str, token_kind: &str) -> String {
    format!("{profile_id}:{token_kind}")
}

/// Source of credentials for a profile.
pub trait CredentialProvider: Send + Sync {
    /// Loads the tokens for a profile, `None` if the profile has none.
    fn load_tokens(&self, profile_id: &str) -> SyncResult<Option<AuthTokens>>;
}

/// In-process credential map.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    entries: RwLock<HashMap<String, String>>,
}

impl StaticCredentials {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider holding one profile's access token.
    pub fn single(profile_id: &str, access_token: &str) -> Self {
        let provider = Self::new();
        provider.save_tokens(profile_id, access_token, None);
        provider
    }

    /// Stores tokens. A blank access token clears the profile; a blank or
    /// missing refresh token removes any stored refresh token.
    pub fn save_tokens(&self, profile_id: &str, access_token: &str, refresh_token: Option<&str>) {
        let mut entries = self.entries.write();
        match normalize_token(access_token) {
            Some(token) => {
                entries.insert(account_name(profile_id, "access"), token);
            }
            None => {
                entries.remove(&account_name(profile_id, "access"));
            }
        }
        match refresh_token.and_then(normalize_token) {
            Some(token) => {
                entries.insert(account_name(profile_id, "refresh"), token);
            }
            None => {
                entries.remove(&account_name(profile_id, "refresh"));
            }
        }
    }

    /// Removes a profile's tokens.
    pub fn clear_tokens(&self, profile_id: &str) {
        let mut entries = self.entries.write();
        entries.remove(&account_name(profile_id, "access"));
        entries.remove(&account_name(profile_id, "refresh"));
    }
}

impl CredentialProvider for StaticCredentials {
    fn load_tokens(&self, profile_id: &str) -> SyncResult<Option<AuthTokens>> {
        let entries = self.entries.read();
        let Some(access) = entries.get(&account_name(profile_id, "access")) else {
            return Ok(None);
        };
        Ok(Some(AuthTokens {
            access_token: access.clone(),
            refresh_token: entries.get(&account_name(profile_id, "refresh")).cloned(),
        }))
    }
}

/// Reads tokens from environment variables.
///
/// For profile `work` the variables are `THREADSYNC_WORK_ACCESS_TOKEN` and
/// `THREADSYNC_WORK_REFRESH_TOKEN`, falling back to the unscoped
/// `THREADSYNC_ACCESS_TOKEN` and `THREADSYNC_REFRESH_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    prefix: String,
}

impl EnvCredentials {
    /// Uses the `THREADSYNC` prefix.
    pub fn new() -> Self {
        Self::with_prefix("THREADSYNC")
    }

    /// Uses a custom variable prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var(&self, profile_id: &str, kind: &str) -> Option<String> {
        let scope: String = profile_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        let scoped = format!("{}_{scope}_{kind}_TOKEN", self.prefix);
        let unscoped = format!("{}_{kind}_TOKEN", self.prefix);
        std::env::var(scoped)
            .ok()
            .and_then(|v| normalize_token(&v))
            .or_else(|| std::env::var(unscoped).ok().and_then(|v| normalize_token(&v)))
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for EnvCredentials {
    fn load_tokens(&self, profile_id: &str) -> SyncResult<Option<AuthTokens>> {
        let Some(access_token) = self.var(profile_id, "ACCESS") else {
            return Ok(None);
        };
        Ok(Some(AuthTokens {
            access_token,
            refresh_token: self.var(profile_id, "REFRESH"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_tokens() {
        assert_eq!(normalize_token("  abc \n"), Some("abc".to_string()));
        assert_eq!(normalize_token("   "), None);
        assert!(AuthTokens::from_raw(" ", Some("r")).is_none());
        assert_eq!(
            AuthTokens::from_raw("a", Some(" ")).unwrap().refresh_token,
            None
        );
    }

    #[test]
    fn account_name_is_stable() {
        assert_eq!(account_name("thread-1", "access"), "thread-1:access");
    }

    #[test]
    fn static_provider_round_trip() {
        let creds = StaticCredentials::new();
        assert!(creds.load_tokens("p").unwrap().is_none());

        creds.save_tokens("p", " tok ", Some("ref"));
        let tokens = creds.load_tokens("p").unwrap().unwrap();
        assert_eq!(tokens.access_token, "tok");
        assert_eq!(tokens.refresh_token.as_deref(), Some("ref"));

        creds.save_tokens("p", "tok2", None);
        assert!(creds.load_tokens("p").unwrap().unwrap().refresh_token.is_none());

        creds.clear_tokens("p");
        assert!(creds.load_tokens("p").unwrap().is_none());
    }

    #[test]
    fn debug_redacts() {
        let tokens = AuthTokens::from_raw("secret", Some("secret2")).unwrap();
        let shown = format!("{tokens:?}");
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let tokens = AuthTokens::from_raw("a", None).unwrap();
        assert_eq!(
            serde_json::to_string(&tokens).unwrap(),
            r#"{"accessToken":"a"}"#
        );
    }

    #[test]
    fn env_provider_prefers_scoped_variables() {
        std::env::set_var("TSTEST_WORK_ACCESS_TOKEN", " scoped ");
        std::env::set_var("TSTEST_ACCESS_TOKEN", "plain");
        let creds = EnvCredentials::with_prefix("TSTEST");

        assert_eq!(
            creds.load_tokens("work").unwrap().unwrap().access_token,
            "scoped"
        );
        assert_eq!(
            creds.load_tokens("home").unwrap().unwrap().access_token,
            "plain"
        );
        assert!(EnvCredentials::with_prefix("TSTEST_NONE")
            .load_tokens("x")
            .unwrap()
            .is_none());
    }
}
