//! Token resolution for the auth handshake.
//!
//! Tokens ride in-band as the first application message (`auth{token}`),
//! never in a URL or header. A token is `user:secret`; the userbase file
//! maps each username to a bcrypt hash of their secret. Unknown users and
//! wrong secrets are rejected identically, and unknown users still pay for
//! a bcrypt verification against a dummy hash so the two cases cost the
//! same.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// A syntactically valid bcrypt hash that matches no secret we ever issue.
/// Verified against for unknown usernames to equalize rejection timing.
const DUMMY_HASH: &str = "$2b$12$C8qQGPGl8ScYlEr1BwDVeOQb1X9T3V1mVmZlYF3Yf9uQ9P1dGeS7m";

/// Looks a bearer token up and yields the authenticated username.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve_token(&self, token: &str) -> Option<String>;
}

#[derive(Debug, Error)]
pub enum UserbaseError {
    #[error("unable to read userbase file: {0}")]
    Io(#[from] std::io::Error),
    #[error("userbase file contains malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    pw_hash: String,
    #[serde(default)]
    #[allow(dead_code)]
    groups: Vec<String>,
}

/// File-backed userbase, the format written by the user-management CLI:
/// `{ "alice": { "pw_hash": "$2b$...", "groups": [...] }, ... }`.
pub struct Userbase {
    users: HashMap<String, UserEntry>,
}

impl Userbase {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UserbaseError> {
        let raw = std::fs::read_to_string(path)?;
        let users = serde_json::from_str(&raw)?;
        Ok(Userbase { users })
    }

    #[cfg(test)]
    fn from_entries(users: HashMap<String, UserEntry>) -> Self {
        Userbase { users }
    }
}

#[async_trait]
impl TokenResolver for Userbase {
    async fn resolve_token(&self, token: &str) -> Option<String> {
        let (user, secret) = match token.split_once(':') {
            Some(parts) => parts,
            // Malformed token: burn a verify anyway, then reject.
            None => ("", ""),
        };
        let (hash, known) = match self.users.get(user) {
            Some(entry) => (entry.pw_hash.clone(), true),
            None => (DUMMY_HASH.to_string(), false),
        };
        let secret = secret.to_string();
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(secret, &hash))
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or(false);
        if known && verified {
            Some(user.to_string())
        } else {
            None
        }
    }
}

/// Resolver used when `require_auth` is off: any token authenticates as an
/// anonymous user.
pub struct AllowAnyToken;

#[async_trait]
impl TokenResolver for AllowAnyToken {
    async fn resolve_token(&self, _token: &str) -> Option<String> {
        Some("anonymous".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn userbase_with(user: &str, secret: &str) -> Userbase {
        let hash = bcrypt::hash(secret, 4).unwrap();
        let mut users = HashMap::new();
        users.insert(
            user.to_string(),
            UserEntry {
                pw_hash: hash,
                groups: vec![],
            },
        );
        Userbase::from_entries(users)
    }

    #[tokio::test]
    async fn known_token_resolves_to_user() {
        let userbase = userbase_with("alice", "hunter2");
        assert_eq!(
            userbase.resolve_token("alice:hunter2").await,
            Some("alice".to_string())
        );
    }

    #[tokio::test]
    async fn wrong_secret_and_unknown_user_reject_identically() {
        let userbase = userbase_with("alice", "hunter2");
        assert_eq!(userbase.resolve_token("alice:wrong").await, None);
        assert_eq!(userbase.resolve_token("mallory:hunter2").await, None);
        assert_eq!(userbase.resolve_token("no-colon-token").await, None);
        assert_eq!(userbase.resolve_token("").await, None);
    }

    #[tokio::test]
    async fn allow_any_resolves_everything() {
        assert_eq!(
            AllowAnyToken.resolve_token("whatever").await,
            Some("anonymous".to_string())
        );
    }
}
