//! Pool bucket keys.
//!
//! Connections opened with the same credentials share a bucket; connections
//! opened without explicit credentials live in the [`ConnectionKey::Default`]
//! bucket. Passwords are compared by value but never rendered by `Debug` or
//! `Display`, so keys can be logged freely.

use std::fmt;

/// Explicit login credentials for a physical connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identifies a pooling bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    /// Connections opened without explicit credentials.
    #[default]
    Default,
    /// Connections opened for a specific login.
    Credentials(Credentials),
}

impl ConnectionKey {
    pub fn with_credentials(username: &str, password: &str) -> Self {
        ConnectionKey::Credentials(Credentials::new(username, password))
    }

    /// Credentials to hand to the supplier, if any.
    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            ConnectionKey::Default => None,
            ConnectionKey::Credentials(creds) => Some(creds),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKey::Default => write!(f, "default"),
            ConnectionKey::Credentials(creds) => write!(f, "user={}", creds.username),
        }
    }
}
