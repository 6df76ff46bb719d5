//! Credentials for route calls.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wraps a token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Supplies tokens and learns when the remote rejects them.
///
/// Token acquisition and refresh live outside the engine.
pub trait AuthProvider: Send + Sync {
    /// The token to use, or `None` while signed out.
    fn current_token(&self) -> Option<AuthToken>;

    /// Called when a route rejected the current token.
    fn on_unauthorized(&self);
}

/// An [`AuthProvider`] holding a token set by the application.
///
/// A rejected token is dropped, so sync stays paused until a new one is set.
#[derive(Debug, Default)]
pub struct StaticAuth {
    token: RwLock<Option<AuthToken>>,
    rejections: AtomicUsize,
}

impl StaticAuth {
    /// Creates a provider holding `token`.
    pub fn new(token: Option<AuthToken>) -> Self {
        Self {
            token: RwLock::new(token),
            rejections: AtomicUsize::new(0),
        }
    }

    /// Installs a new token.
    pub fn set_token(&self, token: AuthToken) {
        *self.token.write() = Some(token);
    }

    /// Signs out.
    pub fn clear(&self) {
        *self.token.write() = None;
    }

    /// How many times a token was rejected.
    pub fn rejections(&self) -> usize {
        self.rejections.load(Ordering::SeqCst)
    }
}

impl AuthProvider for StaticAuth {
    fn current_token(&self) -> Option<AuthToken> {
        self.token.read().clone()
    }

    fn on_unauthorized(&self) {
        self.rejections.fetch_add(1, Ordering::SeqCst);
        self.clear();
    }
}
