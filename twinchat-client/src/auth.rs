use std::sync::RwLock;

/// Synchronous accessor for the current access token.
///
/// Token issuance and refresh live outside this crate; absence of a token is
/// a valid, handled state (connection attempts abort without retrying).
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// Token holder backed by a lock, for embedders that refresh tokens from
/// elsewhere. Also what the tests use.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().expect("token lock poisoned") = token;
    }
}

impl TokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Option<String> {
        self.token.read().expect("token lock poisoned").clone()
    }
}
