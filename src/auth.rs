// src/auth.rs

//! Credentials for transfer requests.

/// Supplies the bearer token attached to every transfer request.
///
/// Called once per request, so implementations may rotate tokens between
/// attempts of the same job.
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Sends requests without an `Authorization` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl TokenProvider for NoAuth {
    fn bearer_token(&self) -> Option<String> {
        None
    }
}

/// A fixed token, e.g. taken from the command line.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.clone())
        }
    }
}
