pub mod error;
pub mod gate;

use async_trait::async_trait;
use std::fmt;

pub use error::AuthError;
pub use gate::{HttpCredentialProvider, TokenEndpointConfig};

/// Short-lived credential presented in the channel handshake.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(<{} bytes>)", self.0.len())
    }
}

/// Source of channel tokens. `refresh` is called once per open attempt and
/// its result is never reused across attempts.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn refresh(&self) -> Result<Token, AuthError>;
}

/// Hands out the same token every time; for servers without a token endpoint
/// or tokens supplied out of band.
#[derive(Clone, Debug)]
pub struct StaticCredentialProvider {
    token: Token,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Token::new(token),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn refresh(&self) -> Result<Token, AuthError> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_debug_is_redacted() {
        let token = Token::new("s3cret");
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("s3cret"));
        assert_eq!(rendered, "Token(<6 bytes>)");
    }

    #[tokio::test]
    async fn static_provider_returns_configured_token() {
        let provider = StaticCredentialProvider::new("abc");
        assert_eq!(provider.refresh().await.unwrap().as_str(), "abc");
        assert_eq!(provider.refresh().await.unwrap().as_str(), "abc");
    }
}
