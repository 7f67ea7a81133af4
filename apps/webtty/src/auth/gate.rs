use crate::auth::error::AuthError;
use crate::auth::{CredentialProvider, Token};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TokenEndpointConfig {
    pub url: Url,
    /// `user:password` pair sent as HTTP basic auth, matching servers started
    /// with a credential requirement.
    pub basic_auth: Option<(String, String)>,
    pub timeout: Duration,
}

impl TokenEndpointConfig {
    /// Derives `<base>/token` from the terminal page URL.
    pub fn for_base(base: &Url) -> Result<Self, AuthError> {
        let url = join_path(base, "token")?;
        Ok(Self {
            url,
            basic_auth: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_basic_auth(mut self, credential: Option<&str>) -> Self {
        self.basic_auth = credential.and_then(|pair| {
            pair.split_once(':')
                .map(|(user, pass)| (user.to_string(), pass.to_string()))
        });
        self
    }
}

fn join_path(base: &Url, leaf: &str) -> Result<Url, AuthError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(leaf)
        .map_err(|err| AuthError::Config(format!("invalid token endpoint '{leaf}': {err}")))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Fetches a fresh token from the server's token endpoint on every refresh.
#[derive(Debug, Clone)]
pub struct HttpCredentialProvider {
    client: Client,
    config: TokenEndpointConfig,
}

impl HttpCredentialProvider {
    pub fn new(config: TokenEndpointConfig) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| AuthError::Config(err.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TokenEndpointConfig {
        &self.config
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn refresh(&self) -> Result<Token, AuthError> {
        let mut request = self.client.get(self.config.url.clone());
        if let Some((user, pass)) = &self.config.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                detail: if detail.trim().is_empty() {
                    "no detail".into()
                } else {
                    detail.trim().to_string()
                },
            });
        }

        let body: TokenResponse = response.json().await?;
        debug!(
            target = "webtty::auth",
            url = %self.config.url,
            token_len = body.token.len(),
            "token refreshed"
        );
        Ok(Token::new(body.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_url_is_relative_to_page_path() {
        let base = Url::parse("https://host.example/term/").unwrap();
        let config = TokenEndpointConfig::for_base(&base).unwrap();
        assert_eq!(config.url.as_str(), "https://host.example/term/token");

        let bare = Url::parse("http://127.0.0.1:7681").unwrap();
        let config = TokenEndpointConfig::for_base(&bare).unwrap();
        assert_eq!(config.url.as_str(), "http://127.0.0.1:7681/token");

        let no_slash = Url::parse("http://127.0.0.1:7681/term").unwrap();
        let config = TokenEndpointConfig::for_base(&no_slash).unwrap();
        assert_eq!(config.url.as_str(), "http://127.0.0.1:7681/term/token");
    }

    #[test]
    fn basic_auth_requires_colon() {
        let base = Url::parse("http://localhost:7681/").unwrap();
        let config = TokenEndpointConfig::for_base(&base)
            .unwrap()
            .with_basic_auth(Some("admin:hunter2"));
        assert_eq!(
            config.basic_auth,
            Some(("admin".to_string(), "hunter2".to_string()))
        );

        let config = config.with_basic_auth(Some("nocolon"));
        assert_eq!(config.basic_auth, None);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_auth_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let base = Url::parse("http://127.0.0.1:9/").unwrap();
        let mut config = TokenEndpointConfig::for_base(&base).unwrap();
        config.timeout = Duration::from_secs(2);
        let provider = HttpCredentialProvider::new(config).unwrap();
        let err = provider.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::Unreachable(_)));
    }
}
