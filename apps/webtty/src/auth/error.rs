use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("config error: {0}")]
    Config(String),
    #[error("credential endpoint unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("credential request rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("malformed token response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            AuthError::Malformed(value.to_string())
        } else {
            AuthError::Unreachable(value)
        }
    }
}
