use serde::{Deserialize, Serialize};

/// Body of a successful `POST /api/token` for both the authorization-code and
/// refresh-token grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: u64,
    /// Only present on the code exchange, or when the refresh grant rotates it.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// RFC 6749 error body returned by the accounts service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl OAuthErrorResponse {
    pub fn reason(&self) -> String {
        match &self.error_description {
            Some(description) => format!("{}: {}", self.error, description),
            None => self.error.clone(),
        }
    }
}
