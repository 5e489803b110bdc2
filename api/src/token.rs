use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::errors::{AuthError, StoreError};
use crate::models::{TokenGrant, User};
use crate::spotify::MusicApi;
use crate::store::UserStore;

/// Whether the cached access token can be used as-is at `now`.
pub fn has_fresh_token(user: &User, now: DateTime<Utc>) -> bool {
    match (&user.access_token, user.token_expires_at) {
        (Some(token), Some(expires_at)) => !token.is_empty() && now < expires_at,
        _ => false,
    }
}

/// Hands out usable access tokens, refreshing and persisting them when the
/// cached one has expired.
#[derive(Clone)]
pub struct TokenManager {
    users: Arc<dyn UserStore>,
    api: Arc<dyn MusicApi>,
}

impl TokenManager {
    pub fn new(users: Arc<dyn UserStore>, api: Arc<dyn MusicApi>) -> Self {
        Self { users, api }
    }

    pub async fn get_valid_access_token(&self, user: &User) -> Result<String, AuthError> {
        self.valid_access_token_at(user, Utc::now()).await
    }

    pub async fn valid_access_token_at(
        &self,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        if has_fresh_token(user, now) {
            if let Some(token) = &user.access_token {
                return Ok(token.clone());
            }
        }
        self.refresh_access_token(user).await
    }

    /// Exchanges the stored refresh token. The new token is persisted before
    /// it is returned.
    pub async fn refresh_access_token(&self, user: &User) -> Result<String, AuthError> {
        let refresh_token = user
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::MissingRefreshToken {
                user_id: user.id.clone(),
            })?;

        let grant = self
            .api
            .refresh_access_token(refresh_token)
            .await
            .map_err(|source| AuthError::Exchange {
                user_id: user.id.clone(),
                source,
            })?;

        self.persist_grant(&user.id, &grant).await?;
        tracing::debug!("refreshed access token for user {}", user.id);
        Ok(grant.access_token)
    }

    pub async fn persist_grant(
        &self,
        user_id: &str,
        grant: &TokenGrant,
    ) -> Result<DateTime<Utc>, StoreError> {
        let expires_at = Utc::now() + Duration::seconds(grant.expires_in_secs);
        self.users
            .update_access_token(
                user_id,
                &grant.access_token,
                expires_at,
                grant.refresh_token.as_deref(),
            )
            .await?;
        Ok(expires_at)
    }
}
