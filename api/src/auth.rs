use std::sync::Arc;

use crate::errors::{AuthError, StoreError};
use crate::models::{NewUser, User};
use crate::spotify::MusicApi;
use crate::store::UserStore;
use crate::token::TokenManager;

/// Completes the authorization-code flow: exchanges the code, reads the
/// listener's profile, and creates or refreshes their user record.
pub async fn sign_in(
    api: &Arc<dyn MusicApi>,
    users: &Arc<dyn UserStore>,
    tokens: &TokenManager,
    code: &str,
) -> Result<User, AuthError> {
    let exchange_failed = |source| AuthError::Exchange {
        user_id: "(sign-in)".to_string(),
        source,
    };

    let grant = api.exchange_code(code).await.map_err(exchange_failed)?;
    let profile = api
        .current_user(&grant.access_token)
        .await
        .map_err(exchange_failed)?;

    users
        .upsert_user(&NewUser {
            id: profile.id.clone(),
            spotify_id: profile.id.clone(),
            display_name: profile.display_name,
            email: profile.email,
            refresh_token: grant.refresh_token.clone(),
        })
        .await?;
    tokens.persist_grant(&profile.id, &grant).await?;

    tracing::info!("user {} signed in", profile.id);

    users
        .get_user(&profile.id)
        .await?
        .ok_or_else(|| {
            AuthError::Store(StoreError::Corrupt {
                key: format!("USER#{}", profile.id),
                reason: "user missing right after sign-in".to_string(),
            })
        })
}
