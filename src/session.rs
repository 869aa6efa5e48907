//! Identity carried by the cookie session.
//!
//! Sign-in happens outside the chat core; whoever authenticates the user
//! calls [`sign_in`] and every chat request afterwards resolves the caller
//! from the session.

use axum::{extract::FromRequestParts, http::request::Parts};
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, Session, SessionManagerLayer};
use uuid::Uuid;

use crate::AppError;

pub const USER_ID: &str = "user_id";

pub fn layer(idle_minutes: i64) -> SessionManagerLayer<MemoryStore> {
    SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(idle_minutes)))
}

pub async fn sign_in(session: &Session, user_id: Uuid) -> Result<(), tower_sessions::session::Error> {
    session.cycle_id().await?;
    session.insert(USER_ID, user_id).await
}

/// Resolved caller, or `None` for an anonymous request.
pub struct MaybeUser(pub Option<Uuid>);

impl<S> FromRequestParts<S> for MaybeUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(|(_, msg)| AppError::Internal(anyhow::anyhow!(msg)))?;

        Ok(MaybeUser(session.get::<Uuid>(USER_ID).await?))
    }
}

/// Resolved caller; anonymous requests are rejected with 401.
pub struct CurrentUser(pub Uuid);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let MaybeUser(user_id) = MaybeUser::from_request_parts(parts, state).await?;
        user_id.map(CurrentUser).ok_or(AppError::Unauthenticated)
    }
}
