use std::future::{Ready, ready};

use actix_web::dev::Payload;
use actix_web::web::Data;
use actix_web::{FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;

use crate::auth::{Claims, validate_token};
use crate::config::Config;
use crate::db::user::{User, UserStore};
use crate::error::ApiError;

/// The authenticated user's id, pulled from the JWT cookie without a
/// database round trip.
#[derive(Debug)]
pub struct AuthUser {
    pub user_id: i64,
    pub claims: Claims,
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract_auth(req))
    }
}

fn extract_auth(req: &HttpRequest) -> Result<AuthUser, ApiError> {
    let config = req.app_data::<Data<Config>>().ok_or(ApiError::Internal)?;

    let cookie = req.cookie("token").ok_or(ApiError::Unauthorized)?;
    let claims = validate_token(cookie.value(), &config.jwt_secret)?;

    Ok(AuthUser {
        user_id: claims.sub,
        claims,
    })
}

/// Like [`AuthUser`] but loads the full user row, for handlers that need
/// the admin flag. Rejects tokens whose user has since been deleted.
#[derive(Debug)]
pub struct AuthAdmin(pub User);

impl FromRequest for AuthAdmin {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let auth = AuthUser::from_request(req, payload);
        let users = req.app_data::<Data<UserStore>>().cloned();

        Box::pin(async move {
            let auth = auth.await?;
            let users = users.ok_or(ApiError::Internal)?;
            let user = users
                .get(auth.user_id)
                .await
                .map_err(ApiError::from)?
                .ok_or(ApiError::Unauthorized)?;
            if !user.is_admin {
                return Err(ApiError::Forbidden);
            }
            Ok(AuthAdmin(user))
        })
    }
}
