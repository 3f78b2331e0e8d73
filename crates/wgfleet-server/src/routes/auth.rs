use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{clear_auth_cookie, create_token, set_auth_cookie};
use crate::config::Config;
use crate::db::user::{User, UserStore};
use crate::error::ApiError;
use crate::extract::AuthUser;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct UserResponse {
    id: i64,
    username: String,
    display_name: String,
    is_admin: bool,
    created_at: DateTime<Utc>,
}

impl UserResponse {
    fn from_model(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            display_name: u.display_name,
            is_admin: u.is_admin,
            created_at: u.created_at,
        }
    }
}

async fn login(
    users: web::Data<UserStore>,
    config: web::Data<Config>,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = users.authenticate(&body.username, &body.password).await?;
    let token = create_token(user.id, &config.jwt_secret)?;

    Ok(HttpResponse::Ok()
        .cookie(set_auth_cookie(&token))
        .json(UserResponse::from_model(user)))
}

async fn logout(_auth: AuthUser) -> HttpResponse {
    HttpResponse::Ok()
        .cookie(clear_auth_cookie())
        .json(serde_json::json!({ "status": "ok" }))
}

async fn me(auth: AuthUser, users: web::Data<UserStore>) -> Result<HttpResponse, ApiError> {
    let user = users
        .get(auth.user_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    Ok(HttpResponse::Ok().json(UserResponse::from_model(user)))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auth")
            .route("/login", web::post().to(login))
            .route("/logout", web::post().to(logout))
            .route("/me", web::get().to(me)),
    );
}
