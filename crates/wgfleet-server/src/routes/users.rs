use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::user::{User, UserChanges, UserStore};
use crate::error::ApiError;
use crate::extract::{AuthAdmin, AuthUser};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    username: String,
    display_name: String,
    password: String,
    #[serde(default)]
    is_admin: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateUserRequest {
    display_name: Option<String>,
    is_admin: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    current_password: Option<String>,
    new_password: String,
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

fn check_password_strength(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

async fn list_users(
    _admin: AuthAdmin,
    users: web::Data<UserStore>,
) -> Result<HttpResponse, ApiError> {
    let all = users.list_all().await?;
    let resp: Vec<UserResponse> = all.into_iter().map(UserResponse::from_model).collect();
    Ok(HttpResponse::Ok().json(resp))
}

async fn create_user(
    _admin: AuthAdmin,
    users: web::Data<UserStore>,
    body: web::Json<CreateUserRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    if body.username.trim().is_empty() {
        return Err(ApiError::Validation("username must not be empty".into()));
    }
    check_password_strength(&body.password)?;

    let user = users
        .create(
            body.username.trim(),
            &body.display_name,
            &body.password,
            body.is_admin,
        )
        .await?;
    Ok(HttpResponse::Created().json(UserResponse::from_model(user)))
}

/// Users may fetch themselves; everyone else is admin-only.
async fn get_user(
    auth: AuthUser,
    users: web::Data<UserStore>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    if id != auth.user_id {
        require_admin(&users, auth.user_id).await?;
    }
    let user = users.get(id).await?.ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(UserResponse::from_model(user)))
}

/// Display name edits are allowed on one's own account; the admin flag,
/// and other accounts, are admin-only.
async fn update_user(
    auth: AuthUser,
    users: web::Data<UserStore>,
    path: web::Path<i64>,
    body: web::Json<UpdateUserRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let body = body.into_inner();
    if id != auth.user_id || body.is_admin.is_some() {
        require_admin(&users, auth.user_id).await?;
    }

    let changes = UserChanges {
        display_name: body.display_name,
        is_admin: body.is_admin,
    };
    let user = users.update(id, &changes).await?.ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(UserResponse::from_model(user)))
}

/// Changing one's own password requires the current one; admins may reset
/// any other account without it.
async fn change_password(
    auth: AuthUser,
    users: web::Data<UserStore>,
    path: web::Path<i64>,
    body: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let body = body.into_inner();
    check_password_strength(&body.new_password)?;

    if id == auth.user_id {
        let user = users.get(id).await?.ok_or(ApiError::Unauthorized)?;
        let current = body
            .current_password
            .ok_or_else(|| ApiError::Validation("current password is required".into()))?;
        users.authenticate(&user.username, &current).await?;
    } else {
        require_admin(&users, auth.user_id).await?;
    }

    if !users.set_password(id, &body.new_password).await? {
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}

async fn delete_user(
    admin: AuthAdmin,
    users: web::Data<UserStore>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    if id == admin.0.id {
        return Err(ApiError::Validation("cannot delete yourself".into()));
    }
    if !users.delete(id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}

async fn require_admin(users: &web::Data<UserStore>, user_id: i64) -> Result<(), ApiError> {
    let user = users.get(user_id).await?.ok_or(ApiError::Unauthorized)?;
    if user.is_admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/users")
            .route("", web::get().to(list_users))
            .route("", web::post().to(create_user))
            .route("/{id}", web::get().to(get_user))
            .route("/{id}", web::put().to(update_user))
            .route("/{id}", web::delete().to(delete_user))
            .route("/{id}/password", web::post().to(change_password)),
    );
}

#[cfg(test)]
mod tests {
    use super::check_password_strength;

    #[test]
    fn short_passwords_are_rejected() {
        assert!(check_password_strength("hunter2").is_err());
        assert!(check_password_strength("").is_err());
        assert!(check_password_strength("longenough").is_ok());
    }
}
