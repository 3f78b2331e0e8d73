pub mod auth;
pub mod clients;
pub mod groups;
pub mod stats;
pub mod users;

use actix_web::web;

use crate::db::user::UserStore;
use crate::error::ApiError;

/// Admins, the group owner, and listed members may see a group.
async fn require_access(
    users: &web::Data<UserStore>,
    user_id: i64,
    group_id: i64,
) -> Result<(), ApiError> {
    if users.can_access_group(user_id, group_id).await? {
        Ok(())
    } else {
        // hide the group's existence from outsiders
        Err(ApiError::NotFound)
    }
}

/// Mutations are restricted to admins and the group owner.
async fn require_owner(
    users: &web::Data<UserStore>,
    owner_id: i64,
    user_id: i64,
) -> Result<(), ApiError> {
    if owner_id == user_id {
        return Ok(());
    }
    let user = users.get(user_id).await?.ok_or(ApiError::Unauthorized)?;
    if user.is_admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}
