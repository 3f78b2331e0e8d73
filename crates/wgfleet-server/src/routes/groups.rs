use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

use crate::db::group::{Group, GroupChanges};
use crate::db::user::UserStore;
use crate::error::ApiError;
use crate::extract::AuthUser;
use crate::service::{AppService, CreateGroup};

use super::{require_access, require_owner};

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    description: String,
    ip_range: String,
    ip_range_v6: Option<String>,
    listen_port: Option<i32>,
    dns: Option<String>,
    endpoint: Option<String>,
    persistent_keepalive: Option<i32>,
    mtu: Option<i32>,
    #[serde(default)]
    allow_client_to_client: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateGroupRequest {
    name: Option<String>,
    description: Option<String>,
    dns: Option<String>,
    endpoint: Option<String>,
    persistent_keepalive: Option<i32>,
    mtu: Option<i32>,
    allow_client_to_client: Option<bool>,
    listen_port: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct SetIpv6Request {
    ip_range_v6: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemberRequest {
    user_id: i64,
}

#[derive(Debug, Serialize)]
struct GroupResponse {
    id: i64,
    name: String,
    description: String,
    interface_name: String,
    server_public_key: String,
    ip_range: String,
    server_ip: String,
    ip_range_v6: Option<String>,
    server_ip_v6: Option<String>,
    listen_port: i32,
    dns: String,
    endpoint: String,
    persistent_keepalive: i32,
    mtu: i32,
    allow_client_to_client: bool,
    is_running: bool,
    owner_id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GroupResponse {
    fn from_model(g: Group) -> Self {
        Self {
            id: g.id,
            name: g.name,
            description: g.description,
            interface_name: g.interface_name,
            server_public_key: g.server_public_key,
            ip_range: g.ip_range.to_string(),
            server_ip: g.server_ip.ip().to_string(),
            ip_range_v6: g.ip_range_v6.map(|n| n.to_string()),
            server_ip_v6: g.server_ip_v6.map(|n| n.ip().to_string()),
            listen_port: g.listen_port,
            dns: g.dns,
            endpoint: g.endpoint,
            persistent_keepalive: g.persistent_keepalive,
            mtu: g.mtu,
            allow_client_to_client: g.allow_client_to_client,
            is_running: g.is_running,
            owner_id: g.owner_id,
            created_at: g.created_at,
            updated_at: g.updated_at,
        }
    }
}

async fn list_groups(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
) -> Result<HttpResponse, ApiError> {
    let user = users
        .get(auth.user_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    let groups = if user.is_admin {
        service.groups().list_all().await?
    } else {
        service.groups().list_for_user(user.id).await?
    };
    let resp: Vec<_> = groups.into_iter().map(GroupResponse::from_model).collect();
    Ok(HttpResponse::Ok().json(resp))
}

async fn create_group(
    auth: AuthUser,
    service: web::Data<AppService>,
    body: web::Json<CreateGroupRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("name must not be empty".into()));
    }
    let ip_range: Ipv4Network = body
        .ip_range
        .parse()
        .map_err(|_| ApiError::Validation("invalid IPv4 range".into()))?;
    let ip_range_v6 = body
        .ip_range_v6
        .map(|raw| {
            raw.parse::<Ipv6Network>()
                .map_err(|_| ApiError::Validation("invalid IPv6 range".into()))
        })
        .transpose()?;

    let group = service
        .create_group(CreateGroup {
            name: body.name,
            description: body.description,
            ip_range,
            ip_range_v6,
            listen_port: body.listen_port,
            dns: body.dns,
            endpoint: body.endpoint,
            persistent_keepalive: body.persistent_keepalive,
            mtu: body.mtu,
            allow_client_to_client: body.allow_client_to_client,
            owner_id: auth.user_id,
        })
        .await?;

    Ok(HttpResponse::Created().json(GroupResponse::from_model(group)))
}

async fn get_group(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    require_access(&users, auth.user_id, id).await?;
    let group = service.groups().get(id).await?.ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(GroupResponse::from_model(group)))
}

async fn update_group(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
    body: web::Json<UpdateGroupRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    require_access(&users, auth.user_id, id).await?;
    let current = service.groups().get(id).await?.ok_or(ApiError::NotFound)?;
    require_owner(&users, current.owner_id, auth.user_id).await?;

    let body = body.into_inner();
    let group = service
        .update_group(
            id,
            &GroupChanges {
                name: body.name,
                description: body.description,
                dns: body.dns,
                endpoint: body.endpoint,
                persistent_keepalive: body.persistent_keepalive,
                mtu: body.mtu,
                allow_client_to_client: body.allow_client_to_client,
                listen_port: body.listen_port,
            },
        )
        .await?;
    Ok(HttpResponse::Ok().json(GroupResponse::from_model(group)))
}

async fn set_ipv6(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
    body: web::Json<SetIpv6Request>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    require_access(&users, auth.user_id, id).await?;
    let current = service.groups().get(id).await?.ok_or(ApiError::NotFound)?;
    require_owner(&users, current.owner_id, auth.user_id).await?;

    let range_v6 = body
        .into_inner()
        .ip_range_v6
        .map(|raw| {
            raw.parse::<Ipv6Network>()
                .map_err(|_| ApiError::Validation("invalid IPv6 range".into()))
        })
        .transpose()?;
    let group = service.set_group_ipv6(id, range_v6).await?;
    Ok(HttpResponse::Ok().json(GroupResponse::from_model(group)))
}

async fn delete_group(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    require_access(&users, auth.user_id, id).await?;
    let current = service.groups().get(id).await?.ok_or(ApiError::NotFound)?;
    require_owner(&users, current.owner_id, auth.user_id).await?;

    service.delete_group(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn group_config(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    require_access(&users, auth.user_id, id).await?;
    let config = service.group_config(id).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(config))
}

async fn toggle_group(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    require_access(&users, auth.user_id, id).await?;
    let current = service.groups().get(id).await?.ok_or(ApiError::NotFound)?;
    require_owner(&users, current.owner_id, auth.user_id).await?;

    let running = service.toggle_interface(id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "is_running": running })))
}

async fn list_members(
    auth: AuthUser,
    users: web::Data<UserStore>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    require_access(&users, auth.user_id, id).await?;
    let members = users.members_of(id).await?;
    let resp: Vec<_> = members
        .into_iter()
        .map(|u| serde_json::json!({ "id": u.id, "username": u.username, "display_name": u.display_name }))
        .collect();
    Ok(HttpResponse::Ok().json(resp))
}

async fn add_member(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
    body: web::Json<MemberRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    require_access(&users, auth.user_id, id).await?;
    let current = service.groups().get(id).await?.ok_or(ApiError::NotFound)?;
    require_owner(&users, current.owner_id, auth.user_id).await?;

    service.groups().add_member(id, body.user_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn remove_member(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<(i64, i64)>,
) -> Result<HttpResponse, ApiError> {
    let (id, user_id) = path.into_inner();
    require_access(&users, auth.user_id, id).await?;
    let current = service.groups().get(id).await?.ok_or(ApiError::NotFound)?;
    require_owner(&users, current.owner_id, auth.user_id).await?;

    if !service.groups().remove_member(id, user_id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/groups")
            .route("", web::get().to(list_groups))
            .route("", web::post().to(create_group))
            .route("/{id}", web::get().to(get_group))
            .route("/{id}", web::put().to(update_group))
            .route("/{id}", web::delete().to(delete_group))
            .route("/{id}/ipv6", web::put().to(set_ipv6))
            .route("/{id}/config", web::get().to(group_config))
            .route("/{id}/toggle", web::post().to(toggle_group))
            .route("/{id}/members", web::get().to(list_members))
            .route("/{id}/members", web::post().to(add_member))
            .route("/{id}/members/{user_id}", web::delete().to(remove_member)),
    );
}
