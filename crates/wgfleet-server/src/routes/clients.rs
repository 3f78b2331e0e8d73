use actix_web::{HttpResponse, web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::client::{Client, ClientChanges};
use crate::db::user::UserStore;
use crate::error::ApiError;
use crate::extract::AuthUser;
use crate::service::{AppService, CreateClient};

use super::require_access;

#[derive(Debug, Deserialize)]
struct CreateClientRequest {
    group_id: i64,
    name: String,
    #[serde(default)]
    description: String,
    allowed_ips: Option<String>,
    #[serde(default)]
    can_address_peers: bool,
    dns_override: Option<String>,
    #[serde(default)]
    use_preshared_key: bool,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct UpdateClientRequest {
    name: Option<String>,
    description: Option<String>,
    allowed_ips: Option<String>,
    can_address_peers: Option<bool>,
    dns_override: Option<String>,
    is_active: Option<bool>,
    /// Present-and-null clears the expiry; absent leaves it untouched.
    #[serde(default, deserialize_with = "double_option")]
    expires_at: Option<Option<DateTime<Utc>>>,
}

fn double_option<'de, D>(de: D) -> Result<Option<Option<DateTime<Utc>>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    Option::<DateTime<Utc>>::deserialize(de).map(Some)
}

#[derive(Debug, Serialize)]
struct ClientResponse {
    id: i64,
    group_id: i64,
    name: String,
    description: String,
    public_key: String,
    has_preshared_key: bool,
    assigned_ip: String,
    assigned_ip_v6: Option<String>,
    allowed_ips: String,
    can_address_peers: bool,
    dns_override: Option<String>,
    is_active: bool,
    expires_at: Option<DateTime<Utc>>,
    last_handshake: Option<DateTime<Utc>>,
    total_received: i64,
    total_sent: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ClientResponse {
    fn from_model(c: Client) -> Self {
        Self {
            id: c.id,
            group_id: c.group_id,
            name: c.name,
            description: c.description,
            public_key: c.public_key,
            has_preshared_key: c.preshared_key.is_some(),
            assigned_ip: c.assigned_ip.ip().to_string(),
            assigned_ip_v6: c.assigned_ip_v6.map(|n| n.ip().to_string()),
            allowed_ips: c.allowed_ips,
            can_address_peers: c.can_address_peers,
            dns_override: c.dns_override,
            is_active: c.is_active,
            expires_at: c.expires_at,
            last_handshake: c.last_handshake,
            total_received: c.total_received,
            total_sent: c.total_sent,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

async fn client_for_access(
    service: &web::Data<AppService>,
    users: &web::Data<UserStore>,
    user_id: i64,
    client_id: i64,
) -> Result<Client, ApiError> {
    let client = service
        .clients()
        .get(client_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    require_access(users, user_id, client.group_id).await?;
    Ok(client)
}

async fn list_by_group(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let group_id = path.into_inner();
    require_access(&users, auth.user_id, group_id).await?;
    let clients = service.clients().list_by_group(group_id).await?;
    let resp: Vec<_> = clients.into_iter().map(ClientResponse::from_model).collect();
    Ok(HttpResponse::Ok().json(resp))
}

async fn create_client(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    body: web::Json<CreateClientRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    require_access(&users, auth.user_id, body.group_id).await?;
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("name must not be empty".into()));
    }

    let client = service
        .create_client(CreateClient {
            group_id: body.group_id,
            name: body.name,
            description: body.description,
            allowed_ips: body.allowed_ips,
            can_address_peers: body.can_address_peers,
            dns_override: body.dns_override,
            use_preshared_key: body.use_preshared_key,
            expires_at: body.expires_at,
        })
        .await?;
    Ok(HttpResponse::Created().json(ClientResponse::from_model(client)))
}

async fn get_client(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let client = client_for_access(&service, &users, auth.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ClientResponse::from_model(client)))
}

async fn update_client(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
    body: web::Json<UpdateClientRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    client_for_access(&service, &users, auth.user_id, id).await?;

    let body = body.into_inner();
    let client = service
        .update_client(
            id,
            &ClientChanges {
                name: body.name,
                description: body.description,
                allowed_ips: body.allowed_ips,
                can_address_peers: body.can_address_peers,
                dns_override: body.dns_override,
                is_active: body.is_active,
                expires_at: body.expires_at,
            },
        )
        .await?;
    Ok(HttpResponse::Ok().json(ClientResponse::from_model(client)))
}

async fn delete_client(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    client_for_access(&service, &users, auth.user_id, id).await?;
    service.remove_client(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn client_config(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    client_for_access(&service, &users, auth.user_id, id).await?;
    let config = service.client_config(id).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(config))
}

async fn regenerate_keys(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    client_for_access(&service, &users, auth.user_id, id).await?;
    let client = service.regenerate_client_keys(id).await?;
    Ok(HttpResponse::Ok().json(ClientResponse::from_model(client)))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/clients")
            .route("", web::post().to(create_client))
            .route("/group/{group_id}", web::get().to(list_by_group))
            .route("/{id}", web::get().to(get_client))
            .route("/{id}", web::put().to(update_client))
            .route("/{id}", web::delete().to(delete_client))
            .route("/{id}/config", web::get().to(client_config))
            .route("/{id}/regenerate", web::post().to(regenerate_keys)),
    );
}
