use actix_web::{HttpResponse, web};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::user::UserStore;
use crate::error::ApiError;
use crate::extract::{AuthAdmin, AuthUser};
use crate::service::AppService;

use super::require_access;

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    /// Window of history to return, defaulting to the last 24 hours.
    hours: Option<i64>,
}

impl HistoryQuery {
    fn since(&self) -> chrono::DateTime<Utc> {
        let hours = self.hours.unwrap_or(24).clamp(1, 24 * 365);
        Utc::now() - Duration::hours(hours)
    }
}

#[derive(Debug, Serialize)]
struct OverviewResponse {
    total_groups: i64,
    running_groups: i64,
    total_clients: i64,
    active_clients: i64,
    total_received: i64,
    total_sent: i64,
}

async fn overview(
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
    let running = groups.iter().filter(|g| g.is_running).count() as i64;
    let totals = if user.is_admin {
        service.traffic_totals().await?
    } else {
        let ids: Vec<i64> = groups.iter().map(|g| g.id).collect();
        service.traffic_totals_for(&ids).await?
    };

    Ok(HttpResponse::Ok().json(OverviewResponse {
        total_groups: groups.len() as i64,
        running_groups: running,
        total_clients: totals.total_clients,
        active_clients: totals.active_clients,
        total_received: totals.total_received,
        total_sent: totals.total_sent,
    }))
}

/// Trigger an immediate poll of one group's live counters.
async fn poll_group(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let group_id = path.into_inner();
    require_access(&users, auth.user_id, group_id).await?;
    let clients = service.poll_group_stats(group_id).await?;
    let resp: Vec<_> = clients
        .into_iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "name": c.name,
                "last_handshake": c.last_handshake,
                "total_received": c.total_received,
                "total_sent": c.total_sent,
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(resp))
}

async fn group_history(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, ApiError> {
    let group_id = path.into_inner();
    require_access(&users, auth.user_id, group_id).await?;
    let samples = service
        .history()
        .group_series(group_id, query.since())
        .await?;
    Ok(HttpResponse::Ok().json(samples))
}

async fn client_history(
    auth: AuthUser,
    users: web::Data<UserStore>,
    service: web::Data<AppService>,
    path: web::Path<i64>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, ApiError> {
    let client_id = path.into_inner();
    let client = service
        .clients()
        .get(client_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    require_access(&users, auth.user_id, client.group_id).await?;
    let samples = service
        .history()
        .client_series(client_id, query.since())
        .await?;
    Ok(HttpResponse::Ok().json(samples))
}

async fn system_history(
    _admin: AuthAdmin,
    service: web::Data<AppService>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, ApiError> {
    let samples = service.history().system_series(query.since()).await?;
    Ok(HttpResponse::Ok().json(samples))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/stats")
            .route("/overview", web::get().to(overview))
            .route("/groups/{id}/poll", web::post().to(poll_group))
            .route("/groups/{id}/history", web::get().to(group_history))
            .route("/clients/{id}/history", web::get().to(client_history))
            .route("/system/history", web::get().to(system_history)),
    );
}
