use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpResponse, HttpServer, web};
use tracing::{info, warn};

use wgfleet_server::config::Config;
use wgfleet_server::db;
use wgfleet_server::db::client::ClientStore;
use wgfleet_server::db::group::GroupStore;
use wgfleet_server::db::history::HistoryStore;
use wgfleet_server::db::user::UserStore;
use wgfleet_server::service::WgService;
use wgfleet_server::wg::SystemRunner;
use wgfleet_server::{routes, scheduler};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// Create the initial admin account on an empty database, if the
/// environment provides a password for it.
async fn seed_admin(users: &UserStore, config: &Config) {
    match users.is_empty().await {
        Ok(true) => {
            let Some(password) = &config.admin_password else {
                warn!("no users exist and ADMIN_PASSWORD is unset, nobody can log in");
                return;
            };
            match users
                .create(&config.admin_username, &config.admin_username, password, true)
                .await
            {
                Ok(user) => info!(username = %user.username, "created initial admin user"),
                Err(e) => warn!(error = %e, "failed to create initial admin user"),
            }
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "could not check for existing users"),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().expect("failed to load configuration");
    info!(addr = %config.bind_addr, "starting wgfleet-server");

    let pool = db::create_pool(&config.database_url).await;
    db::migrate(&pool).await;
    info!("database migrations applied");

    let users = UserStore::new(pool.clone());
    seed_admin(&users, &config).await;

    let runner = SystemRunner::new(Duration::from_secs(config.wg_command_timeout_secs));
    let service = Arc::new(WgService::new(
        GroupStore::new(pool.clone()),
        ClientStore::new(pool.clone()),
        HistoryStore::new(pool.clone()),
        runner,
        &config,
    ));

    if let Err(e) = service.restore_running_interfaces().await {
        warn!(error = %e, "startup interface recovery failed");
    }
    let _collector = scheduler::spawn(service.clone(), config.stats_interval_secs);

    let bind = config.bind_addr.clone();

    let config_data = web::Data::new(config);
    let users_data = web::Data::new(users);
    let service_data = web::Data::from(service);

    HttpServer::new(move || {
        App::new()
            .app_data(config_data.clone())
            .app_data(users_data.clone())
            .app_data(service_data.clone())
            .wrap(tracing_actix_web::TracingLogger::default())
            .route("/health", web::get().to(health))
            .configure(routes::auth::configure)
            .configure(routes::users::configure)
            .configure(routes::groups::configure)
            .configure(routes::clients::configure)
            .configure(routes::stats::configure)
    })
    .bind(&bind)?
    .run()
    .await
}
