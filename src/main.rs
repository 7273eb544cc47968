use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::extract::MatchedPath;
use axum::routing::get;
use axum::Router;
use dotenvy::dotenv;
use http::HeaderValue;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use whiteboard_hub::application::services::CacheConfig;
use whiteboard_hub::bootstrap::{AppContext, Config};
use whiteboard_hub::infrastructure::db::repositories::SqlxRoomRepository;
use whiteboard_hub::infrastructure::realtime::{Hub, HubConfig};
use whiteboard_hub::presentation::{http as rest, ws};

#[derive(OpenApi)]
#[openapi(
    paths(
        rest::health::health,
        rest::rooms::create_room,
        rest::rooms::get_room,
        rest::rooms::room_exists,
        rest::rooms::update_room,
        rest::rooms::delete_room,
        rest::rooms::snapshot_history,
        rest::stats::stats,
        ws::handler::ws_entry,
    ),
    components(schemas(
        rest::health::HealthResp,
        rest::rooms::RoomResponse,
        rest::rooms::CreateRoomRequest,
        rest::rooms::UpdateRoomRequest,
        rest::rooms::ExistsResponse,
        rest::rooms::SnapshotsResponse,
        rest::stats::StatsResponse,
    )),
    tags(
        (name = "Rooms", description = "Room CRUD and snapshot history"),
        (name = "Stats", description = "Live process statistics"),
        (name = "Health", description = "Liveness probe"),
        (name = "Realtime", description = "WebSocket collaboration endpoint"),
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "whiteboard_hub=debug,axum=info,tower_http=info".into()),
        )
        .init();

    let cfg = Config::from_env()?;
    info!(?cfg, "starting whiteboard collaboration hub");

    let pool = whiteboard_hub::infrastructure::db::connect_pool(&cfg.store_url).await?;
    whiteboard_hub::infrastructure::db::migrate(&pool).await?;

    let repo = Arc::new(SqlxRoomRepository::new(pool.clone()));

    let hub_config = HubConfig {
        cache: CacheConfig {
            save_interval: cfg.snapshot_interval,
            destroy_grace: cfg.idle_destroy_grace,
            snapshot_keep: cfg.snapshot_keep,
            apply_queue: cfg.apply_queue,
        },
        outbound_queue: cfg.outbound_queue,
        max_frame_bytes: cfg.max_frame_bytes,
        heartbeat_interval: cfg.heartbeat_interval,
        idle_timeout: cfg.idle_timeout,
        shutdown_drain: cfg.shutdown_drain,
        ..HubConfig::default()
    };
    let hub = Arc::new(Hub::new(repo.clone(), hub_config));
    hub.spawn_stats_emitter();

    let ctx = AppContext::new(cfg.clone(), hub.clone(), repo, pool.clone());

    let cors = match cfg.cors_origin.as_deref().map(HeaderValue::from_str) {
        Some(Ok(origin)) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
        Some(Err(_)) => {
            warn!("CORS_ORIGIN is not a valid header value, denying cross-origin requests");
            CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static(
                "http://invalid",
            )))
        }
        None if cfg.is_production => {
            CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static(
                "http://invalid",
            )))
        }
        None => CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    };

    let api_router = Router::new()
        .merge(rest::health::routes(pool.clone()))
        .nest("/api", rest::rooms::routes(ctx.clone()))
        .nest("/api", rest::stats::routes(ctx.clone()))
        .merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::max(cfg.max_frame_bytes))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &http::Request<_>| {
                let method = req.method().clone();
                let uri = req.uri().clone();
                let matched = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default();
                tracing::info_span!("http", %method, %uri, matched_path = %matched)
            }),
        )
        .layer(cors);

    let ws_router = Router::new()
        .route("/ws", get(ws::handler::ws_entry))
        .with_state(hub.clone());

    let app = api_router.merge(ws_router);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    info!(%addr, "hub listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub.clone()))
        .await?;

    Ok(())
}

/// Waits for either SIGINT or SIGTERM, then runs the hub's graceful
/// shutdown sequence (spec.md §4.6): refuse new sockets, drain outbound
/// queues up to `shutdown_drain`, flush every dirty Document.
async fn shutdown_signal(hub: Arc<Hub>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    hub.shutdown().await;
}
