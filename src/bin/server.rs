use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use warp::{self, Filter};

use chat_relay::auth::TokenManager;
use chat_relay::config::ServerConfig;
use chat_relay::constants::WS_PATH;
use chat_relay::core::engine::ConnectionRoomEngine;
use chat_relay::core::presence::PresenceTracker;
use chat_relay::core::timer::TimerService;
use chat_relay::core::worker_pool::WorkerPool;
use chat_relay::handlers::websocket::handle_ws_client;

#[tokio::main]
async fn main() {
    match dotenvy::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration: host={}, port={}", config.host, config.port);

    let presence = Arc::new(PresenceTracker::new());
    let verifier = Arc::new(TokenManager::new(&config.jwt_secret));
    let engine = Arc::new(ConnectionRoomEngine::new(
        presence,
        verifier,
        config.heartbeat_timeout,
    ));

    let pool = match WorkerPool::new(config.worker_count) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!("Failed to create worker pool: {}", e);
            std::process::exit(1);
        }
    };

    // Presence sweep: the timer schedules, the worker pool executes, so a
    // slow sweep never delays other timer tasks.
    let timer = Arc::new(TimerService::new());
    if let Err(e) = timer.start() {
        error!("Failed to start timer service: {}", e);
        std::process::exit(1);
    }
    {
        let sweep_engine = Arc::clone(&engine);
        let sweep_pool = Arc::clone(&pool);
        let result = timer.schedule_periodic(
            config.sweep_interval,
            config.sweep_interval,
            move || {
                let engine = Arc::clone(&sweep_engine);
                let submitted = sweep_pool.submit(move || match engine.sweep_stale() {
                    Ok(0) => {}
                    Ok(evicted) => info!("Presence sweep evicted {} stale sessions", evicted),
                    Err(e) => error!("Presence sweep failed: {}", e),
                });
                if let Err(e) = submitted {
                    warn!("Could not submit presence sweep: {}", e);
                }
            },
        );
        if let Err(e) = result {
            error!("Failed to schedule presence sweep: {}", e);
            std::process::exit(1);
        }
    }

    // WebSocket route
    let ws_route = warp::path(WS_PATH)
        .and(warp::ws())
        .and(with_engine(Arc::clone(&engine)))
        .map(|ws: warp::ws::Ws, engine: Arc<ConnectionRoomEngine>| {
            info!("New websocket connection");
            ws.on_upgrade(move |socket| handle_ws_client(socket, engine))
        });

    // Health check route
    let health_route = warp::path("health").map(|| "OK");

    // Read-only presence query surface for the HTTP layer
    let online_route = warp::path!("api" / "online")
        .and(warp::get())
        .and(with_engine(Arc::clone(&engine)))
        .and_then(online_handler);

    let routes = ws_route.or(health_route).or(online_route);

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting chat-relay server on {}", addr);
    let (bound, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    });
    info!("Listening on {}", bound);
    server.await;

    // Drain in dependency order: no new connections are being accepted,
    // close the open ones, then stop the time-driven machinery.
    if let Err(e) = engine.shutdown() {
        error!("Engine shutdown failed: {}", e);
    }
    if let Err(e) = timer.stop() {
        error!("Timer shutdown failed: {}", e);
    }
    if let Err(e) = pool.shutdown() {
        error!("Worker pool shutdown failed: {}", e);
    }
    info!("Server stopped");
}

// Helper to include the engine in request handling
fn with_engine(
    engine: Arc<ConnectionRoomEngine>,
) -> impl Filter<Extract = (Arc<ConnectionRoomEngine>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&engine))
}

async fn online_handler(
    engine: Arc<ConnectionRoomEngine>,
) -> Result<impl warp::Reply, Infallible> {
    let users = engine.online_users().unwrap_or_default();
    let stats = engine.stats().ok();
    Ok(warp::reply::json(&serde_json::json!({
        "users": users,
        "stats": stats,
    })))
}
