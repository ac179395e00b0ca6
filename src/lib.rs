//! Real-time room presence tracking built with Rust.
//!
//! Keeps an in-memory, single-process registry of which users are active in which
//! collaboration room, refreshed by client heartbeats and expired by a background sweep.
//! Exposes it over WebSocket (heartbeat/leave with live snapshots) and a small JSON API.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::AppError;
pub use handlers::http::AppState;
pub use services::presence::PresenceStore;
pub use services::room_hub::RoomHub;

use axum::routing::{get, post};
use handlers::http;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the API router (ws, presence, stats, health). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    let room_routes = axum::Router::new()
        .route("/:room/presence", get(http::room_presence))
        .route("/:room/heartbeat", post(http::heartbeat))
        .route(
            "/:room/users/:user",
            get(http::user_in_room).delete(http::leave_room),
        );

    let user_routes = axum::Router::new()
        .route("/:user", axum::routing::delete(http::leave_all))
        .route("/:user/rooms", get(http::user_rooms));

    axum::Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/stats", get(http::stats))
        .route("/health", get(http::health))
        .nest("/rooms", room_routes)
        .nest("/users", user_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
