pub mod handlers;
pub mod xml;

use crate::state::AppState;
use axum::{routing::get, Router};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/description.xml", get(handlers::description_handler))
        .route("/ContentDirectory.xml", get(handlers::content_directory_scpd))
        .route(
            "/ConnectionManager.xml",
            get(handlers::connection_manager_scpd),
        )
        .route(
            "/control/ContentDirectory",
            get(handlers::content_directory_control).post(handlers::content_directory_control),
        )
        .route(
            "/control/ConnectionManager",
            get(handlers::connection_manager_control).post(handlers::connection_manager_control),
        )
        .route(
            "/event/ContentDirectory",
            axum::routing::any(handlers::event_subscribe),
        )
        .route(
            "/event/ConnectionManager",
            axum::routing::any(handlers::event_subscribe),
        )
        .route("/music/{*path}", get(handlers::serve_music))
        .route("/pictures/{file}", get(handlers::serve_picture))
        .route("/content/{command}", get(handlers::content_report))
        .with_state(state)
}
