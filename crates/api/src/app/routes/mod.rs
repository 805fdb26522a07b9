use axum::{routing::get, Router};

pub mod admin;
pub mod common;
pub mod counter;
pub mod sessions;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/counter", counter::router())
        .nest("/sessions", sessions::router())
        .nest("/admin", admin::router())
}
