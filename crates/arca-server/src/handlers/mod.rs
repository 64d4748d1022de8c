pub mod admin;
pub mod checkin;
pub mod clone;
pub mod instances;
pub mod ping;
pub mod search;
pub mod sneakernet;
pub mod upload;

#[cfg(test)]
pub mod test_helpers;

use axum::middleware;
use axum::routing::post;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::state::ServerState;

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/v2/ping", post(ping::ping))
        .route("/api/v2/upload", post(upload::upload))
        .route("/api/v2/search/files", post(search::search_files))
        .route("/api/v2/files/locate", post(search::locate_file))
        .route("/api/v2/validate/file", post(search::validate_file))
        .route("/api/v2/instances/delete", post(instances::delete_instance))
        .route("/api/v2/clone/stage_batch", post(clone::stage_batch))
        .route("/api/v2/clone/complete", post(clone::complete))
        .route("/api/v2/clone/fail", post(clone::fail))
        .route("/api/v2/checkin/status", post(checkin::status))
        .route("/api/v2/checkin/update", post(checkin::update))
        .route("/api/v2/sneakernet/ingest", post(sneakernet::ingest_manifest))
        .route("/api/v2/users/create", post(admin::create_user))
        .route("/api/v2/users/delete", post(admin::delete_user))
        .route("/api/v2/admin/librarians/add", post(admin::add_librarian))
        .route("/api/v2/admin/librarians/remove", post(admin::remove_librarian))
        .route(
            "/api/v2/admin/librarians/set_transfer",
            post(admin::set_librarian_transfer),
        )
        .route("/api/v2/admin/stores/set_state", post(admin::set_store_state))
        .route("/api/v2/admin/stores/manifest", post(admin::get_store_manifest))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
