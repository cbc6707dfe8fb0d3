pub mod handlers;
pub mod state;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use std::sync::Arc;

use crate::{config::Settings, service::ServiceContext};
use state::AppState;

pub fn create_app(service_context: Arc<ServiceContext>, settings: Arc<Settings>) -> Router {
    let app_state = AppState::new(service_context, settings);

    Router::new()
        .route("/health", get(handlers::root::health_check))
        .nest("/api/payments", payment_routes())
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn payment_routes() -> Router<AppState> {
    Router::new()
        // Provider webhook
        .route("/callback", post(handlers::payments::callback))
        .route("/", post(handlers::payments::create))
        .route("/:id", get(handlers::payments::get))
        .route("/member/:member_id", get(handlers::payments::list_by_member))
        .route("/:id/cancel", post(handlers::payments::cancel))
        .route("/:id/refund", post(handlers::payments::refund))
        .route("/:id/verify", post(handlers::payments::verify))
        .route("/:id/charge", post(handlers::payments::charge))
}
