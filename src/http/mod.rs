//! Public booking site API.

mod admin;
mod availability;
mod error;
mod identity;
mod pages;
mod reservations;

pub use error::AppError;
pub use identity::{Admin, Identity};

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::{BoxError, Router};
use tower::ServiceBuilder;
use tower::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::ListCaches;
use crate::config::Config;
use crate::engine::Engine;
use crate::mailer::Outbox;

pub type AppResult<T> = Result<T, AppError>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub caches: ListCaches,
    pub outbox: Outbox,
    /// Bearer token for `/admin`. `None` disables the admin routes.
    pub admin_token: Option<Arc<str>>,
    /// Trusted header carrying the authenticated customer id.
    pub customer_header: Arc<str>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, caches: ListCaches, outbox: Outbox, config: &Config) -> Self {
        Self {
            engine,
            caches,
            outbox,
            admin_token: config.admin_token.as_deref().map(Arc::from),
            customer_header: Arc::from(config.customer_header.as_str()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(pages::router())
        .merge(reservations::router())
        .merge(availability::router())
        .nest("/admin", admin::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(HandleErrorLayer::new(handle_timeout))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

async fn handle_timeout(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "request timed out".into())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("unhandled error: {err}"))
    }
}
