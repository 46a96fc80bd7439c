use std::convert::Infallible;

use axum::extract::{Form, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::cache::{COVER_IMAGES_KEY, TABLES_KEY};
use crate::engine::{ContactMessageForm, EngineStats};
use crate::model::{CoverImage, Table};

use super::AppState;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/tables", get(tables))
        .route("/contact", post(contact))
}

#[derive(Serialize)]
struct Home {
    cover_image: Option<CoverImage>,
}

/// GET / serves the first cover image from the list cache.
async fn home(State(state): State<AppState>) -> Json<Home> {
    let engine = state.engine.clone();
    let images = state
        .caches
        .cover_images
        .get_or_load(COVER_IMAGES_KEY, || async move {
            Ok::<_, Infallible>(engine.list_cover_images().await)
        })
        .await
        .unwrap_or_default();
    Json(Home {
        cover_image: images.into_iter().next(),
    })
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    #[serde(flatten)]
    stats: EngineStats,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        stats: state.engine.stats().await,
    })
}

async fn tables(State(state): State<AppState>) -> Json<Vec<Table>> {
    let engine = state.engine.clone();
    let tables = state
        .caches
        .tables
        .get_or_load(TABLES_KEY, || async move {
            Ok::<_, Infallible>(engine.list_tables().await)
        })
        .await
        .unwrap_or_default();
    Json(tables)
}

/// POST /contact forwards the message to the operator mailbox.
async fn contact(State(state): State<AppState>, Form(form): Form<ContactMessageForm>) -> Response {
    match form.validate() {
        Ok(msg) => {
            state
                .outbox
                .contact_message(&msg.name, &msg.email, &msg.phone, &msg.message);
            Redirect::to("/").into_response()
        }
        Err(errors) => Json(errors).into_response(),
    }
}
