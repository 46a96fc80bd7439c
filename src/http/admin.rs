use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::engine::Page;
use crate::model::{Booking, CoverImage, Event, Table};

use super::{Admin, AppResult, AppState};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/reservations", get(reservations))
        .route("/tables", post(create_table))
        .route("/tables/{id}", put(update_table).delete(delete_table))
        .route("/cover-images", post(add_cover_image))
        .route("/cover-images/{id}", delete(remove_cover_image))
        .route("/feed", get(feed))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<usize>,
}

/// GET /admin/reservations?page=
async fn reservations(
    _: Admin,
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Json<Page<Booking>> {
    Json(state.engine.all_bookings_page(q.page.unwrap_or(1)).await)
}

#[derive(Debug, Deserialize)]
struct TableInput {
    number: u32,
    capacity: u32,
}

async fn create_table(
    _: Admin,
    State(state): State<AppState>,
    Json(input): Json<TableInput>,
) -> AppResult<(StatusCode, Json<Table>)> {
    let table = state.engine.create_table(input.number, input.capacity).await?;
    Ok((StatusCode::CREATED, Json(table)))
}

async fn update_table(
    _: Admin,
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    Json(input): Json<TableInput>,
) -> AppResult<Json<Table>> {
    Ok(Json(
        state.engine.update_table(id, input.number, input.capacity).await?,
    ))
}

async fn delete_table(
    _: Admin,
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> AppResult<StatusCode> {
    state.engine.delete_table(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CoverImageInput {
    title: String,
    image: String,
}

async fn add_cover_image(
    _: Admin,
    State(state): State<AppState>,
    Json(input): Json<CoverImageInput>,
) -> AppResult<(StatusCode, Json<CoverImage>)> {
    let cover = state.engine.add_cover_image(input.title, input.image).await?;
    Ok((StatusCode::CREATED, Json(cover)))
}

async fn remove_cover_image(
    _: Admin,
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
) -> AppResult<StatusCode> {
    state.engine.remove_cover_image(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /admin/feed streams committed changes as server-sent events.
async fn feed(
    _: Admin,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let rx = state.engine.feed.subscribe();
    Sse::new(event_stream(rx)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn event_stream(
    rx: broadcast::Receiver<Event>,
) -> impl Stream<Item = Result<SseEvent, axum::Error>> {
    futures::stream::unfold(rx, |mut rx| async move {
        let sse = match rx.recv().await {
            Ok(event) => SseEvent::default().event(event.name()).json_data(&event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "admin feed subscriber lagged");
                SseEvent::default()
                    .event("lagged")
                    .json_data(serde_json::json!({ "missed": missed }))
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        };
        Some((sse, rx))
    })
}
