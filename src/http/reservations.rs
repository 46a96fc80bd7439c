use axum::extract::{Form, Path, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use ulid::Ulid;

use crate::engine::{EngineError, ReservationForm, ValidationErrors};
use crate::model::{Booking, Table};

use super::{AppError, AppResult, AppState, Identity};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/reservation/new", post(create))
        .route("/reservations", get(list_mine))
        .route("/reservation/{id}", get(detail))
        .route("/reservation/edit/{id}", post(edit))
        .route("/reservation/{id}/cancel", post(cancel))
}

#[derive(Serialize)]
struct BookingView {
    #[serde(flatten)]
    booking: Booking,
    tables: Vec<Table>,
}

/// A rejected form comes back as 200 with its errors so the page can be redrawn.
fn form_errors(errors: ValidationErrors) -> Response {
    Json(errors).into_response()
}

/// Allocation failures the customer can fix go back on the form; the rest are errors.
fn rejected(err: EngineError) -> AppResult<Response> {
    match err {
        EngineError::WalError(_) | EngineError::LimitExceeded(_) | EngineError::NotFound(_) => {
            Err(err.into())
        }
        other => Ok(form_errors(ValidationErrors::from(&other))),
    }
}

async fn owned_booking(state: &AppState, identity: &Identity, id: Ulid) -> AppResult<Booking> {
    let booking = state
        .engine
        .get_booking(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    if !identity.may_access(booking.customer_user.as_deref()) {
        return Err(AppError::Forbidden);
    }
    Ok(booking)
}

/// POST /reservation/new
async fn create(
    State(state): State<AppState>,
    identity: Identity,
    Form(form): Form<ReservationForm>,
) -> AppResult<Response> {
    let customer = identity.require_customer()?.to_string();
    let req = match state
        .engine
        .validate_reservation(&form, Some(customer), None)
        .await
    {
        Ok(req) => req,
        Err(errors) => return Ok(form_errors(errors)),
    };
    match state.engine.allocate(req).await {
        Ok(_) => Ok(Redirect::to("/reservations").into_response()),
        Err(e) => rejected(e),
    }
}

/// GET /reservations
async fn list_mine(State(state): State<AppState>, identity: Identity) -> AppResult<Json<Vec<Booking>>> {
    let customer = identity.require_customer()?;
    Ok(Json(state.engine.bookings_for_customer(customer).await))
}

/// GET /reservation/{id}
async fn detail(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Ulid>,
) -> AppResult<Json<BookingView>> {
    let booking = owned_booking(&state, &identity, id).await?;
    let tables = state.engine.tables_by_ids(&booking.table_ids).await;
    Ok(Json(BookingView { booking, tables }))
}

/// POST /reservation/edit/{id}
async fn edit(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Ulid>,
    Form(form): Form<ReservationForm>,
) -> AppResult<Response> {
    let booking = owned_booking(&state, &identity, id).await?;
    let req = match state
        .engine
        .validate_reservation(&form, booking.customer_user.clone(), Some(id))
        .await
    {
        Ok(req) => req,
        Err(errors) => return Ok(form_errors(errors)),
    };
    match state.engine.reschedule(id, req).await {
        Ok(_) => Ok(Redirect::to(&format!("/reservation/{id}")).into_response()),
        Err(e) => rejected(e),
    }
}

/// POST /reservation/{id}/cancel
async fn cancel(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Ulid>,
) -> AppResult<Redirect> {
    owned_booking(&state, &identity, id).await?;
    state.engine.cancel_booking(id).await?;
    Ok(Redirect::to("/reservations"))
}
