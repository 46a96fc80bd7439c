use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::engine::{parse_date, parse_time, tables_needed};

use super::AppState;

pub(super) fn router() -> Router<AppState> {
    Router::new().route("/check-available-tables", get(check_available_tables))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct CountParams {
    date: Option<String>,
    time: Option<String>,
    guests: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(super) struct FreeCount {
    count: usize,
}

/// GET /check-available-tables?date=&time=&guests=
///
/// Advisory only. Anything missing, malformed or out of range answers `count: 0`.
async fn check_available_tables(
    State(state): State<AppState>,
    Query(params): Query<CountParams>,
) -> Json<FreeCount> {
    let parsed = (|| {
        let date = parse_date(params.date.as_deref()?)?;
        let time = parse_time(params.time.as_deref()?)?;
        let guests = params.guests.as_deref()?.trim().parse::<u32>().ok()?;
        tables_needed(guests).ok()?;
        Some((date, time, guests))
    })();
    let count = match parsed {
        Some((date, time, guests)) => state.engine.available_table_count(date, time, guests).await,
        None => 0,
    };
    Json(FreeCount { count })
}
