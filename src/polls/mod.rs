mod engine;
mod poll;

use std::sync::Arc;

use axum::{Json, Router, debug_handler, extract::{Path, State}, routing::get};
use uuid::Uuid;

use crate::{AppResult, AppState};

pub use engine::{PollEngine, PollSnapshot};
pub use poll::{
    MAX_OPTIONS, MIN_OPTIONS, NewPoll, OptionTally, Poll, PollOption, PollStatus, PollTally,
    percentage,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_polls))
        .route("/{poll_id}", get(poll))
}

#[debug_handler(state = AppState)]
async fn list_polls(State(polls): State<Arc<PollEngine>>) -> Json<Vec<PollSnapshot>> {
    Json(polls.list())
}

#[debug_handler(state = AppState)]
async fn poll(
    State(polls): State<Arc<PollEngine>>,
    Path(poll_id): Path<Uuid>,
) -> AppResult<Json<PollSnapshot>> {
    Ok(Json(polls.get(poll_id)?))
}
