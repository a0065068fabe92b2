use std::sync::Arc;

use axum::{Json, debug_handler, extract::{Path, Query, State}};
use serde::Deserialize;

use crate::AppResult;

use super::msg::{Message, MessageBroker};

pub(crate) const DEFAULT_PAGE: usize = 50;
pub(crate) const MAX_PAGE: usize = 200;

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<usize>,
    before: Option<u64>,
}

pub(crate) fn page_size(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE)
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history(
    State(broker): State<Arc<MessageBroker>>,
    Path(room_id): Path<String>,
    Query(HistoryQuery { limit, before }): Query<HistoryQuery>,
) -> AppResult<Json<Vec<Arc<Message>>>> {
    let page = broker.history(&room_id, page_size(limit), before)?;
    Ok(Json(page.collect()))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn list(State(broker): State<Arc<MessageBroker>>) -> Json<Vec<String>> {
    Json(broker.rooms())
}
