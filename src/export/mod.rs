mod csv;
mod service;

use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::AppState;

pub use service::{
    ExportService, FullExport, MESSAGES_HEADER, POLLS_HEADER, PollStats, PresenceStats, Stats,
    USERS_HEADER,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users.csv", get(users_csv))
        .route("/messages.csv", get(messages_csv))
        .route("/polls.csv", get(polls_csv))
        .route("/all.json", get(all_json))
}

fn csv_attachment(name: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        body,
    )
        .into_response()
}

#[debug_handler(state = AppState)]
async fn users_csv(State(exports): State<Arc<ExportService>>) -> Response {
    csv_attachment("users.csv", exports.users_csv())
}

#[debug_handler(state = AppState)]
async fn messages_csv(State(exports): State<Arc<ExportService>>) -> Response {
    csv_attachment("messages.csv", exports.messages_csv())
}

#[debug_handler(state = AppState)]
async fn polls_csv(State(exports): State<Arc<ExportService>>) -> Response {
    csv_attachment("polls.csv", exports.polls_csv())
}

#[debug_handler(state = AppState)]
async fn all_json(State(exports): State<Arc<ExportService>>) -> Json<FullExport> {
    Json(exports.full())
}

#[debug_handler(state = AppState)]
pub(crate) async fn stats(State(exports): State<Arc<ExportService>>) -> Json<Stats> {
    Json(exports.stats())
}
