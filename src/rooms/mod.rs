mod msg;
mod room;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

pub use msg::{GLOBAL_ROOM, Message, MessageBroker, RoomId};
pub(crate) use msg::validate_room_id;
pub(crate) use room::page_size;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(room::list))
        .route("/{room_id}/messages", get(room::history))
}

pub fn ws_router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::room_ws))
}
