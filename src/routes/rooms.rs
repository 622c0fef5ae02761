use axum::{Router, routing::get, extract::Extension, Json};

use crate::state::{RoomRegistry, RoomSummary};

pub fn router() -> Router {
    Router::new().route("/rooms", get(list_rooms))
}

async fn list_rooms(Extension(rooms): Extension<RoomRegistry>) -> Json<Vec<RoomSummary>> {
    Json(rooms.list().await)
}
