//! Server-sent progress feed

use axum::{
    extract::{Path, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use ferry_common::Event;
use futures::{Stream, StreamExt};

use super::AppState;

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::UploadProgress { .. } => "upload_progress",
        Event::CancelNotice { .. } => "cancel_notice",
        Event::Lifecycle { .. } => "lifecycle",
    }
}

/// Stream events until the client disconnects or the subscription is replaced
pub async fn subscribe(
    State(state): State<AppState>,
    Path(subscriber_id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let stream = state
        .broadcaster
        .subscribe(subscriber_id)
        .map(|event| SseEvent::default().event(event_name(&event)).json_data(&event));

    Sse::new(stream).keep_alive(KeepAlive::default())
}
