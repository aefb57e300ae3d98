//! Server-sent event responses.
//!
//! Frames are `data: <json>\n\n`; an idle stream gets a `: heartbeat` comment
//! every [`HEARTBEAT_INTERVAL`] so proxies keep the connection open. The
//! response ends when the source stream ends or the client disconnects, at
//! which point the source stream is dropped.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;

/// Interval between heartbeat comments.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Wrap a stream of serialisable messages as an SSE response.
///
/// Messages that fail to serialise are logged and skipped.
pub fn sse_response<S, T>(messages: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let events = messages.filter_map(|message| async move {
        match Event::default().json_data(&message) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping unserialisable SSE message");
                None
            }
        }
    });

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}
