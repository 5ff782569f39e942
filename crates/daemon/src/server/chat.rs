//! Server-sent event stream for one-shot queries.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use protocol::QueryRequest;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use super::error::ApiError;
use super::state::AppState;

/// Interval between keep-alive comments on an idle stream.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Runs a query and streams its events. Dropping the response (client
/// disconnect) drops the receiver, which kills the subprocess.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }

    let resume = request.session_id.filter(|s| !s.is_empty());
    let events = state.runner.run(request.message, resume);
    let stream = ReceiverStream::new(events).map(|event| Event::default().json_data(event));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}
