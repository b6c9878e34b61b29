//! Server-sent event stream over a broadcast channel.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub channel: Option<String>,
}

/// Subscribe to a channel and forward every message as one SSE frame.
///
/// The subscription lives inside the response stream: when the client goes
/// away the stream is dropped and the subscriber is removed.
pub(super) async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let channel = params
        .channel
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("channel is required".to_string()))?;

    let subscription = state.broadcaster.subscribe(channel);
    let client_id = uuid::Uuid::new_v4().to_string();
    tracing::debug!(
        channel,
        client_id = %client_id,
        subscriber = subscription.id(),
        "Stream client connected"
    );

    let connected = json!({ "type": "connected", "clientId": client_id });
    let hello = futures::stream::once(async move {
        Ok::<_, Infallible>(Event::default().data(connected.to_string()))
    });
    let messages = futures::stream::unfold(subscription, |mut subscription| async move {
        let message = subscription.recv().await?;
        Some((
            Ok::<_, Infallible>(Event::default().data(message.to_string())),
            subscription,
        ))
    });

    Ok(Sse::new(hello.chain(messages)).keep_alive(KeepAlive::default()))
}
