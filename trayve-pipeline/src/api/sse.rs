//! Server-Sent Events for generation progress
//!
//! A notification side-channel only: every event mirrors a state change that
//! pollers can also read from `GET /executions/{id}`.

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    /// Only stream events of this execution
    pub execution_id: Option<Uuid>,
}

/// GET /events?execution_id=
pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    trayve_common::sse::event_bus_sse_stream(&state.event_bus, query.execution_id)
}
