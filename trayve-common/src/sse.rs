//! Server-Sent Events (SSE) utilities

use crate::events::{EventBus, TrayveEvent};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Create an SSE stream forwarding EventBus events
///
/// When `execution_filter` is set only events for that execution are sent.
/// A `ConnectionStatus` event is sent first, then events as they arrive, with
/// a heartbeat comment every 15 seconds.
pub fn event_bus_sse_stream(
    event_bus: &EventBus,
    execution_filter: Option<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(filter = ?execution_filter, "New SSE client connected");

    let mut rx = event_bus.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                received = rx.recv() => {
                    match received {
                        Ok(event) => {
                            if let Some(event) = to_sse_event(&event, execution_filter) {
                                yield Ok(event);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "SSE: client lagged, events dropped");
                        }
                        Err(RecvError::Closed) => {
                            info!("SSE: event bus closed, ending stream");
                            break;
                        }
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}

fn to_sse_event(event: &TrayveEvent, execution_filter: Option<Uuid>) -> Option<Event> {
    if let Some(filter) = execution_filter {
        if event.execution_id() != filter {
            return None;
        }
    }

    let event_type = event.event_type();
    match serde_json::to_string(event) {
        Ok(event_json) => {
            debug!("SSE: Broadcasting event: {}", event_type);
            Some(Event::default().event(event_type).data(event_json))
        }
        Err(e) => {
            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
            None
        }
    }
}
