//! SSE broadcaster for real-time dashboard updates

use axum::{
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use playguard_common::events::EventBus;

/// SSE broadcaster wrapping the pipeline event bus
#[derive(Clone)]
pub struct SseBroadcaster {
    events: EventBus,
}

impl SseBroadcaster {
    /// Wrap the pipeline event bus.
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Current number of connected clients.
    pub fn client_count(&self) -> usize {
        self.events.subscriber_count()
    }

    /// Create an SSE stream for a new client connection.
    pub fn subscribe_stream(&self) -> impl Stream<Item = Result<Event, Infallible>> {
        let rx = self.events.subscribe();
        let stream = BroadcastStream::new(rx);

        stream.filter_map(|result| async move {
            match result {
                Ok(pipeline_event) => {
                    let event = Event::default()
                        .event(pipeline_event.event_name())
                        .json_data(&pipeline_event)
                        .ok();
                    event.map(Ok)
                }
                Err(e) => {
                    // Slow consumers drop messages; they never block
                    // the pipeline.
                    warn!("SSE client lagged: {:?}", e);
                    None
                }
            }
        })
    }

    /// Axum handler body for GET /api/v1/events.
    pub fn handle_sse_connection(&self) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        info!("New SSE client connected, total clients: {}", self.client_count());

        Sse::new(self.subscribe_stream()).keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(30))
                .text("keep-alive"),
        )
    }
}
