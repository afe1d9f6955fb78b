//! The SSE hub: fan-out of job events to subscribed clients.

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use pipemill_core::JobId;
use pipemill_store::JobSummary;

use crate::AppState;

/// Heartbeat comment interval, keeping intermediaries from timing out.
pub const HEARTBEAT: Duration = Duration::from_secs(15);

const CHANNEL_CAPACITY: usize = 1024;

/// One event on the wire: a typed name plus a JSON payload, tagged with
/// the job it concerns when there is one (used for client-side filtering).
#[derive(Debug, Clone)]
pub struct HubEvent {
    pub name: &'static str,
    pub job_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Broadcast hub for SSE clients.
///
/// Slow clients lag and drop events rather than backing up the publisher;
/// disconnected clients disappear when their receiver is dropped.
pub struct SseHub {
    tx: broadcast::Sender<HubEvent>,
}

impl SseHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Send an event to all connected clients. No receivers is not an
    /// error.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    pub fn seed_uploaded(&self, job_name: &str) {
        self.publish(HubEvent {
            name: "seed:uploaded",
            job_id: None,
            payload: json!({ "jobName": job_name }),
        });
    }

    pub fn job_created(&self, summary: &JobSummary) {
        self.publish(HubEvent {
            name: "job:created",
            job_id: Some(summary.id.clone()),
            payload: serde_json::to_value(summary).unwrap_or_default(),
        });
    }

    pub fn job_updated(&self, summary: &JobSummary) {
        self.publish(HubEvent {
            name: "job:updated",
            job_id: Some(summary.id.clone()),
            payload: serde_json::to_value(summary).unwrap_or_default(),
        });
    }

    pub fn job_removed(&self, job_id: &JobId) {
        self.publish(HubEvent {
            name: "job:removed",
            job_id: Some(job_id.to_string()),
            payload: json!({ "jobId": job_id.to_string() }),
        });
    }

    pub fn status_changed(&self, job_id: &JobId, status: &str) {
        self.publish(HubEvent {
            name: "status:changed",
            job_id: Some(job_id.to_string()),
            payload: json!({ "jobId": job_id.to_string(), "status": status }),
        });
    }

    /// Coarse-grained filesystem notification.
    pub fn state_change(&self, path: &Path, job_id: Option<&JobId>) {
        self.publish(HubEvent {
            name: "state:change",
            job_id: job_id.map(|id| id.to_string()),
            payload: json!({ "path": path.display().to_string() }),
        });
    }
}

impl Default for SseHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Restrict the stream to one job's events; events without a job tag
    /// are always delivered.
    #[serde(rename = "jobId")]
    pub job_id: Option<String>,
}

/// `GET /api/events` — the SSE stream.
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.hub.subscribe();
    let filter = query.job_id;
    debug!(job_id = ?filter, "sse client connected");

    let stream = futures::stream::unfold((rx, filter), |(mut rx, filter)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let (Some(filter), Some(job_id)) = (filter.as_deref(), event.job_id.as_deref())
                    {
                        if filter != job_id {
                            continue;
                        }
                    }
                    let sse_event = Event::default()
                        .event(event.name)
                        .data(event.payload.to_string());
                    return Some((Ok(sse_event), (rx, filter)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "sse client lagging, skipping events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT))
}
