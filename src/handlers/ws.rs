//! Live progress stream at /ws/optimize/{job_id}

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::AppState;
use crate::services::jobs::ResultOutcome;
use crate::types::{
    DaySchedule, JobState, JobView, ProgressEvent, ProgressKind, ScheduleStats,
};

/// Client → server messages
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    GetStatus,
}

/// Server → client messages
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: Uuid,
        phase: String,
        progress: u8,
        message: String,
        timestamp: chrono::DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        job_id: Uuid,
        status: JobState,
        message: String,
        timestamp: chrono::DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        job_id: Uuid,
        result: Box<DaySchedule>,
        stats: ScheduleStats,
        timestamp: chrono::DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        job_id: Uuid,
        error_code: String,
        message: String,
        timestamp: chrono::DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Pong { timestamp: chrono::DateTime<Utc> },
}

impl ServerMessage {
    fn status_of(view: &JobView) -> Self {
        ServerMessage::Status {
            job_id: view.job_id,
            status: view.status,
            message: format!("{} ({}%)", view.phase, view.progress),
            timestamp: Utc::now(),
        }
    }

    fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// GET /ws/optimize/{id}
pub async fn upgrade(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.websocket_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, id))
}

async fn handle_socket(socket: WebSocket, state: AppState, job_id: Uuid) {
    let (mut tx, mut rx) = socket.split();

    // Unknown job ids get an error event, then the subscription closes
    let view = match state.manager.get(job_id).await {
        Ok(Some(view)) => view,
        Ok(None) => {
            let message = ServerMessage::Error {
                job_id,
                error_code: "JOB_NOT_FOUND".to_string(),
                message: format!("job {} not found", job_id),
                timestamp: Utc::now(),
            };
            let _ = tx.send(Message::Text(message.json().into())).await;
            let _ = tx.close().await;
            return;
        }
        Err(e) => {
            warn!(%job_id, error = %e, "job lookup failed on ws connect");
            let _ = tx.close().await;
            return;
        }
    };

    let mut subscription = match state.broker.subscribe(job_id).await {
        Some(subscription) => subscription,
        None => {
            let _ = tx.close().await;
            return;
        }
    };

    // Immediate snapshot so late subscribers see the current state even
    // when the broker has no buffered event (e.g. after a restart)
    let _ = tx
        .send(Message::Text(ServerMessage::status_of(&view).json().into()))
        .await;
    if view.status.is_terminal() {
        if let Some(message) = terminal_message(&state, &view).await {
            let _ = tx.send(Message::Text(message.json().into())).await;
        }
        let _ = tx.close().await;
        return;
    }

    loop {
        tokio::select! {
            event = subscription.events.recv() => {
                match event {
                    Some(event) => {
                        let terminal = event.kind.is_terminal();
                        for message in event_messages(&state, &event).await {
                            if tx.send(Message::Text(message.json().into())).await.is_err() {
                                state.broker.unsubscribe(job_id, subscription.id);
                                return;
                            }
                        }
                        if terminal {
                            break;
                        }
                    }
                    // Broker dropped us (slow consumer) or job feed closed
                    None => break,
                }
            }
            incoming = rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(&state, job_id, &text).await {
                            if tx.send(Message::Text(reply.json().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%job_id, error = %e, "ws receive error");
                        break;
                    }
                }
            }
        }
    }

    state.broker.unsubscribe(job_id, subscription.id);
    let _ = tx.close().await;
}

async fn handle_client_message(
    state: &AppState,
    job_id: Uuid,
    text: &str,
) -> Option<ServerMessage> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => Some(ServerMessage::Pong {
            timestamp: Utc::now(),
        }),
        Ok(ClientMessage::GetStatus) => match state.manager.get(job_id).await {
            Ok(Some(view)) => Some(ServerMessage::status_of(&view)),
            _ => None,
        },
        Err(e) => {
            debug!(%job_id, error = %e, "unparseable ws client message");
            None
        }
    }
}

/// Translate a broker event into wire messages. Completion additionally
/// carries the full result.
async fn event_messages(state: &AppState, event: &ProgressEvent) -> Vec<ServerMessage> {
    match event.kind {
        ProgressKind::Progress => vec![ServerMessage::Progress {
            job_id: event.job_id,
            phase: event.phase.as_str().to_string(),
            progress: event.progress,
            message: event.message.clone(),
            timestamp: event.timestamp,
        }],
        ProgressKind::Completed => {
            match state.manager.result(event.job_id).await {
                Ok(ResultOutcome::Ready(result)) => vec![ServerMessage::Completed {
                    job_id: event.job_id,
                    stats: result.schedule.stats.clone(),
                    result: Box::new(result.schedule),
                    timestamp: event.timestamp,
                }],
                _ => vec![ServerMessage::Error {
                    job_id: event.job_id,
                    error_code: "INTERNAL".to_string(),
                    message: "completed job has no readable result".to_string(),
                    timestamp: event.timestamp,
                }],
            }
        }
        ProgressKind::Error => vec![ServerMessage::Error {
            job_id: event.job_id,
            error_code: extract_code(&event.message),
            message: event.message.clone(),
            timestamp: event.timestamp,
        }],
        ProgressKind::Cancelled => vec![ServerMessage::Status {
            job_id: event.job_id,
            status: JobState::Cancelled,
            message: event.message.clone(),
            timestamp: event.timestamp,
        }],
    }
}

/// Terminal snapshot for subscribers connecting after the fact
async fn terminal_message(state: &AppState, view: &JobView) -> Option<ServerMessage> {
    match view.status {
        JobState::Completed => match state.manager.result(view.job_id).await {
            Ok(ResultOutcome::Ready(result)) => Some(ServerMessage::Completed {
                job_id: view.job_id,
                stats: result.schedule.stats.clone(),
                result: Box::new(result.schedule),
                timestamp: Utc::now(),
            }),
            _ => None,
        },
        JobState::Failed => view.error.as_ref().map(|e| ServerMessage::Error {
            job_id: view.job_id,
            error_code: e.code.clone(),
            message: e.message.clone(),
            timestamp: Utc::now(),
        }),
        JobState::Cancelled => Some(ServerMessage::Status {
            job_id: view.job_id,
            status: JobState::Cancelled,
            message: "job cancelled".to_string(),
            timestamp: Utc::now(),
        }),
        _ => None,
    }
}

/// Error events carry "CODE: message"; fall back to INTERNAL
fn extract_code(message: &str) -> String {
    message
        .split(':')
        .next()
        .filter(|code| code.chars().all(|c| c.is_ascii_uppercase() || c == '_'))
        .unwrap_or("INTERNAL")
        .to_string()
}
