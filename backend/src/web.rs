use crate::codec::is_known_message;
use crate::db;
use crate::mission::event::MISSION_PREFIX;
use crate::state::AppState;
use axum::http::StatusCode;
use axum::{
    extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use gcs_shared::{
    MissionCommand, MissionProgress, MissionState, OutgoingMessage, StatusEvent, StatusRecord,
    TelemetryMessage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::compression::CompressionLayer;

const RECENT_IN_SNAPSHOT: usize = 20;

/// Public router constructor
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/command", post(send_command))
        .route("/api/mission/upload", post(upload_mission))
        .route("/api/mission/clear", post(clear_mission))
        .route("/api/mission/state", get(get_mission_state))
        .route("/api/mission/history", get(get_history))
        .route("/api/message", post(send_message))
        .route("/ws", get(ws_handler))
        .layer(CompressionLayer::new())
        .with_state(state)
}

/// Outgoing WebSocket messages to the frontend:
///   { "ty": "status",   "data": { ...StatusRecord... } }
///   { "ty": "progress", "data": { "sent": 1, "total": 3 } }
///   { "ty": "state",    "data": { "state": "IDLE" } }
///   { "ty": "telemetry", "data": { "name": "ATTITUDE", "fields": {...}, ... } }
#[derive(Serialize)]
#[serde(tag = "ty", content = "data", rename_all = "snake_case")]
pub enum WsOutMsg {
    Status(StatusRecord),
    Progress(MissionProgress),
    State(MissionStateMsg),
    Telemetry(TelemetryMessage),
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionStateMsg {
    pub state: MissionState,
}

#[derive(Serialize)]
pub struct MissionSnapshot {
    pub state: MissionState,
    pub recent: Vec<StatusRecord>,
}

#[derive(Deserialize)]
struct UploadBody {
    waypoints: Vec<Value>,
}

async fn queue(state: &AppState, cmd: MissionCommand) -> (StatusCode, &'static str) {
    match state.cmd_tx.send(cmd).await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::error!("Mission task gone, dropping {:?}", e.0);
            (StatusCode::SERVICE_UNAVAILABLE, "mission task unavailable")
        }
    }
}

async fn send_command(
    State(state): State<Arc<AppState>>,
    Json(cmd): Json<MissionCommand>,
) -> impl IntoResponse {
    queue(&state, cmd).await
}

async fn upload_mission(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UploadBody>,
) -> impl IntoResponse {
    queue(
        &state,
        MissionCommand::UploadMission {
            waypoints: body.waypoints,
        },
    )
    .await
}

async fn clear_mission(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    queue(&state, MissionCommand::ClearMission).await
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<OutgoingMessage>,
) -> (StatusCode, &'static str) {
    if !is_known_message(&msg.name) {
        tracing::warn!("Refusing unknown message {}", msg.name);
        return (StatusCode::BAD_REQUEST, "unknown message");
    }
    if msg.name.starts_with(MISSION_PREFIX) {
        // would interleave with an engine-owned session
        return (StatusCode::BAD_REQUEST, "mission messages go through mission commands");
    }

    match state.message_tx.send(msg).await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::error!("Link task gone, dropping {}", e.0.name);
            (StatusCode::SERVICE_UNAVAILABLE, "link unavailable")
        }
    }
}

async fn get_mission_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(MissionSnapshot {
        state: state.mission_state(),
        recent: state.recent_status(RECENT_IN_SNAPSHOT),
    })
}

#[derive(Deserialize)]
struct HistoryParams {
    // /api/mission/history?minutes=20  (defaults to 20 if not provided)
    minutes: Option<u64>,
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let cutoff = history_cutoff(db::now_ms(), params.minutes.unwrap_or(20));

    match db::status_history(&state.db, cutoff).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            tracing::error!("Reading mission history failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "history unavailable").into_response()
        }
    }
}

/// Oldest timestamp covered by a look-back of `minutes`, clamped for huge windows.
fn history_cutoff(now_ms: i64, minutes: u64) -> i64 {
    let window = i64::try_from(minutes)
        .unwrap_or(i64::MAX)
        .saturating_mul(60_000);
    now_ms.saturating_sub(window)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    let mut status_rx = state.status_tx.subscribe();
    let mut progress_rx = state.progress_tx.subscribe();
    let mut state_rx = state.state_tx.subscribe();
    let mut telemetry_rx = state.telemetry_tx.subscribe();

    let cmd_tx = state.cmd_tx.clone();
    let (mut sender, mut receiver) = socket.split();

    // Task: server -> client (all streams multiplexed)
    let send_task = async move {
        // Late joiners start from the current state.
        let hello = WsOutMsg::State(MissionStateMsg {
            state: state.mission_state(),
        });
        if send_json(&mut sender, &hello).await.is_err() {
            return;
        }

        loop {
            let msg = tokio::select! {
                biased;

                recv = status_rx.recv() => match recv {
                    Ok(rec) => WsOutMsg::Status(rec),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                recv = state_rx.recv() => match recv {
                    Ok(s) => WsOutMsg::State(s),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                recv = progress_rx.recv() => match recv {
                    Ok(p) => WsOutMsg::Progress(p),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                recv = telemetry_rx.recv() => match recv {
                    Ok(t) => WsOutMsg::Telemetry(t),
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!("WS client skipped {n} telemetry messages");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if send_json(&mut sender, &msg).await.is_err() {
                break;
            }
        }
    };

    // Task: client -> server (commands)
    let recv_task = async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<MissionCommand>(&text) {
                    Ok(cmd) => {
                        if let Err(e) = cmd_tx.send(cmd).await {
                            tracing::warn!("Failed to forward WS command to cmd_tx: {e}");
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Invalid WS command JSON {text:?}: {e}");
                    }
                }
            }
        }
    };

    // Run both directions until one side ends
    tokio::join!(send_task, recv_task);
}

async fn send_json<S>(sender: &mut S, msg: &WsOutMsg) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let text = serde_json::to_string(msg).unwrap_or_default();
    sender.send(Message::Text(Utf8Bytes::from(text))).await
}

fn spawn_status_insert(state: &AppState, record: StatusRecord) {
    state.begin_db_write();
    let state_for_task = state.clone();

    tokio::spawn(async move {
        if let Err(e) =
            db::insert_status(&state_for_task.db, record.timestamp_ms, &record.event).await
        {
            tracing::error!("DB insert into mission_events failed after retry: {e}");
        }
        state_for_task.end_db_write();
    });
}

/// Publishes a session outcome: recent buffer, frontend, then the DB.
pub fn emit_status(state: &AppState, event: StatusEvent) {
    let record = StatusRecord {
        timestamp_ms: db::now_ms(),
        event,
    };

    if record.event.success {
        tracing::info!("Mission status: {}", record.event.message);
    } else {
        tracing::warn!("Mission status: {}", record.event.message);
    }

    state.push_recent(record.clone());
    let _ = state.status_tx.send(record.clone());
    spawn_status_insert(state, record);
}

pub fn emit_progress(state: &AppState, progress: MissionProgress) {
    let _ = state.progress_tx.send(progress);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tokio::sync::mpsc;

    async fn test_state() -> (
        Arc<AppState>,
        mpsc::Receiver<MissionCommand>,
        mpsc::Receiver<OutgoingMessage>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (message_tx, message_rx) = mpsc::channel(4);
        let db = db::memory_db().await;
        (
            Arc::new(AppState::new(db, cmd_tx, message_tx)),
            cmd_rx,
            message_rx,
        )
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn upload_endpoint_queues_a_command() {
        let (state, mut cmd_rx, _message_rx) = test_state().await;
        let body = UploadBody {
            waypoints: vec![serde_json::json!({"lat": 1.0, "lon": 2.0})],
        };
        let resp = upload_mission(State(state), Json(body)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        match cmd_rx.recv().await {
            Some(MissionCommand::UploadMission { waypoints }) => assert_eq!(waypoints.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_reports_a_missing_mission_task() {
        let (state, cmd_rx, _message_rx) = test_state().await;
        drop(cmd_rx);
        let resp = clear_mission(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn emitted_status_reaches_snapshot_socket_and_history() {
        let (state, _cmd_rx, _message_rx) = test_state().await;
        let mut status_rx = state.status_tx.subscribe();

        emit_status(&state, StatusEvent::failure("Timeout clearing mission"));
        state.wait_for_db_writes().await;

        assert_eq!(
            status_rx.recv().await.unwrap().event.message,
            "Timeout clearing mission"
        );

        let snapshot = body_json(get_mission_state(State(state.clone())).await.into_response()).await;
        assert_eq!(snapshot["state"], "IDLE");
        assert_eq!(snapshot["recent"][0]["message"], "Timeout clearing mission");
        assert_eq!(snapshot["recent"][0]["success"], false);

        let history = body_json(
            get_history(State(state.clone()), Query(HistoryParams { minutes: None }))
                .await
                .into_response(),
        )
        .await;
        assert_eq!(history.as_array().map(Vec::len), Some(1));

        let everything = body_json(
            get_history(
                State(state.clone()),
                Query(HistoryParams {
                    minutes: Some(u64::MAX),
                }),
            )
            .await
            .into_response(),
        )
        .await;
        assert_eq!(everything.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn history_cutoff_saturates() {
        assert_eq!(history_cutoff(1_000_000, 0), 1_000_000);
        assert_eq!(history_cutoff(1_000_000, 1), 940_000);
        assert_eq!(history_cutoff(1_000, u64::MAX), 1_000 - i64::MAX);
        assert_eq!(history_cutoff(i64::MIN + 5, u64::MAX), i64::MIN);
    }

    #[tokio::test]
    async fn message_endpoint_checks_names_and_queues() {
        let (state, _cmd_rx, mut message_rx) = test_state().await;
        let msg = |name: &str| OutgoingMessage {
            name: name.into(),
            fields: serde_json::json!({"target_system": 1, "param1": 1.0})
                .as_object()
                .cloned()
                .unwrap(),
        };

        let resp = send_message(State(state.clone()), Json(msg("NOT_A_MESSAGE"))).await;
        assert_eq!(resp.0, StatusCode::BAD_REQUEST);
        let resp = send_message(State(state.clone()), Json(msg("MISSION_CLEAR_ALL"))).await;
        assert_eq!(resp.0, StatusCode::BAD_REQUEST);
        assert!(message_rx.try_recv().is_err());

        let resp = send_message(State(state.clone()), Json(msg("COMMAND_LONG"))).await;
        assert_eq!(resp.0, StatusCode::OK);
        let queued = message_rx.recv().await.unwrap();
        assert_eq!(queued.name, "COMMAND_LONG");
        assert_eq!(queued.fields["target_system"], 1);

        drop(message_rx);
        let resp = send_message(State(state), Json(msg("COMMAND_LONG"))).await;
        assert_eq!(resp.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn ws_messages_are_tagged() {
        let msg = WsOutMsg::Progress(MissionProgress { sent: 1, total: 3 });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["ty"], "progress");
        assert_eq!(v["data"]["total"], 3);

        let msg = WsOutMsg::State(MissionStateMsg {
            state: MissionState::WaitingForRequest,
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["ty"], "state");
        assert_eq!(v["data"]["state"], "WAITING_FOR_REQUEST");

        let msg = WsOutMsg::Telemetry(TelemetryMessage {
            timestamp_ms: 7,
            link: "udp".into(),
            name: "HEARTBEAT".into(),
            system_id: 1,
            component_id: 1,
            fields: serde_json::json!({"type": 10}).as_object().cloned().unwrap(),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["ty"], "telemetry");
        assert_eq!(v["data"]["name"], "HEARTBEAT");
        assert_eq!(v["data"]["fields"]["type"], 10);
    }
}
