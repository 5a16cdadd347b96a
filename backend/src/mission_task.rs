use crate::mission::{Effect, InboundMessage, MissionEngine, OutboundMessage};
use crate::state::AppState;
use crate::web::{emit_progress, emit_status};
use gcs_shared::MissionCommand;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};

/// Owns the mission engine. Every command, vehicle message and timer firing
/// is handled to completion before the next one is looked at.
pub async fn mission_task(
    state: Arc<AppState>,
    mut engine: MissionEngine,
    mut cmd_rx: mpsc::Receiver<MissionCommand>,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    link_tx: mpsc::Sender<OutboundMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    state.set_mission_state(engine.state());

    loop {
        let timer = engine.pending_timer();
        let deadline = timer.map(|t| t.deadline).unwrap_or_else(Instant::now);

        let effects = tokio::select! {
            Some(cmd) = cmd_rx.recv() => engine.handle_command(cmd, Instant::now()),
            Some(msg) = inbound_rx.recv() => {
                tracing::debug!("{} <- {}", msg.link, msg.name);
                engine.handle_message(&msg, Instant::now())
            }
            _ = sleep_until(deadline), if timer.is_some() => match timer {
                Some(t) => engine.on_timer(t.session, t.kind, Instant::now()),
                None => Vec::new(),
            },
            _ = shutdown_rx.recv() => {
                // in-flight session is dropped without a status event
                engine.shutdown();
                state.set_mission_state(engine.state());
                break;
            }
        };

        apply_effects(&state, &link_tx, effects).await;
        state.set_mission_state(engine.state());
    }
}

async fn apply_effects(
    state: &AppState,
    link_tx: &mpsc::Sender<OutboundMessage>,
    effects: Vec<Effect>,
) {
    for effect in effects {
        match effect {
            Effect::Send(out) => {
                let name = out.name();
                if link_tx.send(out).await.is_err() {
                    tracing::error!("Link task gone, {name} not sent");
                }
            }
            Effect::Status(event) => emit_status(state, event),
            Effect::Progress(progress) => emit_progress(state, progress),
        }
    }
}
