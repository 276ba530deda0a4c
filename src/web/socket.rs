//! Lobby event stream over WebSocket.
//!
//! Every connection subscribes to its lobby's channel. Closing the socket
//! feeds back into the engine: the host leaving aborts the round, anyone
//! else leaving only flips their connected flag.

use crate::error::LiveError;
use crate::live::{ChannelKey, LiveQuizEngine};
use crate::live::broadcast::EventReceiver;
use crate::state::SharedState;
use crate::web::session::UserSession;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/lobbies/:lobby_id/ws", get(ws_handler))
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Host,
    Player,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    UserSession(user_id): UserSession,
    Path(lobby_id): Path<Uuid>,
) -> Result<Response, LiveError> {
    let role = authorize(&state, lobby_id, user_id).await?;
    // Subscribe before the upgrade so nothing published in between is missed.
    let events = state.hub.subscribe(ChannelKey::Lobby(lobby_id));
    let engine = state.engine.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, engine, events, lobby_id, user_id, role)))
}

async fn authorize(state: &SharedState, lobby_id: Uuid, user_id: Uuid) -> Result<Role, LiveError> {
    let lobby = state
        .roster
        .find_lobby(lobby_id)
        .await?
        .ok_or_else(|| LiveError::NotFound(format!("lobby {}", lobby_id)))?;
    if lobby.host_id == user_id {
        return Ok(Role::Host);
    }
    let members = state.roster.members_of(lobby_id).await?;
    if members.iter().any(|m| m.user_id == user_id) {
        Ok(Role::Player)
    } else {
        Err(LiveError::Forbidden("not a lobby member"))
    }
}

async fn handle_socket(
    socket: WebSocket,
    engine: LiveQuizEngine,
    mut events: EventReceiver,
    lobby_id: Uuid,
    user_id: Uuid,
    role: Role,
) {
    let (mut sender, mut receiver) = socket.split();
    tracing::info!("WebSocket connected: user {} on lobby {} ({:?})", user_id, lobby_id, role);

    if role == Role::Player {
        if let Err(e) = engine.on_participant_presence(lobby_id, user_id, true).await {
            tracing::warn!("Failed to mark user {} connected: {}", user_id, e);
        }
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("Failed to serialize {}: {}", event.type_name(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Lobby {} subscriber {} lagged by {} events", lobby_id, user_id, n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("WebSocket error for user {}: {}", user_id, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let result = match role {
        Role::Host => engine.on_host_disconnect(lobby_id).await,
        Role::Player => engine.on_participant_presence(lobby_id, user_id, false).await,
    };
    if let Err(e) = result {
        tracing::error!("Disconnect handling for user {} on lobby {} failed: {}", user_id, lobby_id, e);
    }
    tracing::info!("WebSocket disconnected: user {} on lobby {}", user_id, lobby_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveConfig;
    use crate::db::MemoryStore;
    use crate::domain::models::RosterMember;
    use crate::live::{ChannelHub, EngineDeps, TokioClock};
    use crate::state::AppState;
    use std::sync::Arc;

    #[tokio::test]
    async fn roles_follow_the_lobby() {
        let store = MemoryStore::new();
        let player = Uuid::new_v4();
        let lobby = store
            .add_lobby(
                Uuid::new_v4(),
                Uuid::new_v4(),
                vec![RosterMember {
                    user_id: player,
                    first_name: "Alan".into(),
                    last_name: "Turing".into(),
                }],
            )
            .await;
        let hub = ChannelHub::new(8);
        let engine = LiveQuizEngine::new(
            LiveConfig::default(),
            EngineDeps {
                store: Arc::new(store.clone()),
                questions: Arc::new(store.clone()),
                roster: Arc::new(store.clone()),
                broadcaster: Arc::new(hub.clone()),
                clock: Arc::new(TokioClock::new()),
            },
        );
        let state: SharedState = Arc::new(AppState {
            engine,
            hub,
            roster: Arc::new(store),
            session_key: b"k".to_vec(),
        });

        assert_eq!(authorize(&state, lobby.id, lobby.host_id).await.unwrap(), Role::Host);
        assert_eq!(authorize(&state, lobby.id, player).await.unwrap(), Role::Player);
        assert!(matches!(
            authorize(&state, lobby.id, Uuid::new_v4()).await,
            Err(LiveError::Forbidden(_))
        ));
        assert!(matches!(
            authorize(&state, Uuid::new_v4(), player).await,
            Err(LiveError::NotFound(_))
        ));
    }
}
