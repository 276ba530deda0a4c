use crate::domain::models::{SessionSnapshot, StartedSession};
use crate::error::LiveError;
use crate::state::SharedState;
use crate::web::session::UserSession;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerPayload {
    question_index: i32,
    answer_id: Uuid,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/lobbies/:lobby_id/start", post(start_session))
        .route("/sessions/:session_id/answers", post(submit_answer))
        .route("/sessions/:session_id/state", get(session_state))
        .with_state(state)
}

async fn start_session(
    State(state): State<SharedState>,
    UserSession(user_id): UserSession,
    Path(lobby_id): Path<Uuid>,
) -> Result<Json<StartedSession>, LiveError> {
    let started = state.engine.start_session(user_id, lobby_id).await?;
    Ok(Json(started))
}

async fn submit_answer(
    State(state): State<SharedState>,
    UserSession(user_id): UserSession,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<AnswerPayload>,
) -> Result<StatusCode, LiveError> {
    state
        .engine
        .submit_answer(session_id, user_id, payload.question_index, payload.answer_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn session_state(
    State(state): State<SharedState>,
    UserSession(user_id): UserSession,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, LiveError> {
    Ok(Json(state.engine.snapshot(session_id, user_id).await?))
}

#[cfg(test)]
mod tests {
    use crate::config::LiveConfig;
    use crate::db::MemoryStore;
    use crate::domain::models::{Lobby, RosterMember};
    use crate::live::{ChannelHub, EngineDeps, LiveQuizEngine, TokioClock};
    use crate::state::{AppState, SharedState};
    use crate::web::{self, session::sign_session};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const KEY: &[u8] = b"live-quiz-test-key";

    struct Fixture {
        app: Router,
        lobby: Lobby,
        player: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let topic = Uuid::new_v4();
        for n in 0..2 {
            store
                .add_question(topic, &format!("Q{n}"), &[("yes", true), ("no", false)])
                .await;
        }
        let player = Uuid::new_v4();
        let lobby = store
            .add_lobby(
                Uuid::new_v4(),
                topic,
                vec![RosterMember {
                    user_id: player,
                    first_name: "Grace".into(),
                    last_name: "Hopper".into(),
                }],
            )
            .await;

        let hub = ChannelHub::new(16);
        let config = LiveConfig {
            question_count: 2,
            ..LiveConfig::default()
        };
        let engine = LiveQuizEngine::new(
            config,
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
            session_key: KEY.to_vec(),
        });

        Fixture {
            app: web::routes(state),
            lobby,
            player,
        }
    }

    fn request(method: Method, uri: String, user: Option<Uuid>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            let token = sign_session(user, KEY).unwrap();
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let fx = fixture().await;
        let response = fx
            .app
            .oneshot(request(Method::GET, "/health".into(), None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn start_requires_a_session_token() {
        let fx = fixture().await;
        let uri = format!("/api/v1/lobbies/{}/start", fx.lobby.id);
        let response = fx.app.oneshot(request(Method::POST, uri, None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn only_the_host_may_start() {
        let fx = fixture().await;
        let uri = format!("/api/v1/lobbies/{}/start", fx.lobby.id);
        let response = fx
            .app
            .oneshot(request(Method::POST, uri, Some(fx.player), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn host_start_then_player_reads_state() {
        let fx = fixture().await;
        let uri = format!("/api/v1/lobbies/{}/start", fx.lobby.id);
        let response = fx
            .app
            .clone()
            .oneshot(request(Method::POST, uri.clone(), Some(fx.lobby.host_id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let started = json_body(response).await;
        assert_eq!(started["totalQuestions"], 2);
        assert_eq!(started["questionDurationSec"], 30);
        let session_id = started["sessionId"].as_str().unwrap().to_string();

        let again = fx
            .app
            .clone()
            .oneshot(request(Method::POST, uri, Some(fx.lobby.host_id), None))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let state = fx
            .app
            .clone()
            .oneshot(request(
                Method::GET,
                format!("/api/v1/sessions/{session_id}/state"),
                Some(fx.player),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(state.status(), StatusCode::OK);
        let snapshot = json_body(state).await;
        assert_eq!(snapshot["status"], "COUNTDOWN");
        assert_eq!(snapshot["currentIndex"], -1);
        assert_eq!(snapshot["you"]["score"], 0);

        let outsider = fx
            .app
            .clone()
            .oneshot(request(
                Method::GET,
                format!("/api/v1/sessions/{session_id}/state"),
                Some(Uuid::new_v4()),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(outsider.status(), StatusCode::FORBIDDEN);

        let early = fx
            .app
            .oneshot(request(
                Method::POST,
                format!("/api/v1/sessions/{session_id}/answers"),
                Some(fx.player),
                Some(json!({ "questionIndex": 0, "answerId": Uuid::new_v4() })),
            ))
            .await
            .unwrap();
        assert_eq!(early.status(), StatusCode::CONFLICT);
        let body = json_body(early).await;
        assert_eq!(body["error"], "ILLEGAL_STATE");
        assert_eq!(body["message"], "session not running");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let fx = fixture().await;
        let response = fx
            .app
            .oneshot(request(
                Method::GET,
                format!("/api/v1/sessions/{}/state", Uuid::new_v4()),
                Some(fx.player),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
