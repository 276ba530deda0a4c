pub mod memory;
pub mod postgres;

use crate::domain::models::{
    LeaderboardRow, LiveSession, Lobby, LobbyStatus, NewSession, Participant, ParticipantAnswer,
    Question, RosterMember, SessionQuestion,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Durable record of live sessions, their frozen questions, participants and answers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Session, questions and participants commit together or not at all.
    async fn insert_session(&self, new: &NewSession) -> Result<()>;

    async fn find_session(&self, session_id: Uuid) -> Result<Option<LiveSession>>;

    /// Most recent non-terminal session of a lobby.
    async fn find_open_session_for_lobby(&self, lobby_id: Uuid) -> Result<Option<LiveSession>>;

    async fn list_open_sessions(&self) -> Result<Vec<LiveSession>>;

    /// Persists status, pointer and timing fields.
    async fn update_session(&self, session: &LiveSession) -> Result<()>;

    async fn find_session_question(
        &self,
        session_id: Uuid,
        index: i32,
    ) -> Result<Option<SessionQuestion>>;

    async fn find_participant(&self, session_id: Uuid, user_id: Uuid)
        -> Result<Option<Participant>>;

    async fn count_participants(&self, session_id: Uuid) -> Result<i64>;

    /// Score descending, ties by join order.
    async fn leaderboard(&self, session_id: Uuid) -> Result<Vec<LeaderboardRow>>;

    async fn mark_connection(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        connected: bool,
        seen_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Inserts the answer unless (participant, index) already has one; when
    /// inserted and correct, adds `reward` to the participant's score in the
    /// same transaction. Returns whether the answer was new.
    async fn record_answer(&self, answer: &ParticipantAnswer, reward: i32) -> Result<bool>;

    async fn has_answered(&self, participant_id: Uuid, question_index: i32) -> Result<bool>;

    async fn count_answers(&self, session_id: Uuid, question_index: i32) -> Result<i64>;
}

/// Question bank lookup.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    /// Up to `count` distinct questions of the topic, in random order.
    async fn pick_random(&self, topic_id: Uuid, count: i32) -> Result<Vec<Question>>;

    async fn load(&self, question_id: Uuid) -> Result<Option<Question>>;
}

/// Lobby membership, owned by the lobby service.
#[async_trait]
pub trait ParticipantRoster: Send + Sync {
    async fn find_lobby(&self, lobby_id: Uuid) -> Result<Option<Lobby>>;

    async fn members_of(&self, lobby_id: Uuid) -> Result<Vec<RosterMember>>;

    async fn set_lobby_status(&self, lobby_id: Uuid, status: LobbyStatus) -> Result<()>;
}
