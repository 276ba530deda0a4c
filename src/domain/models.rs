use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "session_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Planned,
    Countdown,
    Running,
    Finished,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Finished | SessionStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Planned => "PLANNED",
            SessionStatus::Countdown => "COUNTDOWN",
            SessionStatus::Running => "RUNNING",
            SessionStatus::Finished => "FINISHED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "lobby_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LobbyStatus {
    Waiting,
    InProgress,
    Closed,
}

/// One live quiz round. Only the orchestrator mutates it.
#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct LiveSession {
    pub id: Uuid,
    pub lobby_id: Uuid,
    pub topic_id: Uuid,
    pub status: SessionStatus,
    pub total_questions: i32,
    /// -1 before the first question is shown.
    pub current_index: i32,
    /// Index of the last question whose QUESTION_END went out, -1 if none.
    pub last_ended_index: i32,
    pub start_at: DateTime<Utc>,
    pub question_ends_at: Option<DateTime<Utc>>,
    pub question_duration_sec: i32,
    pub buffer_duration_sec: i32,
    pub early_advance_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveSession {
    pub fn has_more_questions(&self) -> bool {
        self.current_index + 1 < self.total_questions
    }

    /// The current question has been shown and not yet closed.
    pub fn question_open(&self) -> bool {
        self.status == SessionStatus::Running
            && self.current_index >= 0
            && self.last_ended_index < self.current_index
    }
}

/// A frozen slot of the round: which bank question sits at `index` and the
/// answer order every participant sees.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionQuestion {
    pub id: Uuid,
    pub session_id: Uuid,
    pub index: i32,
    pub question_id: Uuid,
    pub answer_order: Vec<Uuid>,
}

#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct Participant {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub score: i32,
    pub connected: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct ParticipantAnswer {
    pub id: Uuid,
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub question_index: i32,
    pub answer_id: Uuid,
    pub is_correct: bool,
    pub answered_at: DateTime<Utc>,
}

/// Question-bank content, owned by the catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub text: String,
    pub answers: Vec<AnswerOption>,
}

impl Question {
    pub fn answer(&self, answer_id: Uuid) -> Option<&AnswerOption> {
        self.answers.iter().find(|a| a.id == answer_id)
    }

    pub fn correct_answer_id(&self) -> Option<Uuid> {
        self.answers.iter().find(|a| a.is_correct).map(|a| a.id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct AnswerOption {
    pub id: Uuid,
    pub text: String,
    pub is_correct: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct Lobby {
    pub id: Uuid,
    pub host_id: Uuid,
    pub topic_id: Uuid,
    pub status: LobbyStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
pub struct RosterMember {
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub score: i32,
}

/// Everything written when a round starts, committed as one unit.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub session: LiveSession,
    pub questions: Vec<SessionQuestion>,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedSession {
    pub session_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub total_questions: i32,
    pub question_duration_sec: i32,
    pub buffer_duration_sec: i32,
}

impl From<&LiveSession> for StartedSession {
    fn from(s: &LiveSession) -> Self {
        Self {
            session_id: s.id,
            start_at: s.start_at,
            total_questions: s.total_questions,
            question_duration_sec: s.question_duration_sec,
            buffer_duration_sec: s.buffer_duration_sec,
        }
    }
}

/// Read-only view a reconnecting client uses to resynchronise.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub current_index: i32,
    pub total_questions: i32,
    pub start_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub question: Option<crate::domain::events::QuestionPayload>,
    pub you: YouState,
}

#[derive(Debug, Clone, Serialize)]
pub struct YouState {
    pub score: i32,
    pub answered: bool,
}
