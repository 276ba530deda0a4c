//! Events pushed to a lobby's subscribers during a live round.

use crate::domain::models::LeaderboardRow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum LiveEvent {
    #[serde(rename = "SESSION_STARTED")]
    SessionStarted(SessionStartedEvent),

    #[serde(rename = "QUESTION_SHOW")]
    QuestionShow(QuestionShowEvent),

    #[serde(rename = "QUESTION_END")]
    QuestionEnd(QuestionEndEvent),

    #[serde(rename = "QUIZ_ENDED")]
    QuizEnded(QuizEndedEvent),

    #[serde(rename = "QUIZ_ABORTED")]
    QuizAborted(QuizAbortedEvent),
}

impl LiveEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            LiveEvent::SessionStarted(e) => e.session_id,
            LiveEvent::QuestionShow(e) => e.session_id,
            LiveEvent::QuestionEnd(e) => e.session_id,
            LiveEvent::QuizEnded(e) => e.session_id,
            LiveEvent::QuizAborted(e) => e.session_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            LiveEvent::SessionStarted(_) => "SESSION_STARTED",
            LiveEvent::QuestionShow(_) => "QUESTION_SHOW",
            LiveEvent::QuestionEnd(_) => "QUESTION_END",
            LiveEvent::QuizEnded(_) => "QUIZ_ENDED",
            LiveEvent::QuizAborted(_) => "QUIZ_ABORTED",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedEvent {
    pub lobby_id: Uuid,
    pub session_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub total_questions: i32,
    pub question_duration_sec: i32,
    pub buffer_duration_sec: i32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionShowEvent {
    pub session_id: Uuid,
    pub index: i32,
    pub ends_at: DateTime<Utc>,
    pub question: QuestionPayload,
}

/// A question as participants see it: options in the session's frozen order,
/// correctness withheld.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuestionPayload {
    pub id: Uuid,
    pub text: String,
    pub answers: Vec<AnswerPayload>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnswerPayload {
    pub id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionEndEvent {
    pub session_id: Uuid,
    pub index: i32,
    pub correct_answer_id: Uuid,
    pub leaderboard: Vec<LeaderboardRow>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizEndedEvent {
    pub session_id: Uuid,
    pub leaderboard: Vec<LeaderboardRow>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizAbortedEvent {
    pub session_id: Uuid,
    pub reason: String,
}
