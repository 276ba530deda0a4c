use crate::db::SessionStore;
use crate::domain::models::{Participant, ParticipantAnswer, Question};
use crate::error::LiveError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Recorded { correct: bool },
    /// The participant already answered this index; nothing changed.
    Duplicate,
}

/// One answer per (participant, question index), scored when written.
#[derive(Clone)]
pub struct AnswerLedger {
    store: Arc<dyn SessionStore>,
    reward: i32,
}

impl AnswerLedger {
    pub fn new(store: Arc<dyn SessionStore>, reward: i32) -> Self {
        Self { store, reward }
    }

    /// Records `answer_id` for `participant` at `index`. A repeat submission is
    /// a no-op whatever answer it carries; otherwise the answer must be one of
    /// `question`'s options.
    pub async fn record(
        &self,
        participant: &Participant,
        question: &Question,
        index: i32,
        answer_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AnswerOutcome, LiveError> {
        if self.store.has_answered(participant.id, index).await? {
            return Ok(AnswerOutcome::Duplicate);
        }

        let chosen = question.answer(answer_id).ok_or_else(|| {
            LiveError::InvalidArgument(format!(
                "answer {} does not belong to question {}",
                answer_id, question.id
            ))
        })?;

        let answer = ParticipantAnswer {
            id: Uuid::new_v4(),
            session_id: participant.session_id,
            participant_id: participant.id,
            question_index: index,
            answer_id: chosen.id,
            is_correct: chosen.is_correct,
            answered_at: at,
        };

        // The unique (participant, index) key still wins a race between two
        // deliveries of the same submission.
        if self.store.record_answer(&answer, self.reward).await? {
            Ok(AnswerOutcome::Recorded {
                correct: chosen.is_correct,
            })
        } else {
            Ok(AnswerOutcome::Duplicate)
        }
    }

    pub async fn answered_count(&self, session_id: Uuid, index: i32) -> Result<i64, LiveError> {
        Ok(self.store.count_answers(session_id, index).await?)
    }

    pub async fn has_answered(&self, participant_id: Uuid, index: i32) -> Result<bool, LiveError> {
        Ok(self.store.has_answered(participant_id, index).await?)
    }
}
