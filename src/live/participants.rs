use crate::db::SessionStore;
use crate::domain::models::{LeaderboardRow, Participant, RosterMember};
use crate::error::LiveError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Who is in a session, whether they are connected and what they have scored.
#[derive(Clone)]
pub struct ParticipantLedger {
    store: Arc<dyn SessionStore>,
}

impl ParticipantLedger {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Fresh participant rows for a roster, score 0 and connected. Duplicate
    /// roster entries collapse to one participant.
    pub fn enroll(session_id: Uuid, roster: &[RosterMember], joined_at: DateTime<Utc>) -> Vec<Participant> {
        let mut participants: Vec<Participant> = Vec::with_capacity(roster.len());
        for member in roster {
            if participants.iter().any(|p| p.user_id == member.user_id) {
                continue;
            }
            participants.push(Participant {
                id: Uuid::new_v4(),
                session_id,
                user_id: member.user_id,
                first_name: member.first_name.clone(),
                last_name: member.last_name.clone(),
                score: 0,
                connected: true,
                joined_at,
                last_seen_at: Some(joined_at),
            });
        }
        participants
    }

    pub async fn require(&self, session_id: Uuid, user_id: Uuid) -> Result<Participant, LiveError> {
        self.store
            .find_participant(session_id, user_id)
            .await?
            .ok_or(LiveError::Forbidden("not a participant"))
    }

    pub async fn count(&self, session_id: Uuid) -> Result<i64, LiveError> {
        Ok(self.store.count_participants(session_id).await?)
    }

    pub async fn leaderboard(&self, session_id: Uuid) -> Result<Vec<LeaderboardRow>, LiveError> {
        Ok(self.store.leaderboard(session_id).await?)
    }

    /// Returns false when the user is not part of the session.
    pub async fn set_presence(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        connected: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, LiveError> {
        Ok(self.store.mark_connection(session_id, user_id, connected, at).await?)
    }
}
