//! In-process store used by tests and by the server when no database is configured.

use super::{ParticipantRoster, QuestionSource, SessionStore};
use crate::domain::models::{
    AnswerOption, LeaderboardRow, LiveSession, Lobby, LobbyStatus, NewSession, Participant,
    ParticipantAnswer, Question, RosterMember, SessionQuestion,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A session and everything it owns, held by value. Answers point at their
/// participant by id only.
struct SessionEntry {
    session: LiveSession,
    questions: Vec<SessionQuestion>,
    participants: Vec<Participant>,
    answers: Vec<ParticipantAnswer>,
}

struct LobbyEntry {
    lobby: Lobby,
    members: Vec<RosterMember>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, SessionEntry>,
    bank: HashMap<Uuid, Question>,
    lobbies: HashMap<Uuid, LobbyEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bank question; each answer is `(text, is_correct)`.
    pub async fn add_question(&self, topic_id: Uuid, text: &str, answers: &[(&str, bool)]) -> Question {
        let question = Question {
            id: Uuid::new_v4(),
            topic_id,
            text: text.to_string(),
            answers: answers
                .iter()
                .map(|(text, is_correct)| AnswerOption {
                    id: Uuid::new_v4(),
                    text: text.to_string(),
                    is_correct: *is_correct,
                })
                .collect(),
        };
        self.inner.write().await.bank.insert(question.id, question.clone());
        question
    }

    pub async fn add_lobby(&self, host_id: Uuid, topic_id: Uuid, members: Vec<RosterMember>) -> Lobby {
        let lobby = Lobby {
            id: Uuid::new_v4(),
            host_id,
            topic_id,
            status: LobbyStatus::Waiting,
        };
        self.inner.write().await.lobbies.insert(
            lobby.id,
            LobbyEntry {
                lobby: lobby.clone(),
                members,
            },
        );
        lobby
    }

    pub async fn participants(&self, session_id: Uuid) -> Vec<Participant> {
        self.inner
            .read()
            .await
            .sessions
            .get(&session_id)
            .map(|e| e.participants.clone())
            .unwrap_or_default()
    }

    pub async fn session_questions(&self, session_id: Uuid) -> Vec<SessionQuestion> {
        self.inner
            .read()
            .await
            .sessions
            .get(&session_id)
            .map(|e| e.questions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, new: &NewSession) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&new.session.id) {
            bail!("session {} already exists", new.session.id);
        }
        inner.sessions.insert(
            new.session.id,
            SessionEntry {
                session: new.session.clone(),
                questions: new.questions.clone(),
                participants: new.participants.clone(),
                answers: Vec::new(),
            },
        );
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<LiveSession>> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .get(&session_id)
            .map(|e| e.session.clone()))
    }

    async fn find_open_session_for_lobby(&self, lobby_id: Uuid) -> Result<Option<LiveSession>> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .map(|e| &e.session)
            .filter(|s| s.lobby_id == lobby_id && !s.status.is_terminal())
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn list_open_sessions(&self) -> Result<Vec<LiveSession>> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .filter(|e| !e.session.status.is_terminal())
            .map(|e| e.session.clone())
            .collect())
    }

    async fn update_session(&self, session: &LiveSession) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.sessions.get_mut(&session.id) else {
            bail!("session {} not found", session.id);
        };
        entry.session.status = session.status;
        entry.session.current_index = session.current_index;
        entry.session.last_ended_index = session.last_ended_index;
        entry.session.question_ends_at = session.question_ends_at;
        entry.session.updated_at = Utc::now();
        Ok(())
    }

    async fn find_session_question(
        &self,
        session_id: Uuid,
        index: i32,
    ) -> Result<Option<SessionQuestion>> {
        Ok(self.inner.read().await.sessions.get(&session_id).and_then(|e| {
            e.questions.iter().find(|q| q.index == index).cloned()
        }))
    }

    async fn find_participant(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Participant>> {
        Ok(self.inner.read().await.sessions.get(&session_id).and_then(|e| {
            e.participants.iter().find(|p| p.user_id == user_id).cloned()
        }))
    }

    async fn count_participants(&self, session_id: Uuid) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .get(&session_id)
            .map(|e| e.participants.len() as i64)
            .unwrap_or(0))
    }

    async fn leaderboard(&self, session_id: Uuid) -> Result<Vec<LeaderboardRow>> {
        let inner = self.inner.read().await;
        let Some(entry) = inner.sessions.get(&session_id) else {
            return Ok(Vec::new());
        };
        let mut ranked: Vec<&Participant> = entry.participants.iter().collect();
        ranked.sort_by_key(|p| (Reverse(p.score), p.joined_at, p.user_id));
        Ok(ranked
            .into_iter()
            .map(|p| LeaderboardRow {
                user_id: p.user_id,
                first_name: p.first_name.clone(),
                last_name: p.last_name.clone(),
                score: p.score,
            })
            .collect())
    }

    async fn mark_connection(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        connected: bool,
        seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let participant = inner
            .sessions
            .get_mut(&session_id)
            .and_then(|e| e.participants.iter_mut().find(|p| p.user_id == user_id));
        match participant {
            Some(p) => {
                p.connected = connected;
                p.last_seen_at = Some(seen_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_answer(&self, answer: &ParticipantAnswer, reward: i32) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.sessions.get_mut(&answer.session_id) else {
            bail!("session {} not found", answer.session_id);
        };
        let duplicate = entry.answers.iter().any(|a| {
            a.participant_id == answer.participant_id && a.question_index == answer.question_index
        });
        if duplicate {
            return Ok(false);
        }
        let Some(participant) = entry
            .participants
            .iter_mut()
            .find(|p| p.id == answer.participant_id)
        else {
            bail!("participant {} not found", answer.participant_id);
        };
        if answer.is_correct {
            participant.score += reward;
        }
        entry.answers.push(answer.clone());
        Ok(true)
    }

    async fn has_answered(&self, participant_id: Uuid, question_index: i32) -> Result<bool> {
        Ok(self.inner.read().await.sessions.values().any(|e| {
            e.answers
                .iter()
                .any(|a| a.participant_id == participant_id && a.question_index == question_index)
        }))
    }

    async fn count_answers(&self, session_id: Uuid, question_index: i32) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .get(&session_id)
            .map(|e| {
                e.answers
                    .iter()
                    .filter(|a| a.question_index == question_index)
                    .count() as i64
            })
            .unwrap_or(0))
    }
}

#[async_trait]
impl QuestionSource for MemoryStore {
    async fn pick_random(&self, topic_id: Uuid, count: i32) -> Result<Vec<Question>> {
        let inner = self.inner.read().await;
        let mut pool: Vec<Question> = inner
            .bank
            .values()
            .filter(|q| q.topic_id == topic_id)
            .cloned()
            .collect();
        pool.shuffle(&mut rand::thread_rng());
        pool.truncate(count.max(0) as usize);
        Ok(pool)
    }

    async fn load(&self, question_id: Uuid) -> Result<Option<Question>> {
        Ok(self.inner.read().await.bank.get(&question_id).cloned())
    }
}

#[async_trait]
impl ParticipantRoster for MemoryStore {
    async fn find_lobby(&self, lobby_id: Uuid) -> Result<Option<Lobby>> {
        Ok(self
            .inner
            .read()
            .await
            .lobbies
            .get(&lobby_id)
            .map(|e| e.lobby.clone()))
    }

    async fn members_of(&self, lobby_id: Uuid) -> Result<Vec<RosterMember>> {
        Ok(self
            .inner
            .read()
            .await
            .lobbies
            .get(&lobby_id)
            .map(|e| e.members.clone())
            .unwrap_or_default())
    }

    async fn set_lobby_status(&self, lobby_id: Uuid, status: LobbyStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.lobbies.get_mut(&lobby_id) else {
            bail!("lobby {} not found", lobby_id);
        };
        entry.lobby.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SessionStatus;

    fn participant(session_id: Uuid, name: &str, score: i32) -> Participant {
        Participant {
            id: Uuid::new_v4(),
            session_id,
            user_id: Uuid::new_v4(),
            first_name: name.to_string(),
            last_name: "Test".to_string(),
            score,
            connected: true,
            joined_at: Utc::now(),
            last_seen_at: None,
        }
    }

    fn new_session(participants: Vec<Participant>, session_id: Uuid) -> NewSession {
        let now = Utc::now();
        NewSession {
            session: LiveSession {
                id: session_id,
                lobby_id: Uuid::new_v4(),
                topic_id: Uuid::new_v4(),
                status: SessionStatus::Countdown,
                total_questions: 1,
                current_index: -1,
                last_ended_index: -1,
                start_at: now,
                question_ends_at: None,
                question_duration_sec: 30,
                buffer_duration_sec: 2,
                early_advance_enabled: true,
                created_at: now,
                updated_at: now,
            },
            questions: Vec::new(),
            participants,
        }
    }

    fn answer(session_id: Uuid, participant_id: Uuid, is_correct: bool) -> ParticipantAnswer {
        ParticipantAnswer {
            id: Uuid::new_v4(),
            session_id,
            participant_id,
            question_index: 0,
            answer_id: Uuid::new_v4(),
            is_correct,
            answered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_answer_is_ignored_and_scored_once() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        let p = participant(session_id, "Ada", 0);
        let pid = p.id;
        let user_id = p.user_id;
        store.insert_session(&new_session(vec![p], session_id)).await.unwrap();

        assert!(store.record_answer(&answer(session_id, pid, true), 1).await.unwrap());
        assert!(!store.record_answer(&answer(session_id, pid, true), 1).await.unwrap());

        let stored = store.find_participant(session_id, user_id).await.unwrap().unwrap();
        assert_eq!(stored.score, 1);
        assert_eq!(store.count_answers(session_id, 0).await.unwrap(), 1);
        assert!(store.has_answered(pid, 0).await.unwrap());
        assert!(!store.has_answered(pid, 1).await.unwrap());
    }

    #[tokio::test]
    async fn leaderboard_orders_by_score_descending() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        store
            .insert_session(&new_session(
                vec![
                    participant(session_id, "Low", 1),
                    participant(session_id, "High", 5),
                    participant(session_id, "Mid", 3),
                ],
                session_id,
            ))
            .await
            .unwrap();

        let board = store.leaderboard(session_id).await.unwrap();
        let names: Vec<_> = board.iter().map(|r| r.first_name.as_str()).collect();
        assert_eq!(names, ["High", "Mid", "Low"]);
    }

    #[tokio::test]
    async fn pick_random_stays_within_topic() {
        let store = MemoryStore::new();
        let topic = Uuid::new_v4();
        let other = Uuid::new_v4();
        for i in 0..5 {
            store.add_question(topic, &format!("Q{i}"), &[("yes", true), ("no", false)]).await;
        }
        store.add_question(other, "elsewhere", &[("yes", true)]).await;

        let picked = store.pick_random(topic, 3).await.unwrap();
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|q| q.topic_id == topic));

        let all = store.pick_random(topic, 10).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn open_session_lookup_skips_terminal_sessions() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        let new = new_session(Vec::new(), session_id);
        let lobby_id = new.session.lobby_id;
        store.insert_session(&new).await.unwrap();
        assert!(store.find_open_session_for_lobby(lobby_id).await.unwrap().is_some());

        let mut session = new.session.clone();
        session.status = SessionStatus::Cancelled;
        store.update_session(&session).await.unwrap();
        assert!(store.find_open_session_for_lobby(lobby_id).await.unwrap().is_none());
        assert!(store.list_open_sessions().await.unwrap().is_empty());
    }
}
