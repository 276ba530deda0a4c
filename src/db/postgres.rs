use super::{ParticipantRoster, QuestionSource, SessionStore};
use crate::domain::models::{
    AnswerOption, LeaderboardRow, LiveSession, Lobby, LobbyStatus, NewSession, Participant,
    ParticipantAnswer, Question, RosterMember, SessionQuestion,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

const SESSION_COLUMNS: &str = r#"
    id,
    lobby_id,
    topic_id,
    status,
    total_questions,
    current_index,
    last_ended_index,
    start_at,
    question_ends_at,
    question_duration_sec,
    buffer_duration_sec,
    early_advance_enabled,
    created_at,
    updated_at
"#;

#[derive(Debug, FromRow)]
struct SessionQuestionRow {
    id: Uuid,
    session_id: Uuid,
    index_in_session: i32,
    question_id: Uuid,
    answer_order: Json<Vec<Uuid>>,
}

impl From<SessionQuestionRow> for SessionQuestion {
    fn from(row: SessionQuestionRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            index: row.index_in_session,
            question_id: row.question_id,
            answer_order: row.answer_order.0,
        }
    }
}

#[derive(Debug, FromRow)]
struct QuestionRow {
    id: Uuid,
    topic_id: Uuid,
    text: String,
}

#[derive(Debug, FromRow)]
struct AnswerRow {
    id: Uuid,
    question_id: Uuid,
    text: String,
    is_correct: bool,
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn attach_answers(&self, rows: Vec<QuestionRow>) -> Result<Vec<Question>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let answers = sqlx::query_as::<_, AnswerRow>(
            r#"
            SELECT id, question_id, text, is_correct
            FROM answers
            WHERE question_id = ANY($1)
            ORDER BY question_id, position
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_question: HashMap<Uuid, Vec<AnswerOption>> = HashMap::new();
        for a in answers {
            by_question.entry(a.question_id).or_default().push(AnswerOption {
                id: a.id,
                text: a.text,
                is_correct: a.is_correct,
            });
        }

        Ok(rows
            .into_iter()
            .map(|r| Question {
                answers: by_question.remove(&r.id).unwrap_or_default(),
                id: r.id,
                topic_id: r.topic_id,
                text: r.text,
            })
            .collect())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, new: &NewSession) -> Result<()> {
        let s = &new.session;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO live_sessions (
                id, lobby_id, topic_id, status, total_questions, current_index,
                last_ended_index, start_at, question_ends_at, question_duration_sec,
                buffer_duration_sec, early_advance_enabled, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(s.id)
        .bind(s.lobby_id)
        .bind(s.topic_id)
        .bind(s.status)
        .bind(s.total_questions)
        .bind(s.current_index)
        .bind(s.last_ended_index)
        .bind(s.start_at)
        .bind(s.question_ends_at)
        .bind(s.question_duration_sec)
        .bind(s.buffer_duration_sec)
        .bind(s.early_advance_enabled)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&mut *tx)
        .await?;

        for q in &new.questions {
            sqlx::query(
                r#"
                INSERT INTO session_questions (id, session_id, index_in_session, question_id, answer_order)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(q.id)
            .bind(q.session_id)
            .bind(q.index)
            .bind(q.question_id)
            .bind(Json(&q.answer_order))
            .execute(&mut *tx)
            .await?;
        }

        for p in &new.participants {
            sqlx::query(
                r#"
                INSERT INTO live_participants (
                    id, session_id, user_id, first_name, last_name, score, connected, joined_at, last_seen_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(p.id)
            .bind(p.session_id)
            .bind(p.user_id)
            .bind(&p.first_name)
            .bind(&p.last_name)
            .bind(p.score)
            .bind(p.connected)
            .bind(p.joined_at)
            .bind(p.last_seen_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<LiveSession>> {
        let session = sqlx::query_as::<_, LiveSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM live_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn find_open_session_for_lobby(&self, lobby_id: Uuid) -> Result<Option<LiveSession>> {
        let session = sqlx::query_as::<_, LiveSession>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM live_sessions
            WHERE lobby_id = $1
              AND status NOT IN ('FINISHED', 'CANCELLED')
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(lobby_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn list_open_sessions(&self) -> Result<Vec<LiveSession>> {
        let sessions = sqlx::query_as::<_, LiveSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM live_sessions WHERE status NOT IN ('FINISHED', 'CANCELLED')"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn update_session(&self, session: &LiveSession) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE live_sessions
            SET status = $2,
                current_index = $3,
                last_ended_index = $4,
                question_ends_at = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(session.status)
        .bind(session.current_index)
        .bind(session.last_ended_index)
        .bind(session.question_ends_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_session_question(
        &self,
        session_id: Uuid,
        index: i32,
    ) -> Result<Option<SessionQuestion>> {
        let row = sqlx::query_as::<_, SessionQuestionRow>(
            r#"
            SELECT id, session_id, index_in_session, question_id, answer_order
            FROM session_questions
            WHERE session_id = $1 AND index_in_session = $2
            "#,
        )
        .bind(session_id)
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SessionQuestion::from))
    }

    async fn find_participant(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Participant>> {
        let participant = sqlx::query_as::<_, Participant>(
            r#"
            SELECT id, session_id, user_id, first_name, last_name, score, connected, joined_at, last_seen_at
            FROM live_participants
            WHERE session_id = $1 AND user_id = $2
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(participant)
    }

    async fn count_participants(&self, session_id: Uuid) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM live_participants WHERE session_id = $1")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn leaderboard(&self, session_id: Uuid) -> Result<Vec<LeaderboardRow>> {
        let rows = sqlx::query_as::<_, LeaderboardRow>(
            r#"
            SELECT user_id, first_name, last_name, score
            FROM live_participants
            WHERE session_id = $1
            ORDER BY score DESC, joined_at ASC, user_id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_connection(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        connected: bool,
        seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE live_participants
            SET connected = $3, last_seen_at = $4
            WHERE session_id = $1 AND user_id = $2
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(connected)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_answer(&self, answer: &ParticipantAnswer, reward: i32) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO participant_answers (
                id, session_id, participant_id, question_index, answer_id, is_correct, answered_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (participant_id, question_index) DO NOTHING
            "#,
        )
        .bind(answer.id)
        .bind(answer.session_id)
        .bind(answer.participant_id)
        .bind(answer.question_index)
        .bind(answer.answer_id)
        .bind(answer.is_correct)
        .bind(answer.answered_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted && answer.is_correct {
            sqlx::query("UPDATE live_participants SET score = score + $2 WHERE id = $1")
                .bind(answer.participant_id)
                .bind(reward)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn has_answered(&self, participant_id: Uuid, question_index: i32) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM participant_answers
                WHERE participant_id = $1 AND question_index = $2
            )
            "#,
        )
        .bind(participant_id)
        .bind(question_index)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn count_answers(&self, session_id: Uuid, question_index: i32) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM participant_answers WHERE session_id = $1 AND question_index = $2",
        )
        .bind(session_id)
        .bind(question_index)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl QuestionSource for PgStore {
    async fn pick_random(&self, topic_id: Uuid, count: i32) -> Result<Vec<Question>> {
        let rows = sqlx::query_as::<_, QuestionRow>(
            r#"
            SELECT id, topic_id, text
            FROM questions
            WHERE topic_id = $1
            ORDER BY random()
            LIMIT $2
            "#,
        )
        .bind(topic_id)
        .bind(i64::from(count.max(0)))
        .fetch_all(&self.pool)
        .await?;
        self.attach_answers(rows).await
    }

    async fn load(&self, question_id: Uuid) -> Result<Option<Question>> {
        let row = sqlx::query_as::<_, QuestionRow>(
            "SELECT id, topic_id, text FROM questions WHERE id = $1",
        )
        .bind(question_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(self.attach_answers(vec![row]).await?.pop())
    }
}

#[async_trait]
impl ParticipantRoster for PgStore {
    async fn find_lobby(&self, lobby_id: Uuid) -> Result<Option<Lobby>> {
        let lobby = sqlx::query_as::<_, Lobby>(
            "SELECT id, host_id, topic_id, status FROM lobbies WHERE id = $1",
        )
        .bind(lobby_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(lobby)
    }

    async fn members_of(&self, lobby_id: Uuid) -> Result<Vec<RosterMember>> {
        let members = sqlx::query_as::<_, RosterMember>(
            r#"
            SELECT u.id AS user_id, u.first_name, u.last_name
            FROM lobby_members m
            JOIN users u ON u.id = m.user_id
            WHERE m.lobby_id = $1
            ORDER BY m.joined_at ASC
            "#,
        )
        .bind(lobby_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn set_lobby_status(&self, lobby_id: Uuid, status: LobbyStatus) -> Result<()> {
        sqlx::query("UPDATE lobbies SET status = $2 WHERE id = $1")
            .bind(lobby_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
