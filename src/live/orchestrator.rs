//! Lifecycle of a live round: countdown, question/answer cycles, finish or abort.
//!
//! Every state change of a session happens while holding that session's lock
//! from the [`SessionRegistry`]. Timer callbacks arrive as [`Deferred`]
//! messages and re-validate the stored session before acting, so a late or
//! superseded timer degrades to a no-op.

use crate::config::{LiveConfig, ANSWER_REWARD};
use crate::db::{ParticipantRoster, QuestionSource, SessionStore};
use crate::domain::events::{
    AnswerPayload, LiveEvent, QuestionEndEvent, QuestionPayload, QuestionShowEvent,
    QuizAbortedEvent, QuizEndedEvent, SessionStartedEvent,
};
use crate::domain::models::{
    LiveSession, LobbyStatus, NewSession, Question, SessionQuestion, SessionSnapshot,
    SessionStatus, StartedSession, YouState,
};
use crate::error::{IllegalState, LiveError};
use crate::live::answers::{AnswerLedger, AnswerOutcome};
use crate::live::broadcast::{Broadcaster, ChannelKey};
use crate::live::clock::Clock;
use crate::live::participants::ParticipantLedger;
use crate::live::registry::{SessionGuard, SessionRegistry, TimerKind};
use crate::live::scheduler::{Deferred, SessionCommand, SessionScheduler};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub const HOST_DISCONNECTED: &str = "HOST_DISCONNECTED";
pub const STALE_SESSION: &str = "STALE_SESSION";

/// Collaborators the engine is built on.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn SessionStore>,
    pub questions: Arc<dyn QuestionSource>,
    pub roster: Arc<dyn ParticipantRoster>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct LiveQuizEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: LiveConfig,
    store: Arc<dyn SessionStore>,
    questions: Arc<dyn QuestionSource>,
    roster: Arc<dyn ParticipantRoster>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    registry: SessionRegistry,
    scheduler: SessionScheduler,
    participants: ParticipantLedger,
    answers: AnswerLedger,
    start_gate: Mutex<()>,
}

impl LiveQuizEngine {
    /// Builds the engine and spawns its timer inbox. Needs a tokio runtime.
    pub fn new(config: LiveConfig, deps: EngineDeps) -> Self {
        let registry = SessionRegistry::new();
        let (scheduler, inbox) = SessionScheduler::new(deps.clock.clone(), registry.clone());
        let inner = Arc::new(EngineInner {
            participants: ParticipantLedger::new(deps.store.clone()),
            answers: AnswerLedger::new(deps.store.clone(), ANSWER_REWARD),
            config,
            store: deps.store,
            questions: deps.questions,
            roster: deps.roster,
            broadcaster: deps.broadcaster,
            clock: deps.clock,
            registry,
            scheduler,
            start_gate: Mutex::new(()),
        });
        tokio::spawn(run_inbox(Arc::downgrade(&inner), inbox));
        Self { inner }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Host starts the round of a waiting lobby.
    pub async fn start_session(&self, host_id: Uuid, lobby_id: Uuid) -> Result<StartedSession, LiveError> {
        self.inner.start_session(host_id, lobby_id).await
    }

    pub async fn show_question(&self, session_id: Uuid, index: i32) -> Result<(), LiveError> {
        let Some((_guard, _)) = self.inner.enter(session_id).await? else {
            return Ok(());
        };
        self.inner.show_question_locked(session_id, index).await
    }

    pub async fn end_current_question(&self, session_id: Uuid, early_advance: bool) -> Result<(), LiveError> {
        let Some((_guard, _)) = self.inner.enter(session_id).await? else {
            return Ok(());
        };
        self.inner
            .end_current_question_locked(session_id, early_advance, None)
            .await
    }

    pub async fn finish(&self, session_id: Uuid) -> Result<(), LiveError> {
        let Some((_guard, session)) = self.inner.enter(session_id).await? else {
            return Ok(());
        };
        self.inner.finish_locked(session).await
    }

    pub async fn abort(&self, session_id: Uuid, reason: &str) -> Result<(), LiveError> {
        let Some((_guard, session)) = self.inner.enter(session_id).await? else {
            tracing::debug!("Session {} already over, ignoring abort", session_id);
            return Ok(());
        };
        self.inner.abort_locked(session, reason).await
    }

    pub async fn submit_answer(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        question_index: i32,
        answer_id: Uuid,
    ) -> Result<(), LiveError> {
        self.inner
            .submit_answer(session_id, user_id, question_index, answer_id)
            .await
    }

    /// Durable state for a (re)connecting participant.
    pub async fn snapshot(&self, session_id: Uuid, user_id: Uuid) -> Result<SessionSnapshot, LiveError> {
        self.inner.snapshot(session_id, user_id).await
    }

    pub async fn on_host_disconnect(&self, lobby_id: Uuid) -> Result<(), LiveError> {
        let Some(session) = self.inner.store.find_open_session_for_lobby(lobby_id).await? else {
            tracing::debug!("Host of lobby {} left with no open session", lobby_id);
            return Ok(());
        };
        tracing::warn!("Host of lobby {} disconnected, aborting session {}", lobby_id, session.id);
        self.abort(session.id, HOST_DISCONNECTED).await
    }

    pub async fn on_participant_presence(
        &self,
        lobby_id: Uuid,
        user_id: Uuid,
        connected: bool,
    ) -> Result<(), LiveError> {
        self.inner
            .on_participant_presence(lobby_id, user_id, connected)
            .await
    }

    /// Aborts open sessions that lost their timers, e.g. across a restart.
    pub async fn reap_stale_sessions(&self) -> Result<usize, LiveError> {
        self.inner.reap_stale_sessions().await
    }
}

async fn run_inbox(engine: Weak<EngineInner>, mut inbox: mpsc::UnboundedReceiver<Deferred>) {
    while let Some(deferred) = inbox.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        tokio::spawn(async move { inner.deliver(deferred).await });
    }
    tracing::debug!("Live engine inbox closed");
}

impl EngineInner {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn channel(session: &LiveSession) -> ChannelKey {
        ChannelKey::Lobby(session.lobby_id)
    }

    async fn load_session(&self, session_id: Uuid) -> Result<LiveSession, LiveError> {
        self.store
            .find_session(session_id)
            .await?
            .ok_or_else(|| LiveError::session_not_found(session_id))
    }

    /// Takes the lock of a session that exists and is not over yet, returning
    /// the state read under the lock. Unknown sessions fail with NotFound and
    /// finished or cancelled ones yield `None`; neither leaves a lock entry.
    async fn enter(&self, session_id: Uuid) -> Result<Option<(SessionGuard, LiveSession)>, LiveError> {
        let current = self.load_session(session_id).await?;
        if current.status.is_terminal() {
            return Ok(None);
        }

        let guard = self.registry.lock(session_id).await;
        match self.store.find_session(session_id).await? {
            Some(session) if !session.status.is_terminal() => Ok(Some((guard, session))),
            Some(_) => {
                self.registry.release(session_id).await;
                Ok(None)
            }
            None => {
                self.registry.release(session_id).await;
                Err(LiveError::session_not_found(session_id))
            }
        }
    }

    async fn load_question(&self, session_id: Uuid, index: i32) -> Result<(SessionQuestion, Question), LiveError> {
        let slot = self
            .store
            .find_session_question(session_id, index)
            .await?
            .ok_or_else(|| LiveError::NotFound(format!("question {} of session {}", index, session_id)))?;
        let question = self
            .questions
            .load(slot.question_id)
            .await?
            .ok_or_else(|| LiveError::NotFound(format!("question {}", slot.question_id)))?;
        Ok((slot, question))
    }

    async fn deliver(&self, deferred: Deferred) {
        let Deferred {
            session_id,
            command,
            ticket,
        } = deferred;

        if !self.registry.claim_timer(session_id, command.kind(), ticket).await {
            tracing::debug!("Dropping superseded {:?} for session {}", command, session_id);
            return;
        }

        let _guard = match self.enter(session_id).await {
            Ok(Some((guard, _))) => guard,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Scheduled {:?} for session {} dropped: {}", command, session_id, e);
                return;
            }
        };
        let result = match command {
            SessionCommand::ShowQuestion { index } => self.show_question_locked(session_id, index).await,
            SessionCommand::EndQuestion { index } => {
                self.end_current_question_locked(session_id, false, Some(index))
                    .await
            }
        };
        if let Err(e) = result {
            tracing::warn!("Scheduled {:?} for session {} failed: {}", command, session_id, e);
        }
    }

    async fn start_session(&self, host_id: Uuid, lobby_id: Uuid) -> Result<StartedSession, LiveError> {
        let _gate = self.start_gate.lock().await;

        let lobby = self
            .roster
            .find_lobby(lobby_id)
            .await?
            .ok_or_else(|| LiveError::NotFound(format!("lobby {}", lobby_id)))?;
        if lobby.host_id != host_id {
            return Err(LiveError::Forbidden("only the host can start the quiz"));
        }
        if lobby.status != LobbyStatus::Waiting
            || self.store.find_open_session_for_lobby(lobby_id).await?.is_some()
        {
            return Err(IllegalState::AlreadyStarted.into());
        }

        let roster = self.roster.members_of(lobby_id).await?;
        if roster.is_empty() {
            return Err(LiveError::InvalidArgument(format!("lobby {} has no participants", lobby_id)));
        }

        let needed = self.config.question_count;
        let picked = self.questions.pick_random(lobby.topic_id, needed).await?;
        if (picked.len() as i32) < needed {
            return Err(LiveError::InsufficientContent {
                needed,
                available: picked.len() as i32,
            });
        }

        let question_duration_sec = whole_seconds("question duration", self.config.question_duration)?;
        let buffer_duration_sec = whole_seconds("buffer duration", self.config.buffer_duration)?;

        let now = self.now();
        let session_id = Uuid::new_v4();
        let session = LiveSession {
            id: session_id,
            lobby_id,
            topic_id: lobby.topic_id,
            status: SessionStatus::Countdown,
            total_questions: needed,
            current_index: -1,
            last_ended_index: -1,
            start_at: now + to_chrono(self.config.countdown),
            question_ends_at: None,
            question_duration_sec,
            buffer_duration_sec,
            early_advance_enabled: self.config.early_advance,
            created_at: now,
            updated_at: now,
        };

        let questions = picked
            .iter()
            .enumerate()
            .map(|(index, question)| {
                let mut answer_order: Vec<Uuid> = question.answers.iter().map(|a| a.id).collect();
                answer_order.shuffle(&mut rand::thread_rng());
                SessionQuestion {
                    id: Uuid::new_v4(),
                    session_id,
                    index: index as i32,
                    question_id: question.id,
                    answer_order,
                }
            })
            .collect();

        let new = NewSession {
            participants: ParticipantLedger::enroll(session_id, &roster, now),
            session,
            questions,
        };

        let _guard = self.registry.lock(session_id).await;
        self.store.insert_session(&new).await?;
        let session = new.session;

        if let Err(e) = self.roster.set_lobby_status(lobby_id, LobbyStatus::InProgress).await {
            tracing::error!("Failed to mark lobby {} in progress: {}", lobby_id, e);
        }

        // Only after the insert committed, so subscribers can query the session.
        self.broadcaster.publish(
            &Self::channel(&session),
            LiveEvent::SessionStarted(SessionStartedEvent {
                lobby_id,
                session_id,
                start_at: session.start_at,
                total_questions: session.total_questions,
                question_duration_sec: session.question_duration_sec,
                buffer_duration_sec: session.buffer_duration_sec,
            }),
        );

        self.scheduler
            .schedule_at(session_id, SessionCommand::ShowQuestion { index: 0 }, session.start_at)
            .await;

        tracing::info!(
            "Session {} started for lobby {}: {} questions, {} participants, first question at {}",
            session_id,
            lobby_id,
            session.total_questions,
            new.participants.len(),
            session.start_at
        );
        Ok(StartedSession::from(&session))
    }

    async fn show_question_locked(&self, session_id: Uuid, index: i32) -> Result<(), LiveError> {
        let mut session = self.load_session(session_id).await?;

        if session.status.is_terminal() {
            tracing::debug!("Session {} is {}, not showing question {}", session_id, session.status.as_str(), index);
            self.registry.release(session_id).await;
            return Ok(());
        }
        if index <= session.current_index {
            tracing::debug!(
                "Question {} of session {} already shown (current {})",
                index,
                session_id,
                session.current_index
            );
            return Ok(());
        }
        if index >= session.total_questions {
            return self.finish_locked(session).await;
        }

        let (slot, question) = self.load_question(session_id, index).await?;
        let ends_at = self.now() + chrono::Duration::seconds(session.question_duration_sec.max(0) as i64);

        session.status = SessionStatus::Running;
        session.current_index = index;
        session.question_ends_at = Some(ends_at);
        self.store.update_session(&session).await?;

        self.broadcaster.publish(
            &Self::channel(&session),
            LiveEvent::QuestionShow(QuestionShowEvent {
                session_id,
                index,
                ends_at,
                question: question_payload(&question, &slot.answer_order),
            }),
        );

        self.scheduler
            .schedule_at(session_id, SessionCommand::EndQuestion { index }, ends_at)
            .await;

        tracing::info!("Session {} showing question {}/{} until {}", session_id, index + 1, session.total_questions, ends_at);
        Ok(())
    }

    /// `expected_index` pins a timer to the question it was scheduled for.
    async fn end_current_question_locked(
        &self,
        session_id: Uuid,
        early_advance: bool,
        expected_index: Option<i32>,
    ) -> Result<(), LiveError> {
        let mut session = self.load_session(session_id).await?;

        if session.status.is_terminal() {
            self.registry.release(session_id).await;
            return Ok(());
        }
        if session.status != SessionStatus::Running {
            tracing::debug!("Session {} not running, nothing to end", session_id);
            return Ok(());
        }
        if expected_index.is_some_and(|expected| expected != session.current_index) {
            tracing::debug!(
                "End timer for question {:?} of session {} is stale (current {})",
                expected_index,
                session_id,
                session.current_index
            );
            return Ok(());
        }
        if !session.question_open() {
            tracing::debug!("Question {} of session {} already ended", session.current_index, session_id);
            return Ok(());
        }

        let index = session.current_index;
        let (_, question) = self.load_question(session_id, index).await?;
        let correct_answer_id = question
            .correct_answer_id()
            .ok_or_else(|| anyhow!("question {} has no correct answer", question.id))?;

        let now = self.now();
        session.last_ended_index = index;
        session.question_ends_at = Some(session.question_ends_at.map_or(now, |ends| ends.min(now)));
        self.store.update_session(&session).await?;
        self.scheduler.cancel(session_id, TimerKind::EndQuestion).await;

        let leaderboard = self.participants.leaderboard(session_id).await?;
        self.broadcaster.publish(
            &Self::channel(&session),
            LiveEvent::QuestionEnd(QuestionEndEvent {
                session_id,
                index,
                correct_answer_id,
                leaderboard,
            }),
        );
        tracing::info!(
            "Session {} ended question {} ({})",
            session_id,
            index,
            if early_advance { "everyone answered" } else { "time up" }
        );

        if session.has_more_questions() {
            self.scheduler
                .schedule_after(
                    session_id,
                    SessionCommand::ShowQuestion { index: index + 1 },
                    Duration::from_secs(session.buffer_duration_sec.max(0) as u64),
                )
                .await;
            Ok(())
        } else {
            self.finish_locked(session).await
        }
    }

    async fn finish_locked(&self, mut session: LiveSession) -> Result<(), LiveError> {
        if session.status.is_terminal() {
            self.registry.release(session.id).await;
            return Ok(());
        }

        session.status = SessionStatus::Finished;
        self.store.update_session(&session).await?;

        let leaderboard = self.participants.leaderboard(session.id).await?;
        self.broadcaster.publish(
            &Self::channel(&session),
            LiveEvent::QuizEnded(QuizEndedEvent {
                session_id: session.id,
                leaderboard,
            }),
        );
        self.registry.release(session.id).await;

        tracing::info!("Session {} finished", session.id);
        Ok(())
    }

    async fn abort_locked(&self, mut session: LiveSession, reason: &str) -> Result<(), LiveError> {
        if session.status.is_terminal() {
            tracing::debug!("Session {} already {}, ignoring abort", session.id, session.status.as_str());
            self.registry.release(session.id).await;
            return Ok(());
        }

        session.status = SessionStatus::Cancelled;
        self.store.update_session(&session).await?;

        self.broadcaster.publish(
            &Self::channel(&session),
            LiveEvent::QuizAborted(QuizAbortedEvent {
                session_id: session.id,
                reason: reason.to_string(),
            }),
        );
        self.registry.release(session.id).await;

        tracing::warn!("Session {} aborted: {}", session.id, reason);
        Ok(())
    }

    async fn submit_answer(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        question_index: i32,
        answer_id: Uuid,
    ) -> Result<(), LiveError> {
        let Some((_guard, session)) = self.enter(session_id).await? else {
            return Err(IllegalState::NotRunning.into());
        };

        if session.status != SessionStatus::Running {
            return Err(IllegalState::NotRunning.into());
        }
        if question_index != session.current_index {
            return Err(IllegalState::WrongQuestion.into());
        }
        let now = self.now();
        let window_open = session.question_open() && session.question_ends_at.is_some_and(|ends| now < ends);
        if !window_open {
            return Err(IllegalState::TooLate.into());
        }

        let participant = self.participants.require(session_id, user_id).await?;
        let (_, question) = self.load_question(session_id, question_index).await?;

        match self
            .answers
            .record(&participant, &question, question_index, answer_id, now)
            .await?
        {
            AnswerOutcome::Duplicate => {
                tracing::debug!(
                    "User {} already answered question {} of session {}",
                    user_id,
                    question_index,
                    session_id
                );
                return Ok(());
            }
            AnswerOutcome::Recorded { correct } => {
                tracing::debug!(
                    "User {} answered question {} of session {} (correct: {})",
                    user_id,
                    question_index,
                    session_id,
                    correct
                );
            }
        }

        if session.early_advance_enabled {
            let answered = self.answers.answered_count(session_id, question_index).await?;
            let total = self.participants.count(session_id).await?;
            if answered >= total {
                if let Err(e) = self
                    .end_current_question_locked(session_id, true, Some(question_index))
                    .await
                {
                    tracing::error!(
                        "Early advance of question {} in session {} failed: {}",
                        question_index,
                        session_id,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    async fn snapshot(&self, session_id: Uuid, user_id: Uuid) -> Result<SessionSnapshot, LiveError> {
        let session = self.load_session(session_id).await?;
        let me = self.participants.require(session_id, user_id).await?;

        let question = if session.status == SessionStatus::Running && session.current_index >= 0 {
            let (slot, question) = self.load_question(session_id, session.current_index).await?;
            Some(question_payload(&question, &slot.answer_order))
        } else {
            None
        };

        let answered = if session.current_index >= 0 {
            self.answers.has_answered(me.id, session.current_index).await?
        } else {
            false
        };

        Ok(SessionSnapshot {
            status: session.status,
            current_index: session.current_index,
            total_questions: session.total_questions,
            start_at: session.start_at,
            ends_at: session.question_ends_at,
            question,
            you: YouState {
                score: me.score,
                answered,
            },
        })
    }

    async fn on_participant_presence(
        &self,
        lobby_id: Uuid,
        user_id: Uuid,
        connected: bool,
    ) -> Result<(), LiveError> {
        let Some(open) = self.store.find_open_session_for_lobby(lobby_id).await? else {
            return Ok(());
        };

        let Some((_guard, session)) = self.enter(open.id).await? else {
            return Ok(());
        };

        let known = self
            .participants
            .set_presence(session.id, user_id, connected, self.now())
            .await?;
        if known {
            tracing::info!(
                "User {} {} session {}",
                user_id,
                if connected { "reconnected to" } else { "disconnected from" },
                session.id
            );
        }
        Ok(())
    }

    async fn reap_stale_sessions(&self) -> Result<usize, LiveError> {
        let now = self.now();
        let grace = to_chrono(self.config.stale_grace);
        let mut reaped = 0;

        for candidate in self.store.list_open_sessions().await? {
            if self.registry.has_pending_timers(candidate.id).await {
                continue;
            }
            let deadline = candidate.question_ends_at.unwrap_or(candidate.start_at);
            if now - deadline < grace {
                continue;
            }

            let Some((_guard, session)) = self.enter(candidate.id).await? else {
                continue;
            };
            if self.registry.has_pending_timers(session.id).await {
                continue;
            }
            self.abort_locked(session, STALE_SESSION).await?;
            reaped += 1;
        }

        if reaped > 0 {
            tracing::info!("Reaped {} stale live sessions", reaped);
        }
        Ok(reaped)
    }
}

fn question_payload(question: &Question, answer_order: &[Uuid]) -> QuestionPayload {
    let answers = answer_order
        .iter()
        .filter_map(|id| match question.answer(*id) {
            Some(a) => Some(AnswerPayload {
                id: a.id,
                text: a.text.clone(),
            }),
            None => {
                tracing::warn!("Answer {} missing from question {}", id, question.id);
                None
            }
        })
        .collect();
    QuestionPayload {
        id: question.id,
        text: question.text.clone(),
        answers,
    }
}

fn whole_seconds(what: &str, duration: Duration) -> Result<i32, LiveError> {
    i32::try_from(duration.as_secs())
        .map_err(|_| LiveError::from(anyhow!("{} of {}s is out of range", what, duration.as_secs())))
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
