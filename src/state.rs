use crate::db::ParticipantRoster;
use crate::live::{ChannelHub, LiveQuizEngine};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: LiveQuizEngine,
    pub hub: ChannelHub,
    pub roster: Arc<dyn ParticipantRoster>,
    pub session_key: Vec<u8>,
}

pub type SharedState = Arc<AppState>;
