pub mod answers;
pub mod broadcast;
pub mod clock;
pub mod orchestrator;
pub mod participants;
pub mod registry;
pub mod scheduler;

pub use broadcast::{Broadcaster, ChannelHub, ChannelKey};
pub use clock::{Clock, SystemClock, TokioClock};
pub use orchestrator::{EngineDeps, LiveQuizEngine, HOST_DISCONNECTED, STALE_SESSION};
