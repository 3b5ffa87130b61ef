//! Turn stream recording and playback.

mod file;
mod player;
mod recorder;

pub use file::{REPLAY_FORMAT_VERSION, REPLAY_MAGIC, ReplayLog};
pub use player::ReplayPlayer;
pub use recorder::ReplayRecorder;
