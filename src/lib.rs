//! Host side of a listen-along session: turns a noisy stream of local player
//! observations into the few canonical updates listeners need to stay in sync.

pub mod channel;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod controller;
pub mod cors;
pub mod credentials;
pub mod debounce;
pub mod error;
pub mod events;
pub mod player;
pub mod position;
pub mod presence;
pub mod refresh;

pub use controller::{Collaborators, ControllerState, ControllerStatus, SyncController};
pub use error::{Result, SyncError};
pub use events::{CanonicalUpdate, Observation, TransientFlags};
