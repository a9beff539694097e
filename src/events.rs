use serde::{Deserialize, Serialize};

use crate::position::PlaybackPosition;

/// Provisional player conditions. An observation carrying any of these is
/// never classified as a committed change.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TransientFlags {
    pub buffering: bool,
    pub seeking: bool,
    pub unstarted: bool,
    pub ended: bool,
}

impl TransientFlags {
    pub const NONE: TransientFlags = TransientFlags {
        buffering: false,
        seeking: false,
        unstarted: false,
        ended: false,
    };

    pub fn any(&self) -> bool {
        self.buffering || self.seeking || self.unstarted || self.ended
    }
}

/// Snapshot of the local player at one instant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Empty when the player has no loaded media.
    pub track_identifier: String,
    pub position_millis: u64,
    pub is_playing: bool,
    pub observed_at_millis: u64,
    #[serde(default)]
    pub transient: TransientFlags,
}

impl Observation {
    pub fn new(
        track_identifier: impl Into<String>,
        position_millis: u64,
        is_playing: bool,
        observed_at_millis: u64,
    ) -> Self {
        Self {
            track_identifier: track_identifier.into(),
            position_millis,
            is_playing,
            observed_at_millis,
            transient: TransientFlags::NONE,
        }
    }

    pub fn with_transient(mut self, transient: TransientFlags) -> Self {
        self.transient = transient;
        self
    }

    /// Canonical projection. A player without media is never reported as playing.
    pub fn to_update(&self) -> CanonicalUpdate {
        let is_playing = self.is_playing && !self.track_identifier.is_empty();
        CanonicalUpdate::new(self.track_identifier.clone(), self.position_millis, is_playing)
    }
}

/// Full-state snapshot broadcast to listeners.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUpdate {
    track_identifier: String,
    position_millis: u64,
    is_playing: bool,
}

impl CanonicalUpdate {
    pub fn new(track_identifier: impl Into<String>, position_millis: u64, is_playing: bool) -> Self {
        Self {
            track_identifier: track_identifier.into(),
            position_millis,
            is_playing,
        }
    }

    /// The "host stopped" sentinel.
    pub fn disconnect(position_millis: u64) -> Self {
        Self::new(String::new(), position_millis, false)
    }

    pub fn track_identifier(&self) -> &str {
        &self.track_identifier
    }

    pub fn position_millis(&self) -> u64 {
        self.position_millis
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn is_disconnect(&self) -> bool {
        self.track_identifier.is_empty()
    }
}

/// The controller's memory of what it last forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastKnownState {
    pub update: CanonicalUpdate,
    pub recorded_at_millis: u64,
}

impl LastKnownState {
    pub fn from_observation(observation: &Observation) -> Self {
        Self {
            update: observation.to_update(),
            recorded_at_millis: observation.observed_at_millis,
        }
    }

    pub fn position(&self) -> PlaybackPosition {
        PlaybackPosition::new(
            self.update.position_millis(),
            self.recorded_at_millis,
            self.update.is_playing(),
        )
    }
}

/// Messages written to listener sockets.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "t")]
pub enum ListenerEvent {
    Ready(CanonicalUpdate),
    Update(CanonicalUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_track_is_never_playing() {
        let update = Observation::new("", 1200, true, 10).to_update();
        assert!(update.is_disconnect());
        assert!(!update.is_playing());
        assert_eq!(update.position_millis(), 1200);
    }

    #[test]
    fn transient_flags_default_when_missing() {
        let observation: Observation = serde_json::from_str(
            r#"{"track_identifier":"A","position_millis":5,"is_playing":true,"observed_at_millis":9}"#,
        )
        .unwrap();
        assert!(!observation.transient.any());

        let buffering: TransientFlags = serde_json::from_str(r#"{"buffering":true}"#).unwrap();
        assert!(buffering.any());
    }

    #[test]
    fn listener_events_are_tagged() {
        let json = serde_json::to_value(ListenerEvent::Update(CanonicalUpdate::new("A", 3, true))).unwrap();
        assert_eq!(json["t"], "Update");
        assert_eq!(json["track_identifier"], "A");
    }
}
