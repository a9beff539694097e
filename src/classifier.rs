use crate::events::{LastKnownState, Observation};

pub const DEFAULT_SEEK_THRESHOLD_MILLIS: u64 = 1_000;

/// Outcome of comparing an observation with the last forwarded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NoChange,
    TrackChanged,
    PlayStateChanged,
    SeekDetected { drift_millis: u64 },
}

impl Classification {
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Classification::NoChange)
    }
}

/// Separates genuine seeks, track changes and play/pause flips from tick jitter.
#[derive(Debug, Clone, Copy)]
pub struct ChangeClassifier {
    seek_threshold_millis: u64,
}

impl Default for ChangeClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SEEK_THRESHOLD_MILLIS)
    }
}

impl ChangeClassifier {
    pub fn new(seek_threshold_millis: u64) -> Self {
        Self {
            seek_threshold_millis,
        }
    }

    pub fn seek_threshold_millis(&self) -> u64 {
        self.seek_threshold_millis
    }

    pub fn classify(&self, previous: Option<&LastKnownState>, current: &Observation) -> Classification {
        if current.transient.any() {
            return Classification::NoChange;
        }

        let previous = match previous {
            Some(previous) => previous,
            // nothing forwarded yet, establish initial sync
            None => return Classification::TrackChanged,
        };

        let projected = current.to_update();
        if projected.track_identifier() != previous.update.track_identifier() {
            return Classification::TrackChanged;
        }
        if projected.is_playing() != previous.update.is_playing() {
            return Classification::PlayStateChanged;
        }

        let drift_millis = previous
            .position()
            .drift(current.position_millis, current.observed_at_millis);
        if drift_millis > self.seek_threshold_millis {
            Classification::SeekDetected { drift_millis }
        } else {
            Classification::NoChange
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TransientFlags;

    fn last(track: &str, pos: u64, playing: bool, at: u64) -> LastKnownState {
        LastKnownState::from_observation(&Observation::new(track, pos, playing, at))
    }

    #[test]
    fn first_observation_is_a_track_change() {
        let classifier = ChangeClassifier::default();
        let obs = Observation::new("A", 42, false, 0);
        assert_eq!(classifier.classify(None, &obs), Classification::TrackChanged);
    }

    #[test]
    fn transient_observations_are_never_reported() {
        let classifier = ChangeClassifier::default();
        let previous = last("A", 0, true, 0);
        for flags in [
            TransientFlags { buffering: true, ..TransientFlags::NONE },
            TransientFlags { seeking: true, ..TransientFlags::NONE },
            TransientFlags { unstarted: true, ..TransientFlags::NONE },
            TransientFlags { ended: true, ..TransientFlags::NONE },
        ] {
            let obs = Observation::new("B", 90_000, false, 10).with_transient(flags);
            assert_eq!(classifier.classify(Some(&previous), &obs), Classification::NoChange);
            assert_eq!(classifier.classify(None, &obs), Classification::NoChange);
        }
    }

    #[test]
    fn track_change_wins_over_everything() {
        let classifier = ChangeClassifier::default();
        let previous = last("A", 0, true, 0);
        let obs = Observation::new("B", 0, true, 0);
        assert_eq!(classifier.classify(Some(&previous), &obs), Classification::TrackChanged);
        let obs = Observation::new("B", 77_000, false, 5);
        assert_eq!(classifier.classify(Some(&previous), &obs), Classification::TrackChanged);
    }

    #[test]
    fn play_pause_flip() {
        let classifier = ChangeClassifier::default();
        let previous = last("A", 1_000, true, 0);
        let obs = Observation::new("A", 1_200, false, 200);
        assert_eq!(classifier.classify(Some(&previous), &obs), Classification::PlayStateChanged);
    }

    #[test]
    fn drift_boundary_is_exclusive() {
        let classifier = ChangeClassifier::new(1_000);
        let previous = last("A", 0, true, 0);

        let at_threshold = Observation::new("A", 1_500 + 1_000, true, 1_500);
        assert_eq!(classifier.classify(Some(&previous), &at_threshold), Classification::NoChange);

        let past_threshold = Observation::new("A", 1_500 + 1_001, true, 1_500);
        assert_eq!(
            classifier.classify(Some(&previous), &past_threshold),
            Classification::SeekDetected { drift_millis: 1_001 }
        );

        let backwards = Observation::new("A", 0, true, 1_500);
        assert_eq!(
            classifier.classify(Some(&previous), &backwards),
            Classification::SeekDetected { drift_millis: 1_500 }
        );
    }

    #[test]
    fn paused_seek_is_detected() {
        let classifier = ChangeClassifier::default();
        let previous = last("A", 10_000, false, 0);
        let still = Observation::new("A", 10_000, false, 60_000);
        assert_eq!(classifier.classify(Some(&previous), &still), Classification::NoChange);
        let moved = Observation::new("A", 40_000, false, 60_000);
        assert!(classifier.classify(Some(&previous), &moved).is_reportable());
    }

    #[test]
    fn steady_playback_with_jitter_stays_quiet() {
        let classifier = ChangeClassifier::default();
        let previous = last("A", 0, true, 0);
        for (i, jitter) in [0i64, 250, -400, 900, -999, 30].iter().enumerate() {
            let t = (i as u64 + 1) * 1_000;
            let pos = (t as i64 + jitter) as u64;
            let obs = Observation::new("A", pos, true, t);
            assert_eq!(classifier.classify(Some(&previous), &obs), Classification::NoChange);
        }
    }

    #[test]
    fn player_losing_its_media_reports_the_stopped_sentinel() {
        let classifier = ChangeClassifier::default();
        let previous = last("A", 5_000, true, 0);
        let gone = Observation::new("", 5_300, true, 300);
        assert_eq!(classifier.classify(Some(&previous), &gone), Classification::TrackChanged);

        let still_gone = last("", 5_300, true, 300);
        let again = Observation::new("", 5_300, true, 900);
        assert_eq!(classifier.classify(Some(&still_gone), &again), Classification::NoChange);
    }
}
