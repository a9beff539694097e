/// A media position recorded at a known wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackPosition {
    pub position_millis: u64,
    pub recorded_at_millis: u64,
    pub is_playing: bool,
}

impl PlaybackPosition {
    pub fn new(position_millis: u64, recorded_at_millis: u64, is_playing: bool) -> Self {
        Self {
            position_millis,
            recorded_at_millis,
            is_playing,
        }
    }

    /// Where playback should be at `now_millis` if nothing happened in between.
    pub fn extrapolate(&self, now_millis: u64) -> u64 {
        if self.is_playing {
            let elapsed = now_millis.saturating_sub(self.recorded_at_millis);
            self.position_millis.saturating_add(elapsed)
        } else {
            self.position_millis
        }
    }

    /// Absolute distance between a reported position and the extrapolation.
    pub fn drift(&self, reported_millis: u64, now_millis: u64) -> u64 {
        reported_millis.abs_diff(self.extrapolate(now_millis))
    }
}
