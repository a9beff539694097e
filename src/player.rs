use std::{
    sync::{Arc, RwLock, Weak},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    clock::ClockHandle,
    error::{Result, SyncError},
    events::Observation,
    position::PlaybackPosition,
};

pub type ObservationReceiver = mpsc::UnboundedReceiver<Observation>;

/// The player running on the host's machine.
#[async_trait]
pub trait LocalPlayerSource: Send + Sync {
    /// Attach to the player and return its device id.
    async fn connect(&self, device_label: &str) -> Result<String>;

    async fn disconnect(&self) -> Result<()>;

    /// Start a fresh observation stream; dropping the receiver unsubscribes.
    fn subscribe(&self) -> ObservationReceiver;

    /// Extrapolated position right now, if a track is loaded.
    fn current_position(&self) -> Option<u64>;
}

/// Local player driven by the relay's admin routes or by raw observations
/// pushed from a player SDK.
pub struct HostPlayer {
    clock: ClockHandle,
    inner: RwLock<PlayerState>,
}

struct PlayerState {
    track: String,
    position: PlaybackPosition,
    device_id: Option<String>,
    evt_send: Option<mpsc::UnboundedSender<Observation>>,
}

impl HostPlayer {
    pub fn new(clock: ClockHandle) -> Arc<Self> {
        let now = clock.now_millis();
        Arc::new(Self {
            clock,
            inner: RwLock::new(PlayerState {
                track: String::new(),
                position: PlaybackPosition::new(0, now, false),
                device_id: None,
                evt_send: None,
            }),
        })
    }

    pub fn device_id(&self) -> Option<String> {
        self.read().device_id.clone()
    }

    pub fn pause(&self) {
        self.update(|state, now| {
            if !state.position.is_playing {
                // already paused
                return false;
            }
            let at = state.position.extrapolate(now);
            state.position = PlaybackPosition::new(at, now, false);
            true
        });
    }

    pub fn unpause(&self) {
        self.update(|state, now| {
            if state.position.is_playing {
                return false;
            }
            state.position = PlaybackPosition::new(state.position.position_millis, now, true);
            true
        });
    }

    pub fn seek(&self, position_millis: u64) {
        self.update(|state, now| {
            state.position = PlaybackPosition::new(position_millis, now, state.position.is_playing);
            true
        });
    }

    pub fn change_media(&self, track: String) {
        self.update(|state, now| {
            state.track = track;
            state.position = PlaybackPosition::new(0, now, false);
            true
        });
    }

    /// Re-report the current state every `period` so listeners converge even
    /// when a change was coalesced away. Stops once the player is dropped.
    pub fn spawn_ticker(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let player: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match player.upgrade() {
                    Some(player) => player.tick(),
                    None => break,
                }
            }
        })
    }

    fn tick(&self) {
        self.update(|state, _| !state.track.is_empty() && state.evt_send.is_some());
    }

    /// Adopt a raw observation from an external player and forward it.
    pub fn ingest(&self, observation: Observation) {
        let mut state = self.write();
        if !observation.transient.any() {
            state.track = observation.track_identifier.clone();
            state.position = PlaybackPosition::new(
                observation.position_millis,
                observation.observed_at_millis,
                observation.is_playing,
            );
        }
        state.send(observation);
    }

    fn update(&self, change: impl FnOnce(&mut PlayerState, u64) -> bool) {
        let now = self.clock.now_millis();
        let mut state = self.write();
        if change(&mut *state, now) {
            let observation = Observation::new(
                state.track.clone(),
                state.position.extrapolate(now),
                state.position.is_playing,
                now,
            );
            state.send(observation);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PlayerState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PlayerState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl PlayerState {
    fn send(&mut self, observation: Observation) {
        if let Some(sender) = &self.evt_send {
            if sender.send(observation).is_err() {
                debug!("observation subscriber went away");
                self.evt_send = None;
            }
        }
    }
}

#[async_trait]
impl LocalPlayerSource for HostPlayer {
    async fn connect(&self, device_label: &str) -> Result<String> {
        if device_label.trim().is_empty() {
            return Err(SyncError::Handshake("device label must not be empty".into()));
        }
        let device_id = format!("{}-{}", device_label, uuid::Uuid::new_v4());
        info!(device_id = %device_id, "local player connected");
        self.write().device_id = Some(device_id.clone());
        Ok(device_id)
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(device_id) = self.write().device_id.take() {
            info!(device_id = %device_id, "local player disconnected");
        }
        Ok(())
    }

    fn subscribe(&self) -> ObservationReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.write().evt_send = Some(sender);
        receiver
    }

    fn current_position(&self) -> Option<u64> {
        let state = self.read();
        if state.track.is_empty() {
            return None;
        }
        Some(state.position.extrapolate(self.clock.now_millis()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn admin_actions_emit_observations() {
        let clock = ManualClock::new(1_000);
        let player = HostPlayer::new(clock.clone());
        let mut rx = player.subscribe();

        player.change_media("A".into());
        player.unpause();
        clock.advance(2_000);
        player.pause();
        player.pause();

        let first = rx.recv().await.unwrap();
        assert_eq!((first.track_identifier.as_str(), first.position_millis, first.is_playing), ("A", 0, false));
        let second = rx.recv().await.unwrap();
        assert!(second.is_playing);
        let third = rx.recv().await.unwrap();
        assert_eq!((third.position_millis, third.is_playing, third.observed_at_millis), (2_000, false, 3_000));
        assert!(rx.try_recv().is_err(), "second pause is a no-op");
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_reports_state_periodically() {
        let clock = ManualClock::new(0);
        let player = HostPlayer::new(clock.clone());
        let mut rx = player.subscribe();
        let _ticker = player.spawn_ticker(Duration::from_secs(1));

        time::sleep(Duration::from_millis(1_500)).await;
        assert!(rx.try_recv().is_err(), "nothing to report without media");

        player.change_media("A".into());
        player.unpause();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        clock.advance(700);
        let tick = rx.recv().await.unwrap();
        assert_eq!(
            (tick.track_identifier.as_str(), tick.position_millis, tick.is_playing),
            ("A", 700, true)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stops_with_the_player() {
        let player = HostPlayer::new(ManualClock::new(0));
        let ticker = player.spawn_ticker(Duration::from_secs(1));
        drop(player);
        time::sleep(Duration::from_secs(2)).await;
        assert!(ticker.is_finished());
    }

    #[tokio::test]
    async fn current_position_extrapolates() {
        let clock = ManualClock::new(0);
        let player = HostPlayer::new(clock.clone());
        assert_eq!(player.current_position(), None);

        player.ingest(Observation::new("A", 500, true, 0));
        clock.advance(250);
        assert_eq!(player.current_position(), Some(750));
    }

    #[tokio::test]
    async fn connect_requires_a_label() {
        let player = HostPlayer::new(ManualClock::new(0));
        assert!(matches!(player.connect(" ").await, Err(SyncError::Handshake(_))));
        let id = player.connect("Host").await.unwrap();
        assert!(id.starts_with("Host-"));
        assert_eq!(player.device_id(), Some(id));
        player.disconnect().await.unwrap();
        assert_eq!(player.device_id(), None);
    }
}
