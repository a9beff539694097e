//! Host-side synchronization controller.
//!
//! A started controller runs one session task. The task owns the observation
//! subscription, the last forwarded state, the debounced emitter and the
//! credential refresh timer, and handles one event at a time. Updates leave
//! through an ordered outbound worker so classification never waits on the
//! network.

use std::sync::Arc;

use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use crate::{
    channel::OutboundChannel,
    classifier::{ChangeClassifier, Classification},
    clock::ClockHandle,
    config::SyncConfig,
    credentials::CredentialStore,
    debounce::{DebouncedEmitter, Submission},
    error::{Result, SyncError},
    events::{CanonicalUpdate, LastKnownState, Observation},
    player::{LocalPlayerSource, ObservationReceiver},
    presence::PresenceSource,
    refresh::{RefreshScheduler, RefreshSignal},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Idle,
    Starting,
    Active,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub device_id: Option<String>,
    pub last_update: Option<CanonicalUpdate>,
    pub publish_failures: u64,
    pub last_error: Option<String>,
    pub needs_reauthentication: bool,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            state: ControllerState::Idle,
            device_id: None,
            last_update: None,
            publish_failures: 0,
            last_error: None,
            needs_reauthentication: false,
        }
    }
}

/// Everything the controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub player: Arc<dyn LocalPlayerSource>,
    pub channel: Arc<dyn OutboundChannel>,
    pub credentials: Arc<dyn CredentialStore>,
    pub presence: Arc<dyn PresenceSource>,
    pub clock: ClockHandle,
}

type StatusHandle = Arc<watch::Sender<ControllerStatus>>;

enum Command {
    Stop { done: Option<oneshot::Sender<()>> },
    CredentialsExpired,
}

struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

pub struct SyncController {
    config: SyncConfig,
    deps: Collaborators,
    status: StatusHandle,
    session: Option<SessionHandle>,
}

impl SyncController {
    pub fn new(config: SyncConfig, deps: Collaborators) -> Self {
        let (status, _) = watch::channel(ControllerStatus::default());
        Self {
            config,
            deps,
            status: Arc::new(status),
            session: None,
        }
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ControllerState {
        self.status.borrow().state
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.status.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.deps.presence.listener_count()
    }

    /// Attach to the local player and begin broadcasting. Returns the device id.
    pub async fn start(&mut self) -> Result<String> {
        if let Some(session) = &self.session {
            if !session.task.is_finished() {
                return Err(SyncError::InvalidState(format!(
                    "cannot start while {:?}",
                    self.state()
                )));
            }
            // the previous session already tore itself down
            self.session = None;
        }

        set_status(&self.status, |s| {
            s.state = ControllerState::Starting;
            s.last_error = None;
        });
        info!(label = %self.config.device_label, "starting synchronization");

        let (signal_tx, refresh_signals) = mpsc::unbounded_channel();
        let scheduler = RefreshScheduler::spawn(
            self.config.refresh_interval,
            self.deps.credentials.clone(),
            signal_tx,
        );

        let device_id = match connect_player(&self.deps, &self.config).await {
            Ok(device_id) => device_id,
            Err(err) => {
                warn!("handshake failed: {}", err);
                set_status(&self.status, |s| {
                    s.state = ControllerState::Idle;
                    s.last_error = Some(err.to_string());
                });
                return Err(err);
            }
        };

        let observations = self.deps.player.subscribe();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = SessionTask::new(
            self.config.clone(),
            self.deps.clone(),
            self.status.clone(),
            observations,
            command_rx,
            refresh_signals,
            scheduler,
        );

        set_status(&self.status, |s| {
            s.state = ControllerState::Active;
            s.device_id = Some(device_id.clone());
            s.last_update = None;
            s.needs_reauthentication = false;
        });
        info!(device_id = %device_id, "synchronization active");

        self.session = Some(SessionHandle {
            commands,
            task: tokio::spawn(task.run()),
        });
        Ok(device_id)
    }

    /// Broadcast the disconnect update and release everything. No-op when idle.
    pub async fn stop(&mut self) -> Result<()> {
        let session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };

        // player disconnect and outbound drain each get one timeout, plus slack
        let budget = self.config.teardown_timeout * 3;
        let (done, wait) = oneshot::channel();
        let task = session.task;
        if session.commands.send(Command::Stop { done: Some(done) }).is_ok()
            && time::timeout(budget, wait).await.is_err()
        {
            warn!(?budget, "session did not stop in time, aborting it");
            task.abort();
        }

        if let Err(err) = task.await {
            if err.is_cancelled() {
                self.broadcast_disconnect_detached();
            } else {
                warn!("session task ended abnormally: {}", err);
            }
            set_status(&self.status, |s| {
                s.state = ControllerState::Idle;
                s.device_id = None;
            });
        }
        Ok(())
    }

    /// Last resort when the session task had to be aborted.
    fn broadcast_disconnect_detached(&self) {
        let position = self.deps.player.current_position().unwrap_or(0);
        let channel = self.deps.channel.clone();
        tokio::spawn(async move {
            if let Err(err) = channel.publish(CanonicalUpdate::disconnect(position)).await {
                warn!("disconnect broadcast after abort failed: {}", err);
            }
        });
    }

    /// Best-effort teardown for contexts that cannot wait, such as process exit.
    pub fn stop_detached(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(Command::Stop { done: None });
        }
    }

    /// Credentials went stale; re-attach to the player without a disconnect broadcast.
    pub fn credentials_expired(&self) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| SyncError::InvalidState("controller is idle".into()))?;
        session
            .commands
            .send(Command::CredentialsExpired)
            .map_err(|_| SyncError::ChannelClosed("session"))
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.stop_detached();
    }
}

enum Handshake {
    Connected,
    Failed(SyncError),
    Stopped(Option<oneshot::Sender<()>>),
}

enum SessionEvent {
    Command(Option<Command>),
    Refresh(RefreshSignal),
    Observation(Option<Observation>),
}

struct SessionTask {
    config: SyncConfig,
    deps: Collaborators,
    status: StatusHandle,
    classifier: ChangeClassifier,
    emitter: DebouncedEmitter<Box<dyn FnMut(CanonicalUpdate) + Send>>,
    last_known: Option<LastKnownState>,
    observations: ObservationReceiver,
    observing: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    refresh_signals: mpsc::UnboundedReceiver<RefreshSignal>,
    scheduler: RefreshScheduler,
    outbound: mpsc::UnboundedSender<CanonicalUpdate>,
    worker: JoinHandle<()>,
}

impl SessionTask {
    fn new(
        config: SyncConfig,
        deps: Collaborators,
        status: StatusHandle,
        observations: ObservationReceiver,
        commands: mpsc::UnboundedReceiver<Command>,
        refresh_signals: mpsc::UnboundedReceiver<RefreshSignal>,
        scheduler: RefreshScheduler,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(publish_worker(outbound_rx, deps.channel.clone(), status.clone()));

        let sink_tx = outbound.clone();
        let sink: Box<dyn FnMut(CanonicalUpdate) + Send> = Box::new(move |update| {
            if sink_tx.send(update).is_err() {
                warn!("outbound worker gone, update dropped");
            }
        });

        Self {
            classifier: ChangeClassifier::new(config.seek_threshold_millis),
            emitter: DebouncedEmitter::new(config.debounce_window_millis, sink),
            config,
            deps,
            status,
            last_known: None,
            observations,
            observing: true,
            commands,
            refresh_signals,
            scheduler,
            outbound,
            worker,
        }
    }

    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                cmd = self.commands.recv() => SessionEvent::Command(cmd),
                Some(signal) = self.refresh_signals.recv() => SessionEvent::Refresh(signal),
                obs = self.observations.recv(), if self.observing => SessionEvent::Observation(obs),
            };

            let handshake = match event {
                SessionEvent::Command(Some(Command::Stop { done })) => {
                    self.finish(done).await;
                    return;
                }
                SessionEvent::Command(None) => {
                    self.finish(None).await;
                    return;
                }
                SessionEvent::Command(Some(Command::CredentialsExpired)) => {
                    self.rehandshake().await
                }
                SessionEvent::Refresh(RefreshSignal::Renewed) => {
                    debug!("credentials renewed");
                    continue;
                }
                SessionEvent::Refresh(RefreshSignal::Reauthenticate(err)) => {
                    warn!("credential store asked for re-authentication: {}", err);
                    set_status(&self.status, |s| {
                        s.needs_reauthentication = true;
                        s.last_error = Some(err.to_string());
                    });
                    self.rehandshake().await
                }
                SessionEvent::Observation(Some(observation)) => {
                    if let Err(err) = self.handle_observation(observation) {
                        warn!("observation dropped: {}", err);
                    }
                    continue;
                }
                SessionEvent::Observation(None) => {
                    warn!("local player closed the observation stream");
                    self.observing = false;
                    continue;
                }
            };

            match handshake {
                Handshake::Connected => {}
                Handshake::Failed(err) => {
                    self.fail(err).await;
                    return;
                }
                Handshake::Stopped(done) => {
                    self.finish(done).await;
                    return;
                }
            }
        }
    }

    async fn finish(self, done: Option<oneshot::Sender<()>>) {
        self.teardown().await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn handle_observation(&mut self, observation: Observation) -> Result<()> {
        let classification = self.classifier.classify(self.last_known.as_ref(), &observation);
        if classification == Classification::NoChange {
            return Ok(());
        }
        if self.outbound.is_closed() {
            return Err(SyncError::ChannelClosed("outbound"));
        }

        let update = observation.to_update();
        let now = self.deps.clock.now_millis();
        match self.emitter.submit(update.clone(), now) {
            Submission::Forwarded => {
                debug!(
                    ?classification,
                    track = update.track_identifier(),
                    position = update.position_millis(),
                    "update forwarded"
                );
                // advanced even if the publish later fails; the next tick re-evaluates
                self.last_known = Some(LastKnownState::from_observation(&observation));
                set_status(&self.status, |s| s.last_update = Some(update));
            }
            Submission::Suppressed => {
                debug!(?classification, "update coalesced");
            }
        }
        Ok(())
    }

    /// Re-attach to the player. Observations wait in the queue meanwhile, but a
    /// stop request still gets through.
    async fn rehandshake(&mut self) -> Handshake {
        set_status(&self.status, |s| s.state = ControllerState::Starting);
        info!("re-attaching to local player");

        let deps = self.deps.clone();
        let config = self.config.clone();
        let connect = async move { connect_player(&deps, &config).await };
        tokio::pin!(connect);

        let result = loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::CredentialsExpired) => debug!("re-attach already in progress"),
                    Some(Command::Stop { done }) => return Handshake::Stopped(done),
                    None => return Handshake::Stopped(None),
                },
                result = &mut connect => break result,
            }
        };

        match result {
            Ok(device_id) => {
                set_status(&self.status, |s| {
                    s.state = ControllerState::Active;
                    s.device_id = Some(device_id.clone());
                    s.needs_reauthentication = false;
                });
                info!(device_id = %device_id, "synchronization active again");
                Handshake::Connected
            }
            Err(err) => Handshake::Failed(err),
        }
    }

    async fn fail(self, err: SyncError) {
        warn!("re-handshake failed, stopping: {}", err);
        set_status(&self.status, |s| s.last_error = Some(err.to_string()));
        self.teardown().await;
    }

    fn disconnect_position(&self) -> u64 {
        self.deps
            .player
            .current_position()
            .or_else(|| {
                let now = self.deps.clock.now_millis();
                self.last_known.as_ref().map(|s| s.position().extrapolate(now))
            })
            .unwrap_or(0)
    }

    /// Emitter cancel, timer cancel, disconnect broadcast, then release the
    /// subscription and the player.
    async fn teardown(self) {
        set_status(&self.status, |s| s.state = ControllerState::Stopping);
        let position = self.disconnect_position();

        let SessionTask {
            config,
            deps,
            status,
            mut emitter,
            mut scheduler,
            observations,
            outbound,
            mut worker,
            ..
        } = self;

        emitter.cancel();
        scheduler.cancel();

        let disconnect = CanonicalUpdate::disconnect(position);
        info!(position, "broadcasting host disconnect");
        if outbound.send(disconnect).is_err() {
            warn!("outbound worker gone, disconnect not broadcast");
        }

        drop(observations);
        drop(emitter);
        drop(outbound);

        match time::timeout(config.teardown_timeout, deps.player.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("player disconnect failed: {}", err),
            Err(_) => warn!("player disconnect timed out"),
        }

        if time::timeout(config.teardown_timeout, &mut worker).await.is_err() {
            warn!("outbound queue still draining after stop");
        }

        set_status(&status, |s| {
            s.state = ControllerState::Idle;
            s.device_id = None;
        });
        info!("synchronization stopped");
    }
}

async fn publish_worker(
    mut updates: mpsc::UnboundedReceiver<CanonicalUpdate>,
    channel: Arc<dyn OutboundChannel>,
    status: StatusHandle,
) {
    while let Some(update) = updates.recv().await {
        match channel.publish(update).await {
            Ok(()) => {}
            Err(err) => {
                if status.borrow().state == ControllerState::Idle {
                    debug!("ignoring late publish failure: {}", err);
                    continue;
                }
                warn!("publish failed, next observation will resync: {}", err);
                set_status(&status, |s| {
                    s.publish_failures += 1;
                    s.last_error = Some(err.to_string());
                });
            }
        }
    }
}

async fn connect_player(deps: &Collaborators, config: &SyncConfig) -> Result<String> {
    match time::timeout(config.handshake_timeout, deps.player.connect(&config.device_label)).await {
        Ok(result) => result.map_err(into_handshake),
        Err(_) => Err(SyncError::Handshake(format!(
            "player did not answer within {:?}",
            config.handshake_timeout
        ))),
    }
}

fn into_handshake(err: SyncError) -> SyncError {
    match err {
        SyncError::Handshake(_) => err,
        other => SyncError::Handshake(other.to_string()),
    }
}

fn set_status(status: &watch::Sender<ControllerStatus>, change: impl FnOnce(&mut ControllerStatus)) {
    status.send_modify(change);
}
