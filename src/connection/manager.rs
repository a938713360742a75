//! Connection manager: the supervisory task driving one `ConnectionState`
//!
//! One task per target. It connects with bounded retries, binds the frame
//! producer as the session's audio, polls session health, and on session
//! loss loops back into the connect cycle instead of giving up. Every state
//! write happens on this task; other tasks observe through the shared record
//! or the event stream.

use parking_lot::Mutex;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::audio::{release_source, CaptureDevice, FrameSource};
use crate::config::BridgeConfig;
use crate::connection::coordination::{CoordinationTable, ManagerId};
use crate::connection::producer::SourceProducer;
use crate::connection::state::{ConnectionState, Phase, Target};
use crate::connection::status::{ConnectionEvent, EventKind, StatusReporter, StatusSnapshot};
use crate::error::{AudioError, ConnectionError, TransportError};
use crate::transport::{ChannelInfo, FrameProducer, GroupId, SessionId, VoiceTransport};

/// Collaborators shared by every manager of a bridge
#[derive(Clone)]
pub struct ManagerContext {
    /// Voice transport every session goes through
    pub transport: Arc<dyn VoiceTransport>,
    /// Group claims; a manager releases its own on close
    pub coordination: Arc<CoordinationTable>,
    /// Retry, playback and health tunables
    pub config: Arc<BridgeConfig>,
    /// Event stream shared by all connections
    pub events: broadcast::Sender<ConnectionEvent>,
}

pub(crate) enum Command {
    SwitchDevice {
        source: Arc<FrameSource>,
        /// Reopen `source` on this device before attaching it
        device: Option<CaptureDevice>,
        reply: oneshot::Sender<Result<(), AudioError>>,
    },
}

/// Resolves once a close has been requested or the handle is gone
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub struct ConnectionManager {
    id: ManagerId,
    target: Target,
    channel: ChannelInfo,
    transport: Arc<dyn VoiceTransport>,
    coordination: Arc<CoordinationTable>,
    config: Arc<BridgeConfig>,
    events: broadcast::Sender<ConnectionEvent>,
    producer: Arc<SourceProducer>,
    state: Arc<Mutex<ConnectionState>>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    session: Option<SessionId>,
    settle_first: bool,
}

impl ConnectionManager {
    /// Start the supervisory task for `target`.
    ///
    /// The caller must already hold the coordination claim on the channel's
    /// group for `id`; the manager releases it when it closes. With
    /// `settle_first` the first connect attempt waits the switch settle
    /// interval, for use right after leaving another channel.
    pub fn spawn(
        ctx: ManagerContext,
        id: ManagerId,
        target: Target,
        channel: ChannelInfo,
        source: Arc<FrameSource>,
        settle_first: bool,
    ) -> ManagerHandle {
        let state = Arc::new(Mutex::new(ConnectionState::new(target)));
        let producer = Arc::new(SourceProducer::new(source));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reporter = StatusReporter::new(state.clone(), ctx.transport.clone(), producer.clone());

        let manager = ConnectionManager {
            id,
            target,
            channel: channel.clone(),
            transport: ctx.transport,
            coordination: ctx.coordination,
            config: ctx.config,
            events: ctx.events.clone(),
            producer: producer.clone(),
            state: state.clone(),
            commands: command_rx,
            shutdown: shutdown_rx,
            session: None,
            settle_first,
        };

        let span = tracing::info_span!("connection", target = %target, channel = %channel.name);
        let task = tokio::spawn(manager.run().instrument(span));

        ManagerHandle {
            id,
            target,
            channel,
            state,
            reporter,
            producer,
            events: ctx.events,
            commands: command_tx,
            shutdown: shutdown_tx,
            task: Some(task),
            outcome: None,
        }
    }

    async fn run(mut self) -> Result<(), ConnectionError> {
        let reason = match self.supervise().await {
            Ok(never) => match never {},
            Err(reason) => reason,
        };

        let outcome = match reason {
            ConnectionError::Cancelled => {
                tracing::info!("closing connection on request");
                Ok(())
            }
            reason => {
                tracing::error!(error = %reason, "connection failed");
                self.state.lock().record_error(reason.clone());
                Err(reason)
            }
        };

        self.teardown().await;
        self.emit(EventKind::Closed {
            reason: outcome.as_ref().err().map(|e| e.to_string()),
        });
        outcome
    }

    /// Connect, play, monitor, and restart on session loss. Only returns with
    /// the reason the connection must end.
    async fn supervise(&mut self) -> Result<Infallible, ConnectionError> {
        if self.settle_first {
            self.idle(self.config.retry.switch_settle()).await?;
        }

        loop {
            self.connect().await?;
            self.bind_playback().await?;
            self.monitor().await?;

            // Session lost: we are in ReconnectPending
            self.release_session().await;
            if !self.config.retry.auto_restart {
                return Err(ConnectionError::SessionLost);
            }

            let restarts = {
                let mut state = self.state.lock();
                state.restarts += 1;
                state.restarts
            };
            let delay = self.config.retry.restart_delay();
            tracing::info!(restarts, delay_secs = delay.as_secs_f32(), "restarting connection cycle");
            self.idle(delay).await?;
        }
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.transition(Phase::Connecting)?;
        self.state.lock().attempt = 0;

        if self.adopt_or_clear_existing().await? {
            return Ok(());
        }

        let max_attempts = self.config.retry.max_attempts.max(1);
        let timeout = self.config.retry.connect_timeout();

        loop {
            let attempt = {
                let mut state = self.state.lock();
                state.attempt += 1;
                state.attempt
            };
            tracing::info!(attempt, max_attempts, "connecting to voice channel");

            let result = tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => return Err(ConnectionError::Cancelled),
                r = tokio::time::timeout(timeout, self.transport.connect(&self.channel)) => {
                    r.unwrap_or(Err(TransportError::Timeout))
                }
            };

            let failure = match result {
                Ok(session) => return self.on_connected(session),
                Err(TransportError::AlreadyConnected) => match self.recover_existing() {
                    Some(session) => {
                        tracing::info!(%session, "recovered session after duplicate connect");
                        return self.on_connected(session);
                    }
                    None => {
                        tracing::warn!("transport reports already connected, but no valid session");
                        TransportError::AlreadyConnected
                    }
                },
                Err(e) => e,
            };

            tracing::warn!(attempt, max_attempts, error = %failure, "connect attempt failed");
            self.state
                .lock()
                .record_error(ConnectionError::Transport(failure.clone()));
            self.emit(EventKind::AttemptFailed {
                attempt,
                error: failure.to_string(),
            });

            if !failure.is_retryable() {
                return Err(ConnectionError::Transport(failure));
            }
            if attempt >= max_attempts {
                return Err(ConnectionError::RetriesExhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            let backoff = self.config.retry.backoff();
            tracing::info!(delay_secs = backoff.as_secs_f32(), "waiting before next attempt");
            self.idle(backoff).await?;
            self.transition(Phase::Connecting)?;
        }
    }

    /// Reuse a live session already bound to our channel, or clear one bound
    /// elsewhere in the group. Returns true when a session was adopted.
    async fn adopt_or_clear_existing(&mut self) -> Result<bool, ConnectionError> {
        let Some(existing) = self.transport.existing_session(self.channel.group) else {
            return Ok(false);
        };

        if self.is_valid(existing) {
            tracing::info!(session = %existing, "reusing live session");
            self.on_connected(existing)?;
            return Ok(true);
        }

        let was_connected = self.transport.is_connected(existing);
        if was_connected {
            tracing::info!(
                session = %existing,
                from = ?self.transport.session_channel(existing),
                "leaving previous channel before switching"
            );
        } else {
            tracing::debug!(session = %existing, "clearing stale session");
        }
        self.disconnect_quietly(existing).await;

        if was_connected {
            self.idle(self.config.retry.switch_settle()).await?;
        }
        Ok(false)
    }

    fn recover_existing(&self) -> Option<SessionId> {
        self.transport
            .existing_session(self.channel.group)
            .filter(|&session| self.is_valid(session))
    }

    fn is_valid(&self, session: SessionId) -> bool {
        self.transport.is_connected(session)
            && self.transport.session_channel(session) == Some(self.channel.id)
    }

    fn on_connected(&mut self, session: SessionId) -> Result<(), ConnectionError> {
        self.transition(Phase::Connected)?;
        self.session = Some(session);
        {
            let mut state = self.state.lock();
            state.session = Some(session);
            state.channel_name = Some(self.channel.name.clone());
        }
        tracing::info!(
            %session,
            group = %self.channel.group_name,
            "connected to voice channel"
        );
        Ok(())
    }

    /// Start audio after connecting; a blocked start leaves us Degraded
    async fn bind_playback(&mut self) -> Result<(), ConnectionError> {
        if self.start_playback().await? {
            return Ok(());
        }

        let attempts = self.config.playback.start_attempts.max(1);
        self.state
            .lock()
            .record_error(ConnectionError::PlaybackFailed { attempts });
        if self.phase() == Phase::Connected {
            self.transition(Phase::Degraded)?;
        }
        Ok(())
    }

    /// Try to start playback, stopping a stale player when the transport
    /// says one is still running. Returns whether playback started.
    async fn start_playback(&mut self) -> Result<bool, ConnectionError> {
        let Some(session) = self.session else {
            return Ok(false);
        };

        let attempts = self.config.playback.start_attempts.max(1);
        for attempt in 1..=attempts {
            let producer: Arc<dyn FrameProducer> = self.producer.clone();
            match self.transport.play(session, producer) {
                Ok(()) => {
                    tracing::debug!(attempt, "playback started");
                    return Ok(true);
                }
                Err(TransportError::AlreadyPlaying) => {
                    tracing::debug!(attempt, "transport still playing, stopping first");
                    if let Err(e) = self.transport.stop(session) {
                        tracing::warn!(error = %e, "failed to stop previous playback");
                    }
                    if attempt < attempts {
                        self.sleep(self.config.playback.retry_delay()).await?;
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "failed to start playback");
                    return Ok(false);
                }
            }
        }

        tracing::warn!(attempts, "playback still blocked after retries");
        Ok(false)
    }

    /// Poll session health until the session is lost
    async fn monitor(&mut self) -> Result<(), ConnectionError> {
        let poll = self.config.health.poll_interval();
        let status_every = self.config.health.status_interval();

        let mut ticker = tokio::time::interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_status = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => return Err(ConnectionError::Cancelled),
                Some(command) = self.commands.recv() => self.handle_command(command).await?,
                _ = ticker.tick() => {
                    if !self.check_health().await? {
                        return Ok(());
                    }
                    if last_status.elapsed() >= status_every {
                        self.report_status();
                        last_status = Instant::now();
                    }
                }
            }
        }
    }

    /// One health poll. Returns false once the session is lost.
    async fn check_health(&mut self) -> Result<bool, ConnectionError> {
        let Some(session) = self.session else {
            return Ok(false);
        };

        if !self.transport.is_connected(session) {
            tracing::warn!(%session, "voice session disconnected");
            self.transition(Phase::ReconnectPending)?;
            return Ok(false);
        }

        let degraded = self.phase() == Phase::Degraded;
        if self.transport.is_playing(session) {
            if degraded {
                self.transition(Phase::Connected)?;
            }
            return Ok(true);
        }

        tracing::info!("audio not playing, restarting playback");
        if self.start_playback().await? {
            tracing::info!("playback restarted");
            self.emit(EventKind::PlaybackRestarted);
            if degraded {
                self.transition(Phase::Connected)?;
            }
            return Ok(true);
        }

        let attempts = self.config.playback.start_attempts.max(1);
        self.state
            .lock()
            .record_error(ConnectionError::PlaybackFailed { attempts });

        if degraded {
            tracing::warn!("playback could not be repaired, reconnecting");
            self.transition(Phase::ReconnectPending)?;
            return Ok(false);
        }

        self.transition(Phase::Degraded)?;
        Ok(true)
    }

    fn report_status(&self) {
        let Some(session) = self.session else {
            return;
        };

        let uptime = self
            .state
            .lock()
            .connected_at
            .map(|at| at.elapsed())
            .unwrap_or_default();
        let peers = self.transport.peer_count(session);
        let latency = self.transport.latency(session);

        tracing::info!(
            uptime_secs = uptime.as_secs(),
            peers,
            latency_ms = latency.map(|l| l.as_millis() as u64),
            "voice session status"
        );
        self.emit(EventKind::Status {
            uptime,
            peers,
            latency,
        });
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), ConnectionError> {
        match command {
            Command::SwitchDevice {
                source,
                device,
                reply,
            } => {
                let live = self.session.filter(|_| self.phase().is_live());
                if let Some(session) = live {
                    if self.transport.is_playing(session) {
                        if let Err(e) = self.transport.stop(session) {
                            tracing::warn!(error = %e, "failed to stop playback for device switch");
                        }
                    }
                }

                let previous = source.device();
                let result = match &device {
                    Some(device) => source.open_async(device).await,
                    None => Ok(()),
                };

                let mut has_stream = true;
                match &result {
                    Ok(()) => {
                        let device_id = source.device().map(|d| d.id);
                        if let Some(old) = self.producer.replace(source) {
                            release_source(old).await;
                        }
                        if let Some(id) = device_id {
                            self.target.device = id;
                            self.state.lock().target.device = id;
                            self.emit(EventKind::DeviceSwitched { device: id });
                            tracing::info!(device = id, "capture device switched");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "device switch failed");
                        // A failed reopen already closed the old handle
                        if device.is_some() && !source.is_open() {
                            has_stream = self.restore_device(&source, previous).await;
                        }
                    }
                }
                let _ = reply.send(result);

                if live.is_none() {
                    return Ok(());
                }
                let playing = has_stream && self.start_playback().await?;
                if !playing && self.phase() == Phase::Connected {
                    self.transition(Phase::Degraded)?;
                }
            }
        }
        Ok(())
    }

    /// Reopen the device a failed switch left behind. Returns whether the
    /// connection still has a stream; without one the source is detached.
    async fn restore_device(&mut self, source: &Arc<FrameSource>, previous: Option<CaptureDevice>) -> bool {
        if let Some(previous) = previous {
            match source.open_async(&previous).await {
                Ok(()) => {
                    tracing::info!(device = previous.id, "kept previous capture device");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(device = previous.id, error = %e, "previous capture device is gone too")
                }
            }
        }

        if let Some(old) = self.producer.detach() {
            release_source(old).await;
        }
        false
    }

    /// Stop and disconnect the current session, best-effort
    async fn release_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        if self.transport.is_playing(session) {
            if let Err(e) = self.transport.stop(session) {
                tracing::warn!(%session, error = %e, "failed to stop playback");
            }
        }
        self.disconnect_quietly(session).await;
    }

    async fn disconnect_quietly(&self, session: SessionId) {
        let timeout = self.config.retry.connect_timeout();
        match tokio::time::timeout(timeout, self.transport.disconnect(session)).await {
            Ok(Ok(())) => tracing::info!(%session, "disconnected"),
            Ok(Err(TransportError::NotConnected)) => {
                tracing::debug!(%session, "session already gone")
            }
            Ok(Err(e)) => tracing::warn!(%session, error = %e, "failed to disconnect"),
            Err(_) => tracing::warn!(%session, "disconnect timed out"),
        }
    }

    /// Release everything this connection holds. Each step is best-effort and
    /// never stops the ones after it.
    async fn teardown(&mut self) {
        self.release_session().await;

        // A connect abandoned mid-flight may still have produced a binding
        let group: GroupId = self.channel.group;
        if let Some(orphan) = self.transport.existing_session(group) {
            if self.transport.session_channel(orphan) == Some(self.channel.id) {
                tracing::debug!(session = %orphan, "disconnecting partially established session");
                self.disconnect_quietly(orphan).await;
            }
        }

        if !self.coordination.release(group, self.id) {
            tracing::debug!(group, "group claim was not held");
        }

        if let Some(source) = self.producer.detach() {
            release_source(source).await;
        }

        if let Err(e) = self.transition(Phase::Closed) {
            tracing::debug!(error = %e, "already closed");
        }
        tracing::info!("connection closed");
    }

    /// Wait `duration`, serving commands meanwhile; aborts on close
    async fn idle(&mut self, duration: Duration) -> Result<(), ConnectionError> {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => return Err(ConnectionError::Cancelled),
                _ = &mut deadline => return Ok(()),
                Some(command) = self.commands.recv() => self.handle_command(command).await?,
            }
        }
    }

    /// Wait `duration`; aborts on close
    async fn sleep(&mut self, duration: Duration) -> Result<(), ConnectionError> {
        tokio::select! {
            biased;
            _ = cancelled(&mut self.shutdown) => Err(ConnectionError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    fn transition(&self, next: Phase) -> Result<(), ConnectionError> {
        let from = self.state.lock().transition(next)?;
        if from != next {
            tracing::debug!(?from, to = ?next, "phase changed");
        }
        self.emit(EventKind::PhaseChanged { from, to: next });
        Ok(())
    }

    fn emit(&self, kind: EventKind) {
        // No subscribers is fine
        let _ = self.events.send(ConnectionEvent::new(self.target, kind));
    }
}

/// Caller-side handle to a running connection manager
pub struct ManagerHandle {
    id: ManagerId,
    target: Target,
    channel: ChannelInfo,
    state: Arc<Mutex<ConnectionState>>,
    reporter: StatusReporter,
    producer: Arc<SourceProducer>,
    events: broadcast::Sender<ConnectionEvent>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), ConnectionError>>>,
    outcome: Option<Result<(), ConnectionError>>,
}

impl ManagerHandle {
    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub(crate) fn set_target(&mut self, target: Target) {
        self.target = target;
    }

    pub fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    pub fn group(&self) -> GroupId {
        self.channel.group
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.reporter.snapshot()
    }

    pub fn reporter(&self) -> StatusReporter {
        self.reporter.clone()
    }

    pub fn source(&self) -> Option<Arc<FrameSource>> {
        self.producer.source()
    }

    /// Closed, or the task has exited
    pub fn is_closed(&self) -> bool {
        self.phase().is_terminal() || self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn is_muted(&self) -> bool {
        self.producer.is_muted()
    }

    pub fn set_muted(&self, muted: bool) {
        if self.producer.is_muted() == muted {
            return;
        }
        self.producer.set_muted(muted);
        tracing::info!(target = %self.target, muted, "mute changed");
        let _ = self
            .events
            .send(ConnectionEvent::new(self.target, EventKind::MuteChanged { muted }));
    }

    /// Ask the manager to attach `source`, reopening it on `device` first
    /// when given. The returned future resolves once the manager applied it.
    pub fn switch_device(
        &self,
        source: Arc<FrameSource>,
        device: Option<CaptureDevice>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send + 'static {
        let (reply, response) = oneshot::channel();
        let sent = self
            .commands
            .send(Command::SwitchDevice {
                source,
                device,
                reply,
            })
            .is_ok();

        async move {
            if !sent {
                return Err(ConnectionError::Cancelled);
            }
            match response.await {
                Ok(result) => result.map_err(ConnectionError::Device),
                Err(_) => Err(ConnectionError::Cancelled),
            }
        }
    }

    /// Wait for the manager to finish on its own
    pub async fn wait(&mut self) -> Result<(), ConnectionError> {
        if let Some(task) = self.task.take() {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "connection task aborted");
                    Err(ConnectionError::Cancelled)
                }
            };
            self.outcome = Some(outcome);
        }
        self.outcome.clone().unwrap_or(Ok(()))
    }

    /// Request a close and wait for cleanup to finish
    pub async fn close(mut self) -> Result<(), ConnectionError> {
        let _ = self.shutdown.send(true);
        self.wait().await
    }
}
