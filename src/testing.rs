//! In-memory capture backend and voice transport for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::audio::{CaptureBackend, CaptureDevice, CaptureHandle, DeviceId, Frame, StreamFormat};
use crate::connection::{ManagerHandle, Phase};
use crate::error::{AudioError, TransportError};
use crate::transport::{ChannelId, ChannelInfo, FrameProducer, GroupId, SessionId, VoiceTransport};

/// Poll `handle` on virtual time until it reaches `phase`
pub async fn wait_for_phase(handle: &ManagerHandle, phase: Phase) {
    wait_until(|| handle.phase() == phase, &format!("phase {phase:?}")).await;
}

pub async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    // 10 ms steps for up to ten virtual minutes
    for _ in 0..60_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Default)]
struct BackendShared {
    sample_value: AtomicI16,
    counting: AtomicBool,
    counter: AtomicU32,
    failing_reads: AtomicU32,
    opens: AtomicUsize,
    closes: AtomicUsize,
    open_handles: AtomicUsize,
    max_concurrent: AtomicUsize,
    open_delay_ms: AtomicU64,
}

pub struct MockBackend {
    devices: Vec<CaptureDevice>,
    shared: Arc<BackendShared>,
}

impl MockBackend {
    /// Three stereo inputs on the default host API
    pub fn new() -> Self {
        let devices = ["Microphone", "Line In", "Stereo Mix"]
            .iter()
            .enumerate()
            .map(|(id, name)| CaptureDevice {
                id: id as DeviceId,
                name: name.to_string(),
                max_input_channels: 2,
                host_api: 0,
            })
            .collect();
        Self::with_devices(devices)
    }

    pub fn with_devices(devices: Vec<CaptureDevice>) -> Self {
        Self {
            devices,
            shared: Arc::new(BackendShared::default()),
        }
    }

    pub fn device(&self, id: DeviceId) -> CaptureDevice {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .unwrap_or_else(|| panic!("no mock device {id}"))
    }

    pub fn set_sample_value(&self, value: i16) {
        self.shared.sample_value.store(value, Ordering::SeqCst);
    }

    /// Fill each read with its own sequence number so frames differ
    pub fn set_counting_samples(&self, counting: bool) {
        self.shared.counting.store(counting, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.shared.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make every open block its thread for `delay`, like a slow driver
    pub fn set_open_delay(&self, delay: Duration) {
        self.shared
            .open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.shared.open_handles.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_handles(&self) -> usize {
        self.shared.max_concurrent.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for MockBackend {
    fn enumerate(&self) -> Result<Vec<CaptureDevice>, AudioError> {
        Ok(self.devices.clone())
    }

    fn open(
        &self,
        device: &CaptureDevice,
        _format: StreamFormat,
    ) -> Result<Box<dyn CaptureHandle>, AudioError> {
        if !self.devices.iter().any(|d| d.id == device.id) {
            return Err(AudioError::DeviceNotFound(device.id));
        }

        let delay = self.shared.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let open = self.shared.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_concurrent.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(MockHandle {
            shared: self.shared.clone(),
            open: true,
        }))
    }
}

struct MockHandle {
    shared: Arc<BackendShared>,
    open: bool,
}

impl CaptureHandle for MockHandle {
    fn read(&mut self, out: &mut [i16], _timeout: Duration) -> Result<(), AudioError> {
        let failing = self
            .shared
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(AudioError::ReadFailed("mock glitch".to_string()));
        }

        let value = if self.shared.counting.load(Ordering::SeqCst) {
            (self.shared.counter.fetch_add(1, Ordering::SeqCst) % i16::MAX as u32) as i16
        } else {
            self.shared.sample_value.load(Ordering::SeqCst)
        };
        out.fill(value);
        Ok(())
    }

    fn close(&mut self) {
        if std::mem::take(&mut self.open) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
            self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct MockSession {
    channel: ChannelId,
    group: GroupId,
    connected: bool,
    producer: Option<Arc<dyn FrameProducer>>,
}

#[derive(Default)]
struct TransportState {
    next_session: u64,
    sessions: HashMap<SessionId, MockSession>,
    connect_failures: VecDeque<TransportError>,
    fail_all: Option<TransportError>,
    race_next: bool,
    hang_next: bool,
    resolve_delays: VecDeque<Duration>,
    play_failures: VecDeque<TransportError>,
    connect_times: Vec<Instant>,
    play_calls: usize,
    stop_calls: usize,
    disconnect_calls: usize,
}

impl TransportState {
    fn create_session(&mut self, channel: &ChannelInfo) -> SessionId {
        self.next_session += 1;
        let id = SessionId(self.next_session);
        self.sessions.insert(
            id,
            MockSession {
                channel: channel.id,
                group: channel.group,
                connected: true,
                producer: None,
            },
        );
        id
    }
}

/// Scriptable voice transport.
///
/// Channels: group 10 "Studio" holds 100 "Lobby" and 101 "Stage"; group 20
/// "Friends" holds 200 "Hangout".
pub struct MockTransport {
    channels: HashMap<ChannelId, ChannelInfo>,
    state: Mutex<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        let channels = [
            (100, "Lobby", 10, "Studio"),
            (101, "Stage", 10, "Studio"),
            (200, "Hangout", 20, "Friends"),
        ]
        .into_iter()
        .map(|(id, name, group, group_name)| {
            (
                id,
                ChannelInfo {
                    id,
                    name: name.to_string(),
                    group,
                    group_name: group_name.to_string(),
                },
            )
        })
        .collect();

        Self {
            channels,
            state: Mutex::new(TransportState::default()),
        }
    }

    pub fn channel(&self, id: ChannelId) -> ChannelInfo {
        self.channels
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("no mock channel {id}"))
    }

    pub fn fail_next_connects(&self, errors: Vec<TransportError>) {
        self.state.lock().connect_failures.extend(errors);
    }

    pub fn fail_all_connects(&self, error: TransportError) {
        self.state.lock().fail_all = Some(error);
    }

    /// Make the next lookups wait, one delay per call
    pub fn delay_next_resolves(&self, delays: Vec<Duration>) {
        self.state.lock().resolve_delays.extend(delays);
    }

    pub fn clear_connect_failures(&self) {
        let mut state = self.state.lock();
        state.connect_failures.clear();
        state.fail_all = None;
    }

    /// Next connect binds a session but still reports `AlreadyConnected`
    pub fn race_next_connect(&self) {
        self.state.lock().race_next = true;
    }

    /// Next connect binds a session and then never completes
    pub fn hang_next_connect(&self) {
        self.state.lock().hang_next = true;
    }

    pub fn fail_next_plays(&self, errors: Vec<TransportError>) {
        self.state.lock().play_failures.extend(errors);
    }

    /// Simulate the remote end dropping the session
    pub fn drop_connection(&self, session: SessionId) {
        if let Some(s) = self.state.lock().sessions.get_mut(&session) {
            s.connected = false;
            s.producer = None;
        }
    }

    /// Simulate the player dying while the session stays up
    pub fn stall_playback(&self, session: SessionId) {
        if let Some(s) = self.state.lock().sessions.get_mut(&session) {
            s.producer = None;
        }
    }

    /// A session left over from an earlier run
    pub fn inject_session(&self, channel: ChannelId) -> SessionId {
        let info = self.channel(channel);
        self.state.lock().create_session(&info)
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_times.len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connect_times.clone()
    }

    pub fn play_count(&self) -> usize {
        self.state.lock().play_calls
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stop_calls
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    pub fn sessions_in_group(&self, group: GroupId) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.group == group)
            .count()
    }

    pub fn session_for_channel(&self, channel: ChannelId) -> Option<SessionId> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|(_, s)| s.channel == channel && s.connected)
            .map(|(id, _)| *id)
    }

    /// Pull one frame the way the transport's player would
    pub fn pull(&self, session: SessionId) -> Option<Frame> {
        let producer = self
            .state
            .lock()
            .sessions
            .get(&session)
            .and_then(|s| s.producer.clone())?;
        producer.pull()
    }
}

#[async_trait]
impl VoiceTransport for MockTransport {
    async fn resolve_channel(&self, channel: ChannelId) -> Result<ChannelInfo, TransportError> {
        let delay = self.state.lock().resolve_delays.pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.channels
            .get(&channel)
            .cloned()
            .ok_or(TransportError::ChannelNotFound(channel))
    }

    async fn connect(&self, channel: &ChannelInfo) -> Result<SessionId, TransportError> {
        let hang = {
            let mut state = self.state.lock();
            state.connect_times.push(Instant::now());

            if std::mem::take(&mut state.hang_next) {
                state.create_session(channel);
                true
            } else {
                if let Some(error) = state.connect_failures.pop_front() {
                    return Err(error);
                }
                if let Some(error) = state.fail_all.clone() {
                    return Err(error);
                }
                if state.sessions.values().any(|s| s.group == channel.group) {
                    return Err(TransportError::AlreadyConnected);
                }
                if std::mem::take(&mut state.race_next) {
                    state.create_session(channel);
                    return Err(TransportError::AlreadyConnected);
                }
                return Ok(state.create_session(channel));
            }
        };

        if hang {
            std::future::pending::<()>().await;
        }
        Err(TransportError::Timeout)
    }

    async fn disconnect(&self, session: SessionId) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        state
            .sessions
            .remove(&session)
            .map(|_| ())
            .ok_or(TransportError::NotConnected)
    }

    fn play(&self, session: SessionId, producer: Arc<dyn FrameProducer>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.play_calls += 1;

        if !state.sessions.get(&session).map_or(false, |s| s.connected) {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = state.play_failures.pop_front() {
            return Err(error);
        }

        let Some(s) = state.sessions.get_mut(&session) else {
            return Err(TransportError::NotConnected);
        };
        if s.producer.is_some() {
            return Err(TransportError::AlreadyPlaying);
        }
        s.producer = Some(producer);
        Ok(())
    }

    fn stop(&self, session: SessionId) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.stop_calls += 1;
        match state.sessions.get_mut(&session) {
            Some(s) => {
                s.producer = None;
                Ok(())
            }
            None => Err(TransportError::NotConnected),
        }
    }

    fn is_connected(&self, session: SessionId) -> bool {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map_or(false, |s| s.connected)
    }

    fn is_playing(&self, session: SessionId) -> bool {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map_or(false, |s| s.connected && s.producer.is_some())
    }

    fn existing_session(&self, group: GroupId) -> Option<SessionId> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|(_, s)| s.group == group)
            .map(|(id, _)| *id)
    }

    fn session_channel(&self, session: SessionId) -> Option<ChannelId> {
        self.state.lock().sessions.get(&session).map(|s| s.channel)
    }

    fn latency(&self, session: SessionId) -> Option<Duration> {
        self.is_connected(session).then(|| Duration::from_millis(42))
    }

    fn peer_count(&self, session: SessionId) -> usize {
        if self.is_connected(session) {
            3
        } else {
            0
        }
    }
}
