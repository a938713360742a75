//! Bridge: the entry point a shell drives
//!
//! Owns the device registry, the group coordination table, one capture
//! source per open device, and one connection manager per target.

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

use crate::audio::{CaptureBackend, CaptureDevice, DeviceId, DeviceRegistry, FrameSource};
use crate::config::BridgeConfig;
use crate::connection::manager::ManagerContext;
use crate::connection::{
    ConnectionEvent, ConnectionManager, CoordinationTable, ManagerHandle, ManagerId, StatusReporter,
    StatusSnapshot, Target,
};
use crate::error::{ConnectionError, CoordinationError, Result};
use crate::transport::{ChannelId, GroupId, VoiceTransport};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 256;

pub struct Bridge {
    config: Arc<BridgeConfig>,
    registry: RwLock<DeviceRegistry>,
    transport: Arc<dyn VoiceTransport>,
    coordination: Arc<CoordinationTable>,
    connections: Mutex<HashMap<Target, ManagerHandle>>,
    /// Serializes request and switch handling
    requests: tokio::sync::Mutex<()>,
    /// Open capture sources by device; a source closes once its last
    /// connection lets go of it
    sources: Mutex<HashMap<DeviceId, Weak<FrameSource>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Bridge {
    /// Enumerate capture devices and get ready to accept requests. Fails
    /// when no usable capture device exists.
    pub fn new(
        config: BridgeConfig,
        transport: Arc<dyn VoiceTransport>,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<Self> {
        let registry = DeviceRegistry::new(backend)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!(devices = registry.devices().len(), "bridge ready");

        Ok(Self {
            config: Arc::new(config),
            registry: RwLock::new(registry),
            transport,
            coordination: Arc::new(CoordinationTable::new()),
            connections: Mutex::new(HashMap::new()),
            requests: tokio::sync::Mutex::new(()),
            sources: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn devices(&self) -> Vec<CaptureDevice> {
        self.registry.read().devices().to_vec()
    }

    /// Name to id mapping for selection lists
    pub fn device_options(&self) -> BTreeMap<String, DeviceId> {
        self.registry.read().options()
    }

    pub fn refresh_devices(&self) -> Result<()> {
        self.registry.write().refresh()?;
        Ok(())
    }

    /// Receive every connection's phase changes, failures and status lines
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn coordination(&self) -> &CoordinationTable {
        &self.coordination
    }

    /// The candidate groups no connection currently holds
    pub fn available_groups<I>(&self, candidates: I) -> Vec<GroupId>
    where
        I: IntoIterator<Item = GroupId>,
    {
        self.coordination.available(candidates)
    }

    /// Start bridging `device` into `channel`.
    ///
    /// Returns as soon as the connection is accepted; connecting proceeds in
    /// the background. Requesting a live target again returns it unchanged.
    /// Requesting another channel in a group this device already serves
    /// moves the connection there.
    pub async fn request_connection(&self, device: DeviceId, channel: ChannelId) -> Result<Target> {
        let device = self.registry.read().get(device)?.clone();
        let target = Target::new(device.id, channel);

        // Requests run one at a time so a duplicate never sees a half-built one
        let _serial = self.requests.lock().await;
        self.reap_closed();

        if self.connections.lock().contains_key(&target) {
            tracing::debug!(%target, "connection already active");
            return Ok(target);
        }

        let info = self.transport.resolve_channel(channel).await?;

        let mut settle_first = false;
        if let Some(holder) = self.coordination.holder(info.group) {
            let previous = self.take_switchable(holder, device.id);
            let Some(previous) = previous else {
                return Err(CoordinationError::AlreadyClaimed {
                    group: info.group,
                    holder,
                }
                .into());
            };

            tracing::info!(
                from = previous.channel().id,
                to = channel,
                group = %info.group_name,
                "switching channel"
            );
            if let Err(e) = previous.close().await {
                tracing::debug!(error = %e, "previous connection had already failed");
            }
            settle_first = true;
        }

        let id = ManagerId::new();
        self.coordination.claim(info.group, id)?;
        let source = match self.acquire_source(&device).await {
            Ok(source) => source,
            Err(e) => {
                self.coordination.release(info.group, id);
                return Err(e);
            }
        };

        tracing::info!(
            %target,
            device = %device.name,
            channel = %info.name,
            group = %info.group_name,
            "connection requested"
        );

        let handle = ConnectionManager::spawn(self.context(), id, target, info, source, settle_first);
        self.connections.lock().insert(target, handle);
        Ok(target)
    }

    /// Remove the connection held by `holder` when it is bridging `device`
    fn take_switchable(&self, holder: ManagerId, device: DeviceId) -> Option<ManagerHandle> {
        let mut connections = self.connections.lock();
        let target = connections
            .iter()
            .find(|(_, handle)| handle.id() == holder)
            .map(|(target, _)| *target)
            .filter(|target| target.device == device)?;
        connections.remove(&target)
    }

    /// Drop handles whose manager has finished
    fn reap_closed(&self) {
        self.connections.lock().retain(|target, handle| {
            let closed = handle.is_closed();
            if closed {
                tracing::debug!(%target, "removing closed connection");
            }
            !closed
        });
    }

    /// Close a connection and wait for its cleanup
    pub async fn close_connection(&self, target: Target) -> Result<()> {
        let handle = self
            .connections
            .lock()
            .remove(&target)
            .ok_or(ConnectionError::UnknownTarget(target))?;

        if let Err(e) = handle.close().await {
            tracing::debug!(%target, error = %e, "connection had already failed");
        }
        Ok(())
    }

    /// Move a connection onto another capture device without leaving the
    /// channel. Returns the connection's new target.
    pub async fn switch_device(&self, target: Target, device: DeviceId) -> Result<Target> {
        let device = self.registry.read().get(device)?.clone();
        if device.id == target.device {
            return Ok(target);
        }

        let _serial = self.requests.lock().await;

        let current = self
            .connections
            .lock()
            .get(&target)
            .ok_or(ConnectionError::UnknownTarget(target))?
            .source();
        let (source, reopen) = self.source_for_switch(current, &device).await?;
        let reopened = reopen.is_some();
        let weak = Arc::downgrade(&source);

        let pending = self
            .connections
            .lock()
            .get(&target)
            .ok_or(ConnectionError::UnknownTarget(target))?
            .switch_device(source, reopen);

        if let Err(e) = pending.await {
            if reopened {
                // The manager went back to the old device; key it there again
                let mut sources = self.sources.lock();
                if sources.get(&device.id).map_or(false, |w| w.ptr_eq(&weak)) {
                    sources.remove(&device.id);
                    sources.insert(target.device, weak);
                }
            }
            return Err(e.into());
        }

        let next = Target::new(device.id, target.channel);
        let mut connections = self.connections.lock();
        if let Some(mut handle) = connections.remove(&target) {
            handle.set_target(next);
            connections.insert(next, handle);
        }
        Ok(next)
    }

    /// Pick the source a switching connection should use: one already open
    /// on `device`, its own source reopened in place when nobody else uses
    /// it, or a fresh one.
    async fn source_for_switch(
        &self,
        current: Option<Arc<FrameSource>>,
        device: &CaptureDevice,
    ) -> Result<(Arc<FrameSource>, Option<CaptureDevice>)> {
        {
            let mut sources = self.sources.lock();

            if let Some(shared) = Self::live_source(&sources, device.id) {
                return Ok((shared, None));
            }

            if let Some(current) = current {
                // One reference in the connection's producer, one here
                if Arc::strong_count(&current) <= 2 {
                    sources.retain(|_, weak| !std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&current)));
                    sources.insert(device.id, Arc::downgrade(&current));
                    return Ok((current, Some(device.clone())));
                }
            }
        }

        let source = self.open_source(device).await?;
        self.sources.lock().insert(device.id, Arc::downgrade(&source));
        Ok((source, None))
    }

    /// The open source for `device`, opening it if no connection uses it yet
    async fn acquire_source(&self, device: &CaptureDevice) -> Result<Arc<FrameSource>> {
        let shared = Self::live_source(&self.sources.lock(), device.id);
        if let Some(shared) = shared {
            tracing::debug!(device = device.id, "sharing open capture device");
            return Ok(shared);
        }

        let source = self.open_source(device).await?;
        self.sources.lock().insert(device.id, Arc::downgrade(&source));
        Ok(source)
    }

    fn live_source(sources: &HashMap<DeviceId, Weak<FrameSource>>, device: DeviceId) -> Option<Arc<FrameSource>> {
        sources
            .get(&device)
            .and_then(Weak::upgrade)
            .filter(|source| source.is_open() && source.device().map(|d| d.id) == Some(device))
    }

    async fn open_source(&self, device: &CaptureDevice) -> Result<Arc<FrameSource>> {
        let backend = self.registry.read().backend();
        let source = Arc::new(FrameSource::new(backend, self.config.capture.clone()));
        source.open_async(device).await?;
        tracing::info!(device = device.id, name = %device.name, "capture device opened");
        Ok(source)
    }

    pub fn snapshot(&self, target: Target) -> Option<StatusSnapshot> {
        self.connections.lock().get(&target).map(|h| h.snapshot())
    }

    /// Snapshots of every connection, ordered by target. A connection that
    /// has closed is reported one last time and then forgotten.
    pub fn snapshots(&self) -> Vec<StatusSnapshot> {
        let reporters: Vec<StatusReporter> = self
            .connections
            .lock()
            .values()
            .map(|h| h.reporter())
            .collect();

        let mut snapshots: Vec<StatusSnapshot> = reporters.iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by_key(|s| s.target);
        self.reap_closed();
        snapshots
    }

    /// Targets of the connections still running
    pub fn targets(&self) -> Vec<Target> {
        self.reap_closed();
        let mut targets: Vec<Target> = self.connections.lock().keys().copied().collect();
        targets.sort();
        targets
    }

    pub fn reporter(&self, target: Target) -> Option<StatusReporter> {
        self.connections.lock().get(&target).map(|h| h.reporter())
    }

    pub fn set_muted(&self, target: Target, muted: bool) -> Result<()> {
        let connections = self.connections.lock();
        let handle = connections
            .get(&target)
            .ok_or(ConnectionError::UnknownTarget(target))?;
        handle.set_muted(muted);
        Ok(())
    }

    /// Flip mute, returning the new state
    pub fn toggle_mute(&self, target: Target) -> Result<bool> {
        let connections = self.connections.lock();
        let handle = connections
            .get(&target)
            .ok_or(ConnectionError::UnknownTarget(target))?;
        let muted = !handle.is_muted();
        handle.set_muted(muted);
        Ok(muted)
    }

    /// Close every connection and wait until all of them are cleaned up
    pub async fn shutdown(&self) {
        let handles: Vec<ManagerHandle> = self.connections.lock().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }

        tracing::info!(connections = handles.len(), "shutting down");
        let outcomes = join_all(handles.into_iter().map(|h| h.close())).await;
        for outcome in outcomes {
            if let Err(e) = outcome {
                tracing::debug!(error = %e, "connection had already failed");
            }
        }
        tracing::info!("shutdown complete");
    }

    fn context(&self) -> ManagerContext {
        ManagerContext {
            transport: self.transport.clone(),
            coordination: self.coordination.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{EventKind, Phase};
    use crate::error::{AudioError, Error, TransportError};
    use crate::testing::{wait_until, MockBackend, MockTransport};
    use std::time::Duration;
    use tokio::time::Instant;

    fn bridge() -> (Bridge, Arc<MockTransport>, Arc<MockBackend>) {
        let transport = Arc::new(MockTransport::new());
        let backend = Arc::new(MockBackend::new());
        let bridge = Bridge::new(BridgeConfig::default(), transport.clone(), backend.clone()).unwrap();
        (bridge, transport, backend)
    }

    async fn wait_connected(bridge: &Bridge, target: Target) {
        wait_until(
            || bridge.snapshot(target).map_or(false, |s| s.phase == Phase::Connected),
            "connected",
        )
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_request_is_idempotent() {
        let (bridge, transport, _) = bridge();

        let target = bridge.request_connection(0, 100).await.unwrap();
        wait_connected(&bridge, target).await;
        let again = bridge.request_connection(0, 100).await.unwrap();

        assert_eq!(again, target);
        assert_eq!(bridge.targets(), vec![target]);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_device_in_group_is_rejected() {
        let (bridge, transport, _) = bridge();
        let target = bridge.request_connection(0, 100).await.unwrap();
        wait_connected(&bridge, target).await;

        let err = bridge.request_connection(1, 101).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Coordination(CoordinationError::AlreadyClaimed { group: 10, .. })
        ));
        assert_eq!(transport.sessions_in_group(10), 1);
        assert_eq!(bridge.snapshot(target).unwrap().phase, Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_device_moves_channel_within_group() {
        let (bridge, transport, _) = bridge();
        let lobby = bridge.request_connection(0, 100).await.unwrap();
        wait_connected(&bridge, lobby).await;

        let started = Instant::now();
        let stage = bridge.request_connection(0, 101).await.unwrap();
        wait_connected(&bridge, stage).await;

        assert!(bridge.snapshot(lobby).is_none());
        assert_eq!(transport.sessions_in_group(10), 1);
        assert!(transport.session_for_channel(101).is_some());
        let last_connect = *transport.connect_times().last().unwrap();
        assert!(last_connect - started >= bridge.config().retry.switch_settle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_and_channel_fail_fast() {
        let (bridge, transport, backend) = bridge();

        let err = bridge.request_connection(9, 100).await.unwrap_err();
        assert!(matches!(err, Error::Audio(AudioError::DeviceNotFound(9))));

        let err = bridge.request_connection(0, 999).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::ChannelNotFound(999))
        ));

        assert!(bridge.targets().is_empty());
        assert!(bridge.coordination().claimed_groups().is_empty());
        assert_eq!(backend.open_handles(), 0);
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_device_feeds_two_groups() {
        let (bridge, transport, backend) = bridge();
        let a = bridge.request_connection(0, 100).await.unwrap();
        let b = bridge.request_connection(0, 200).await.unwrap();
        wait_connected(&bridge, a).await;
        wait_connected(&bridge, b).await;

        assert_eq!(backend.opens(), 1);
        assert_eq!(bridge.available_groups([10, 20, 30]), vec![30]);

        bridge.close_connection(a).await.unwrap();
        assert_eq!(backend.open_handles(), 1);
        assert!(transport.session_for_channel(200).is_some());

        bridge.close_connection(b).await.unwrap();
        assert_eq!(backend.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_device_rekeys_target() {
        let (bridge, transport, backend) = bridge();
        let target = bridge.request_connection(0, 100).await.unwrap();
        wait_connected(&bridge, target).await;
        let session = transport.session_for_channel(100);

        let moved = bridge.switch_device(target, 2).await.unwrap();

        assert_eq!(moved, Target::new(2, 100));
        assert!(bridge.snapshot(target).is_none());
        let snapshot = bridge.snapshot(moved).unwrap();
        assert_eq!(snapshot.target, moved);
        assert!(snapshot.playing);
        assert_eq!(transport.session_for_channel(100), session);
        assert_eq!(backend.max_concurrent_handles(), 1);

        // The reopened source is now the one shared for device 2
        let other = bridge.request_connection(2, 200).await.unwrap();
        wait_connected(&bridge, other).await;
        assert_eq!(backend.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_unknown_target() {
        let (bridge, _, _) = bridge();
        let err = bridge.switch_device(Target::new(0, 100), 1).await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::UnknownTarget(_))));

        let err = bridge.close_connection(Target::new(0, 100)).await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::UnknownTarget(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_mute() {
        let (bridge, _, _) = bridge();
        let mut events = bridge.subscribe();
        let target = bridge.request_connection(0, 100).await.unwrap();

        assert!(bridge.toggle_mute(target).unwrap());
        assert!(bridge.snapshot(target).unwrap().muted);
        assert!(!bridge.toggle_mute(target).unwrap());

        let mut mutes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EventKind::MuteChanged { muted } = event.kind {
                mutes.push(muted);
            }
        }
        assert_eq!(mutes, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_everything() {
        let (bridge, transport, backend) = bridge();
        let a = bridge.request_connection(0, 100).await.unwrap();
        let b = bridge.request_connection(1, 200).await.unwrap();
        wait_connected(&bridge, a).await;
        wait_connected(&bridge, b).await;

        bridge.shutdown().await;

        assert!(bridge.targets().is_empty());
        assert!(bridge.coordination().claimed_groups().is_empty());
        assert_eq!(transport.sessions_in_group(10), 0);
        assert_eq!(transport.sessions_in_group(20), 0);
        assert_eq!(backend.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connection_can_be_requested_again() {
        let (bridge, transport, _) = bridge();
        transport.fail_all_connects(TransportError::PermissionDenied);

        let target = bridge.request_connection(0, 100).await.unwrap();
        wait_until(
            || bridge.snapshot(target).map_or(false, |s| s.phase == Phase::Closed),
            "closed",
        )
        .await;
        assert!(!bridge.coordination().is_claimed(10));

        transport.clear_connect_failures();
        let again = bridge.request_connection(0, 100).await.unwrap();
        assert_eq!(again, target);
        wait_connected(&bridge, target).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_duplicate_requests_share_one_connection() {
        let (bridge, transport, _) = bridge();
        transport.delay_next_resolves(vec![Duration::from_millis(10), Duration::from_secs(6)]);

        let (first, second) = tokio::join!(
            bridge.request_connection(0, 100),
            bridge.request_connection(0, 100)
        );
        let target = first.unwrap();
        assert_eq!(second.unwrap(), target);

        wait_connected(&bridge, target).await;
        tokio::time::sleep(Duration::from_secs(7)).await;

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(transport.disconnect_count(), 0);
        assert_eq!(bridge.snapshot(target).unwrap().phase, Phase::Connected);
    }

    #[tokio::test]
    async fn test_slow_device_open_does_not_stall_runtime() {
        let (bridge, _, backend) = bridge();
        backend.set_open_delay(Duration::from_millis(300));

        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = running.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            let mut last = std::time::Instant::now();
            let mut worst = Duration::ZERO;
            while flag.load(std::sync::atomic::Ordering::SeqCst) {
                interval.tick().await;
                worst = worst.max(last.elapsed());
                last = std::time::Instant::now();
            }
            worst
        });

        let target = bridge.request_connection(0, 100).await.unwrap();
        wait_connected(&bridge, target).await;
        // In-place reopen runs inside the connection task
        let moved = bridge.switch_device(target, 1).await.unwrap();
        assert_eq!(moved.device, 1);

        running.store(false, std::sync::atomic::Ordering::SeqCst);
        let worst = ticker.await.unwrap();
        assert!(worst < Duration::from_millis(150), "runtime stalled for {worst:?}");

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connections_are_forgotten() {
        let (bridge, transport, _) = bridge();
        transport.fail_all_connects(TransportError::PermissionDenied);

        let target = bridge.request_connection(0, 100).await.unwrap();
        wait_until(
            || bridge.snapshot(target).map_or(false, |s| s.phase == Phase::Closed),
            "closed",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let last = bridge.snapshots();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].phase, Phase::Closed);
        assert!(last[0].last_error.is_some());

        assert!(bridge.snapshots().is_empty());
        assert!(bridge.targets().is_empty());
    }
}
