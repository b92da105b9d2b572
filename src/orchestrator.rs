//! Poll orchestration and the consumer-facing session handle.
//!
//! One [`PollOrchestrator`] per station. Each cycle runs
//! transport → decoder → registry → statistics and then publishes a complete
//! [`StationState`] through a `watch` channel, so readers only ever see whole
//! snapshots. Failures are absorbed here; consumers observe availability.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::StationConfig;
use crate::error::{ConnectionError, CycleError, TransportError};
use crate::models::{Channel, ChannelId, ConnectionHealth, DeviceSnapshot};
use crate::registry::ChannelRegistry;
use crate::station::{decode, HttpTransport, Transport};
use crate::stats::StatisticsEngine;
use crate::utils::{Clock, SystemClock};

/// Everything a consumer can read, published atomically after every cycle.
#[derive(Debug, Clone)]
pub struct StationState {
    pub snapshot: Arc<DeviceSnapshot>,
    pub health: ConnectionHealth,
    pub channels: Arc<BTreeMap<ChannelId, Channel>>,
}

/// Outcome of one successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub channels_created: usize,
    pub readings_applied: usize,
    pub fields_dropped: usize,
}

pub struct PollOrchestrator {
    config: StationConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    registry: ChannelRegistry,
    engine: StatisticsEngine,
    health: ConnectionHealth,
    snapshot: Arc<DeviceSnapshot>,
    channels: Arc<BTreeMap<ChannelId, Channel>>,
    publisher: watch::Sender<Arc<StationState>>,
}

impl PollOrchestrator {
    pub fn new(
        config: StationConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let snapshot = Arc::new(DeviceSnapshot::empty(clock.now()));
        let channels = Arc::new(BTreeMap::new());
        let health = ConnectionHealth::new();
        let (publisher, _) = watch::channel(Arc::new(StationState {
            snapshot: snapshot.clone(),
            health: health.clone(),
            channels: channels.clone(),
        }));

        Self {
            engine: StatisticsEngine::new(config.window_size, config.smoothing_factor),
            config,
            transport,
            clock,
            registry: ChannelRegistry::new(),
            health,
            snapshot,
            channels,
            publisher,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StationState>> {
        self.publisher.subscribe()
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.snapshot.clone()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Run exactly one poll cycle and publish the result.
    ///
    /// On failure the previous snapshot is kept; the station turns
    /// unavailable once `failure_threshold` cycles in a row have failed.
    pub async fn poll(&mut self) -> Result<CycleReport, CycleError> {
        let result = self.cycle().await;
        let now = self.clock.now();

        match &result {
            Ok(report) => {
                let was_available = self.health.available;
                self.health.record_success(now);
                if !was_available {
                    info!("Station {} is available again", self.config.host);
                }
                debug!(
                    "Poll of {} applied {} readings ({} new channels, {} fields dropped)",
                    self.config.host,
                    report.readings_applied,
                    report.channels_created,
                    report.fields_dropped
                );
            }
            Err(e) => {
                let became_unavailable =
                    self.health
                        .record_failure(now, e.to_string(), self.config.failure_threshold);
                warn!(
                    "Poll of {} failed ({} consecutive): {}",
                    self.config.host, self.health.consecutive_failures, e
                );
                if became_unavailable {
                    warn!(
                        "Station {} marked unavailable after {} consecutive failures",
                        self.config.host, self.health.consecutive_failures
                    );
                }
            }
        }

        self.publish();
        result
    }

    async fn cycle(&mut self) -> Result<CycleReport, CycleError> {
        let body = match tokio::time::timeout(self.config.timeout, self.transport.fetch()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Unreachable(format!(
                    "no response within {}s",
                    self.config.timeout.as_secs_f64()
                ))
                .into())
            }
        };
        let raw = decode(&body)?;

        // Nothing below awaits, so a cancelled cycle never leaves partial state.
        let timestamp = self.clock.now();
        let created = self.registry.observe(&raw);
        if !created.is_empty() {
            self.channels = Arc::new(
                self.registry
                    .known()
                    .map(|c| (c.id.clone(), c.clone()))
                    .collect(),
            );
        }

        let mut applied = 0;
        for reading in raw.readings(timestamp) {
            let Some(channel) = self.registry.get(&reading.channel_id) else {
                continue;
            };
            self.engine.update(channel, reading.raw_value, reading.timestamp);
            applied += 1;
        }

        // Channels missing from this payload keep their last values.
        let channels = self
            .registry
            .known()
            .filter_map(|c| self.engine.current(&c.id).map(|s| (c.id.clone(), s.clone())))
            .collect();
        self.snapshot = Arc::new(DeviceSnapshot {
            taken_at: timestamp,
            channels,
        });

        Ok(CycleReport {
            channels_created: created.len(),
            readings_applied: applied,
            fields_dropped: raw.warnings.len(),
        })
    }

    fn publish(&self) {
        self.publisher.send_replace(Arc::new(StationState {
            snapshot: self.snapshot.clone(),
            health: self.health.clone(),
            channels: self.channels.clone(),
        }));
    }

    /// Poll on a fixed interval until `shutdown` fires or its sender is dropped.
    ///
    /// The first tick is one interval from now. A cycle always finishes (or
    /// times out) before the next one is scheduled.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let period = self.config.poll_interval;
        let start = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
        let mut ticker = interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Polling {} every {}s",
            self.config.host,
            period.as_secs()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = self.poll() => {}
                    }
                }
            }
        }

        info!("Stopped polling {}", self.config.host);
    }
}

/// Consumer handle for one running station session.
///
/// Dropping the handle stops polling; [`SessionHandle::close`] does the same
/// and waits for the poll task to exit.
pub struct SessionHandle {
    host: String,
    state: watch::Receiver<Arc<StationState>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Validate the connection with a first poll, then start the timer loop.
    pub async fn start(
        config: StationConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConnectionError> {
        config.validate()?;
        let host = config.host.clone();
        let mut orchestrator = PollOrchestrator::new(config, transport, clock);

        let report = orchestrator.poll().await?;
        info!(
            "Connected to station {} with {} channels",
            host, report.channels_created
        );

        let state = orchestrator.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(orchestrator.run(shutdown_rx));

        Ok(Self {
            host,
            state,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> Arc<StationState> {
        self.state.borrow().clone()
    }

    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.state.borrow().snapshot.clone()
    }

    pub fn available(&self) -> bool {
        self.state.borrow().health.available
    }

    pub fn health(&self) -> ConnectionHealth {
        self.state.borrow().health.clone()
    }

    /// Every discovered channel, including ones disabled by default.
    pub fn channels(&self) -> Vec<Channel> {
        self.state.borrow().channels.values().cloned().collect()
    }

    pub fn channel(&self, id: &str) -> Option<Channel> {
        self.state.borrow().channels.get(id).cloned()
    }

    /// Wait for the next published cycle. Returns false once polling has stopped.
    pub async fn changed(&mut self) -> bool {
        self.state.changed().await.is_ok()
    }

    /// Stop polling. Any in-flight fetch is abandoned.
    pub async fn close(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Closed session for {}", self.host);
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Connect to the station at `host` with default settings.
pub async fn connect(host: &str) -> Result<SessionHandle, ConnectionError> {
    connect_with_config(StationConfig::new(host)).await
}

pub async fn connect_with_config(config: StationConfig) -> Result<SessionHandle, ConnectionError> {
    config.validate()?;
    let transport = HttpTransport::new(config.endpoint()?, config.timeout)
        .map_err(ConnectionError::CannotConnect)?;
    SessionHandle::start(config, Arc::new(transport), Arc::new(SystemClock)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::utils::ManualClock;
    use futures_util::future::BoxFuture;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use time::OffsetDateTime;

    /// Replays a script of responses, then keeps failing.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Vec<u8>, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    impl Transport for ScriptedTransport {
        fn fetch(&self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>> {
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Unreachable("script exhausted".into())));
            Box::pin(async move { next })
        }
    }

    /// Never answers; only the orchestrator's timeout ends the fetch.
    struct HangingTransport;

    impl Transport for HangingTransport {
        fn fetch(&self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>> {
            Box::pin(futures_util::future::pending())
        }
    }

    /// Answers once, then never again. Counts every fetch.
    struct StallingTransport {
        calls: AtomicUsize,
    }

    impl Transport for StallingTransport {
        fn fetch(&self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Box::pin(async { payload(5.0, false) })
            } else {
                Box::pin(futures_util::future::pending())
            }
        }
    }

    fn payload(pm25: f64, with_met: bool) -> Result<Vec<u8>, TransportError> {
        let mut body = json!({
            "pms": { "pms1": { "pm25": { "latest": pm25 }, "pm10": { "latest": pm25 * 2.0 } } }
        });
        if with_met {
            body["met"] = json!({ "temperature": 20.0 });
        }
        Ok(body.to_string().into_bytes())
    }

    fn unreachable() -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unreachable("connection refused".into()))
    }

    fn orchestrator(
        script: Vec<Result<Vec<u8>, TransportError>>,
    ) -> (PollOrchestrator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let config = StationConfig::new("10.0.0.7").with_window_size(3);
        (PollOrchestrator::new(config, ScriptedTransport::new(script), clock.clone()), clock)
    }

    #[tokio::test]
    async fn successful_cycle_publishes_snapshot() {
        let (mut orch, clock) = orchestrator(vec![payload(10.0, true)]);
        let rx = orch.subscribe();
        clock.advance(time::Duration::seconds(5));

        let report = orch.poll().await.unwrap();
        assert_eq!(report.channels_created, 3);
        assert_eq!(report.readings_applied, 3);

        let state = rx.borrow().clone();
        assert!(state.health.available);
        assert_eq!(state.channels.len(), 3);
        assert_eq!(state.snapshot.channels.len(), 3);
        assert_eq!(state.snapshot.taken_at.unix_timestamp(), 5);
        assert_eq!(state.snapshot.get("pm1_pm25").unwrap().latest, 10.0);
    }

    #[tokio::test]
    async fn unavailable_after_three_failures_and_recovers() {
        let (mut orch, _) = orchestrator(vec![
            payload(10.0, false),
            unreachable(),
            unreachable(),
            unreachable(),
            payload(20.0, false),
        ]);
        orch.poll().await.unwrap();

        assert!(orch.poll().await.is_err());
        assert!(orch.poll().await.is_err());
        assert!(orch.health().available);
        assert!(orch.poll().await.is_err());
        assert!(!orch.health().available);
        assert_eq!(orch.health().consecutive_failures, 3);
        // Stale data is kept while unavailable.
        assert_eq!(orch.snapshot().get("pm1_pm25").unwrap().latest, 10.0);

        orch.poll().await.unwrap();
        assert!(orch.health().available);
        assert_eq!(orch.health().consecutive_failures, 0);
        assert_eq!(orch.snapshot().get("pm1_pm25").unwrap().latest, 20.0);
    }

    #[tokio::test]
    async fn implausible_field_on_first_payload_still_becomes_a_channel() {
        let first = json!({
            "pms": { "pms1": { "pm25": { "latest": -1.0 }, "pm10": { "latest": 14.0 } } }
        });
        let (mut orch, _) = orchestrator(vec![
            Ok(first.to_string().into_bytes()),
            payload(6.0, false),
            payload(8.0, false),
        ]);

        let report = orch.poll().await.unwrap();
        assert_eq!(report.channels_created, 2);
        assert_eq!(report.fields_dropped, 1);
        assert!(orch.registry().contains("pm1_pm25"));
        assert!(orch.snapshot().get("pm1_pm25").is_none());

        orch.poll().await.unwrap();
        orch.poll().await.unwrap();
        assert_eq!(orch.registry().len(), 2);
        assert!(orch.registry().ignored().is_empty());

        let pm = orch.snapshot().get("pm1_pm25").cloned().unwrap();
        assert_eq!(pm.latest, 8.0);
        assert_eq!(pm.window.unwrap().samples, 2);
    }

    #[tokio::test]
    async fn malformed_payload_leaves_state_untouched() {
        let (mut orch, _) = orchestrator(vec![Ok(b"not json".to_vec()), payload(4.0, false)]);

        let err = orch.poll().await.unwrap_err();
        assert!(matches!(err, CycleError::Decode(_)));
        assert!(orch.registry().is_empty());
        assert!(orch.snapshot().channels.is_empty());
        assert_eq!(orch.health().consecutive_failures, 1);

        orch.poll().await.unwrap();
        assert_eq!(orch.registry().len(), 2);
    }

    #[tokio::test]
    async fn omitted_channels_keep_last_values() {
        let (mut orch, _) = orchestrator(vec![payload(10.0, true), payload(12.0, false)]);
        orch.poll().await.unwrap();
        orch.poll().await.unwrap();

        let snapshot = orch.snapshot();
        assert_eq!(snapshot.channels.len(), 3);
        assert_eq!(snapshot.get("temperature").unwrap().latest, 20.0);
        let pm = snapshot.get("pm1_pm25").unwrap();
        assert_eq!(pm.latest, 12.0);
        assert_eq!(pm.window.unwrap().mean, 11.0);
    }

    #[tokio::test]
    async fn channels_after_discovery_never_enter_snapshot() {
        let (mut orch, _) = orchestrator(vec![payload(10.0, false), payload(11.0, true)]);
        orch.poll().await.unwrap();
        let report = orch.poll().await.unwrap();

        assert_eq!(report.channels_created, 0);
        assert_eq!(report.readings_applied, 2);
        assert!(orch.snapshot().get("temperature").is_none());
        assert!(orch.snapshot().channels.keys().all(|id| orch.registry().contains(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_station_times_out() {
        let config = StationConfig::new("10.0.0.8").with_timeout(Duration::from_secs(2));
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let mut orch = PollOrchestrator::new(config, Arc::new(HangingTransport), clock);

        let err = orch.poll().await.unwrap_err();
        assert!(matches!(err, CycleError::Transport(TransportError::Unreachable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_drives_polls_until_closed() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let config = StationConfig::new("10.0.0.9")
            .with_poll_interval(Duration::from_secs(60))
            .with_smoothing_factor(0.5);
        let transport = ScriptedTransport::new(vec![payload(1.0, false), payload(3.0, false)]);

        let mut session = SessionHandle::start(config, transport, clock).await.unwrap();
        assert_eq!(session.snapshot().get("pm1_pm25").unwrap().latest, 1.0);
        assert_eq!(session.channels().len(), 2);

        assert!(session.changed().await);
        assert_eq!(session.snapshot().get("pm1_pm25").unwrap().latest, 3.0);
        assert_eq!(session.snapshot().get("pm1_pm25").unwrap().rolling, Some(2.0));

        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_abandons_in_flight_fetch() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let config = StationConfig::new("10.0.0.11")
            .with_poll_interval(Duration::from_secs(60))
            .with_timeout(Duration::from_secs(90));
        let transport = Arc::new(StallingTransport {
            calls: AtomicUsize::new(0),
        });

        let session = SessionHandle::start(config, transport.clone(), clock).await.unwrap();
        let before = session.snapshot();

        // First timer tick fires; its fetch hangs until the 90s timeout.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        let state = session.state();
        tokio::time::timeout(Duration::from_secs(1), session.close())
            .await
            .expect("close waited on the in-flight fetch");

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&state.snapshot, &before));
        assert_eq!(state.health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn connect_rejects_overflowing_interval() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let config =
            StationConfig::new("10.0.0.12").with_poll_interval(Duration::from_secs(u64::MAX));
        let transport = ScriptedTransport::new(vec![payload(1.0, false)]);

        let result = SessionHandle::start(config, transport, clock).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Config(ConfigError::TooLong("poll interval")))
        ));
    }

    #[tokio::test]
    async fn connect_fails_on_unreachable_station() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let result = SessionHandle::start(
            StationConfig::new("10.0.0.10"),
            ScriptedTransport::new(vec![unreachable()]),
            clock,
        )
        .await;
        assert!(matches!(result, Err(ConnectionError::CannotConnect(_))));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_host() {
        assert!(matches!(connect("").await, Err(ConnectionError::Config(_))));
    }
}
