//! Core B.3 — the tick-driven CAN scheduler. Recomputes the
//! CVL once per tick, then walks [`encoders::CHANNEL_TABLE`] in order,
//! transmitting every frame whose period has elapsed. A frame-payload cache
//! suppresses repeat transmissions of unchanged data; a circuit breaker and
//! a token bucket protect the bus and the controller from a wedged peer.
//!
//! The keepalive (0x305) and the Victron handshake dialogue (0x307 RX) are
//! handled outside the channel table — they drive peer presence, which the
//! 0x35A encoder and `Event::CanStatus` both need.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Ticker};

use core::hash::Hasher;

use crate::bus::{Event, EventBus};
use crate::config::{CanConfig, CvlConfig};
use crate::cvl::{CvlController, CvlState};
use crate::energy::EnergyCounters;
use crate::error::GatewayError;
use crate::model::{Identity, LiveData};
use crate::registers::RegisterCache;

use super::encoders::{self, CHANNEL_TABLE};
use super::frame::CanFrame;
use super::port::CanPort;

const CHANNEL_COUNT: usize = CHANNEL_TABLE.len();
const IDENTITY_REFRESH_MS: u64 = 5_000;

fn fnv1a_hash(id: u16, data: &[u8]) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(&id.to_le_bytes());
    hasher.write(data);
    hasher.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// CLOSED/OPEN/HALF_OPEN transmit guard. Consecutive
/// transmit failures open the breaker; after `open_duration_ms` it samples
/// one trial send at a time until `half_open_successes` consecutive
/// successes close it again.
struct Breaker {
    state: BreakerState,
    consecutive_failures: u8,
    half_open_successes: u8,
    opened_at: Instant,
    failure_threshold: u8,
    open_duration: Duration,
    required_half_open_successes: u8,
}

impl Breaker {
    fn new(cfg: &CanConfig, now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: now,
            failure_threshold: cfg.breaker_failure_threshold,
            open_duration: Duration::from_millis(cfg.breaker_open_duration_ms as u64),
            required_half_open_successes: cfg.breaker_half_open_successes,
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open)
    }

    /// Whether a transmit attempt may proceed right now. Transitions
    /// `Open` -> `HalfOpen` in place once the open duration has elapsed.
    fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if now - self.opened_at >= self.open_duration {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.required_half_open_successes {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Returns `true` if this failure just opened (or re-opened) the
    /// breaker, so the caller publishes `CanBusError` exactly once per
    /// transition rather than once per failed frame.
    fn record_failure(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = now;
                    return true;
                }
                false
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = now;
                self.consecutive_failures = self.failure_threshold;
                true
            }
            BreakerState::Open => false,
        }
    }
}

/// A simple refill-by-elapsed-time token bucket guarding the transmit rate.
struct TokenBucket {
    capacity: u32,
    tokens: u32,
    last_refill: Instant,
    refill_interval: Duration,
}

impl TokenBucket {
    fn new(cfg: &CanConfig, now: Instant) -> Self {
        Self {
            capacity: cfg.bucket_capacity,
            tokens: cfg.bucket_capacity,
            last_refill: now,
            refill_interval: Duration::from_millis(cfg.bucket_refill_interval_ms.max(1) as u64),
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        let elapsed_ticks = (now - self.last_refill).as_ticks();
        let interval_ticks = self.refill_interval.as_ticks().max(1);
        let steps = elapsed_ticks / interval_ticks;
        if steps > 0 {
            self.tokens = self.tokens.saturating_add(steps as u32).min(self.capacity);
            self.last_refill += Duration::from_ticks(interval_ticks * steps);
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

struct PublisherState {
    next_due: [Instant; CHANNEL_COUNT],
    last_hash: [Option<u64>; CHANNEL_COUNT],
    peer_connected: bool,
    last_handshake_rx: Option<Instant>,
    keepalive_next_due: Instant,
    identity: Option<Identity>,
    identity_next_due: Instant,
    last_cvl_state: Option<CvlState>,
    breaker: Breaker,
    bucket: TokenBucket,
    channel_metrics: [ChannelMetrics; CHANNEL_COUNT],
    rx_frames_total: u32,
    rx_bytes_total: u32,
    latency_sum_us: u64,
    latency_count: u32,
    latency_max_us: u32,
}

/// Per-tick outcome counters, surfaced for diagnostics/tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublisherMetrics {
    pub transmitted: u32,
    pub suppressed_unchanged: u32,
    pub rate_limited: u32,
    pub breaker_rejected: u32,
}

/// Cumulative transmit outcome counters for one channel, tracked across the
/// publisher's whole lifetime rather than reset every tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelMetrics {
    pub transmitted: u32,
    pub suppressed_unchanged: u32,
    pub rate_limited: u32,
    pub failed: u32,
}

/// The `get_can_metrics` external accessor: cumulative per-channel counters,
/// transmit latency (encode through `CanPort::transmit` returning), and
/// received-frame totals, all accumulated since the publisher was built.
#[derive(Debug, Clone, Copy)]
pub struct CanMetrics {
    pub channels: [ChannelMetrics; CHANNEL_COUNT],
    pub latency_avg_us: u32,
    pub latency_max_us: u32,
    pub rx_frames_total: u32,
    pub rx_bytes_total: u32,
}

pub struct CanPublisher<'a> {
    cache: &'a RegisterCache,
    bus: &'a EventBus,
    can_cfg: CanConfig,
    cvl: Mutex<CriticalSectionRawMutex, CvlController>,
    state: Mutex<CriticalSectionRawMutex, PublisherState>,
}

impl<'a> CanPublisher<'a> {
    pub fn new(cache: &'a RegisterCache, bus: &'a EventBus, can_cfg: CanConfig, cvl_cfg: CvlConfig, now: Instant) -> Self {
        Self {
            cache,
            bus,
            can_cfg,
            cvl: Mutex::new(CvlController::new(cvl_cfg)),
            state: Mutex::new(PublisherState {
                next_due: [now; CHANNEL_COUNT],
                last_hash: [None; CHANNEL_COUNT],
                peer_connected: false,
                last_handshake_rx: None,
                keepalive_next_due: now,
                identity: None,
                identity_next_due: now,
                last_cvl_state: None,
                breaker: Breaker::new(&can_cfg, now),
                bucket: TokenBucket::new(&can_cfg, now),
                channel_metrics: [ChannelMetrics::default(); CHANNEL_COUNT],
                rx_frames_total: 0,
                rx_bytes_total: 0,
                latency_sum_us: 0,
                latency_count: 0,
                latency_max_us: 0,
            }),
        }
    }

    pub async fn cvl_output(&self) -> crate::cvl::CvlOutput {
        self.cvl.lock().await.last_output()
    }

    /// The `get_can_metrics` external accessor (§6): cumulative per-channel
    /// transmit outcomes, transmit latency, and received-frame totals since
    /// this publisher was constructed.
    pub async fn get_can_metrics(&self) -> CanMetrics {
        let st = self.state.lock().await;
        CanMetrics {
            channels: st.channel_metrics,
            latency_avg_us: if st.latency_count > 0 {
                (st.latency_sum_us / st.latency_count as u64) as u32
            } else {
                0
            },
            latency_max_us: st.latency_max_us,
            rx_frames_total: st.rx_frames_total,
            rx_bytes_total: st.rx_bytes_total,
        }
    }

    /// The `set_cvl_config` command surface: validates and
    /// applies the new configuration to the live controller, then persists
    /// it so it survives a reboot. Applying before persisting means a
    /// `PersistenceFailure` still leaves the running controller on the new
    /// config; persistence failures are logged-and-retried, not a reason to
    /// roll back behavior that already validated clean.
    pub async fn set_cvl_config(&self, cfg: CvlConfig, store: &dyn crate::storage::KvStore) -> Result<(), GatewayError> {
        self.cvl.lock().await.set_config(cfg)?;
        crate::config::persist_cvl_config(store, cfg).await
    }

    fn encode(&self, id: u16, live: &LiveData, cvl: &crate::cvl::CvlOutput, energy: &EnergyCounters, identity: &Identity, cvl_cfg: &CvlConfig, peer_connected: bool) -> [u8; 8] {
        match id {
            0x351 => encoders::encode_0x351(cvl),
            0x355 => encoders::encode_0x355(live),
            0x356 => encoders::encode_0x356(live),
            0x35A => encoders::encode_0x35a(live, cvl_cfg, &self.can_cfg, cvl, peer_connected),
            0x35E => encoders::encode_0x35e(),
            0x35F => encoders::encode_0x35f(identity),
            0x370 => encoders::encode_0x370(),
            0x371 => encoders::encode_0x371(),
            0x372 => encoders::encode_0x372(live, cvl),
            0x373 => encoders::encode_0x373(live),
            0x374 => encoders::encode_0x374(live),
            0x375 => encoders::encode_0x375(live),
            0x376 => encoders::encode_0x376(live),
            0x377 => encoders::encode_0x377(live),
            0x378 => encoders::encode_0x378(energy),
            0x379 => encoders::encode_0x379(identity),
            0x380 => encoders::encode_0x380(identity),
            0x381 => encoders::encode_0x381(identity),
            0x382 => encoders::encode_0x382(identity),
            _ => [0u8; 8],
        }
    }

    /// Drains at most one received frame and updates the handshake/peer
    /// presence state (bytes 4–6 of a 0x307 frame == "VIC").
    async fn poll_handshake<P: CanPort>(&self, port: &mut P, now: Instant) {
        if let Ok(Some(frame)) = port.receive().await {
            let mut st = self.state.lock().await;
            st.rx_frames_total += 1;
            st.rx_bytes_total += frame.dlc as u32;
            if frame.id == encoders::HANDSHAKE_RX_ID && encoders::is_victron_handshake(&frame.data) {
                st.last_handshake_rx = Some(now);
                if !st.peer_connected {
                    st.peer_connected = true;
                    drop(st);
                    self.bus.publish(Event::CanPeerConnected).await;
                }
            }
        }

        let mut st = self.state.lock().await;
        if st.peer_connected {
            let timeout = Duration::from_millis(self.can_cfg.keepalive_timeout_ms as u64);
            let timed_out = st.last_handshake_rx.map(|t| now - t >= timeout).unwrap_or(true);
            if timed_out {
                st.peer_connected = false;
                drop(st);
                self.bus.publish(Event::CanPeerDisconnected).await;
            }
        }
    }

    /// `channel_index` is the frame's slot in [`CHANNEL_TABLE`], or `None`
    /// for the keepalive frame, which isn't part of the table; it's only
    /// used to attribute the cumulative per-channel counters in
    /// [`CanMetrics`].
    async fn try_transmit<P: CanPort>(
        &self,
        port: &mut P,
        frame: CanFrame,
        now: Instant,
        channel_index: Option<usize>,
    ) -> Result<(), GatewayError> {
        let mut st = self.state.lock().await;
        if !st.breaker.allow(now) {
            if let Some(i) = channel_index {
                st.channel_metrics[i].failed += 1;
            }
            return Err(GatewayError::Unavailable);
        }
        if !st.bucket.try_consume(now) {
            if let Some(i) = channel_index {
                st.channel_metrics[i].rate_limited += 1;
            }
            return Err(GatewayError::RateLimited);
        }
        drop(st);

        let started_at = Instant::now();
        match port.transmit(&frame).await {
            Ok(()) => {
                let elapsed_us = (Instant::now() - started_at).as_micros() as u32;
                let mut st = self.state.lock().await;
                st.breaker.record_success();
                if let Some(i) = channel_index {
                    st.channel_metrics[i].transmitted += 1;
                }
                st.latency_sum_us += elapsed_us as u64;
                st.latency_count += 1;
                st.latency_max_us = st.latency_max_us.max(elapsed_us);
                drop(st);
                self.bus
                    .publish(Event::CanFrameTransmitted { id: frame.id, dlc: frame.dlc })
                    .await;
                Ok(())
            }
            Err(_) => {
                let mut st = self.state.lock().await;
                let just_opened = st.breaker.record_failure(now);
                if let Some(i) = channel_index {
                    st.channel_metrics[i].failed += 1;
                }
                drop(st);
                if just_opened {
                    self.bus.publish(Event::CanBusError).await;
                }
                Err(GatewayError::Unavailable)
            }
        }
    }

    /// Runs one scheduler step: handshake poll, CVL recompute (before any
    /// 0x351-dependent frame is encoded), then every channel whose period
    /// has elapsed, in table order (ties broken by table order).
    pub async fn tick<P: CanPort>(&self, now: Instant, port: &mut P, energy: EnergyCounters) -> PublisherMetrics {
        let mut metrics = PublisherMetrics::default();

        self.poll_handshake(port, now).await;

        if now >= self.state.lock().await.keepalive_next_due {
            let frame = CanFrame::full(encoders::KEEPALIVE_ID, encoders::encode_keepalive());
            let _ = self.try_transmit(port, frame, now, None).await;
            let mut st = self.state.lock().await;
            st.keepalive_next_due = now + Duration::from_millis(self.can_cfg.keepalive_interval_ms as u64);
        }

        let live = LiveData::from_cache(self.cache).await;
        let cvl_output = {
            let mut cvl = self.cvl.lock().await;
            cvl.tick(&live)
        };
        let cvl_cfg = self.cvl.lock().await.config();

        {
            let mut st = self.state.lock().await;
            let changed = st.last_cvl_state != Some(cvl_output.state);
            st.last_cvl_state = Some(cvl_output.state);
            drop(st);
            if changed {
                self.bus.publish(Event::CvlStateChanged { state: cvl_output.state }).await;
            }
        }
        self.bus
            .publish(Event::CvlLimitsUpdated {
                cvl_v: cvl_output.cvl_v,
                ccl_a: cvl_output.ccl_a,
                dcl_a: cvl_output.dcl_a,
            })
            .await;

        {
            let mut st = self.state.lock().await;
            if st.identity.is_none() || now >= st.identity_next_due {
                drop(st);
                let identity = Identity::from_cache(self.cache).await;
                let mut st = self.state.lock().await;
                st.identity = Some(identity);
                st.identity_next_due = now + Duration::from_millis(IDENTITY_REFRESH_MS);
            }
        }
        let identity = self.state.lock().await.identity.unwrap_or(Identity {
            serial: [0u8; 16],
            family: [0u8; 8],
            fw_version: 0,
            capacity_ah: 0.0,
        });

        let peer_connected = self.state.lock().await.peer_connected;

        for (i, spec) in CHANNEL_TABLE.iter().enumerate() {
            let due = self.state.lock().await.next_due[i];
            if now < due {
                continue;
            }
            if self.state.lock().await.breaker.is_open() {
                metrics.breaker_rejected += 1;
                let mut st = self.state.lock().await;
                st.channel_metrics[i].failed += 1;
                continue;
            }

            let payload = self.encode(spec.id, &live, &cvl_output, &energy, &identity, &cvl_cfg, peer_connected);

            if spec.cacheable {
                let hash = fnv1a_hash(spec.id, &payload);
                let unchanged = self.state.lock().await.last_hash[i] == Some(hash);
                if unchanged {
                    metrics.suppressed_unchanged += 1;
                    let mut st = self.state.lock().await;
                    st.next_due[i] = now + Duration::from_millis(spec.period_ms as u64);
                    st.channel_metrics[i].suppressed_unchanged += 1;
                    continue;
                }
                let mut st = self.state.lock().await;
                st.last_hash[i] = Some(hash);
            }

            let frame = CanFrame::full(spec.id, payload);
            match self.try_transmit(port, frame, now, Some(i)).await {
                Ok(()) => {
                    metrics.transmitted += 1;
                    let mut st = self.state.lock().await;
                    st.next_due[i] = now + Duration::from_millis(spec.period_ms as u64);
                }
                Err(GatewayError::RateLimited) => {
                    metrics.rate_limited += 1;
                }
                Err(_) => {
                    metrics.breaker_rejected += 1;
                }
            }
        }

        let breaker_open = self.state.lock().await.breaker.is_open();
        self.bus
            .publish(Event::CanStatus { peer_connected, breaker_open })
            .await;

        metrics
    }

    /// Runs the scheduler forever at `scheduler_resolution_ms` granularity.
    /// `energy` is sampled fresh every tick so 0x378 always reflects the
    /// latest persisted-or-in-memory counters.
    pub async fn run_publish_loop<P: CanPort>(&self, port: &mut P, energy: &crate::energy::EnergyAccumulator<'_>) -> ! {
        let mut ticker = Ticker::every(Duration::from_millis(self.can_cfg.scheduler_resolution_ms as u64));
        loop {
            ticker.next().await;
            let now = Instant::now();
            let snapshot = energy.snapshot().await;
            self.tick(now, port, snapshot).await;
        }
    }
}
