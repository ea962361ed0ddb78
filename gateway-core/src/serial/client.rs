//! Core A.2 — owns the UART, serializes one request at a time, retries on
//! transient failure, and drives the steady poll loop that keeps the
//! register cache and the `LiveData` snapshot current.

use byteorder::{ByteOrder, LittleEndian};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{with_timeout, Duration, Instant, Timer};
use heapless::Vec as HVec;

use crate::bus::{Event, EventBus};
use crate::config::SerialConfig;
use crate::error::GatewayError;
use crate::model::LiveData;
use crate::registers::{addr, RawValue, RegisterCache};

use super::codec::{self, ParsedFrame};
use super::port::UartPort;

/// Outcome of one completed, CRC-valid round trip, with the payload copied
/// out of the scratch read buffer so callers don't fight its lifetime.
enum RawOutcome {
    Ack,
    Data(HVec<u8, 64>),
}

struct ClientState {
    last_activity: Instant,
    consecutive_failed_sweeps: u8,
    online: bool,
    last_live: Option<LiveData>,
}

/// Owns one UART and the poll loop. Generic over the platform's UART driver
/// so this crate never depends on a concrete MCU. `&self` methods are safe
/// to call concurrently: exactly one call reaches the port at a time via
/// the internal mutex, and every other caller waits or times out rather
/// than the device ever being accessed from two tasks at once.
pub struct SerialClient<'a, U: UartPort> {
    port: Mutex<CriticalSectionRawMutex, U>,
    state: Mutex<CriticalSectionRawMutex, ClientState>,
    cfg: SerialConfig,
    cache: &'a RegisterCache,
    bus: &'a EventBus,
}

struct ReadBuf {
    data: [u8; codec::MAX_FRAME * 2],
    len: usize,
}

impl ReadBuf {
    fn new() -> Self {
        Self {
            data: [0u8; codec::MAX_FRAME * 2],
            len: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let space = self.data.len() - self.len;
        let n = chunk.len().min(space);
        self.data[self.len..self.len + n].copy_from_slice(&chunk[..n]);
        self.len += n;
    }
}

/// Quiet period after which the first request to the device may be
/// swallowed to wake it.
const WAKE_QUIET_PERIOD_MS: u64 = 2_000;

impl<'a, U: UartPort> SerialClient<'a, U> {
    pub fn new(port: U, cfg: SerialConfig, cache: &'a RegisterCache, bus: &'a EventBus) -> Self {
        Self {
            port: Mutex::new(port),
            state: Mutex::new(ClientState {
                last_activity: Instant::now(),
                consecutive_failed_sweeps: 0,
                online: true,
                last_live: None,
            }),
            cfg,
            cache,
            bus,
        }
    }

    /// One request/response attempt: acquire the port, write, and read
    /// until a complete frame parses, a NACK arrives, or the per-request
    /// deadline expires. No retry logic lives here.
    async fn raw_transact(&self, request: &[u8]) -> Result<RawOutcome, GatewayError> {
        let guard = with_timeout(
            Duration::from_millis(self.cfg.queue_mutex_timeout_ms as u64),
            self.port.lock(),
        )
        .await
        .map_err(|_| GatewayError::Timeout)?;
        let mut port = guard;

        if self.cfg.flush_before_read {
            let _ = port.flush_rx().await;
        }
        port.write(request).await.map_err(|_| GatewayError::BadFrame)?;

        let mut rx = ReadBuf::new();
        let deadline = Instant::now() + Duration::from_millis(self.cfg.request_deadline_ms as u64);
        let mut chunk = [0u8; 64];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(GatewayError::Timeout);
            }
            let remaining = deadline - now;
            let window = Duration::from_millis(self.cfg.read_chunk_ms as u64).min(remaining);
            match with_timeout(window, port.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => continue,
                Ok(Err(_)) => return Err(GatewayError::BadFrame),
                Ok(Ok(n)) => {
                    rx.push(&chunk[..n]);
                    match codec::parse_response(&rx.data[..rx.len]) {
                        Ok((ParsedFrame::Ack { .. }, _)) => return Ok(RawOutcome::Ack),
                        Ok((ParsedFrame::Nack { code }, _)) => return Err(GatewayError::Nack(code)),
                        Ok((ParsedFrame::Data { payload, .. }, _)) => {
                            let mut out = HVec::new();
                            let _ = out.extend_from_slice(payload);
                            return Ok(RawOutcome::Data(out));
                        }
                        Err(GatewayError::BadFrame) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Retries `raw_transact` with exponential backoff on
    /// timeout/bad-frame/CRC, no retry on NACK, and — if the link has been
    /// quiet for a while — one extra immediate repeat of the first request
    /// before it counts against the retry budget at all, since the device
    /// is documented to swallow the frame that wakes it.
    async fn transact(&self, request: &[u8]) -> Result<RawOutcome, GatewayError> {
        let was_quiet = {
            let state = self.state.lock().await;
            Instant::now() - state.last_activity > Duration::from_millis(WAKE_QUIET_PERIOD_MS)
        };

        if was_quiet {
            if let Ok(outcome) = self.raw_transact(request).await {
                self.state.lock().await.last_activity = Instant::now();
                return Ok(outcome);
            }
            // Swallowed to wake the device; fall through to the normal
            // retry loop without consuming one of its attempts.
        }

        let mut last_err = GatewayError::Timeout;
        for attempt in 0..=self.cfg.max_retries {
            match self.raw_transact(request).await {
                Ok(outcome) => {
                    self.state.lock().await.last_activity = Instant::now();
                    return Ok(outcome);
                }
                Err(GatewayError::Nack(code)) => return Err(GatewayError::Nack(code)),
                Err(e) => {
                    last_err = e;
                    if attempt < self.cfg.max_retries {
                        let backoff = self.cfg.backoff_steps_ms[(attempt as usize).min(2)];
                        Timer::after(Duration::from_millis(backoff as u64)).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Reads one register block and returns its raw little-endian payload
    /// bytes.
    pub async fn read_block(&self, start_addr: u16, count: u8) -> Result<HVec<u8, 64>, GatewayError> {
        let request = codec::build_read_block(start_addr, count);
        match self.transact(&request).await? {
            RawOutcome::Data(payload) => Ok(payload),
            RawOutcome::Ack => Ok(HVec::new()),
        }
    }

    /// Writes one register and confirms the new value with a follow-up
    /// read: writes are never retried after a clean ACK, but the verified
    /// readback is always what's reported to the caller.
    pub async fn write_register(&self, addr: u16, value: u16) -> Result<u16, GatewayError> {
        let request = codec::build_write_individual(addr, value);
        self.transact(&request).await?;

        let readback = self.read_block(addr, 1).await?;
        if readback.len() < 2 {
            return Err(GatewayError::BadFrame);
        }
        let verified = LittleEndian::read_u16(&readback[0..2]);
        self.cache
            .put(addr, RawValue::U16(verified), Instant::now())
            .await;
        Ok(verified)
    }

    /// Issues the reset/clear command and waits for its ACK.
    pub async fn reset(&self, option: codec::ResetOption) -> Result<(), GatewayError> {
        let request = codec::build_reset(option);
        self.transact(&request).await?;
        Ok(())
    }

    /// One full sweep over the documented poll set: each
    /// successful read updates the cache and publishes
    /// `BmsRegisterUpdated`; a full sweep also rebuilds and publishes a
    /// `LiveData` snapshot. A single bad register does not abort the
    /// sweep; the sweep only fails if every register in it failed.
    pub async fn poll_sweep(&self) -> Result<LiveData, GatewayError> {
        let mut any_ok = false;
        for &register in addr::POLL_SET.iter() {
            // SOC is stored as parts-per-million and needs the full 32 bits;
            // every other polled register fits in one 16-bit word.
            let width: u8 = if register == addr::SOC_PPM { 2 } else { 1 };
            if let Ok(payload) = self.read_block(register, width).await {
                let (raw, value_for_event) = if width == 2 && payload.len() >= 4 {
                    let raw = LittleEndian::read_u32(&payload[0..4]);
                    (RawValue::U32(raw), raw as u16)
                } else if payload.len() >= 2 {
                    let raw = LittleEndian::read_u16(&payload[0..2]);
                    (RawValue::U16(raw), raw)
                } else {
                    continue;
                };
                let now = Instant::now();
                self.cache.put(register, raw, now).await;
                any_ok = true;
                self.bus
                    .publish(Event::BmsRegisterUpdated {
                        addr: register,
                        value: value_for_event,
                    })
                    .await;
            }
        }

        let mut state = self.state.lock().await;
        if any_ok {
            state.consecutive_failed_sweeps = 0;
            if !state.online {
                state.online = true;
                drop(state);
                self.bus.publish(Event::BmsOnline).await;
            }
        } else {
            state.consecutive_failed_sweeps = state.consecutive_failed_sweeps.saturating_add(1);
            let should_go_offline =
                state.online && state.consecutive_failed_sweeps >= self.cfg.offline_after_failed_sweeps;
            if should_go_offline {
                state.online = false;
            }
            drop(state);
            if should_go_offline {
                self.bus.publish(Event::BmsOffline).await;
            }
            return Err(GatewayError::Timeout);
        }

        let live = LiveData::from_cache(self.cache).await;
        self.state.lock().await.last_live = Some(live);
        self.bus.publish(Event::BmsLiveData(live)).await;
        Ok(live)
    }

    /// Returns the `LiveData` snapshot built by the most recently completed
    /// sweep without locking the register cache, for the external
    /// last-known-state accessor. `None` until the first sweep completes.
    pub async fn get_live_data(&self) -> Option<LiveData> {
        self.state.lock().await.last_live
    }

    /// Reads the identity registers (serial number, family, firmware
    /// version) into the cache. These aren't part of `addr::POLL_SET` —
    /// they change essentially never, so [`run_poll_loop`](Self::run_poll_loop)
    /// only calls this occasionally rather than every tick.
    pub async fn poll_identity(&self) -> Result<(), GatewayError> {
        let now = Instant::now();
        let serial = self.read_block(addr::SERIAL_NUMBER_BASE, 8).await?;
        for (i, word) in serial.chunks_exact(2).enumerate() {
            self.cache
                .put(addr::SERIAL_NUMBER_BASE + i as u16, RawValue::U16(LittleEndian::read_u16(word)), now)
                .await;
        }
        let family = self.read_block(addr::FAMILY_BASE, 4).await?;
        for (i, word) in family.chunks_exact(2).enumerate() {
            self.cache
                .put(addr::FAMILY_BASE + i as u16, RawValue::U16(LittleEndian::read_u16(word)), now)
                .await;
        }
        let fw = self.read_block(addr::FW_VERSION, 1).await?;
        if fw.len() >= 2 {
            self.cache
                .put(addr::FW_VERSION, RawValue::U16(LittleEndian::read_u16(&fw[0..2])), now)
                .await;
        }
        Ok(())
    }

    /// Runs the steady poll tick forever. Intended to be spawned as the
    /// long-lived serial task. Every
    /// `IDENTITY_REFRESH_EVERY_N_SWEEPS` ticks it also refreshes the
    /// identity registers, starting with the very first tick so the CAN
    /// identification frames have real data as soon as possible.
    pub async fn run_poll_loop(&self) -> ! {
        const IDENTITY_REFRESH_EVERY_N_SWEEPS: u32 = 20;
        let mut sweep_count: u32 = 0;
        loop {
            let tick_start = Instant::now();
            if self.poll_sweep().await.is_err() {
                self.bus
                    .publish(Event::SerialCommError {
                        error: GatewayError::Timeout,
                    })
                    .await;
            }
            if sweep_count % IDENTITY_REFRESH_EVERY_N_SWEEPS == 0 {
                let _ = self.poll_identity().await;
            }
            sweep_count = sweep_count.wrapping_add(1);
            let elapsed = Instant::now() - tick_start;
            let period = Duration::from_millis(self.cfg.poll_tick_ms as u64);
            if elapsed < period {
                Timer::after(period - elapsed).await;
            }
        }
    }
}
