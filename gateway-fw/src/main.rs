//! Demo/desktop wiring: spawns the serial client, CAN publisher and
//! energy-persistence tasks over loopback drivers so the whole gateway can
//! run and be watched without any real TinyBMS or CAN hardware attached.
//! A board port replaces [`LoopbackUart`]/[`LoopbackCan`] with real drivers
//! and otherwise reuses this wiring unchanged.

use byteorder::{ByteOrder, LittleEndian};
use embassy_executor::Spawner;
use embassy_time::{Duration, Timer};
use static_cell::StaticCell;

use gateway_core::bus::{EventBus, EventFilter, Received};
use gateway_core::can::port::CanPort;
use gateway_core::can::{CanFrame, CanPublisher};
use gateway_core::config::GatewayConfig;
use gateway_core::energy::EnergyAccumulator;
use gateway_core::registers::{addr, RegisterCache};
use gateway_core::serial::client::SerialClient;
use gateway_core::serial::codec;
use gateway_core::serial::port::UartPort;
use gateway_core::storage::InMemoryKvStore;

/// A fixed demo battery: the values a TinyBMS at roughly 80% SOC, balanced,
/// room temperature would report. Good enough to drive the CVL state
/// machine and every CAN encoder through their ordinary paths.
fn synthetic_word(addr: u16) -> u16 {
    const SERIAL_TEXT: &[u8; 16] = b"ENPQ-DEMO-000001";
    const FAMILY_TEXT: &[u8; 8] = b"TinyBMS1";

    let ascii_word = |pair: [u8; 2]| -> u16 { pair[0] as u16 | (pair[1] as u16) << 8 };

    if (addr::SERIAL_NUMBER_BASE..addr::SERIAL_NUMBER_BASE + 8).contains(&addr) {
        let i = ((addr - addr::SERIAL_NUMBER_BASE) * 2) as usize;
        return ascii_word([SERIAL_TEXT[i], SERIAL_TEXT[i + 1]]);
    }
    if (addr::FAMILY_BASE..addr::FAMILY_BASE + 4).contains(&addr) {
        let i = ((addr - addr::FAMILY_BASE) * 2) as usize;
        return ascii_word([FAMILY_TEXT[i], FAMILY_TEXT[i + 1]]);
    }
    if (addr::CELL_VOLTAGE_BASE..addr::CELL_VOLTAGE_BASE + 16).contains(&addr) {
        return 3280 + (addr - addr::CELL_VOLTAGE_BASE);
    }
    match addr {
        addr::PACK_VOLTAGE => 5440,               // 54.40 V
        addr::PACK_CURRENT => 100,                 // +10.0 A, charging
        addr::SOH_PCT => 9800,                     // 98.00 %
        addr::TEMP_INTERNAL => 235,                // 23.5 C
        addr::TEMP_EXTERNAL_1 | addr::TEMP_EXTERNAL_2 => 0x8000, // sensor absent
        addr::MIN_CELL_VOLTAGE => 3280,
        addr::MAX_CELL_VOLTAGE => 3296,
        addr::ONLINE_STATUS => 1,
        addr::CCL_BASE | addr::DCL_BASE => 500,    // 50.0 A
        addr::CAPACITY_AH => 10000,                // 100.00 Ah
        addr::SERIES_CELLS => 16,
        addr::FW_VERSION => 0x0105,
        _ => 0,
    }
}

/// `SOC_PPM` is the one polled register wider than 16 bits; `synthetic_word`
/// only hands back one word at a time, so the loopback response builder asks
/// for both halves of an 80% state of charge here instead.
fn synthetic_soc_words(word_index: u16) -> u16 {
    let ppm: u32 = 800_000;
    if word_index == 0 {
        (ppm & 0xFFFF) as u16
    } else {
        (ppm >> 16) as u16
    }
}

fn build_response(request: &[u8]) -> heapless::Vec<u8, 48> {
    let mut out = heapless::Vec::new();
    if request.len() < 5 || request[0] != codec::PREAMBLE {
        return out;
    }
    let cmd = request[1];

    if cmd == codec::Command::ReadBlock as u8 {
        let start_addr = LittleEndian::read_u16(&request[2..4]);
        let count = request[4] as usize;
        let mut payload = heapless::Vec::<u8, 32>::new();
        for i in 0..count {
            let word = if start_addr == addr::SOC_PPM {
                synthetic_soc_words(i as u16)
            } else {
                synthetic_word(start_addr + i as u16)
            };
            let _ = payload.extend_from_slice(&word.to_le_bytes());
        }
        let _ = out.push(codec::PREAMBLE);
        let _ = out.push(cmd);
        let _ = out.push(payload.len() as u8);
        let _ = out.extend_from_slice(&payload);
        let crc = crc16::State::<crc16::MODBUS>::calculate(&out);
        let _ = out.push((crc & 0xFF) as u8);
        let _ = out.push((crc >> 8) as u8);
        return out;
    }

    // Anything this demo doesn't specifically script (resets, single-register
    // writes) is just acknowledged so the caller's retry logic never trips.
    let _ = out.push(codec::PREAMBLE);
    let _ = out.push(0x01);
    let _ = out.push(cmd);
    let crc = crc16::State::<crc16::MODBUS>::calculate(&out);
    let _ = out.push((crc & 0xFF) as u8);
    let _ = out.push((crc >> 8) as u8);
    out
}

/// Hands back a scripted response to the most recent request; there is no
/// real device on the other end of this "wire".
struct LoopbackUart {
    pending: heapless::Vec<u8, 48>,
    delivered: bool,
}

impl LoopbackUart {
    fn new() -> Self {
        Self {
            pending: heapless::Vec::new(),
            delivered: true,
        }
    }
}

impl UartPort for LoopbackUart {
    type Error = ();

    async fn write(&mut self, data: &[u8]) -> Result<(), ()> {
        self.pending = build_response(data);
        self.delivered = false;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ()> {
        if self.delivered || self.pending.is_empty() {
            return Ok(0);
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.delivered = true;
        Ok(n)
    }

    async fn flush_rx(&mut self) -> Result<(), ()> {
        Ok(())
    }
}

/// Logs every transmitted frame and always answers a receive poll with a
/// Victron handshake, simulating a GX device that's already paired and
/// never drops off the bus.
struct LoopbackCan;

impl CanPort for LoopbackCan {
    type Error = ();

    async fn transmit(&mut self, frame: &CanFrame) -> Result<(), ()> {
        log::debug!(
            "can tx id={:#05x} dlc={} data={:02x?}",
            frame.id,
            frame.dlc,
            &frame.data[..frame.dlc as usize]
        );
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<CanFrame>, ()> {
        let mut data = [0u8; 8];
        data[4..7].copy_from_slice(b"VIC");
        Ok(Some(CanFrame::full(
            gateway_core::can::encoders::HANDSHAKE_RX_ID,
            data,
        )))
    }
}

async fn log_events(bus: &'static EventBus) -> ! {
    let handle = bus.subscribe("diagnostics", EventFilter::all(), 64).await;
    loop {
        match bus.receive(handle, Duration::from_secs(1)).await {
            Received::Event(event) => log::info!("{:?}", event),
            Received::Timeout => {}
            Received::Closed => Timer::after(Duration::from_secs(1)).await,
        }
    }
}

#[embassy_executor::task]
async fn serial_task(client: &'static SerialClient<'static, LoopbackUart>) {
    client.run_poll_loop().await;
}

#[embassy_executor::task]
async fn can_task(
    publisher: &'static CanPublisher<'static>,
    energy: &'static EnergyAccumulator<'static>,
) {
    let mut port = LoopbackCan;
    publisher.run_publish_loop(&mut port, energy).await;
}

#[embassy_executor::task]
async fn energy_persistence_task(
    energy: &'static EnergyAccumulator<'static>,
    store: &'static InMemoryKvStore,
) {
    energy.run_persistence_loop(store).await;
}

#[embassy_executor::task]
async fn diagnostics_task(bus: &'static EventBus) {
    log_events(bus).await;
}

static CACHE: StaticCell<RegisterCache> = StaticCell::new();
static BUS: StaticCell<EventBus> = StaticCell::new();
static STORE: StaticCell<InMemoryKvStore> = StaticCell::new();
static ENERGY: StaticCell<EnergyAccumulator<'static>> = StaticCell::new();
static PUBLISHER: StaticCell<CanPublisher<'static>> = StaticCell::new();
static CLIENT: StaticCell<SerialClient<'static, LoopbackUart>> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) -> ! {
    env_logger::init();

    let cfg = GatewayConfig::default();
    let now = embassy_time::Instant::now();

    let cache: &'static RegisterCache = CACHE.init(RegisterCache::new());
    let bus: &'static EventBus = BUS.init(EventBus::new(cfg.bus));
    let store: &'static InMemoryKvStore = STORE.init(InMemoryKvStore::new());

    let energy: &'static EnergyAccumulator<'static> =
        ENERGY.init(EnergyAccumulator::load(store, cfg.energy, bus, now).await);
    // Falls back to `cfg.cvl`'s compile-time defaults if nothing has been
    // persisted yet; loss of the CVL config blob never halts the core.
    let cvl_cfg = gateway_core::config::load_cvl_config(store).await;
    let publisher: &'static CanPublisher<'static> =
        PUBLISHER.init(CanPublisher::new(cache, bus, cfg.can, cvl_cfg, now));
    let client: &'static SerialClient<'static, LoopbackUart> =
        CLIENT.init(SerialClient::new(LoopbackUart::new(), cfg.serial, cache, bus));

    spawner.must_spawn(serial_task(client));
    spawner.must_spawn(can_task(publisher, energy));
    spawner.must_spawn(energy_persistence_task(energy, store));
    spawner.must_spawn(diagnostics_task(bus));

    log::info!("gateway-fw demo wiring started on loopback drivers");
    loop {
        Timer::after(Duration::from_secs(3600)).await;
    }
}
