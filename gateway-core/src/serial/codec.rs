//! Pure frame build/parse for the TinyBMS proprietary and MODBUS-mapped
//! commands. No I/O lives here — see [`super::client`] for the part that
//! owns the UART.
//!
//! Frame layout for every request: `[0xAA][cmd][payload..][crc_lo][crc_hi]`.
//! The CRC is CRC-16/MODBUS (poly 0xA001 reversed, init 0xFFFF) computed
//! over every byte before the CRC field.
//!
//! Byte order is the single easiest place to introduce a silent bug here:
//! proprietary commands (0x07, 0x09, 0x0B, 0x0D, and the shortcut reads) are
//! little-endian; the MODBUS-mapped commands (0x03, 0x10) are big-endian,
//! address and data both — *except* 0x0D, whose data word is big-endian
//! even though its address is little-endian. Every builder below spells out
//! its byte order explicitly rather than routing through one generic
//! encoder.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc16::{State, MODBUS};
use heapless::Vec;

use crate::error::{GatewayError, NackCode};

pub const PREAMBLE: u8 = 0xAA;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Reset = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadBlock = 0x07,
    ReadIndividual = 0x09,
    WriteBlock = 0x0B,
    WriteIndividual = 0x0D,
    WriteMultipleModbus = 0x10,
    ShortcutPackVoltage = 0x14,
    ShortcutPackCurrent = 0x15,
    ShortcutSoc = 0x1A,
    ShortcutTemperatures = 0x1B,
    ShortcutCellVoltages = 0x1C,
    ShortcutVersion = 0x1E,
    ShortcutExtended = 0x1F,
}

/// Options for the 0x02 reset/clear command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOption {
    Reset = 0x01,
    ClearEvents = 0x02,
    ClearStats = 0x03,
}

/// Max frame size this codec ever builds or parses. The largest payload is
/// a 16-word register block read/write (32 data bytes) plus header/CRC.
pub const MAX_FRAME: usize = 48;

type FrameBuf = Vec<u8, MAX_FRAME>;

fn crc16_modbus(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

fn finish(mut buf: FrameBuf) -> FrameBuf {
    let crc = crc16_modbus(&buf);
    // CRC is transmitted little-endian (crc_lo, crc_hi) regardless of the
    // command's own endianness — it rides outside the payload.
    let _ = buf.push((crc & 0xFF) as u8);
    let _ = buf.push((crc >> 8) as u8);
    buf
}

/// `[0xAA][0x02][option]` — reset / clear events / clear stats.
pub fn build_reset(option: ResetOption) -> FrameBuf {
    let mut buf = FrameBuf::new();
    let _ = buf.push(PREAMBLE);
    let _ = buf.push(Command::Reset as u8);
    let _ = buf.push(option as u8);
    finish(buf)
}

/// `[0xAA][0x03][addr_hi][addr_lo][count_hi][count_lo]` — MODBUS read
/// holding registers. Big-endian address and count.
pub fn build_read_holding_registers(start_addr: u16, count: u16) -> FrameBuf {
    let mut buf = FrameBuf::new();
    let _ = buf.push(PREAMBLE);
    let _ = buf.push(Command::ReadHoldingRegisters as u8);
    let mut field = [0u8; 4];
    BigEndian::write_u16(&mut field[0..2], start_addr);
    BigEndian::write_u16(&mut field[2..4], count);
    let _ = buf.extend_from_slice(&field);
    finish(buf)
}

/// `[0xAA][0x07][addr_lo][addr_hi][count]` — proprietary block read,
/// little-endian address, single-byte register count.
pub fn build_read_block(start_addr: u16, count: u8) -> FrameBuf {
    let mut buf = FrameBuf::new();
    let _ = buf.push(PREAMBLE);
    let _ = buf.push(Command::ReadBlock as u8);
    let mut addr_bytes = [0u8; 2];
    LittleEndian::write_u16(&mut addr_bytes, start_addr);
    let _ = buf.extend_from_slice(&addr_bytes);
    let _ = buf.push(count);
    finish(buf)
}

/// `[0xAA][0x09][count][addr_lo][addr_hi]...` — read individually addressed
/// registers, little-endian addresses.
pub fn build_read_individual(addrs: &[u16]) -> FrameBuf {
    let mut buf = FrameBuf::new();
    let _ = buf.push(PREAMBLE);
    let _ = buf.push(Command::ReadIndividual as u8);
    let _ = buf.push(addrs.len() as u8);
    for &addr in addrs {
        let mut field = [0u8; 2];
        LittleEndian::write_u16(&mut field, addr);
        let _ = buf.extend_from_slice(&field);
    }
    finish(buf)
}

/// `[0xAA][0x0B][addr_lo][addr_hi][count][data...]` — write a register
/// block, little-endian address and little-endian data words.
pub fn build_write_block(start_addr: u16, words: &[u16]) -> FrameBuf {
    let mut buf = FrameBuf::new();
    let _ = buf.push(PREAMBLE);
    let _ = buf.push(Command::WriteBlock as u8);
    let mut addr_bytes = [0u8; 2];
    LittleEndian::write_u16(&mut addr_bytes, start_addr);
    let _ = buf.extend_from_slice(&addr_bytes);
    let _ = buf.push(words.len() as u8);
    for &w in words {
        let mut field = [0u8; 2];
        LittleEndian::write_u16(&mut field, w);
        let _ = buf.extend_from_slice(&field);
    }
    finish(buf)
}

/// `[0xAA][0x0D][addr_lo][addr_hi][data_hi][data_lo]` — write one register.
/// The gotcha: the address is little-endian but the data word is encoded
/// big-endian, unlike every other proprietary frame.
pub fn build_write_individual(addr: u16, data: u16) -> FrameBuf {
    let mut buf = FrameBuf::new();
    let _ = buf.push(PREAMBLE);
    let _ = buf.push(Command::WriteIndividual as u8);
    let mut addr_bytes = [0u8; 2];
    LittleEndian::write_u16(&mut addr_bytes, addr);
    let _ = buf.extend_from_slice(&addr_bytes);
    let mut data_bytes = [0u8; 2];
    BigEndian::write_u16(&mut data_bytes, data);
    let _ = buf.extend_from_slice(&data_bytes);
    finish(buf)
}

/// `[0xAA][0x10][addr_hi][addr_lo][count_hi][count_lo][byte_count][data...]`
/// — MODBUS write multiple registers, big-endian throughout.
pub fn build_write_multiple_modbus(start_addr: u16, words: &[u16]) -> FrameBuf {
    let mut buf = FrameBuf::new();
    let _ = buf.push(PREAMBLE);
    let _ = buf.push(Command::WriteMultipleModbus as u8);
    let mut header = [0u8; 4];
    BigEndian::write_u16(&mut header[0..2], start_addr);
    BigEndian::write_u16(&mut header[2..4], words.len() as u16);
    let _ = buf.extend_from_slice(&header);
    let _ = buf.push((words.len() * 2) as u8);
    for &w in words {
        let mut field = [0u8; 2];
        BigEndian::write_u16(&mut field, w);
        let _ = buf.extend_from_slice(&field);
    }
    finish(buf)
}

/// A shortcut read command takes no payload beyond the command byte.
pub fn build_shortcut(cmd: Command) -> FrameBuf {
    let mut buf = FrameBuf::new();
    let _ = buf.push(PREAMBLE);
    let _ = buf.push(cmd as u8);
    finish(buf)
}

/// A parsed, CRC-verified response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedFrame<'a> {
    /// The 5-byte `AA 01 <cmd> crc crc` acknowledgement to a write.
    Ack { cmd: u8 },
    /// A response carrying a decoded data payload.
    Data { cmd: u8, payload: &'a [u8] },
    /// The device rejected the request.
    Nack { code: NackCode },
}

/// Scans `buf` for the `0xAA` preamble, validates the announced length and
/// the CRC, and returns either a decoded response or a typed error. Does not
/// consume `buf`; the caller advances its own read cursor based on how many
/// bytes the matched frame occupied (tracked by returning that length).
pub fn parse_response(buf: &[u8]) -> Result<(ParsedFrame<'_>, usize), GatewayError> {
    let preamble_pos = buf
        .iter()
        .position(|&b| b == PREAMBLE)
        .ok_or(GatewayError::BadFrame)?;
    let buf = &buf[preamble_pos..];

    if buf.len() < 2 {
        return Err(GatewayError::BadFrame);
    }
    let cmd = buf[1];

    // Fixed 5-byte forms: AA 01 <cmd> crc crc (ack) and AA FF <code> crc crc
    // (nack). Both carry no length byte, so they must be told apart from a
    // 0-length data response by the reserved marker in byte[1] before the
    // length-prefixed path below ever looks at byte[2] as a length.
    if buf.len() >= 5 && (buf[1] == 0x01 || buf[1] == 0xFF) {
        let crc_actual = LittleEndian::read_u16(&buf[3..5]);
        let crc_expected = crc16_modbus(&buf[0..3]);
        if crc_actual == crc_expected {
            return Ok(if buf[1] == 0x01 {
                (ParsedFrame::Ack { cmd: buf[2] }, 5)
            } else {
                (ParsedFrame::Nack { code: buf[2] }, 5)
            });
        }
        return Err(GatewayError::BadCrc);
    }

    // Generic data response: [0xAA][cmd][len][payload..][crc_lo][crc_hi].
    if buf.len() < 3 {
        return Err(GatewayError::BadFrame);
    }
    let len = buf[2] as usize;
    let total = 3 + len + 2;
    if buf.len() < total {
        return Err(GatewayError::BadFrame);
    }
    let crc_actual = LittleEndian::read_u16(&buf[3 + len..3 + len + 2]);
    let crc_expected = crc16_modbus(&buf[0..3 + len]);
    if crc_actual != crc_expected {
        return Err(GatewayError::BadCrc);
    }
    Ok((
        ParsedFrame::Data {
            cmd,
            payload: &buf[3..3 + len],
        },
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_frame_has_valid_crc() {
        let frame = build_reset(ResetOption::ClearEvents);
        assert_eq!(frame[0], PREAMBLE);
        assert_eq!(frame[1], Command::Reset as u8);
        let crc = crc16_modbus(&frame[..frame.len() - 2]);
        assert_eq!(LittleEndian::read_u16(&frame[frame.len() - 2..]), crc);
    }

    #[test]
    fn read_holding_registers_is_big_endian() {
        let frame = build_read_holding_registers(0x0024, 0x0002);
        assert_eq!(&frame[2..6], &[0x00, 0x24, 0x00, 0x02]);
    }

    #[test]
    fn read_block_is_little_endian_address() {
        let frame = build_read_block(0x0024, 4);
        assert_eq!(&frame[2..4], &[0x24, 0x00]);
        assert_eq!(frame[4], 4);
    }

    #[test]
    fn write_individual_mixes_endianness() {
        // address little-endian, data big-endian — the one gotcha case.
        let frame = build_write_individual(0x0066, 0x1234);
        assert_eq!(&frame[2..4], &[0x66, 0x00]);
        assert_eq!(&frame[4..6], &[0x12, 0x34]);
    }

    #[test]
    fn write_multiple_modbus_is_big_endian_throughout() {
        let frame = build_write_multiple_modbus(0x0010, &[0x1234, 0x5678]);
        assert_eq!(&frame[2..6], &[0x00, 0x10, 0x00, 0x02]);
        assert_eq!(frame[6], 4);
        assert_eq!(&frame[7..11], &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn parse_data_response_round_trips_payload() {
        let mut raw = heapless::Vec::<u8, MAX_FRAME>::new();
        raw.push(PREAMBLE).unwrap();
        raw.push(Command::ReadBlock as u8).unwrap();
        raw.push(4).unwrap(); // length
        raw.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]).unwrap();
        let crc = crc16_modbus(&raw);
        raw.push((crc & 0xFF) as u8).unwrap();
        raw.push((crc >> 8) as u8).unwrap();

        let (parsed, consumed) = parse_response(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        match parsed {
            ParsedFrame::Data { cmd, payload } => {
                assert_eq!(cmd, Command::ReadBlock as u8);
                assert_eq!(payload, &[0x01, 0x02, 0x03, 0x04]);
            }
            _ => panic!("expected Data"),
        }
    }

    #[test]
    fn parse_ack_response() {
        let mut raw = heapless::Vec::<u8, MAX_FRAME>::new();
        raw.push(PREAMBLE).unwrap();
        raw.push(0x01).unwrap();
        raw.push(Command::WriteIndividual as u8).unwrap();
        let crc = crc16_modbus(&raw);
        raw.push((crc & 0xFF) as u8).unwrap();
        raw.push((crc >> 8) as u8).unwrap();

        let (parsed, consumed) = parse_response(&raw).unwrap();
        assert_eq!(consumed, 5);
        match parsed {
            ParsedFrame::Ack { cmd } => assert_eq!(cmd, Command::WriteIndividual as u8),
            _ => panic!("expected Ack"),
        }
    }

    #[test]
    fn parse_rejects_bad_crc() {
        let mut raw = heapless::Vec::<u8, MAX_FRAME>::new();
        raw.push(PREAMBLE).unwrap();
        raw.push(Command::ReadBlock as u8).unwrap();
        raw.push(1).unwrap();
        raw.push(0xAB).unwrap();
        raw.push(0x00).unwrap();
        raw.push(0x00).unwrap(); // wrong crc
        assert_eq!(parse_response(&raw), Err(GatewayError::BadCrc));
    }

    #[test]
    fn parse_skips_noise_before_preamble() {
        let mut raw = heapless::Vec::<u8, MAX_FRAME>::new();
        raw.extend_from_slice(&[0x00, 0x11, 0x22]).unwrap();
        raw.push(PREAMBLE).unwrap();
        raw.push(0x01).unwrap();
        raw.push(Command::Reset as u8).unwrap();
        let crc = crc16_modbus(&raw[3..]);
        raw.push((crc & 0xFF) as u8).unwrap();
        raw.push((crc >> 8) as u8).unwrap();

        let (parsed, _) = parse_response(&raw).unwrap();
        assert!(matches!(parsed, ParsedFrame::Ack { .. }));
    }

    #[test]
    fn parse_incomplete_data_is_bad_frame() {
        let raw = [PREAMBLE, Command::ReadBlock as u8, 10, 0x01, 0x02];
        assert_eq!(parse_response(&raw), Err(GatewayError::BadFrame));
    }

    /// Table-driven endianness discipline check.
    #[test]
    fn endianness_discipline_table() {
        struct Case {
            frame: FrameBuf,
            be_range: core::ops::Range<usize>,
            expect_be: &'static [u8],
        }
        let cases = [
            Case {
                frame: build_read_holding_registers(0x0001, 0x0002),
                be_range: 2..6,
                expect_be: &[0x00, 0x01, 0x00, 0x02],
            },
            Case {
                frame: build_write_multiple_modbus(0x0001, &[0x0002]),
                be_range: 2..6,
                expect_be: &[0x00, 0x01, 0x00, 0x01],
            },
        ];
        for case in cases {
            assert_eq!(&case.frame[case.be_range], case.expect_be);
        }
    }
}
