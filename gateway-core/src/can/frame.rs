//! The minimal CAN frame value type the nineteen encoders and the publisher
//! need: a standard 11-bit identifier, up to 8 data bytes, and a DLC. This
//! is deliberately not a peripheral register wrapper — owning an actual CAN
//! controller's registers is a platform service, the same way
//! [`super::port::CanPort`] only asks for `transmit`/`receive`, not
//! register-level access.

use embedded_can::{Frame, Id, StandardId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    pub id: u16,
    pub data: [u8; 8],
    pub dlc: u8,
}

impl CanFrame {
    pub fn new(id: u16, data: [u8; 8], dlc: u8) -> Self {
        Self { id, data, dlc }
    }

    /// Every Victron frame this gateway transmits carries a full 8-byte
    /// payload; every encoder produces exactly 8 bytes.
    pub fn full(id: u16, data: [u8; 8]) -> Self {
        Self { id, data, dlc: 8 }
    }
}

/// Bridges to `embedded_can`'s `Frame` trait so a board's real CAN
/// controller driver — typically generic over `embedded_can::Frame` — can
/// accept a `CanFrame` directly instead of this crate re-deriving its own
/// wire trait.
impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let id = match id.into() {
            Id::Standard(s) => s.as_raw(),
            Id::Extended(_) => return None, // standard 11-bit only
        };
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            data: buf,
            dlc: data.len() as u8,
        })
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None // this bus never exchanges remote frames
    }

    fn is_extended(&self) -> bool {
        false
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        Id::Standard(StandardId::new(self.id).unwrap_or_else(|| StandardId::new(0).unwrap()))
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_frame_has_dlc_eight() {
        let f = CanFrame::full(0x351, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(f.dlc, 8);
        assert_eq!(Frame::data(&f).len(), 8);
    }

    #[test]
    fn frame_trait_new_rejects_oversized_payload() {
        let id = StandardId::new(0x100).unwrap();
        assert!(<CanFrame as Frame>::new(id, &[0u8; 9]).is_none());
    }
}
