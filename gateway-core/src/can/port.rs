//! The CAN controller is a platform service, mirrored
//! from [`crate::serial::port::UartPort`]: `CanPort` is the minimal surface
//! the publisher needs, a board crate implements it over its own MCAN/FDCAN
//! peripheral the way GrepitAB-mcan and Ironedde-mcan wrap theirs.

use super::frame::CanFrame;

pub trait CanPort {
    type Error;

    /// Transmits one frame. Returns once the controller has accepted it for
    /// arbitration, not once it has won the bus — the publisher's circuit
    /// breaker treats any `Err` here as a transmit failure regardless of
    /// which layer it came from.
    async fn transmit(&mut self, frame: &CanFrame) -> Result<(), Self::Error>;

    /// Polls for one received frame without blocking. `Ok(None)` means
    /// nothing is pending right now.
    async fn receive(&mut self) -> Result<Option<CanFrame>, Self::Error>;
}
