//! Core B.2/B.3 — the Victron-compatible CAN side: frame type, platform
//! port trait, pure encoders, and the publisher that schedules/transmits
//! them. Mirrors [`crate::serial`]'s `port`/`codec`/`client` split.

pub mod encoders;
pub mod frame;
pub mod port;
pub mod publisher;

pub use frame::CanFrame;
pub use port::CanPort;
pub use publisher::CanPublisher;
