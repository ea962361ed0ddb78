//! Core A — the TinyBMS serial codec ([`codec`]) and the polling client
//! ([`client`]) that owns the UART and keeps the register cache fresh.

pub mod client;
pub mod codec;
pub mod port;

pub use port::UartPort;
