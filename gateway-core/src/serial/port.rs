//! The UART is a platform service; no HAL is prescribed here. [`UartPort`]
//! is the minimal surface the serial client needs from it; a board crate
//! implements it over its own USART/UART driver, the way TheClams-lr1120
//! parameterizes its driver over `embedded_hal_async::spi::SpiBus` instead
//! of owning a concrete SPI type.

/// A half-duplex, byte-oriented UART configured 115200 8N1, no flow
/// control. `write` sends a whole request in one shot; `read` fills as much
/// of `buf` as is currently available and returns the number of bytes
/// written, without blocking past what the platform driver considers "no
/// more data right now".
pub trait UartPort {
    type Error;

    /// Send `data` in one shot.
    async fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Fill as much of `buf` as is currently available. Returns `0` if
    /// nothing was ready; never blocks indefinitely.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Discard whatever is currently sitting in the RX buffer.
    async fn flush_rx(&mut self) -> Result<(), Self::Error>;
}
