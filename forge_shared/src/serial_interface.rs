use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Serial port error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    Closed,
}

/// Line-oriented, half-duplex link to one device.
#[async_trait]
pub trait DeviceConnection: Send {
    /// Transmit one already-framed instruction. The newline is appended here.
    async fn send(&mut self, line: &str) -> Result<(), ConnectionError>;

    /// Next response line, without its terminator. `None` once the link is gone.
    /// Must be cancel safe: the device worker polls it inside `select!`.
    async fn next_line(&mut self) -> Option<Result<String, ConnectionError>>;
}
