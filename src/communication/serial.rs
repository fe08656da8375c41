//! Serial transport for a single device using serial2-tokio.
use async_trait::async_trait;
use forge_shared::serial_interface::{ConnectionError, DeviceConnection};
use serial2_tokio::SerialPort;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Serial link split into a writer and a background line reader.
///
/// The reader task owns line assembly so that `next_line` only awaits a
/// channel receive, which keeps it cancel safe.
pub struct SerialConnection {
    path: String,
    port: Arc<SerialPort>,
    lines: mpsc::Receiver<Result<String, ConnectionError>>,
    reader: JoinHandle<()>,
}

impl SerialConnection {
    pub fn open(path: &str, baud: u32) -> Result<Self, ConnectionError> {
        tracing::info!("Opening serial port {} at {} baud", path, baud);
        let port = Arc::new(SerialPort::open(path, baud)?);
        let (tx, lines) = mpsc::channel(64);
        let reader = tokio::spawn(read_lines(path.to_string(), port.clone(), tx));
        Ok(Self {
            path: path.to_string(),
            port,
            lines,
            reader,
        })
    }
}

async fn read_lines(
    path: String,
    port: Arc<SerialPort>,
    tx: mpsc::Sender<Result<String, ConnectionError>>,
) {
    let mut buf = [0u8; 512];
    let mut pending = Vec::new();
    loop {
        let n = match port.read(&mut buf).await {
            Ok(0) => {
                tracing::warn!("Serial port {} closed", path);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Serial read error on {}: {}", path, e);
                let _ = tx.send(Err(ConnectionError::Io(e))).await;
                return;
            }
        };
        for &byte in &buf[..n] {
            if byte != b'\n' {
                pending.push(byte);
                continue;
            }
            let line = String::from_utf8_lossy(&pending).trim().to_string();
            pending.clear();
            if line.is_empty() {
                continue;
            }
            if tx.send(Ok(line)).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl DeviceConnection for SerialConnection {
    async fn send(&mut self, line: &str) -> Result<(), ConnectionError> {
        tracing::debug!("{} <- {}", self.path, line);
        let framed = format!("{}\n", line);
        self.port.write_all(framed.as_bytes()).await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Option<Result<String, ConnectionError>> {
        let line = self.lines.recv().await;
        if let Some(Ok(ref text)) = line {
            tracing::debug!("{} -> {}", self.path, text);
        }
        line
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
