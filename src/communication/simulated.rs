//! In-process firmware for dry runs and tests.
//!
//! Answers every instruction with `ok`, reports its tracked position for
//! `M114`, follows absolute `G0`/`G1`/`G92`/`G28` moves, and keeps the
//! numbers needed to check that a host never has two instructions
//! outstanding.
use super::serial_protocol::unframe;
use async_trait::async_trait;
use forge_shared::Position;
use forge_shared::serial_interface::{ConnectionError, DeviceConnection};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct SimState {
    position: Position,
    /// Instruction text as received, framing stripped.
    received: Vec<String>,
    /// Raw framed lines as received.
    raw: Vec<String>,
    outstanding: usize,
    max_outstanding: usize,
    held: bool,
    backlog: Vec<String>,
    silenced: Vec<String>,
    hold_at: Vec<String>,
    fail_sends: usize,
}

/// Test and operator handle onto a running simulated device.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
    tx: mpsc::UnboundedSender<String>,
}

pub struct SimulatedConnection {
    name: String,
    state: Arc<Mutex<SimState>>,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedConnection {
    pub fn new(name: &str) -> (Self, SimulatorHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SimulatorHandle {
            state: state.clone(),
            tx: tx.clone(),
        };
        let connection = Self {
            name: name.to_string(),
            state,
            tx,
            rx,
        };
        (connection, handle)
    }
}

fn respond(state: &mut SimState, text: &str) -> Vec<String> {
    let mut words = text.split_whitespace();
    let command = words.next().unwrap_or("").to_ascii_uppercase();
    match command.as_str() {
        "G0" | "G1" | "G92" => {
            for word in words {
                if !word.is_char_boundary(1) {
                    continue;
                }
                let (axis, value) = word.split_at(1);
                let Ok(value) = value.parse::<f64>() else { continue };
                match axis.to_ascii_uppercase().as_str() {
                    "X" => state.position.x = value,
                    "Y" => state.position.y = value,
                    "Z" => state.position.z = value,
                    "E" => state.position.e = value,
                    _ => {}
                }
            }
        }
        "G28" => {
            state.position = Position { e: state.position.e, ..Position::default() };
        }
        "M114" => {
            let p = state.position;
            return vec![
                format!(
                    "X:{:.2} Y:{:.2} Z:{:.2} E:{:.2} Count X:0 Y:0 Z:0",
                    p.x, p.y, p.z, p.e
                ),
                "ok".to_string(),
            ];
        }
        _ => {}
    }
    vec!["ok".to_string()]
}

#[async_trait]
impl DeviceConnection for SimulatedConnection {
    async fn send(&mut self, line: &str) -> Result<(), ConnectionError> {
        let mut state = lock(&self.state);
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        tracing::debug!("{} <- {}", self.name, line);
        state.raw.push(line.to_string());
        state.outstanding += 1;
        state.max_outstanding = state.max_outstanding.max(state.outstanding);
        let responses = match unframe(line) {
            Ok((_, text)) => {
                state.received.push(text.to_string());
                if let Some(i) = state.hold_at.iter().position(|prefix| text.starts_with(prefix.as_str())) {
                    state.hold_at.remove(i);
                    state.held = true;
                }
                if state.silenced.iter().any(|prefix| text.starts_with(prefix.as_str())) {
                    Vec::new()
                } else {
                    respond(&mut state, text)
                }
            }
            Err(e) => vec![format!("Error:{}", e), "ok".to_string()],
        };
        if state.held {
            state.backlog.extend(responses);
        } else {
            for response in responses {
                let _ = self.tx.send(response);
            }
        }
        Ok(())
    }

    async fn next_line(&mut self) -> Option<Result<String, ConnectionError>> {
        let line = self.rx.recv().await?;
        if line.starts_with("ok") {
            let mut state = lock(&self.state);
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        tracing::debug!("{} -> {}", self.name, line);
        Some(Ok(line))
    }
}

impl SimulatorHandle {
    /// Instruction texts received so far, framing stripped.
    pub fn received(&self) -> Vec<String> {
        lock(&self.state).received.clone()
    }

    /// Lines exactly as they crossed the wire.
    pub fn raw(&self) -> Vec<String> {
        lock(&self.state).raw.clone()
    }

    /// Highest number of unacknowledged instructions ever observed.
    pub fn max_outstanding(&self) -> usize {
        lock(&self.state).max_outstanding
    }

    pub fn position(&self) -> Position {
        lock(&self.state).position
    }

    pub fn set_position(&self, position: Position) {
        lock(&self.state).position = position;
    }

    /// Buffer responses instead of delivering them.
    pub fn hold(&self) {
        lock(&self.state).held = true;
    }

    /// Deliver buffered responses and stop buffering.
    pub fn release(&self) {
        let backlog = {
            let mut state = lock(&self.state);
            state.held = false;
            std::mem::take(&mut state.backlog)
        };
        for line in backlog {
            let _ = self.tx.send(line);
        }
    }

    /// Start buffering responses when the next instruction starting with
    /// `prefix` arrives, so it stays unacknowledged until [`release`]. One-shot.
    ///
    /// [`release`]: SimulatorHandle::release
    pub fn hold_at(&self, prefix: &str) {
        lock(&self.state).hold_at.push(prefix.to_string());
    }

    /// Never answer instructions starting with `prefix`.
    pub fn silence(&self, prefix: &str) {
        lock(&self.state).silenced.push(prefix.to_string());
    }

    /// Fail the next `count` sends with an I/O error.
    pub fn fail_next_sends(&self, count: usize) {
        lock(&self.state).fail_sends = count;
    }

    /// Push an unsolicited line, as firmware does for status messages.
    pub fn inject(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }
}
