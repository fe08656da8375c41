//! Ordered per-device work list.
//!
//! Entries are drained one at a time by the device worker. New work can be
//! prepended (runs before everything queued, most recent batch first) or
//! appended (FIFO), including from an entry's own callbacks while the worker
//! is draining it.

use crate::device::Device;
use crate::telemetry::TelemetryError;
use forge_shared::print_job::JobTransitionError;
use forge_shared::serial_interface::ConnectionError;
use forge_shared::StateTransitionError;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// Why an entry failed. The queue logs it and moves on.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("transport error: {0}")]
    Transport(#[from] ConnectionError),
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Transition(#[from] StateTransitionError),
    #[error(transparent)]
    Job(#[from] JobTransitionError),
    #[error("cannot generate instruction: {0}")]
    Generation(String),
    #[error("acknowledged before the expected response arrived")]
    IncompleteResponse,
}

pub type EntryCallback = Box<dyn FnOnce(&mut Device) -> Result<(), QueueError> + Send>;
/// Inspects one response line; `Ok(true)` keeps the entry waiting for more.
pub type ResponseProcessor = Box<dyn FnMut(&str, &mut Device) -> Result<bool, QueueError> + Send>;
/// `Ok(None)` turns the entry into a synchronization point: nothing is sent.
pub type InstructionGenerator =
    Box<dyn FnOnce(&mut Device) -> Result<Option<String>, QueueError> + Send>;

pub enum Instruction {
    Text(String),
    /// Text produced from device state at the moment the entry is transmitted.
    Generated(InstructionGenerator),
}

impl Instruction {
    pub fn resolve(self, device: &mut Device) -> Result<Option<String>, QueueError> {
        match self {
            Instruction::Text(text) => Ok(Some(text)),
            Instruction::Generated(generate) => generate(device),
        }
    }
}

/// One unit of queued work. Entries without an instruction are pure
/// synchronization points.
#[derive(Default)]
pub struct CommandEntry {
    pub label: Option<&'static str>,
    pub instruction: Option<Instruction>,
    pub pre: Option<EntryCallback>,
    pub post: Option<EntryCallback>,
    pub process: Option<ResponseProcessor>,
}

impl CommandEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            instruction: Some(Instruction::Text(text.into())),
            ..Self::default()
        }
    }

    pub fn generated<F>(generate: F) -> Self
    where
        F: FnOnce(&mut Device) -> Result<Option<String>, QueueError> + Send + 'static,
    {
        Self {
            instruction: Some(Instruction::Generated(Box::new(generate))),
            ..Self::default()
        }
    }

    /// Callback-only entry.
    pub fn marker(label: &'static str) -> Self {
        Self {
            label: Some(label),
            ..Self::default()
        }
    }

    pub fn labeled(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    pub fn before<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&mut Device) -> Result<(), QueueError> + Send + 'static,
    {
        self.pre = Some(Box::new(callback));
        self
    }

    pub fn after<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&mut Device) -> Result<(), QueueError> + Send + 'static,
    {
        self.post = Some(Box::new(callback));
        self
    }

    pub fn processing<F>(mut self, process: F) -> Self
    where
        F: FnMut(&str, &mut Device) -> Result<bool, QueueError> + Send + 'static,
    {
        self.process = Some(Box::new(process));
        self
    }

    pub fn has_instruction(&self) -> bool {
        self.instruction.is_some()
    }
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instruction = match &self.instruction {
            Some(Instruction::Text(text)) => Some(text.as_str()),
            Some(Instruction::Generated(_)) => Some("<generated>"),
            None => None,
        };
        f.debug_struct("CommandEntry")
            .field("label", &self.label)
            .field("instruction", &instruction)
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("process", &self.process.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: VecDeque<CommandEntry>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a batch ahead of everything queued. The batch keeps its own order.
    pub fn prepend<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = CommandEntry>,
        I::IntoIter: DoubleEndedIterator,
    {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    pub fn append<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = CommandEntry>,
    {
        self.entries.extend(entries);
    }

    pub fn pop_front(&mut self) -> Option<CommandEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels and instruction texts in drain order, for diagnostics.
    pub fn describe(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| match (&entry.instruction, entry.label) {
                (Some(Instruction::Text(text)), _) => text.clone(),
                (Some(Instruction::Generated(_)), Some(label)) => format!("<{}>", label),
                (Some(Instruction::Generated(_)), None) => "<generated>".to_string(),
                (None, Some(label)) => format!("[{}]", label),
                (None, None) => "[marker]".to_string(),
            })
            .collect()
    }
}
