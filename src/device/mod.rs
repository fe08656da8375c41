// src/device/mod.rs - one physical machine: state, queue and worker handle
pub mod channel;
pub mod models;
pub mod state_machine;
pub mod worker;

pub use channel::{DeviceHandle, DeviceRequest, Placement};
pub use models::{CommandSet, ModelDescriptor, ModelOverride};
pub use state_machine::DeviceStateMachine;
pub use worker::DeviceWorker;

use crate::command_queue::{CommandEntry, CommandQueue};
use crate::print_job::Job;
use forge_shared::{DeviceEvent, DeviceSnapshot, DeviceState, Position, StateTransitionError};
use std::sync::{Arc, Weak};

/// Cursor over the program of the job a device is executing.
#[derive(Debug)]
pub struct JobStream {
    pub(crate) job: Weak<Job>,
    program: Arc<Vec<String>>,
    next: usize,
    /// A feed entry is queued or running.
    pub(crate) feeding: bool,
}

impl JobStream {
    pub fn new(job: &Arc<Job>) -> Self {
        Self {
            job: Arc::downgrade(job),
            program: job.program(),
            next: 0,
            feeding: false,
        }
    }

    pub fn has_more(&self) -> bool {
        self.next < self.program.len()
    }

    pub fn take_line(&mut self) -> Option<String> {
        let line = self.program.get(self.next)?.clone();
        self.next += 1;
        Some(line)
    }

    /// Lines handed to the device so far.
    pub fn sent(&self) -> usize {
        self.next
    }
}

/// Everything the drain loop and its callbacks may touch for one device.
/// Owned by that device's worker task; nothing else mutates it.
#[derive(Debug)]
pub struct Device {
    id: String,
    descriptor: ModelDescriptor,
    lift_clearance: f64,
    queue: CommandQueue,
    state: DeviceStateMachine,
    paused_position: Option<Position>,
    current_job: Option<Weak<Job>>,
    pub(crate) stream: Option<JobStream>,
}

impl Device {
    pub fn new(id: &str, descriptor: ModelDescriptor, lift_clearance: f64) -> Self {
        Self {
            id: id.to_string(),
            descriptor,
            lift_clearance,
            queue: CommandQueue::new(),
            state: DeviceStateMachine::new(id),
            paused_position: None,
            current_job: None,
            stream: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn lift_clearance(&self) -> f64 {
        self.lift_clearance
    }

    pub fn state(&self) -> DeviceState {
        self.state.current()
    }

    pub fn state_machine(&self) -> &DeviceStateMachine {
        &self.state
    }

    pub fn fire(&mut self, event: DeviceEvent) -> Result<DeviceState, StateTransitionError> {
        self.state.fire(event)
    }

    /// Run `entries` before anything already queued.
    pub fn prepend_commands<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = CommandEntry>,
        I::IntoIter: DoubleEndedIterator,
    {
        self.queue.prepend(entries);
    }

    pub fn queue_commands<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = CommandEntry>,
    {
        self.queue.append(entries);
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub(crate) fn next_entry(&mut self) -> Option<CommandEntry> {
        self.queue.pop_front()
    }

    pub fn paused_position(&self) -> Option<Position> {
        self.paused_position
    }

    pub fn set_paused_position(&mut self, position: Option<Position>) {
        self.paused_position = position;
    }

    /// The job this device is bound to, if it still exists.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.current_job.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_current_job(&mut self, job: &Arc<Job>) {
        self.current_job = Some(Arc::downgrade(job));
        self.paused_position = None;
        self.stream = None;
    }

    pub fn clear_current_job(&mut self) {
        self.current_job = None;
        self.stream = None;
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            model: self.descriptor.name.clone(),
            state: self.state.current(),
            paused_position: self.paused_position,
            pauseable_state: self.state.pauseable_state(),
            current_job: self.current_job().map(|job| job.id()),
            queue_depth: self.queue.len(),
        }
    }
}
