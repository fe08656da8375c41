//! The per-device actor.
//!
//! One task owns a [`Device`] and its connection. It drains the command queue
//! one entry at a time, feeds response lines to the entry in flight and
//! serves control requests between lines, so every queue mutation for a
//! device happens on this task.

use super::channel::{ControlReply, DeviceRequest, Placement};
use super::Device;
use crate::command_queue::{CommandEntry, EntryCallback, Instruction, QueueError, ResponseProcessor};
use crate::communication::LineFramer;
use crate::orchestrator::{self, ControlError};
use forge_shared::serial_interface::{ConnectionError, DeviceConnection};
use forge_shared::{DeviceEvent, DeviceSnapshot};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

/// The entry whose instruction has been sent and not yet satisfied.
struct InFlight {
    name: String,
    post: Option<EntryCallback>,
    process: Option<ResponseProcessor>,
    /// Instruction text was sent and no `ok` has arrived yet.
    awaiting_ack: bool,
    /// The processor (if any) has returned `false`.
    processing_done: bool,
    /// Processor error held back until the `ok` that closes the instruction,
    /// so the acknowledgement is not credited to the next one.
    failure: Option<QueueError>,
    deadline: Instant,
}

enum LineOutcome {
    Waiting,
    Satisfied,
    Failed(QueueError),
}

pub struct DeviceWorker {
    device: Device,
    connection: Box<dyn DeviceConnection>,
    requests: mpsc::Receiver<DeviceRequest>,
    framer: LineFramer,
    response_timeout: Duration,
    in_flight: Option<InFlight>,
    link_open: bool,
}

fn entry_name(label: Option<&'static str>, instruction: &Option<Instruction>) -> String {
    match (instruction, label) {
        (Some(Instruction::Text(text)), _) => text.clone(),
        (_, Some(label)) => label.to_string(),
        (Some(Instruction::Generated(_)), None) => "generated instruction".to_string(),
        (None, None) => "marker".to_string(),
    }
}

fn is_ack(line: &str) -> bool {
    line.starts_with("ok")
}

fn is_error_report(line: &str) -> bool {
    line.starts_with("Error") || line.starts_with("!!")
}

fn is_keepalive(line: &str) -> bool {
    line.starts_with("busy") || line.starts_with("wait")
}

impl DeviceWorker {
    pub fn new(
        device: Device,
        connection: Box<dyn DeviceConnection>,
        requests: mpsc::Receiver<DeviceRequest>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            device,
            connection,
            requests,
            framer: LineFramer::new(),
            response_timeout,
            in_flight: None,
            link_open: true,
        }
    }

    pub async fn run(mut self) {
        self.begin_connect();
        loop {
            self.drain().await;
            let deadline = self.in_flight.as_ref().map(|flight| flight.deadline);
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(DeviceRequest::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                line = self.connection.next_line(), if self.link_open => match line {
                    Some(Ok(line)) => self.handle_line(&line),
                    Some(Err(e)) => self.fail_in_flight(QueueError::Transport(e)),
                    None => self.link_closed(),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fail_in_flight(QueueError::Timeout(self.response_timeout));
                }
            }
        }
        tracing::info!("Device {}: worker stopped", self.device.id());
    }

    /// `connect`, line-number reset when checksummed, then `connectDone`.
    /// `connectDone` sits on its own entry so a failed reset still leaves the
    /// device usable.
    fn begin_connect(&mut self) {
        if let Err(e) = self.device.fire(DeviceEvent::Connect) {
            tracing::warn!("Device {}: {}", self.device.id(), e);
            return;
        }
        let mut handshake = Vec::new();
        if self.device.descriptor().checksum_support {
            self.framer.reset();
            let reset = (self.device.descriptor().commands.reset_line_numbers)();
            handshake.push(CommandEntry::new(reset));
        }
        handshake.push(CommandEntry::marker("connected").after(|device| {
            device.fire(DeviceEvent::ConnectDone)?;
            Ok(())
        }));
        self.device.prepend_commands(handshake);
    }

    fn link_closed(&mut self) {
        tracing::error!("Device {}: connection closed", self.device.id());
        self.link_open = false;
        self.fail_in_flight(QueueError::Transport(ConnectionError::Closed));
        if let Err(e) = self.device.fire(DeviceEvent::Disconnect) {
            tracing::warn!("Device {}: {}", self.device.id(), e);
        }
    }

    /// Start queued entries until one is left waiting for the device.
    async fn drain(&mut self) {
        while self.in_flight.is_none() && self.link_open {
            let Some(entry) = self.device.next_entry() else {
                break;
            };
            self.start_entry(entry).await;
        }
    }

    async fn start_entry(&mut self, entry: CommandEntry) {
        let CommandEntry {
            label,
            instruction,
            pre,
            post,
            process,
        } = entry;
        let mut name = entry_name(label, &instruction);

        if let Some(pre) = pre {
            if let Err(e) = pre(&mut self.device) {
                self.log_failure(&name, &e);
                return;
            }
        }

        let text = match instruction {
            Some(instruction) => match instruction.resolve(&mut self.device) {
                Ok(text) => text,
                Err(e) => {
                    self.log_failure(&name, &e);
                    return;
                }
            },
            None => None,
        };

        if let Some(text) = &text {
            let line = self
                .framer
                .frame(text, self.device.descriptor().checksum_support);
            if let Err(e) = self.connection.send(&line).await {
                self.log_failure(text, &QueueError::Transport(e));
                return;
            }
            name = text.clone();
        }

        if text.is_none() && process.is_none() {
            self.finish(&name, post);
            return;
        }

        self.in_flight = Some(InFlight {
            name,
            post,
            awaiting_ack: text.is_some(),
            processing_done: process.is_none(),
            process,
            failure: None,
            deadline: Instant::now() + self.response_timeout,
        });
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let Some(flight) = self.in_flight.as_mut() else {
            if is_error_report(line) {
                tracing::warn!("Device {}: {}", self.device.id(), line);
            } else {
                tracing::debug!("Device {}: unsolicited '{}'", self.device.id(), line);
            }
            return;
        };
        flight.deadline = Instant::now() + self.response_timeout;

        if is_error_report(line) {
            tracing::warn!("Device {}: {} (while running {})", self.device.id(), line, flight.name);
            return;
        }
        if is_keepalive(line) {
            return;
        }

        let outcome = if flight.awaiting_ack && is_ack(line) {
            if let Some(e) = flight.failure.take() {
                LineOutcome::Failed(e)
            } else if flight.processing_done {
                flight.awaiting_ack = false;
                LineOutcome::Satisfied
            } else {
                LineOutcome::Failed(QueueError::IncompleteResponse)
            }
        } else if let (false, Some(process)) = (flight.processing_done, flight.process.as_mut()) {
            match process(line, &mut self.device) {
                Ok(true) => LineOutcome::Waiting,
                Ok(false) => {
                    flight.processing_done = true;
                    if flight.awaiting_ack {
                        LineOutcome::Waiting
                    } else {
                        LineOutcome::Satisfied
                    }
                }
                Err(e) if flight.awaiting_ack => {
                    tracing::debug!("Device {}: '{}' will fail on ack: {}", self.device.id(), flight.name, e);
                    flight.processing_done = true;
                    flight.failure = Some(e);
                    LineOutcome::Waiting
                }
                Err(e) => LineOutcome::Failed(e),
            }
        } else {
            tracing::debug!("Device {}: ignored '{}'", self.device.id(), line);
            LineOutcome::Waiting
        };

        match outcome {
            LineOutcome::Waiting => {}
            LineOutcome::Satisfied => {
                if let Some(flight) = self.in_flight.take() {
                    self.finish(&flight.name, flight.post);
                }
            }
            LineOutcome::Failed(e) => self.fail_in_flight(e),
        }
    }

    fn fail_in_flight(&mut self, error: QueueError) {
        match self.in_flight.take() {
            Some(flight) => self.log_failure(&flight.name, &error),
            None => tracing::warn!("Device {}: {}", self.device.id(), error),
        }
    }

    /// Failed entries never run their post-callback.
    fn log_failure(&self, name: &str, error: &QueueError) {
        tracing::warn!("Device {}: '{}' failed: {}", self.device.id(), name, error);
    }

    fn finish(&mut self, name: &str, post: Option<EntryCallback>) {
        tracing::trace!("Device {}: '{}' done", self.device.id(), name);
        if let Some(post) = post {
            if let Err(e) = post(&mut self.device) {
                tracing::warn!("Device {}: after '{}': {}", self.device.id(), name, e);
            }
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        let mut snapshot = self.device.snapshot();
        if self.in_flight.is_some() {
            snapshot.queue_depth += 1;
        }
        snapshot
    }

    fn reply(&self, respond_to: ControlReply, result: Result<(), ControlError>) {
        let result = result.map(|()| self.snapshot());
        let _ = respond_to.send(result);
    }

    fn handle_request(&mut self, request: DeviceRequest) {
        match request {
            DeviceRequest::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            DeviceRequest::AssignJob { job, respond_to } => {
                let result = orchestrator::assign_job(&mut self.device, job);
                self.reply(respond_to, result);
            }
            DeviceRequest::ReleaseJob { job_id, respond_to } => {
                let result = orchestrator::release_job(&mut self.device, job_id);
                self.reply(respond_to, result);
            }
            DeviceRequest::Start { respond_to } => {
                let result = orchestrator::start(&mut self.device);
                self.reply(respond_to, result);
            }
            DeviceRequest::Pause { respond_to } => {
                let result = orchestrator::pause(&mut self.device);
                self.reply(respond_to, result);
            }
            DeviceRequest::Resume { respond_to } => {
                let result = orchestrator::resume(&mut self.device);
                self.reply(respond_to, result);
            }
            DeviceRequest::Cancel { respond_to } => {
                let result = orchestrator::cancel(&mut self.device);
                self.reply(respond_to, result);
            }
            DeviceRequest::Execute { command, respond_to } => {
                let result = orchestrator::execute(&mut self.device, &command);
                self.reply(respond_to, result);
            }
            DeviceRequest::RunBlocking { commands, respond_to } => {
                let result = orchestrator::run_blocking(&mut self.device, commands);
                self.reply(respond_to, result);
            }
            DeviceRequest::Enqueue {
                entries,
                placement,
                respond_to,
            } => {
                match placement {
                    Placement::Front => self.device.prepend_commands(entries),
                    Placement::Back => self.device.queue_commands(entries),
                }
                let _ = respond_to.send(self.snapshot());
            }
            DeviceRequest::Shutdown => {}
        }
    }
}
