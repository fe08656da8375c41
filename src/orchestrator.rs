//! Pause, resume, cancel and start, expressed as queue manipulation on a
//! single [`Device`].
//!
//! Everything here runs on the device's worker task, either directly from a
//! control request or from an entry callback while the queue drains.
//!
//! Pausing is a cascade of three stages. Each stage is enqueued by the
//! post-callback of the previous stage's last entry, never ahead of time, so
//! parking motion only starts after whatever was in flight has completed and
//! the device only settles into `paused` after the lift has been sent.

use crate::command_queue::{CommandEntry, QueueError};
use crate::device::{Device, JobStream};
use crate::print_job::Job;
use crate::telemetry::{apply_offsets, parse_position};
use forge_shared::config::AxisOffsets;
use forge_shared::{DeviceEvent, DeviceState, JobState, JobTransitionError, StateTransitionError};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Why a control request was refused. The device is left as it was.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no job in progress")]
    NoJobInProgress,
    #[error("cannot pause from state {0}")]
    CannotPause(DeviceState),
    #[error("cannot pause job from state {0}")]
    CannotPauseJob(JobState),
    #[error("cannot resume from state {0}")]
    CannotResume(DeviceState),
    #[error("cannot resume job from state {0}")]
    CannotResumeJob(JobState),
    #[error("cannot start from state {0}")]
    CannotStart(DeviceState),
    #[error("device already has active job {0}")]
    JobAlreadyAssigned(Uuid),
    #[error("job {0} is still running or paused")]
    JobActive(Uuid),
    #[error("device is not connected")]
    NotConnected,
    #[error("empty instruction")]
    EmptyCommand,
    #[error(transparent)]
    Job(#[from] JobTransitionError),
    #[error(transparent)]
    Transition(#[from] StateTransitionError),
    #[error("device {0} worker has stopped")]
    WorkerGone(String),
}

impl ControlError {
    /// Wrong device or job state for the request, as opposed to a dead worker.
    pub fn is_precondition(&self) -> bool {
        !matches!(self, ControlError::WorkerGone(_))
    }
}

/// Stages of the pause cascade, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseStage {
    /// Pause the job once the in-flight entry has completed.
    Halt,
    /// Finish motion, capture the position, lift clear of the part.
    Park,
    /// Settle the device into `paused`.
    Settle,
}

impl PauseStage {
    pub fn entries(self, device: &Device) -> Vec<CommandEntry> {
        match self {
            PauseStage::Halt => vec![CommandEntry::marker("pause: halt").after(|device| {
                device.set_paused_position(None);
                if let Some(job) = device.current_job() {
                    if let Err(e) = job.pause() {
                        tracing::warn!("Device {}: {}", device.id(), e);
                    }
                }
                let park = PauseStage::Park.entries(device);
                device.prepend_commands(park);
                Ok(())
            })],
            PauseStage::Park => {
                let commands = device.descriptor().commands;
                let offsets = device.descriptor().offsets;
                vec![
                    CommandEntry::new((commands.finish_moves)()),
                    CommandEntry::new((commands.query_position)())
                        .processing(move |line, device| capture_position(line, &offsets, device)),
                    CommandEntry::generated(move |device| {
                        let position = device.paused_position().ok_or_else(|| {
                            QueueError::Generation("no paused position captured".to_string())
                        })?;
                        Ok(Some((commands.lift)(position.z + device.lift_clearance())))
                    })
                    .labeled("pause: lift"),
                    CommandEntry::marker("pause: parked").after(|device| {
                        let settle = PauseStage::Settle.entries(device);
                        device.prepend_commands(settle);
                        Ok(())
                    }),
                ]
            }
            PauseStage::Settle => vec![CommandEntry::marker("pause: settle").after(|device| {
                device.fire(DeviceEvent::PauseDone)?;
                // Canceled (or vanished) while parking: nothing to resume.
                let held = device
                    .current_job()
                    .is_some_and(|job| job.state() == JobState::Paused);
                if !held {
                    device.fire(DeviceEvent::Resume)?;
                }
                Ok(())
            })],
        }
    }
}

/// Response processor for the position query. Keeps waiting until a report
/// line arrives; a malformed report fails the entry.
fn capture_position(
    line: &str,
    offsets: &AxisOffsets,
    device: &mut Device,
) -> Result<bool, QueueError> {
    let Some(reported) = parse_position(line)? else {
        return Ok(true);
    };
    let position = apply_offsets(reported, offsets);
    tracing::info!(
        "Device {}: paused at X{} Y{} Z{} E{}",
        device.id(),
        position.x,
        position.y,
        position.z,
        position.e
    );
    device.set_paused_position(Some(position));
    Ok(false)
}

fn engage_pause(device: &mut Device) -> Result<(), StateTransitionError> {
    device.fire(DeviceEvent::Pause)?;
    let halt = PauseStage::Halt.entries(device);
    device.prepend_commands(halt);
    Ok(())
}

/// Replays a pause request once the transient phase it arrived during has
/// drained.
pub(crate) fn deferred_pause_marker() -> CommandEntry {
    CommandEntry::marker("deferred pause").after(|device| {
        let running = device
            .current_job()
            .is_some_and(|job| job.state() == JobState::Running);
        if !running {
            tracing::info!("Device {}: deferred pause dropped, job no longer running", device.id());
            return Ok(());
        }
        if device.state().is_transient() {
            if device.queue().is_empty() {
                tracing::warn!(
                    "Device {}: deferred pause dropped, {} with nothing queued",
                    device.id(),
                    device.state()
                );
                return Ok(());
            }
            device.queue_commands([deferred_pause_marker()]);
            return Ok(());
        }
        engage_pause(device)?;
        Ok(())
    })
}

/// Request a pause of the device's current job.
pub fn pause(device: &mut Device) -> Result<(), ControlError> {
    let job = device.current_job().ok_or(ControlError::NoJobInProgress)?;
    let state = device.state();
    if !state.is_pauseable() && !state.is_transient() {
        return Err(ControlError::CannotPause(state));
    }
    let job_state = job.state();
    if job_state != JobState::Running {
        return Err(ControlError::CannotPauseJob(job_state));
    }
    if state.is_transient() {
        tracing::info!("Device {}: pause deferred until {} completes", device.id(), state);
        device.queue_commands([deferred_pause_marker()]);
        return Ok(());
    }
    engage_pause(device)?;
    Ok(())
}

/// No-op when the job is already running.
pub fn resume(device: &mut Device) -> Result<(), ControlError> {
    let job = device.current_job().ok_or(ControlError::NoJobInProgress)?;
    match job.state() {
        JobState::Running => {
            tracing::debug!("Device {}: resume ignored, job already running", device.id());
            Ok(())
        }
        JobState::Paused => {
            let state = device.state();
            if state != DeviceState::Paused {
                return Err(ControlError::CannotResume(state));
            }
            device.fire(DeviceEvent::Resume)?;
            job.resume()?;
            arm_feed(device);
            Ok(())
        }
        other => Err(ControlError::CannotResumeJob(other)),
    }
}

/// Cancel the current job. Entries already queued keep draining; a device
/// held in `paused` is released.
pub fn cancel(device: &mut Device) -> Result<(), ControlError> {
    let job = device.current_job().ok_or(ControlError::NoJobInProgress)?;
    job.cancel()?;
    device.stream = None;
    if device.state() == DeviceState::Paused {
        device.fire(DeviceEvent::Resume)?;
    }
    Ok(())
}

/// Run the start sequence in a `blocking` phase, then stream the program.
pub fn start(device: &mut Device) -> Result<(), ControlError> {
    let job = device.current_job().ok_or(ControlError::NoJobInProgress)?;
    let state = device.state();
    if state != DeviceState::Idle {
        return Err(ControlError::CannotStart(state));
    }
    job.start()?;
    device.stream = Some(JobStream::new(&job));
    let start_sequence = (device.descriptor().commands.start_sequence)();
    transient_sequence(
        device,
        DeviceEvent::Block,
        DeviceEvent::BlockDone,
        "start sequence done",
        start_sequence,
    )?;
    arm_feed(device);
    Ok(())
}

pub fn assign_job(device: &mut Device, job: Arc<Job>) -> Result<(), ControlError> {
    if let Some(current) = device.current_job() {
        if current.id() != job.id() && !current.state().is_finished() {
            return Err(ControlError::JobAlreadyAssigned(current.id()));
        }
    }
    device.set_current_job(&job);
    tracing::info!("Device {}: assigned job {} ({})", device.id(), job.id(), job.file());
    Ok(())
}

/// Unbind `job_id` if it is the device's job. Other jobs are left alone.
/// Refused while the bound job is running or paused.
pub fn release_job(device: &mut Device, job_id: Uuid) -> Result<(), ControlError> {
    match device.current_job() {
        Some(job) if job.id() != job_id => {}
        Some(job) if job.state().is_processing() => {
            return Err(ControlError::JobActive(job_id));
        }
        _ => device.clear_current_job(),
    }
    Ok(())
}

pub fn execute(device: &mut Device, command: &str) -> Result<(), ControlError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(ControlError::EmptyCommand);
    }
    if device.state() == DeviceState::Disconnected {
        return Err(ControlError::NotConnected);
    }
    device.queue_commands([CommandEntry::new(command)]);
    Ok(())
}

pub fn run_blocking(device: &mut Device, commands: Vec<String>) -> Result<(), ControlError> {
    transient_sequence(
        device,
        DeviceEvent::Block,
        DeviceEvent::BlockDone,
        "blocking sequence done",
        commands,
    )?;
    Ok(())
}

/// Enter a transient state now and leave it once `commands` have drained.
/// The closing marker runs even if some of the commands fail.
pub(crate) fn transient_sequence(
    device: &mut Device,
    enter: DeviceEvent,
    leave: DeviceEvent,
    label: &'static str,
    commands: Vec<String>,
) -> Result<(), StateTransitionError> {
    device.fire(enter)?;
    let mut entries: Vec<CommandEntry> = commands.into_iter().map(CommandEntry::new).collect();
    entries.push(CommandEntry::marker(label).after(move |device| {
        device.fire(leave)?;
        Ok(())
    }));
    device.queue_commands(entries);
    Ok(())
}

fn arm_feed(device: &mut Device) {
    let Some(stream) = device.stream.as_mut() else {
        return;
    };
    if stream.feeding {
        return;
    }
    stream.feeding = true;
    device.queue_commands([feed_marker()]);
}

/// Appends the next program line and another feed marker while the job is
/// running. Disarms itself otherwise.
fn feed_marker() -> CommandEntry {
    CommandEntry::marker("feed").after(|device| {
        let Some(stream) = device.stream.as_mut() else {
            return Ok(());
        };
        let job = match stream.job.upgrade() {
            Some(job) if job.state() == JobState::Running => job,
            _ => {
                stream.feeding = false;
                return Ok(());
            }
        };
        job.set_progress(stream.sent());
        if stream.has_more() {
            device.queue_commands([program_line(), feed_marker()]);
            Ok(())
        } else {
            finish_program(device, &job)
        }
    })
}

/// The next program line, taken at transmit time. Sends nothing once the
/// job has stopped running, leaving the line for a later resume.
fn program_line() -> CommandEntry {
    CommandEntry::generated(|device| {
        let Some(stream) = device.stream.as_mut() else {
            return Ok(None);
        };
        let running = stream
            .job
            .upgrade()
            .is_some_and(|job| job.state() == JobState::Running);
        if !running {
            return Ok(None);
        }
        Ok(stream.take_line())
    })
    .labeled("program line")
}

fn finish_program(device: &mut Device, job: &Arc<Job>) -> Result<(), QueueError> {
    job.complete()?;
    device.stream = None;
    let end_sequence = (device.descriptor().commands.end_sequence)();
    transient_sequence(
        device,
        DeviceEvent::Unblock,
        DeviceEvent::UnblockDone,
        "end sequence done",
        end_sequence,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ModelDescriptor;
    use crate::print_job::JobUpdate;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connected_device() -> Device {
        let mut device = Device::new("d1", ModelDescriptor::base(), 10.0);
        device.fire(DeviceEvent::Connect).unwrap();
        device.fire(DeviceEvent::ConnectDone).unwrap();
        device
    }

    fn ready_job() -> (Arc<Job>, mpsc::UnboundedReceiver<JobUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let job = Job::new("d1", "part.gcode", vec!["G1 X1".to_string()], tx, Duration::from_secs(10));
        job.initialization_done().unwrap();
        (job, rx)
    }

    #[test]
    fn pause_without_job_changes_nothing() {
        let mut device = connected_device();
        let err = pause(&mut device).unwrap_err();
        assert_eq!(err.to_string(), "no job in progress");
        assert_eq!(device.state(), DeviceState::Idle);
        assert!(device.queue().is_empty());
    }

    #[test]
    fn pause_from_idle_prepends_halt() {
        let mut device = connected_device();
        let (job, _rx) = ready_job();
        assign_job(&mut device, job.clone()).unwrap();
        job.start().unwrap();
        device.queue_commands([CommandEntry::new("G1 X5")]);

        pause(&mut device).unwrap();
        assert_eq!(device.state(), DeviceState::Pausing);
        assert_eq!(device.state_machine().pauseable_state(), Some(DeviceState::Idle));
        assert_eq!(device.queue().describe(), vec!["[pause: halt]", "G1 X5"]);
        // The job itself is paused by the halt entry, not by the request.
        assert_eq!(job.state(), JobState::Running);
    }

    #[test]
    fn pause_while_blocking_is_deferred_to_the_back() {
        let mut device = connected_device();
        let (job, _rx) = ready_job();
        assign_job(&mut device, job.clone()).unwrap();
        start(&mut device).unwrap();
        assert_eq!(device.state(), DeviceState::Blocking);

        pause(&mut device).unwrap();
        assert_eq!(device.state(), DeviceState::Blocking);
        assert_eq!(
            device.queue().describe(),
            vec!["G28", "G90", "[start sequence done]", "[feed]", "[deferred pause]"]
        );
    }

    #[test]
    fn pause_requires_running_job() {
        let mut device = connected_device();
        let (job, _rx) = ready_job();
        assign_job(&mut device, job).unwrap();
        let err = pause(&mut device).unwrap_err();
        assert_eq!(err.to_string(), "cannot pause job from state ready");
        assert_eq!(device.state(), DeviceState::Idle);
    }

    #[test]
    fn pause_checks_device_state_before_job_state() {
        let mut device = Device::new("d1", ModelDescriptor::base(), 10.0);
        let (job, _rx) = ready_job();
        assign_job(&mut device, job).unwrap();
        let err = pause(&mut device).unwrap_err();
        assert_eq!(err.to_string(), "cannot pause from state disconnected");
    }

    #[test]
    fn second_job_is_refused_while_first_is_active() {
        let mut device = connected_device();
        let (first, _rx1) = ready_job();
        let (second, _rx2) = ready_job();
        assign_job(&mut device, first.clone()).unwrap();
        assert!(matches!(
            assign_job(&mut device, second.clone()),
            Err(ControlError::JobAlreadyAssigned(id)) if id == first.id()
        ));
        first.start().unwrap();
        first.cancel().unwrap();
        assign_job(&mut device, second.clone()).unwrap();
        assert_eq!(device.current_job().map(|job| job.id()), Some(second.id()));
    }

    #[test]
    fn release_refuses_active_job() {
        let mut device = connected_device();
        let (job, _rx) = ready_job();
        assign_job(&mut device, job.clone()).unwrap();
        start(&mut device).unwrap();
        assert!(matches!(
            release_job(&mut device, job.id()),
            Err(ControlError::JobActive(id)) if id == job.id()
        ));
        assert_eq!(device.current_job().map(|job| job.id()), Some(job.id()));

        job.cancel().unwrap();
        release_job(&mut device, job.id()).unwrap();
        assert!(device.current_job().is_none());
    }

    #[test]
    fn execute_refuses_disconnected_device() {
        let mut device = Device::new("d1", ModelDescriptor::base(), 10.0);
        assert!(matches!(execute(&mut device, "G28"), Err(ControlError::NotConnected)));
        let mut device = connected_device();
        assert!(matches!(execute(&mut device, "  "), Err(ControlError::EmptyCommand)));
        execute(&mut device, " M105 ").unwrap();
        assert_eq!(device.queue().describe(), vec!["M105"]);
    }
}
