//! Messages between control callers and a device's worker task, and the
//! cloneable handle that sends them.

use super::worker::DeviceWorker;
use super::Device;
use crate::command_queue::CommandEntry;
use crate::orchestrator::ControlError;
use crate::print_job::Job;
use forge_shared::DeviceSnapshot;
use forge_shared::serial_interface::DeviceConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type ControlReply = oneshot::Sender<Result<DeviceSnapshot, ControlError>>;

/// Where injected entries go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Front,
    Back,
}

/// Represents a request sent to a device's worker task.
#[derive(Debug)]
pub enum DeviceRequest {
    /// Current device snapshot.
    Snapshot {
        respond_to: oneshot::Sender<DeviceSnapshot>,
    },
    /// Bind a job to the device.
    AssignJob { job: Arc<Job>, respond_to: ControlReply },
    /// Unbind a job that is being deleted.
    ReleaseJob { job_id: Uuid, respond_to: ControlReply },
    /// Start the bound job.
    Start { respond_to: ControlReply },
    Pause { respond_to: ControlReply },
    Resume { respond_to: ControlReply },
    Cancel { respond_to: ControlReply },
    /// Queue one raw instruction.
    Execute { command: String, respond_to: ControlReply },
    /// Queue instructions to run inside a non-interruptible `blocking` phase.
    RunBlocking {
        commands: Vec<String>,
        respond_to: ControlReply,
    },
    /// Inject arbitrary entries.
    Enqueue {
        entries: Vec<CommandEntry>,
        placement: Placement,
        respond_to: oneshot::Sender<DeviceSnapshot>,
    },
    /// Stop the worker.
    Shutdown,
}

/// Cloneable handle onto one device's worker.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    id: String,
    tx: mpsc::Sender<DeviceRequest>,
}

impl DeviceHandle {
    /// Start the worker task that owns `device` and `connection`.
    pub fn spawn(
        device: Device,
        connection: Box<dyn DeviceConnection>,
        response_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let id = device.id().to_string();
        let worker = DeviceWorker::new(device, connection, rx, response_timeout);
        let task = tokio::spawn(worker.run());
        (Self { id, tx }, task)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DeviceRequest,
    ) -> Result<T, ControlError> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(build(respond_to))
            .await
            .map_err(|_| ControlError::WorkerGone(self.id.clone()))?;
        response
            .await
            .map_err(|_| ControlError::WorkerGone(self.id.clone()))
    }

    pub async fn snapshot(&self) -> Result<DeviceSnapshot, ControlError> {
        self.call(|respond_to| DeviceRequest::Snapshot { respond_to }).await
    }

    pub async fn assign_job(&self, job: Arc<Job>) -> Result<DeviceSnapshot, ControlError> {
        self.call(|respond_to| DeviceRequest::AssignJob { job, respond_to }).await?
    }

    pub async fn release_job(&self, job_id: Uuid) -> Result<DeviceSnapshot, ControlError> {
        self.call(|respond_to| DeviceRequest::ReleaseJob { job_id, respond_to }).await?
    }

    pub async fn start(&self) -> Result<DeviceSnapshot, ControlError> {
        self.call(|respond_to| DeviceRequest::Start { respond_to }).await?
    }

    pub async fn pause(&self) -> Result<DeviceSnapshot, ControlError> {
        self.call(|respond_to| DeviceRequest::Pause { respond_to }).await?
    }

    pub async fn resume(&self) -> Result<DeviceSnapshot, ControlError> {
        self.call(|respond_to| DeviceRequest::Resume { respond_to }).await?
    }

    pub async fn cancel(&self) -> Result<DeviceSnapshot, ControlError> {
        self.call(|respond_to| DeviceRequest::Cancel { respond_to }).await?
    }

    pub async fn execute(&self, command: &str) -> Result<DeviceSnapshot, ControlError> {
        let command = command.to_string();
        self.call(|respond_to| DeviceRequest::Execute { command, respond_to }).await?
    }

    pub async fn run_blocking(&self, commands: Vec<String>) -> Result<DeviceSnapshot, ControlError> {
        self.call(|respond_to| DeviceRequest::RunBlocking { commands, respond_to }).await?
    }

    pub async fn enqueue(
        &self,
        entries: Vec<CommandEntry>,
        placement: Placement,
    ) -> Result<DeviceSnapshot, ControlError> {
        self.call(|respond_to| DeviceRequest::Enqueue {
            entries,
            placement,
            respond_to,
        })
        .await
    }

    pub async fn shutdown(&self) {
        if self.tx.send(DeviceRequest::Shutdown).await.is_err() {
            tracing::debug!("Device {} worker already stopped", self.id);
        }
    }
}
