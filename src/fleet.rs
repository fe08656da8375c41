//! Owned device and job registries and the control surface over them.

use crate::communication::{SerialConnection, SimulatedConnection, TokioEventSystem, TopicEvent};
use crate::device::models::UnknownModel;
use crate::device::{Device, DeviceHandle, ModelDescriptor};
use crate::file_manager::{FileManager, FileManagerError};
use crate::job_store::{JsonDirJobStore, MemoryJobStore};
use crate::orchestrator::ControlError;
use crate::print_job::{run_publisher, Job, JobPublisher};
use forge_shared::config::{Config, DeviceConfig, TransportKind};
use forge_shared::event_interface::{EventSink, JobStore, StoreError};
use forge_shared::print_job::JobTransitionError;
use forge_shared::serial_interface::{ConnectionError, DeviceConnection};
use forge_shared::{DeviceSnapshot, JobSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("unknown job {0}")]
    UnknownJob(Uuid),
    #[error("device '{0}' is already registered")]
    DuplicateDevice(String),
    #[error("job {0} is still running or paused")]
    JobActive(Uuid),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Job(#[from] JobTransitionError),
    #[error(transparent)]
    File(#[from] FileManagerError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Model(#[from] UnknownModel),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Fleet {
    devices: RwLock<HashMap<String, DeviceHandle>>,
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn JobStore>,
    events: Arc<TokioEventSystem>,
    publisher: JobPublisher,
    files: FileManager,
    tick_interval: Duration,
}

impl Fleet {
    /// Empty fleet. Spawns the job snapshot publisher, so it must be called
    /// inside a tokio runtime.
    pub fn new(
        store: Arc<dyn JobStore>,
        events: Arc<TokioEventSystem>,
        files: FileManager,
        tick_interval: Duration,
    ) -> Self {
        let (publisher, updates) = tokio::sync::mpsc::unbounded_channel();
        let sink: Arc<dyn EventSink> = events.clone();
        tokio::spawn(run_publisher(updates, store.clone(), sink));
        Self {
            devices: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            store,
            events,
            publisher,
            files,
            tick_interval,
        }
    }

    /// Fleet described by `config`: job store, event bus and every device.
    pub async fn from_config(config: &Config) -> Result<Self, FleetError> {
        let store: Arc<dyn JobStore> = match &config.server.job_store {
            Some(dir) => Arc::new(JsonDirJobStore::open(dir).await?),
            None => Arc::new(MemoryJobStore::new()),
        };
        let events = Arc::new(TokioEventSystem::new(config.server.event_buffer));
        let fleet = Self::new(
            store,
            events,
            FileManager::default(),
            config.server.tick_interval(),
        );
        for device in &config.devices {
            fleet.open_device(device).await?;
        }
        Ok(fleet)
    }

    /// Connect the transport `config` names and register the device.
    pub async fn open_device(&self, config: &DeviceConfig) -> Result<DeviceSnapshot, FleetError> {
        let connection: Box<dyn DeviceConnection> = match config.transport {
            TransportKind::Serial => Box::new(SerialConnection::open(&config.port, config.baud)?),
            TransportKind::Simulated => {
                let (connection, _handle) = SimulatedConnection::new(&config.id);
                Box::new(connection)
            }
        };
        self.add_device(config, connection).await
    }

    /// Register a device over an already open connection and start its worker.
    pub async fn add_device(
        &self,
        config: &DeviceConfig,
        connection: Box<dyn DeviceConnection>,
    ) -> Result<DeviceSnapshot, FleetError> {
        let descriptor = ModelDescriptor::from_config(config)?;
        let mut devices = self.devices.write().await;
        if devices.contains_key(&config.id) {
            return Err(FleetError::DuplicateDevice(config.id.clone()));
        }
        let device = Device::new(&config.id, descriptor, config.lift_clearance);
        let (handle, worker) = DeviceHandle::spawn(device, connection, config.response_timeout());
        devices.insert(config.id.clone(), handle.clone());
        drop(devices);
        self.workers.lock().await.push(worker);
        tracing::info!("Registered device {} ({})", config.id, config.model);
        Ok(handle.snapshot().await?)
    }

    /// Reload persisted jobs. Anything that was not finished comes back canceled.
    pub async fn restore_jobs(&self) -> Result<usize, FleetError> {
        let records = self.store.load_all().await?;
        let count = records.len();
        let mut jobs = self.jobs.write().await;
        for record in records {
            let job = Job::restore(record, self.publisher.clone(), self.tick_interval);
            jobs.insert(job.id(), job);
        }
        tracing::info!("Restored {} job(s)", count);
        Ok(count)
    }

    async fn handle(&self, device_id: &str) -> Result<DeviceHandle, FleetError> {
        match self.devices.read().await.get(device_id) {
            Some(handle) => Ok(handle.clone()),
            None => {
                tracing::warn!("Unknown device '{}'", device_id);
                Err(FleetError::UnknownDevice(device_id.to_string()))
            }
        }
    }

    fn checked(
        device_id: &str,
        operation: &str,
        result: Result<DeviceSnapshot, ControlError>,
    ) -> Result<DeviceSnapshot, FleetError> {
        result.map_err(|e| {
            tracing::warn!("Device {}: {} refused: {}", device_id, operation, e);
            FleetError::Control(e)
        })
    }

    pub async fn device(&self, device_id: &str) -> Result<DeviceSnapshot, FleetError> {
        let handle = self.handle(device_id).await?;
        Ok(handle.snapshot().await?)
    }

    /// Snapshots of every device with a live worker, ordered by id.
    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        let handles: Vec<DeviceHandle> = self.devices.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.snapshot().await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!("{}", e),
            }
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub async fn start(&self, device_id: &str) -> Result<DeviceSnapshot, FleetError> {
        let handle = self.handle(device_id).await?;
        Self::checked(device_id, "start", handle.start().await)
    }

    pub async fn pause(&self, device_id: &str) -> Result<DeviceSnapshot, FleetError> {
        let handle = self.handle(device_id).await?;
        Self::checked(device_id, "pause", handle.pause().await)
    }

    pub async fn resume(&self, device_id: &str) -> Result<DeviceSnapshot, FleetError> {
        let handle = self.handle(device_id).await?;
        Self::checked(device_id, "resume", handle.resume().await)
    }

    pub async fn cancel(&self, device_id: &str) -> Result<DeviceSnapshot, FleetError> {
        let handle = self.handle(device_id).await?;
        Self::checked(device_id, "cancel", handle.cancel().await)
    }

    pub async fn execute(&self, device_id: &str, command: &str) -> Result<DeviceSnapshot, FleetError> {
        let handle = self.handle(device_id).await?;
        Self::checked(device_id, "execute", handle.execute(command).await)
    }

    /// Load `file` and bind it to the device as a `ready` job.
    pub async fn create_job(&self, device_id: &str, file: &str) -> Result<JobSnapshot, FleetError> {
        self.handle(device_id).await?;
        let program = self.files.load_program(file).await.inspect_err(|e| {
            tracing::warn!("Device {}: cannot load job file: {}", device_id, e);
        })?;
        self.create_job_from_lines(device_id, file, program).await
    }

    pub async fn create_job_from_lines(
        &self,
        device_id: &str,
        file: &str,
        program: Vec<String>,
    ) -> Result<JobSnapshot, FleetError> {
        let handle = self.handle(device_id).await?;
        let job = Job::new(device_id, file, program, self.publisher.clone(), self.tick_interval);
        job.initialization_done()?;
        if let Err(e) = Self::checked(device_id, "assign job", handle.assign_job(job.clone()).await) {
            job.announce_deleted();
            return Err(e);
        }
        self.jobs.write().await.insert(job.id(), job.clone());
        Ok(job.snapshot())
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobSnapshot, FleetError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .map(|job| job.snapshot())
            .ok_or(FleetError::UnknownJob(id))
    }

    /// Every known job, oldest start first; never-started jobs last.
    pub async fn get_jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .jobs
            .read()
            .await
            .values()
            .map(|job| job.snapshot())
            .collect();
        jobs.sort_by_key(|job| (job.started_at.is_none(), job.started_at));
        jobs
    }

    /// Remove a job that is not running or paused, unbinding it from its device.
    pub async fn delete_job(&self, id: Uuid) -> Result<JobSnapshot, FleetError> {
        let job = self
            .jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(FleetError::UnknownJob(id))?;
        if job.state().is_processing() {
            tracing::warn!("Job {}: delete refused, still {}", id, job.state());
            return Err(FleetError::JobActive(id));
        }
        // The worker re-checks the job state, serialized with `start`.
        let handle = self.devices.read().await.get(job.device_id()).cloned();
        if let Some(handle) = handle {
            match handle.release_job(id).await {
                Ok(_) => {}
                Err(ControlError::JobActive(_)) => {
                    tracing::warn!("Job {}: delete refused, started meanwhile", id);
                    return Err(FleetError::JobActive(id));
                }
                Err(e) => {
                    tracing::warn!("Device {}: release job refused: {}", job.device_id(), e);
                    return Err(FleetError::Control(e));
                }
            }
        }
        self.jobs.write().await.remove(&id);
        job.announce_deleted();
        tracing::info!("Job {}: deleted", id);
        Ok(job.snapshot())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicEvent> {
        self.events.subscribe()
    }

    /// Stop every device worker and wait for them to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<DeviceHandle> = self.devices.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.shutdown().await;
        }
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Device worker failed: {}", e);
            }
        }
    }
}
