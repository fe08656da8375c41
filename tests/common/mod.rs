// Shared helpers for the integration tests. Devices run over the simulated
// transport; nothing here touches real hardware.
#![allow(dead_code)]

use forge_rs::communication::{SimulatedConnection, SimulatorHandle, TokioEventSystem};
use forge_rs::device::{Device, DeviceHandle, ModelDescriptor};
use forge_rs::file_manager::FileManager;
use forge_rs::fleet::Fleet;
use forge_rs::job_store::MemoryJobStore;
use forge_shared::config::{DeviceConfig, TransportKind};
use forge_shared::{DeviceSnapshot, DeviceState, JobSnapshot, JobState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn sim_config(id: &str) -> DeviceConfig {
    DeviceConfig {
        id: id.to_string(),
        transport: TransportKind::Simulated,
        model: "marlin".to_string(),
        ..DeviceConfig::default()
    }
}

/// Poll `probe` until it yields a value, failing the test after [`WAIT`].
pub async fn eventually<T, F, Fut>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A single worker over a simulated marlin, already idle.
pub async fn spawn_device(timeout: Duration) -> (DeviceHandle, SimulatorHandle) {
    let (connection, sim) = SimulatedConnection::new("sim");
    let device = Device::new("d1", ModelDescriptor::lookup("marlin").unwrap(), 10.0);
    let (handle, _task) = DeviceHandle::spawn(device, Box::new(connection), timeout);
    wait_for_state(&handle, DeviceState::Idle).await;
    (handle, sim)
}

pub async fn wait_for_state(handle: &DeviceHandle, state: DeviceState) -> DeviceSnapshot {
    eventually(&format!("device {}", state), || async move {
        let snapshot = handle.snapshot().await.unwrap();
        (snapshot.state == state).then_some(snapshot)
    })
    .await
}

/// Wait until nothing is queued or in flight.
pub async fn wait_until_drained(handle: &DeviceHandle) -> DeviceSnapshot {
    eventually("queue to drain", || async move {
        let snapshot = handle.snapshot().await.unwrap();
        (snapshot.queue_depth == 0).then_some(snapshot)
    })
    .await
}

pub async fn wait_until_received(sim: &SimulatorHandle, text: &str) {
    eventually(&format!("'{}' to be sent", text), || async move {
        sim.received().iter().any(|line| line == text).then_some(())
    })
    .await
}

pub struct TestFleet {
    pub fleet: Arc<Fleet>,
    pub store: Arc<MemoryJobStore>,
    pub events: Arc<TokioEventSystem>,
}

pub fn memory_fleet() -> TestFleet {
    let store = Arc::new(MemoryJobStore::new());
    let events = Arc::new(TokioEventSystem::new(64));
    let fleet = Fleet::new(
        store.clone(),
        events.clone(),
        FileManager::default(),
        Duration::from_secs(10),
    );
    TestFleet {
        fleet: Arc::new(fleet),
        store,
        events,
    }
}

/// Register a simulated device and wait for its handshake to finish.
pub async fn add_sim_device(fleet: &Fleet, config: DeviceConfig) -> SimulatorHandle {
    let (connection, sim) = SimulatedConnection::new(&config.id);
    fleet.add_device(&config, Box::new(connection)).await.unwrap();
    let id = config.id.as_str();
    eventually("device to connect", || async move {
        let snapshot = fleet.device(id).await.unwrap();
        (snapshot.state == DeviceState::Idle).then_some(())
    })
    .await;
    sim
}

pub async fn wait_for_device(fleet: &Fleet, id: &str, state: DeviceState) -> DeviceSnapshot {
    eventually(&format!("device {} {}", id, state), || async move {
        let snapshot = fleet.device(id).await.unwrap();
        (snapshot.state == state && snapshot.queue_depth == 0).then_some(snapshot)
    })
    .await
}

pub async fn wait_for_job(fleet: &Fleet, id: Uuid, state: JobState) -> JobSnapshot {
    eventually(&format!("job {}", state), || async move {
        let job = fleet.get_job(id).await.unwrap();
        (job.state == state).then_some(job)
    })
    .await
}

pub fn lines(program: &[&str]) -> Vec<String> {
    program.iter().map(|line| line.to_string()).collect()
}
