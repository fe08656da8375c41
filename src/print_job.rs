//! Job life cycle: state machine, elapsed-time tracking, progress and the
//! snapshot publisher that persists and broadcasts every change.

use chrono::{DateTime, Utc};
use forge_shared::event_interface::{EventSink, JobStore};
use forge_shared::print_job::{JobEvent, JobSnapshot, JobState, JobTransition, JobTransitionError};
use forge_shared::{BroadcastEvent, EventKind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const JOB_TOPIC: &str = "jobs";

/// A snapshot on its way to the store and subscribers.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub kind: EventKind,
    pub snapshot: JobSnapshot,
}

pub type JobPublisher = mpsc::UnboundedSender<JobUpdate>;

#[derive(Debug)]
struct JobInner {
    state: JobState,
    started_at: Option<DateTime<Utc>>,
    elapsed: Duration,
    running_since: Option<Instant>,
    percent_complete: f64,
    ticker: Option<JoinHandle<()>>,
}

/// Execution of one program file on one device.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    device_id: String,
    file: String,
    program: Arc<Vec<String>>,
    inner: Mutex<JobInner>,
    publisher: JobPublisher,
    tick_interval: Duration,
}

impl Job {
    /// New job in `initializing`. Announced to subscribers as `new`.
    pub fn new(
        device_id: &str,
        file: &str,
        program: Vec<String>,
        publisher: JobPublisher,
        tick_interval: Duration,
    ) -> Arc<Self> {
        let job = Arc::new(Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            file: file.to_string(),
            program: Arc::new(program),
            inner: Mutex::new(JobInner {
                state: JobState::Initializing,
                started_at: None,
                elapsed: Duration::ZERO,
                running_since: None,
                percent_complete: 0.0,
                ticker: None,
            }),
            publisher,
            tick_interval,
        });
        job.publish(EventKind::New, job.snapshot());
        job
    }

    /// Rebuild a job from its persisted record. Unfinished jobs come back
    /// `canceled`; the change is published so the record catches up.
    pub fn restore(snapshot: JobSnapshot, publisher: JobPublisher, tick_interval: Duration) -> Arc<Self> {
        let state = JobState::restored(snapshot.state);
        let job = Arc::new(Self {
            id: snapshot.id,
            device_id: snapshot.device_id.clone(),
            file: snapshot.file.clone(),
            program: Arc::new(Vec::new()),
            inner: Mutex::new(JobInner {
                state,
                started_at: snapshot.started_at,
                elapsed: Duration::from_millis(snapshot.elapsed_ms),
                running_since: None,
                percent_complete: snapshot.percent_complete,
                ticker: None,
            }),
            publisher,
            tick_interval,
        });
        if state != snapshot.state {
            tracing::info!("Job {}: restored as {} (was {})", job.id, state, snapshot.state);
            job.publish(EventKind::Update, job.snapshot());
        }
        job
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn program(&self) -> Arc<Vec<String>> {
        self.program.clone()
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn elapsed(&self) -> Duration {
        let inner = self.lock();
        inner.elapsed + inner.running_since.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Whether elapsed time is currently accumulating.
    pub fn timer_running(&self) -> bool {
        self.lock().running_since.is_some()
    }

    pub fn percent_complete(&self) -> f64 {
        self.lock().percent_complete
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.lock();
        self.snapshot_of(&inner)
    }

    fn snapshot_of(&self, inner: &JobInner) -> JobSnapshot {
        let elapsed = inner.elapsed + inner.running_since.map(|t| t.elapsed()).unwrap_or_default();
        JobSnapshot {
            id: self.id,
            device_id: self.device_id.clone(),
            state: inner.state,
            file: self.file.clone(),
            started_at: inner.started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            percent_complete: inner.percent_complete,
        }
    }

    fn publish(&self, kind: EventKind, snapshot: JobSnapshot) {
        if self.publisher.send(JobUpdate { kind, snapshot }).is_err() {
            tracing::warn!("Job {}: publisher gone, {:?} not recorded", self.id, kind);
        }
    }

    pub fn initialization_done(self: &Arc<Self>) -> Result<JobTransition, JobTransitionError> {
        self.fire(JobEvent::InitializationDone)
    }

    /// `ready -> running`; records the start time and starts the timer.
    pub fn start(self: &Arc<Self>) -> Result<JobTransition, JobTransitionError> {
        self.fire(JobEvent::Start)
    }

    pub fn pause(self: &Arc<Self>) -> Result<JobTransition, JobTransitionError> {
        self.fire(JobEvent::Pause)
    }

    pub fn resume(self: &Arc<Self>) -> Result<JobTransition, JobTransitionError> {
        self.fire(JobEvent::Resume)
    }

    pub fn cancel(self: &Arc<Self>) -> Result<JobTransition, JobTransitionError> {
        self.fire(JobEvent::Cancel)
    }

    pub fn complete(self: &Arc<Self>) -> Result<JobTransition, JobTransitionError> {
        self.fire(JobEvent::CompleteJob)
    }

    /// Record how many program lines have completed. Not broadcast; the
    /// periodic tick carries it.
    pub fn set_progress(&self, completed: usize) {
        let total = self.program.len();
        if total == 0 {
            return;
        }
        let percent = (completed.min(total) as f64 / total as f64) * 100.0;
        self.lock().percent_complete = percent;
    }

    /// Tell subscribers and the store this job is gone.
    pub fn announce_deleted(&self) {
        let mut inner = self.lock();
        stop_timer(&mut inner);
        let snapshot = self.snapshot_of(&inner);
        self.publish(EventKind::Delete, snapshot);
    }

    fn fire(self: &Arc<Self>, event: JobEvent) -> Result<JobTransition, JobTransitionError> {
        let mut inner = self.lock();
        let from = inner.state;
        let transition = from.apply(event)?;
        let JobTransition::Changed(to) = transition else {
            tracing::debug!("Job {}: {} ignored, already {}", self.id, event, from);
            return Ok(transition);
        };
        inner.state = to;
        match event {
            JobEvent::Start => {
                inner.started_at = Some(Utc::now());
                self.start_timer(&mut inner);
            }
            JobEvent::Resume => self.start_timer(&mut inner),
            JobEvent::Pause | JobEvent::Cancel => stop_timer(&mut inner),
            JobEvent::CompleteJob => {
                inner.percent_complete = 100.0;
                stop_timer(&mut inner);
            }
            JobEvent::InitializationDone => {}
        }
        tracing::info!("Job {}: {} ({} -> {})", self.id, event, from, to);
        let snapshot = self.snapshot_of(&inner);
        self.publish(EventKind::Update, snapshot);
        Ok(transition)
    }

    fn start_timer(self: &Arc<Self>, inner: &mut JobInner) {
        inner.running_since = Some(Instant::now());
        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
        inner.ticker = self.spawn_ticker();
    }

    /// Re-broadcast the snapshot every tick while running.
    fn spawn_ticker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let job = Arc::downgrade(self);
        let period = self.tick_interval;
        Some(runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(job) = job.upgrade() else { break };
                if job.state() != JobState::Running {
                    break;
                }
                job.publish(EventKind::Update, job.snapshot());
            }
        }))
    }
}

fn stop_timer(inner: &mut JobInner) {
    if let Some(since) = inner.running_since.take() {
        inner.elapsed += since.elapsed();
    }
    if let Some(ticker) = inner.ticker.take() {
        ticker.abort();
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
    }
}

/// Persist then broadcast every job update, in the order they were produced.
/// Failures on either side channel are logged and never propagate.
pub async fn run_publisher(
    mut updates: mpsc::UnboundedReceiver<JobUpdate>,
    store: Arc<dyn JobStore>,
    events: Arc<dyn EventSink>,
) {
    while let Some(JobUpdate { kind, snapshot }) = updates.recv().await {
        let id = snapshot.id;
        let persisted = match kind {
            EventKind::New => store.insert(&snapshot).await,
            EventKind::Update => store.update(&snapshot).await,
            EventKind::Delete => store.delete(id).await,
        };
        if let Err(e) = persisted {
            tracing::warn!("Failed to persist job {}: {}", id, e);
        }
        let data = match serde_json::to_value(&snapshot) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Failed to serialize job {}: {}", id, e);
                continue;
            }
        };
        let event = BroadcastEvent {
            uuid: id.to_string(),
            event: kind,
            data,
        };
        if let Err(e) = events.emit(JOB_TOPIC, event) {
            tracing::debug!("Job {} update not broadcast: {}", id, e);
        }
    }
    tracing::debug!("Job publisher stopped");
}
