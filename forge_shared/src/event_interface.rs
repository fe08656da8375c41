use crate::api_models::BroadcastEvent;
use crate::print_job::JobSnapshot;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("No subscribers for topic '{0}'")]
    NoSubscribers(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Job record {0} not found")]
    NotFound(Uuid),
}

/// Fire-and-forget publication to external listeners.
pub trait EventSink: Send + Sync {
    fn emit(&self, topic: &str, event: BroadcastEvent) -> Result<(), EventError>;
}

/// Durable job records. Failures are reported, never fatal to a transition.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobSnapshot>, StoreError>;
    async fn insert(&self, snapshot: &JobSnapshot) -> Result<(), StoreError>;
    /// Overwrites an existing record; `NotFound` when there is none.
    async fn update(&self, snapshot: &JobSnapshot) -> Result<(), StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
    async fn load_all(&self) -> Result<Vec<JobSnapshot>, StoreError>;
}
