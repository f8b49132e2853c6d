use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{EditInstancePayload, InstanceRecord};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Durable store of desired instance records, keyed by instance id.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get_all(&self) -> Result<Vec<InstanceRecord>, RepositoryError>;
    async fn get_by_id(&self, id: &str) -> Result<Option<InstanceRecord>, RepositoryError>;
    async fn create(&self, record: InstanceRecord) -> Result<InstanceRecord, RepositoryError>;
    /// Merge a partial payload into the stored record and return the result.
    async fn update(
        &self,
        id: &str,
        patch: EditInstancePayload,
    ) -> Result<InstanceRecord, RepositoryError>;
    async fn update_container_id(
        &self,
        id: &str,
        container_id: Option<String>,
    ) -> Result<(), RepositoryError>;
    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;
}

/// In-memory repository for development and testing.
#[derive(Default)]
pub struct InMemoryRepository {
    records: Arc<RwLock<HashMap<String, InstanceRecord>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryRepository {
    async fn get_all(&self) -> Result<Vec<InstanceRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<InstanceRecord>, RepositoryError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn create(&self, record: InstanceRecord) -> Result<InstanceRecord, RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(RepositoryError::Backend(format!(
                "duplicate instance id {}",
                record.id
            )));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        id: &str,
        patch: EditInstancePayload,
    ) -> Result<InstanceRecord, RepositoryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        record.apply(&patch);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn update_container_id(
        &self,
        id: &str,
        container_id: Option<String>,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        record.container_id = container_id;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.records
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }
}
