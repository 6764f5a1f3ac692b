//! Persistence gateway.
//!
//! Append-only storage of verdicts behind the `StorageBackend` capability.
//! Retries belong to the orchestrator; the gateway performs single attempts.

mod redb_store;
mod supabase;

pub use redb_store::RedbStorage;
pub use supabase::SupabaseStorage;

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::extraction::VerificationVerdict;
use crate::identifier::Identifier;
use crate::pipeline::FailureKind;

/// Acknowledgement returned by a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Backend-assigned record key, when the backend exposes one.
    pub record_id: Option<String>,
    pub stored_at: DateTime<Utc>,
}

impl Ack {
    pub fn new(record_id: Option<String>) -> Self {
        Self {
            record_id,
            stored_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),
    #[error("storage rejected the request: {0}")]
    Rejected(String),
    #[error("stored record could not be decoded: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            StorageError::Transient(_) => FailureKind::StorageTransient,
            StorageError::Rejected(_) => FailureKind::StorageRejected,
            StorageError::Corrupt(_) => FailureKind::StorageCorrupt,
        }
    }
}

/// Durable, append-only verdict store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn append(&self, verdict: &VerificationVerdict) -> Result<Ack, StorageError>;

    /// Most recent verdicts first, optionally filtered by identifier.
    async fn history(
        &self,
        identifier: Option<&Identifier>,
        limit: usize,
    ) -> Result<Vec<VerificationVerdict>, StorageError>;
}

/// Thin front over the configured backend.
#[derive(Clone)]
pub struct PersistenceGateway {
    backend: Arc<dyn StorageBackend>,
}

impl fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl PersistenceGateway {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn store(&self, verdict: &VerificationVerdict) -> Result<Ack, StorageError> {
        let ack = self.backend.append(verdict).await?;
        log::debug!(
            "stored {} verdict for {} in {}",
            verdict.status,
            verdict.identifier,
            self.backend.name()
        );
        Ok(ack)
    }

    pub async fn history(
        &self,
        identifier: Option<&Identifier>,
        limit: usize,
    ) -> Result<Vec<VerificationVerdict>, StorageError> {
        self.backend.history(identifier, limit).await
    }
}

/// In-process store, useful for tests and ephemeral deployments.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    records: Arc<Mutex<Vec<VerificationVerdict>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<VerificationVerdict> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, verdict: &VerificationVerdict) -> Result<Ack, StorageError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StorageError::Transient("memory store poisoned".into()))?;
        records.push(verdict.clone());
        Ok(Ack::new(Some((records.len() - 1).to_string())))
    }

    async fn history(
        &self,
        identifier: Option<&Identifier>,
        limit: usize,
    ) -> Result<Vec<VerificationVerdict>, StorageError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StorageError::Transient("memory store poisoned".into()))?;
        Ok(newest_first(records.iter().cloned(), identifier, limit))
    }
}

/// Filter by identifier and order newest first; ties keep reverse insertion order.
pub(crate) fn newest_first(
    records: impl DoubleEndedIterator<Item = VerificationVerdict>,
    identifier: Option<&Identifier>,
    limit: usize,
) -> Vec<VerificationVerdict> {
    let mut matching: Vec<_> = records
        .rev()
        .filter(|verdict| identifier.is_none_or(|id| &verdict.identifier == id))
        .collect();
    matching.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
    matching.truncate(limit);
    matching
}


#[cfg(test)]
mod tests {
    use super::fixtures::verdict;
    use super::*;
    use crate::extraction::VerdictStatus;

    const A: &str = "359871977331199";
    const B: &str = "490154203237518";

    #[tokio::test]
    async fn memory_store_is_append_only() {
        let store = MemoryStorage::new();
        let gateway = PersistenceGateway::new(Arc::new(store.clone()));
        let first = verdict(A, VerdictStatus::Compliant, 0);

        gateway.store(&first).await.unwrap();
        gateway.store(&first).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(gateway.backend_name(), "memory");
    }

    #[tokio::test]
    async fn history_filters_and_orders_newest_first() {
        let store = MemoryStorage::new();
        store.append(&verdict(A, VerdictStatus::NonCompliant, 1)).await.unwrap();
        store.append(&verdict(B, VerdictStatus::Compliant, 2)).await.unwrap();
        store.append(&verdict(A, VerdictStatus::Compliant, 3)).await.unwrap();

        let id = Identifier::parse(A).unwrap();
        let history = store.history(Some(&id), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, VerdictStatus::Compliant);
        assert_eq!(history[1].status, VerdictStatus::NonCompliant);

        let latest = store.history(None, 1).await.unwrap();
        assert_eq!(latest[0].identifier.as_str(), A);
        assert_eq!(latest[0].checked_at.format("%M").to_string(), "03");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StorageError::Transient("503".into()).is_retryable());
        assert!(!StorageError::Rejected("401".into()).is_retryable());
        assert!(!StorageError::Corrupt("bad json".into()).is_retryable());
    }

    #[test]
    fn failure_kind_follows_error_variant() {
        assert_eq!(
            StorageError::Transient("503".into()).failure_kind(),
            FailureKind::StorageTransient
        );
        assert_eq!(
            StorageError::Rejected("401".into()).failure_kind(),
            FailureKind::StorageRejected
        );
        assert_eq!(
            StorageError::Corrupt("bad json".into()).failure_kind(),
            FailureKind::StorageCorrupt
        );
    }
}
