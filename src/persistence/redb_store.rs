use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, TableError};

use super::{Ack, StorageBackend, StorageError, newest_first};
use crate::extraction::VerificationVerdict;
use crate::identifier::Identifier;

/// Sequence number -> JSON-encoded verdict.
const VERDICTS: TableDefinition<u64, &[u8]> = TableDefinition::new("verification_verdicts");

/// Embedded append-only store. Blocking database work runs on the blocking pool.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage").finish_non_exhaustive()
    }
}

impl RedbStorage {
    /// Open or create the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(transient)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn append_blocking(db: &Database, encoded: &[u8]) -> Result<u64, redb::Error> {
        let txn = db.begin_write()?;
        let key = {
            let mut table = txn.open_table(VERDICTS)?;
            let next = table.last()?.map(|(key, _)| key.value() + 1).unwrap_or(0);
            table.insert(next, encoded)?;
            next
        };
        txn.commit()?;
        Ok(key)
    }

    fn load_blocking(db: &Database) -> Result<Vec<Vec<u8>>, redb::Error> {
        let txn = db.begin_read()?;
        let table = match txn.open_table(VERDICTS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            rows.push(value.value().to_vec());
        }
        Ok(rows)
    }
}

fn transient(err: impl Into<redb::Error>) -> StorageError {
    StorageError::Transient(err.into().to_string())
}

fn join_error(err: tokio::task::JoinError) -> StorageError {
    StorageError::Transient(format!("storage task failed: {err}"))
}

#[async_trait]
impl StorageBackend for RedbStorage {
    fn name(&self) -> &'static str {
        "redb"
    }

    async fn append(&self, verdict: &VerificationVerdict) -> Result<Ack, StorageError> {
        let encoded =
            serde_json::to_vec(verdict).map_err(|err| StorageError::Rejected(err.to_string()))?;
        let db = Arc::clone(&self.db);
        let key = tokio::task::spawn_blocking(move || Self::append_blocking(&db, &encoded))
            .await
            .map_err(join_error)?
            .map_err(transient)?;
        Ok(Ack::new(Some(key.to_string())))
    }

    async fn history(
        &self,
        identifier: Option<&Identifier>,
        limit: usize,
    ) -> Result<Vec<VerificationVerdict>, StorageError> {
        let db = Arc::clone(&self.db);
        let rows = tokio::task::spawn_blocking(move || Self::load_blocking(&db))
            .await
            .map_err(join_error)?
            .map_err(transient)?;

        let verdicts = rows
            .iter()
            .map(|row| serde_json::from_slice::<VerificationVerdict>(row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StorageError::Corrupt(err.to_string()))?;
        Ok(newest_first(verdicts.into_iter(), identifier, limit))
    }
}
