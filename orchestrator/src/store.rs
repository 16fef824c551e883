//! Operation record storage
//!
//! Records are keyed by operation ID. Deposits are additionally indexed by
//! external reference; admission checks and updates that index as one step
//! so two concurrent submissions of the same transfer cannot both create a
//! record.

use crate::record::OperationRecord;
use dashmap::DashMap;
use parking_lot::Mutex;
use reserve_core::{OperationId, OperationStatus, Result};
use std::collections::HashMap;

/// Result of admitting a new record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Record stored
    Created,
    /// A live record already holds this external reference
    Existing(OperationId),
}

/// Durable home of operation records
pub trait OperationStore: Send + Sync {
    /// Store a new record unless its external reference already has a non-`Failed` record
    fn admit(&self, record: &OperationRecord) -> Result<Admission>;

    /// Overwrite a record
    fn save(&self, record: &OperationRecord) -> Result<()>;

    /// Load a record
    fn get(&self, id: &OperationId) -> Result<Option<OperationRecord>>;

    /// Records not yet in a terminal state
    fn unfinished(&self) -> Result<Vec<OperationRecord>>;

    /// Number of records stored
    fn count(&self) -> Result<usize>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<OperationId, OperationRecord>,
    references: Mutex<HashMap<String, OperationId>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl OperationStore for InMemoryStore {
    fn admit(&self, record: &OperationRecord) -> Result<Admission> {
        let Some(reference) = record.external_reference.as_deref() else {
            self.records.insert(record.id, record.clone());
            return Ok(Admission::Created);
        };

        let mut references = self.references.lock();
        if let Some(existing) = references.get(reference) {
            let live = self
                .records
                .get(existing)
                .map(|r| r.status != OperationStatus::Failed)
                .unwrap_or(false);
            if live {
                return Ok(Admission::Existing(*existing));
            }
        }
        self.records.insert(record.id, record.clone());
        references.insert(reference.to_string(), record.id);
        Ok(Admission::Created)
    }

    fn save(&self, record: &OperationRecord) -> Result<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    fn get(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    fn unfinished(&self) -> Result<Vec<OperationRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.clone())
            .collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.records.len())
    }
}

#[cfg(feature = "rocksdb")]
pub use self::durable::RocksDbStore;

#[cfg(feature = "rocksdb")]
mod durable {
    //! RocksDB-backed store
    //!
    //! # Column Families
    //!
    //! - `operations` - Operation records (key: operation ID bytes)
    //! - `references` - External reference index (key: reference, value: operation ID bytes)

    use super::{Admission, OperationStore};
    use crate::record::OperationRecord;
    use parking_lot::Mutex;
    use reserve_core::{Error, OperationId, OperationStatus, Result};
    use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
    use std::path::Path;
    use std::sync::Arc;

    const CF_OPERATIONS: &str = "operations";
    const CF_REFERENCES: &str = "references";

    /// Store backed by RocksDB
    pub struct RocksDbStore {
        db: Arc<DB>,
        admission: Mutex<()>,
    }

    impl std::fmt::Debug for RocksDbStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RocksDbStore")
                .field("path", &self.db.path())
                .finish()
        }
    }

    impl RocksDbStore {
        /// Open or create the database at `path`
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            std::fs::create_dir_all(path)?;

            let mut db_opts = Options::default();
            db_opts.create_if_missing(true);
            db_opts.create_missing_column_families(true);

            let mut operations_opts = Options::default();
            operations_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

            let cf_descriptors = vec![
                ColumnFamilyDescriptor::new(CF_OPERATIONS, operations_opts),
                ColumnFamilyDescriptor::new(CF_REFERENCES, Options::default()),
            ];

            let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)
                .map_err(|e| Error::Storage(e.to_string()))?;
            tracing::info!("Opened operation store at {:?}", path);

            Ok(Self {
                db: Arc::new(db),
                admission: Mutex::new(()),
            })
        }

        fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
            self.db
                .cf_handle(name)
                .ok_or_else(|| Error::Storage(format!("Column family not found: {}", name)))
        }

        fn decode(bytes: &[u8]) -> Result<OperationRecord> {
            Ok(serde_json::from_slice(bytes)?)
        }
    }

    impl OperationStore for RocksDbStore {
        fn admit(&self, record: &OperationRecord) -> Result<Admission> {
            let _guard = self.admission.lock();
            let cf_operations = self.cf_handle(CF_OPERATIONS)?;
            let cf_references = self.cf_handle(CF_REFERENCES)?;

            if let Some(reference) = record.external_reference.as_deref() {
                let existing = self
                    .db
                    .get_cf(cf_references, reference.as_bytes())
                    .map_err(|e| Error::Storage(e.to_string()))?;
                if let Some(id_bytes) = existing {
                    let id_bytes: [u8; 32] = id_bytes.as_slice().try_into().map_err(|_| {
                        Error::Storage(format!("corrupt reference index for {}", reference))
                    })?;
                    let id = OperationId::from_bytes(id_bytes);
                    if let Some(existing) = self.get(&id)? {
                        if existing.status != OperationStatus::Failed {
                            return Ok(Admission::Existing(id));
                        }
                    }
                }
            }

            let mut batch = WriteBatch::default();
            batch.put_cf(
                cf_operations,
                record.id.as_bytes(),
                serde_json::to_vec(record)?,
            );
            if let Some(reference) = record.external_reference.as_deref() {
                batch.put_cf(cf_references, reference.as_bytes(), record.id.as_bytes());
            }
            self.db
                .write(batch)
                .map_err(|e| Error::Storage(e.to_string()))?;
            Ok(Admission::Created)
        }

        fn save(&self, record: &OperationRecord) -> Result<()> {
            let cf = self.cf_handle(CF_OPERATIONS)?;
            self.db
                .put_cf(cf, record.id.as_bytes(), serde_json::to_vec(record)?)
                .map_err(|e| Error::Storage(e.to_string()))
        }

        fn get(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
            let cf = self.cf_handle(CF_OPERATIONS)?;
            self.db
                .get_cf(cf, id.as_bytes())
                .map_err(|e| Error::Storage(e.to_string()))?
                .map(|bytes| Self::decode(&bytes))
                .transpose()
        }

        fn unfinished(&self) -> Result<Vec<OperationRecord>> {
            let cf = self.cf_handle(CF_OPERATIONS)?;
            let mut records = Vec::new();
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (_, value) = item.map_err(|e| Error::Storage(e.to_string()))?;
                let record = Self::decode(&value)?;
                if !record.status.is_terminal() {
                    records.push(record);
                }
            }
            Ok(records)
        }

        fn count(&self) -> Result<usize> {
            let cf = self.cf_handle(CF_OPERATIONS)?;
            Ok(self.db.iterator_cf(cf, IteratorMode::Start).count())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::record::OperationParams;
        use chrono::Utc;
        use reserve_core::AccountId;
        use rust_decimal_macros::dec;
        use tempfile::TempDir;

        fn deposit(reference: &str) -> OperationRecord {
            OperationRecord::new(
                AccountId::new("alice"),
                OperationParams::Deposit {
                    amount: dec!(100),
                    external_reference: reference.into(),
                    confirmations: 6,
                },
                Utc::now(),
            )
        }

        #[test]
        fn test_records_survive_reopen() {
            let dir = TempDir::new().unwrap();
            let record = deposit("tx-9");
            {
                let store = RocksDbStore::open(dir.path()).unwrap();
                assert_eq!(store.admit(&record).unwrap(), Admission::Created);
            }

            let store = RocksDbStore::open(dir.path()).unwrap();
            assert_eq!(store.get(&record.id).unwrap(), Some(record.clone()));
            assert_eq!(store.unfinished().unwrap().len(), 1);
            assert_eq!(
                store.admit(&deposit("tx-9")).unwrap(),
                Admission::Existing(record.id)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OperationParams;
    use chrono::Utc;
    use reserve_core::AccountId;
    use rust_decimal_macros::dec;

    fn deposit(reference: &str) -> OperationRecord {
        OperationRecord::new(
            AccountId::new("alice"),
            OperationParams::Deposit {
                amount: dec!(100),
                external_reference: reference.into(),
                confirmations: 6,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_duplicate_reference_returns_existing() {
        let store = InMemoryStore::new();
        let first = deposit("tx-1");
        assert_eq!(store.admit(&first).unwrap(), Admission::Created);
        assert_eq!(
            store.admit(&deposit("tx-1")).unwrap(),
            Admission::Existing(first.id)
        );
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_failed_record_does_not_block_resubmission() {
        let store = InMemoryStore::new();
        let mut first = deposit("tx-2");
        store.admit(&first).unwrap();
        first.status = OperationStatus::Failed;
        store.save(&first).unwrap();

        let second = deposit("tx-2");
        assert_eq!(store.admit(&second).unwrap(), Admission::Created);
        assert_eq!(store.count().unwrap(), 2);
        assert!(store.unfinished().unwrap().iter().all(|r| r.id == second.id));
    }
}
