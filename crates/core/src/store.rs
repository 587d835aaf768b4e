use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::domain::approval::{ApprovalRecord, SubjectId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("version conflict for subject {subject_id}: expected {expected}, found {actual}")]
    Conflict { subject_id: SubjectId, expected: u64, actual: u64 },
    #[error("store operation timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored record could not be decoded: {0}")]
    Decode(String),
    #[error("write for subject {subject_id} would rewrite its audit log: {message}")]
    RewritesHistory { subject_id: SubjectId, message: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

/// A write must carry one audit entry per version and add at least one
/// entry on top of `expected_version`.
pub fn check_log_extends(expected_version: u64, record: &ApprovalRecord) -> Result<(), StoreError> {
    let logged = record.audit_log.len() as u64;
    let message = if logged != record.version {
        format!("version {} does not match {logged} audit entries", record.version)
    } else if record.version <= expected_version {
        format!("version {} does not advance past {expected_version}", record.version)
    } else {
        return Ok(());
    };
    Err(StoreError::RewritesHistory { subject_id: record.subject_id.clone(), message })
}

/// Keyed persistence for approval records.
///
/// Implementations must serialise writes per subject: `compare_and_swap`
/// only succeeds when the stored version still equals `expected_version`
/// (zero meaning "no record yet"), so two read-modify-write cycles on the
/// same subject can never both commit. Records are never deleted and a
/// committed audit entry is never rewritten.
#[async_trait]
pub trait ApprovalRecordStore: Send + Sync {
    async fn load(&self, subject_id: &SubjectId) -> Result<Option<ApprovalRecord>, StoreError>;

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: ApprovalRecord,
    ) -> Result<(), StoreError>;

    async fn list_subjects(&self) -> Result<Vec<SubjectId>, StoreError>;
}

/// Sharded in-memory store. Subjects in different shards never contend.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    records: DashMap<SubjectId, ApprovalRecord>,
    write_faults: DashMap<SubjectId, (StoreError, u32)>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Makes the next `times` writes for `subject_id` fail with `fault`.
    pub fn inject_write_faults(&self, subject_id: SubjectId, fault: StoreError, times: u32) {
        self.write_faults.insert(subject_id, (fault, times));
    }

    fn take_write_fault(&self, subject_id: &SubjectId) -> Option<StoreError> {
        let mut slot = self.write_faults.get_mut(subject_id)?;
        let (fault, remaining) = slot.value_mut();
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(fault.clone())
    }
}

#[async_trait]
impl ApprovalRecordStore for InMemoryApprovalStore {
    async fn load(&self, subject_id: &SubjectId) -> Result<Option<ApprovalRecord>, StoreError> {
        Ok(self.records.get(subject_id).map(|record| record.clone()))
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: ApprovalRecord,
    ) -> Result<(), StoreError> {
        if let Some(fault) = self.take_write_fault(&record.subject_id) {
            return Err(fault);
        }

        match self.records.entry(record.subject_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let actual = occupied.get().version;
                if actual != expected_version {
                    return Err(StoreError::Conflict {
                        subject_id: record.subject_id,
                        expected: expected_version,
                        actual,
                    });
                }
                check_log_extends(expected_version, &record)?;
                if !record.audit_log.starts_with(&occupied.get().audit_log) {
                    return Err(StoreError::RewritesHistory {
                        subject_id: record.subject_id,
                        message: "committed audit entries differ".to_string(),
                    });
                }
                occupied.insert(record);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(StoreError::Conflict {
                        subject_id: record.subject_id,
                        expected: expected_version,
                        actual: 0,
                    });
                }
                check_log_extends(expected_version, &record)?;
                vacant.insert(record);
                Ok(())
            }
        }
    }

    async fn list_subjects(&self) -> Result<Vec<SubjectId>, StoreError> {
        let mut subjects: Vec<SubjectId> =
            self.records.iter().map(|entry| entry.key().clone()).collect();
        subjects.sort();
        Ok(subjects)
    }
}
