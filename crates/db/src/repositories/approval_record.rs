use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use tempo_core::domain::approval::{
    Actor, ActorId, ActorRole, ApprovalEvent, ApprovalRecord, ApprovalState, AuditEntry,
    EventPayload, SubjectId,
};
use tempo_core::store::{check_log_extends, ApprovalRecordStore, StoreError};

use super::RepositoryError;
use crate::DbPool;

/// SQLite-backed record store. The row version is the compare-and-swap
/// token and audit entries are append-only rows keyed by sequence; a swap
/// inserts only the entries past the expected version.
pub struct SqlApprovalRecordStore {
    pool: DbPool,
}

enum SwapOutcome {
    Committed,
    Conflict { actual: u64 },
}

impl SqlApprovalRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn find(&self, subject_id: &SubjectId) -> Result<Option<ApprovalRecord>, RepositoryError> {
        // One read transaction so the row and its entries come from the same snapshot.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT subject_id, state, resume_stage, delegated_to, escalated_to, version,
                    created_at, updated_at
             FROM approval_record WHERE subject_id = ?",
        )
        .bind(subject_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let entry_rows = sqlx::query(
            "SELECT sequence, event, actor_id, actor_role, reason, target, from_state, to_state,
                    occurred_at
             FROM approval_audit_entry WHERE subject_id = ? ORDER BY sequence ASC",
        )
        .bind(subject_id.as_str())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let audit_log = entry_rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()?;
        row_to_record(&row, audit_log).map(Some)
    }

    async fn swap(
        &self,
        expected_version: u64,
        record: &ApprovalRecord,
    ) -> Result<SwapOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let written = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO approval_record (subject_id, state, resume_stage, delegated_to,
                                              escalated_to, version, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(subject_id) DO NOTHING",
            )
            .bind(record.subject_id.as_str())
            .bind(record.state.as_str())
            .bind(record.resume_stage.map(|state| state.as_str()))
            .bind(record.delegated_to.as_ref().map(ActorId::as_str))
            .bind(record.escalated_to.as_ref().map(ActorId::as_str))
            .bind(to_db_version(record.version)?)
            .bind(record.created_at.to_rfc3339())
            .bind(record.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE approval_record
                 SET state = ?, resume_stage = ?, delegated_to = ?, escalated_to = ?,
                     version = ?, updated_at = ?
                 WHERE subject_id = ? AND version = ?",
            )
            .bind(record.state.as_str())
            .bind(record.resume_stage.map(|state| state.as_str()))
            .bind(record.delegated_to.as_ref().map(ActorId::as_str))
            .bind(record.escalated_to.as_ref().map(ActorId::as_str))
            .bind(to_db_version(record.version)?)
            .bind(record.updated_at.to_rfc3339())
            .bind(record.subject_id.as_str())
            .bind(to_db_version(expected_version)?)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if written == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM approval_record WHERE subject_id = ?")
                    .bind(record.subject_id.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            let actual = actual.map(from_db_version).transpose()?.unwrap_or(0);
            return Ok(SwapOutcome::Conflict { actual });
        }

        let already_stored = usize::try_from(expected_version)
            .map_err(|_| RepositoryError::Decode(format!("version {expected_version} overflows")))?;
        for entry in record.audit_log.iter().skip(already_stored) {
            insert_entry(&mut tx, &record.subject_id, entry).await?;
        }

        tx.commit().await?;
        Ok(SwapOutcome::Committed)
    }

    async fn subjects(&self) -> Result<Vec<SubjectId>, RepositoryError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT subject_id FROM approval_record ORDER BY subject_id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(SubjectId).collect())
    }
}

#[async_trait]
impl ApprovalRecordStore for SqlApprovalRecordStore {
    async fn load(&self, subject_id: &SubjectId) -> Result<Option<ApprovalRecord>, StoreError> {
        Ok(self.find(subject_id).await?)
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: ApprovalRecord,
    ) -> Result<(), StoreError> {
        check_log_extends(expected_version, &record)?;
        match self.swap(expected_version, &record).await? {
            SwapOutcome::Committed => Ok(()),
            SwapOutcome::Conflict { actual } => {
                debug!(
                    subject_id = %record.subject_id,
                    expected = expected_version,
                    actual,
                    "approval record version moved"
                );
                Err(StoreError::Conflict {
                    subject_id: record.subject_id,
                    expected: expected_version,
                    actual,
                })
            }
        }
    }

    async fn list_subjects(&self) -> Result<Vec<SubjectId>, StoreError> {
        Ok(self.subjects().await?)
    }
}

async fn insert_entry(
    tx: &mut Transaction<'_, Sqlite>,
    subject_id: &SubjectId,
    entry: &AuditEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO approval_audit_entry (subject_id, sequence, event, actor_id, actor_role,
                                           reason, target, from_state, to_state, occurred_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(subject_id.as_str())
    .bind(to_db_version(entry.sequence)?)
    .bind(entry.event.as_str())
    .bind(entry.actor.id.as_str())
    .bind(entry.actor.role.storage_key())
    .bind(entry.payload.reason.as_deref())
    .bind(entry.payload.target.as_ref().map(ActorId::as_str))
    .bind(entry.from.as_str())
    .bind(entry.to.as_str())
    .bind(entry.occurred_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn column<T>(row: &SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: for<'r> sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

fn to_db_version(value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| RepositoryError::Decode(format!("version {value} overflows")))
}

fn from_db_version(value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| RepositoryError::Decode(format!("negative version {value}")))
}

fn parse_state(name: &str, value: &str) -> Result<ApprovalState, RepositoryError> {
    ApprovalState::parse(value)
        .ok_or_else(|| RepositoryError::Decode(format!("{name}: unknown approval state `{value}`")))
}

fn parse_timestamp(name: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

fn row_to_record(
    row: &SqliteRow,
    audit_log: Vec<AuditEntry>,
) -> Result<ApprovalRecord, RepositoryError> {
    let state: String = column(row, "state")?;
    let resume_stage: Option<String> = column(row, "resume_stage")?;
    let delegated_to: Option<String> = column(row, "delegated_to")?;
    let escalated_to: Option<String> = column(row, "escalated_to")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(ApprovalRecord {
        subject_id: SubjectId(column(row, "subject_id")?),
        state: parse_state("state", &state)?,
        resume_stage: resume_stage.map(|value| parse_state("resume_stage", &value)).transpose()?,
        delegated_to: delegated_to.map(ActorId),
        escalated_to: escalated_to.map(ActorId),
        audit_log,
        version: from_db_version(column(row, "version")?)?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn row_to_entry(row: &SqliteRow) -> Result<AuditEntry, RepositoryError> {
    let event: String = column(row, "event")?;
    let actor_role: String = column(row, "actor_role")?;
    let from_state: String = column(row, "from_state")?;
    let to_state: String = column(row, "to_state")?;
    let target: Option<String> = column(row, "target")?;
    let occurred_at: String = column(row, "occurred_at")?;

    let event = ApprovalEvent::parse(&event)
        .ok_or_else(|| RepositoryError::Decode(format!("event: unknown approval event `{event}`")))?;
    let role = ActorRole::from_storage_key(&actor_role).ok_or_else(|| {
        RepositoryError::Decode(format!("actor_role: unknown role `{actor_role}`"))
    })?;

    Ok(AuditEntry {
        sequence: from_db_version(column(row, "sequence")?)?,
        event,
        actor: Actor { id: ActorId(column(row, "actor_id")?), role },
        payload: EventPayload { reason: column(row, "reason")?, target: target.map(ActorId) },
        from: parse_state("from_state", &from_state)?,
        to: parse_state("to_state", &to_state)?,
        occurred_at: parse_timestamp("occurred_at", &occurred_at)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tempo_core::domain::approval::{
        Actor, ActorId, ActorRole, ApprovalEvent, ApprovalRecord, ApprovalState, EventPayload,
        SubjectId,
    };
    use tempo_core::errors::WorkflowError;
    use tempo_core::store::{ApprovalRecordStore, StoreError};
    use tempo_core::workflow::WorkflowEngine;

    use super::SqlApprovalRecordStore;
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlApprovalRecordStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlApprovalRecordStore::new(pool)
    }

    fn manager() -> Actor {
        Actor::new("mgr-1", ActorRole::Manager)
    }

    fn delegated_record(subject: &str) -> ApprovalRecord {
        let pending = ApprovalRecord::pending(SubjectId::new(subject));
        let approved = pending.advance(
            ApprovalEvent::ManagerApprove,
            ApprovalState::ManagerApproved,
            &manager(),
            &EventPayload::default(),
            Utc::now(),
        );
        approved.advance(
            ApprovalEvent::Delegate,
            ApprovalState::Delegated,
            &Actor::new("hr-1", ActorRole::Hr),
            &EventPayload::target("hr-2"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn missing_subject_loads_as_none() {
        let store = store().await;
        let loaded = store.load(&SubjectId::new("TE-404")).await.expect("load");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn insert_then_load_round_trips_record_and_audit_log() {
        let store = store().await;
        let record = delegated_record("TE-1");

        store.compare_and_swap(0, record.clone()).await.expect("insert");
        let loaded = store.load(&record.subject_id).await.expect("load").expect("present");

        assert_eq!(loaded, record);
        assert_eq!(loaded.delegated_to, Some(ActorId::new("hr-2")));
        assert_eq!(loaded.resume_stage, Some(ApprovalState::ManagerApproved));
        assert_eq!(loaded.verify_projection(), Ok(()));
    }

    #[tokio::test]
    async fn first_touch_swap_inserts_and_stale_swap_conflicts() {
        let store = store().await;
        let pending = ApprovalRecord::pending(SubjectId::new("TE-2"));
        let first = pending.advance(
            ApprovalEvent::ManagerApprove,
            ApprovalState::ManagerApproved,
            &manager(),
            &EventPayload::default(),
            Utc::now(),
        );

        store.compare_and_swap(0, first.clone()).await.expect("first insert");

        let racing = store.compare_and_swap(0, first.clone()).await.expect_err("already exists");
        assert_eq!(
            racing,
            StoreError::Conflict { subject_id: SubjectId::new("TE-2"), expected: 0, actual: 1 }
        );

        let second = first.advance(
            ApprovalEvent::HrApprove,
            ApprovalState::HrApproved,
            &Actor::new("hr-1", ActorRole::Hr),
            &EventPayload::default(),
            Utc::now(),
        );
        store.compare_and_swap(1, second.clone()).await.expect("update");

        let stale = store.compare_and_swap(1, second.clone()).await.expect_err("stale");
        assert!(matches!(stale, StoreError::Conflict { expected: 1, actual: 2, .. }));

        let loaded = store.load(&second.subject_id).await.expect("load").expect("present");
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.audit_log.len(), 2);
        assert_eq!(loaded.verify_projection(), Ok(()));
    }

    #[tokio::test]
    async fn swap_against_missing_row_reports_zero_version() {
        let store = store().await;
        let record = delegated_record("TE-3");

        let error = store.compare_and_swap(1, record).await.expect_err("no row yet");
        assert!(matches!(error, StoreError::Conflict { expected: 1, actual: 0, .. }));
    }

    #[tokio::test]
    async fn committed_audit_rows_are_never_removed() {
        let store = store().await;
        let record = delegated_record("TE-4");
        store.compare_and_swap(0, record.clone()).await.expect("insert");

        let mut rewound = ApprovalRecord::pending(SubjectId::new("TE-4"));
        rewound.version = 3;
        let error = store.compare_and_swap(2, rewound).await.expect_err("empty log");
        assert!(matches!(error, StoreError::RewritesHistory { .. }));

        let deleted = sqlx::query("DELETE FROM approval_record WHERE subject_id = 'TE-4'")
            .execute(store.pool())
            .await;
        assert!(deleted.is_err(), "audit rows must pin their record");

        let loaded = store.load(&record.subject_id).await.expect("load").expect("present");
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn reviewer_named_like_a_stage_role_reloads_unchanged() {
        let store = store().await;
        let lookalike = Actor::new("dir-1", ActorRole::Reviewer("manager".to_string()));
        let record = ApprovalRecord::pending(SubjectId::new("TE-6"))
            .advance(
                ApprovalEvent::Escalate,
                ApprovalState::Escalated,
                &manager(),
                &EventPayload::target("dir-1"),
                Utc::now(),
            )
            .advance(
                ApprovalEvent::ManagerApprove,
                ApprovalState::ManagerApproved,
                &lookalike,
                &EventPayload::default(),
                Utc::now(),
            );
        store.compare_and_swap(0, record.clone()).await.expect("insert");

        let loaded = store.load(&record.subject_id).await.expect("load").expect("present");
        assert_eq!(loaded.audit_log[1].actor, lookalike);
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn list_subjects_is_sorted() {
        let store = store().await;
        for subject in ["TE-9", "TE-1", "TE-5"] {
            store.compare_and_swap(0, delegated_record(subject)).await.expect("insert");
        }

        let subjects = store.list_subjects().await.expect("list");
        assert_eq!(
            subjects,
            vec![SubjectId::new("TE-1"), SubjectId::new("TE-5"), SubjectId::new("TE-9")]
        );
    }

    #[tokio::test]
    async fn engine_runs_the_full_chain_on_sqlite() {
        let engine = WorkflowEngine::new(Arc::new(store().await));
        let subject = SubjectId::new("TE-10");
        let none = EventPayload::default();

        engine.apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none).await.expect("m");
        let before = engine.store().load(&subject).await.expect("load");

        let illegal = engine
            .apply(&subject, ApprovalEvent::FinanceApprove, &Actor::new("fin-1", ActorRole::Finance), &none)
            .await
            .expect_err("finance cannot skip hr");
        assert!(matches!(illegal, WorkflowError::IllegalTransition { .. }));
        assert_eq!(engine.store().load(&subject).await.expect("load"), before);

        engine
            .apply(&subject, ApprovalEvent::HrApprove, &Actor::new("hr-1", ActorRole::Hr), &none)
            .await
            .expect("h");
        let record = engine
            .apply(
                &subject,
                ApprovalEvent::FinanceApprove,
                &Actor::new("fin-1", ActorRole::Finance),
                &none,
            )
            .await
            .expect("f");

        assert_eq!(record.state, ApprovalState::FinanceApproved);
        let stored = engine.store().load(&subject).await.expect("load").expect("present");
        assert_eq!(stored.version, 3);
        assert_eq!(stored.verify_projection(), Ok(()));
    }

    #[tokio::test]
    async fn unknown_state_surfaces_as_corrupt_record() {
        let store = store().await;
        sqlx::query(
            "INSERT INTO approval_record (subject_id, state, version, created_at, updated_at)
             VALUES ('TE-11', 'SUBMITTED', 1, '2026-01-05T10:00:00Z', '2026-01-05T10:00:00Z')",
        )
        .execute(store.pool())
        .await
        .expect("insert raw row");

        let error = store.load(&SubjectId::new("TE-11")).await.expect_err("bad state");
        assert!(matches!(error, StoreError::Decode(_)));
        assert!(!error.is_transient());

        let engine = WorkflowEngine::new(Arc::new(store));
        let error = engine.record(&SubjectId::new("TE-11")).await.expect_err("corrupt");
        assert!(matches!(error, WorkflowError::CorruptRecord { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engines_on_separate_pools_race_to_one_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("race.db").display());
        let first_pool = connect_with_settings(&url, 4, 5).await.expect("connect");
        migrations::run_pending(&first_pool).await.expect("migrations");
        let second_pool = connect_with_settings(&url, 4, 5).await.expect("connect");

        let approving =
            Arc::new(WorkflowEngine::new(Arc::new(SqlApprovalRecordStore::new(first_pool))));
        let delegating =
            Arc::new(WorkflowEngine::new(Arc::new(SqlApprovalRecordStore::new(second_pool))));

        for round in 0..8 {
            let subject = SubjectId::new(format!("TE-RACE-{round}"));

            let approve = {
                let engine = Arc::clone(&approving);
                let subject = subject.clone();
                tokio::spawn(async move {
                    let payload = EventPayload::default();
                    engine.apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &payload).await
                })
            };
            let delegate = {
                let engine = Arc::clone(&delegating);
                let subject = subject.clone();
                tokio::spawn(async move {
                    let actor = Actor::new("mgr-2", ActorRole::Manager);
                    let payload = EventPayload::target("mgr-3");
                    engine.apply(&subject, ApprovalEvent::Delegate, &actor, &payload).await
                })
            };

            let outcomes = [approve.await.expect("task"), delegate.await.expect("task")];
            let committed = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
            assert_eq!(committed, 1, "exactly one event commits for {subject}");
            let loser = outcomes.iter().find_map(|outcome| outcome.as_ref().err());
            assert!(
                matches!(loser, Some(WorkflowError::Unauthorized { .. })),
                "unexpected loser outcome: {loser:?}"
            );

            let stored = approving.store().load(&subject).await.expect("load").expect("present");
            assert_eq!(stored.version, 1);
            assert_eq!(stored.audit_log.len(), 1);
            assert_eq!(stored.verify_projection(), Ok(()));
        }
    }
}
