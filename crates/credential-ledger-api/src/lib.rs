use std::path::PathBuf;

use anyhow::Result;
use credential_ledger_core::{
    create_record, dispatch, grant_viewer_to_many, history_for_record, query_records,
    query_records_by_owner, read_record, validate_record, CreateRecordRequest, HistoryHit,
    InvokePayload, QueryHit, Record, RecordId, ValidationOutcome,
};
use credential_ledger_store_sqlite::{SchemaStatus, SqliteStateStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Path-based facade over the credential ledger: opens the SQLite-backed
/// state store per call, migrates it, and runs one operation as a single
/// synchronous unit of work.
#[derive(Debug, Clone)]
pub struct CredentialLedgerApi {
    db_path: PathBuf,
}

impl CredentialLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStateStore> {
        SqliteStateStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run
    /// mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Resolve a named operation against the registry and execute it with a
    /// positional argument list.
    ///
    /// # Errors
    /// Returns the domain error of the dispatched operation; the
    /// [`credential_ledger_core::LedgerError`] stays downcastable from the
    /// returned error.
    pub fn invoke(&self, operation: &str, args: &[String]) -> Result<InvokePayload> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(dispatch(&mut store, operation, args)?)
    }

    /// Create one record. Creation is single-shot; there is no update path.
    ///
    /// # Errors
    /// Returns an error when validation, key collision checks, or
    /// persistence fail.
    pub fn init_record(&self, request: &CreateRecordRequest) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        create_record(&mut store, request)?;
        Ok(())
    }

    /// Read one record on behalf of a requester.
    ///
    /// # Errors
    /// Returns an error when the record is absent or the requester is
    /// neither owner nor viewer.
    pub fn read_record(&self, record_id: RecordId, requester: &str) -> Result<Record> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(read_record(&store, record_id, requester)?)
    }

    /// Flip the one-way validation flag; re-validation is an idempotent
    /// success.
    ///
    /// # Errors
    /// Returns an error when the record is absent or persistence fails.
    pub fn validate_record(&self, record_id: RecordId) -> Result<ValidationOutcome> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(validate_record(&mut store, record_id)?)
    }

    /// Grant one viewer on every record in a comma-delimited id list.
    /// Successful grants stay committed even when the aggregate fails.
    ///
    /// # Errors
    /// Returns an error naming every failed record id.
    pub fn add_viewer_to_records(
        &self,
        record_ids: &str,
        owner: &str,
        viewer: &str,
    ) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        grant_viewer_to_many(&mut store, record_ids, owner, viewer)?;
        Ok(())
    }

    /// Parameterized query over records of one owner.
    ///
    /// # Errors
    /// Returns an error when the backing store query fails.
    pub fn query_records_by_owner(&self, owner: &str) -> Result<Vec<QueryHit>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(query_records_by_owner(&store, owner)?)
    }

    /// Ad hoc query executing a caller-supplied filter expression verbatim.
    ///
    /// # Errors
    /// Returns an error when the filter cannot be parsed or executed.
    pub fn query_records(&self, filter: &str) -> Result<Vec<QueryHit>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(query_records(&store, filter)?)
    }

    /// All historical versions of one record, newest first.
    ///
    /// # Errors
    /// Returns an error when the backing store fails.
    pub fn history_for_record(&self, record_id: RecordId) -> Result<Vec<HistoryHit>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(history_for_record(&store, record_id)?)
    }
}

#[cfg(test)]
mod tests {
    use credential_ledger_core::LedgerError;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("credential-ledger-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_args(record_id: &str, owner: &str) -> Vec<String> {
        vec![
            record_id.to_string(),
            "Dylan".to_string(),
            "Bryan".to_string(),
            "200049641".to_string(),
            "North Carolina State University".to_string(),
            "Bachelor of Science in Computer Science".to_string(),
            "4.0".to_string(),
            "4.0".to_string(),
            owner.to_string(),
        ]
    }

    // Test IDs: TAPI-001
    #[test]
    fn invoke_runs_create_read_validate_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CredentialLedgerApi::new(db_path.clone());

        let created = api.invoke("initRecord", &fixture_args("32", "DBryan@ncsu.edu"))?;
        assert_eq!(created, InvokePayload::Empty);

        let read =
            api.invoke("readRecord", &["32".to_string(), "dbryan@ncsu.edu".to_string()])?;
        let InvokePayload::Json(record) = read else {
            return Err(anyhow::anyhow!("expected JSON payload from readRecord"));
        };
        assert_eq!(record.get("firstName"), Some(&serde_json::Value::String("dylan".into())));

        assert_eq!(api.invoke("validateRecord", &["32".to_string()])?, InvokePayload::Empty);
        assert_eq!(
            api.invoke("validateRecord", &["32".to_string()])?,
            InvokePayload::Message("Record already validated!".to_string())
        );

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn invoke_errors_stay_downcastable_to_domain_kinds() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CredentialLedgerApi::new(db_path.clone());

        let Err(unknown) = api.invoke("transferRecord", &["1".to_string()]) else {
            return Err(anyhow::anyhow!("unknown operation must fail"));
        };
        assert!(matches!(
            unknown.downcast_ref::<LedgerError>(),
            Some(LedgerError::UnknownOperation(_))
        ));

        api.init_record(&CreateRecordRequest {
            record_id: RecordId(5),
            first_name: "Dylan".to_string(),
            last_name: "Bryan".to_string(),
            student_id: "200049641".to_string(),
            university: "NCSU".to_string(),
            degree: "BSc".to_string(),
            gpa: "4.0".to_string(),
            major_gpa: "4.0".to_string(),
            owner: "alice".to_string(),
        })?;

        let Err(unauthorized) =
            api.invoke("readRecord", &["5".to_string(), "eve".to_string()])
        else {
            return Err(anyhow::anyhow!("stranger read must fail"));
        };
        assert!(matches!(
            unauthorized.downcast_ref::<LedgerError>(),
            Some(LedgerError::Unauthorized { .. })
        ));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn batched_grant_reports_partial_failure_and_keeps_successes() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CredentialLedgerApi::new(db_path.clone());

        api.invoke("initRecord", &fixture_args("1", "alice"))?;
        api.invoke("initRecord", &fixture_args("3", "alice"))?;

        let Err(err) = api.add_viewer_to_records("1,2,3", "alice", "employer") else {
            return Err(anyhow::anyhow!("grant on a missing record must fail"));
        };
        assert_eq!(
            err.downcast_ref::<LedgerError>(),
            Some(&LedgerError::PartialFailure { failed: vec!["2".to_string()] })
        );

        assert!(api.read_record(RecordId(1), "employer").is_ok());
        assert!(api.read_record(RecordId(3), "employer").is_ok());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn queries_and_history_flow_through_the_store_adapter() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CredentialLedgerApi::new(db_path.clone());

        api.invoke("initRecord", &fixture_args("1", "Alice"))?;
        api.invoke("initRecord", &fixture_args("2", "bob"))?;
        api.add_viewer_to_records("1", "alice", "employer")?;
        api.validate_record(RecordId(1))?;

        let owned = api.query_records_by_owner("ALICE")?;
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].key, "1");

        let ad_hoc = api.query_records(r#"{"selector":{"validated":true}}"#)?;
        assert_eq!(ad_hoc.len(), 1);
        assert_eq!(ad_hoc[0].key, "1");

        let history = api.history_for_record(RecordId(1))?;
        assert_eq!(history.len(), 3);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn migrate_dry_run_plans_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CredentialLedgerApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
