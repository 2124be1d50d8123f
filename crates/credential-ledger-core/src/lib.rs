use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Document discriminator stamped on every stored envelope so structured
/// filters can address the record type as a top-level field.
pub const RECORD_DOC_TYPE: &str = "record";

/// Opaque failure reported by a state-store adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("store failure: {0}")]
pub struct StoreError(String);

impl StoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("record already exists: {0}")]
    AlreadyExists(RecordId),
    #[error("record does not exist: {0}")]
    NotFound(RecordId),
    #[error("invalid requester {requester}: owner is {owner}")]
    Unauthorized { requester: String, owner: String },
    #[error("received unknown operation invocation: {0}")]
    UnknownOperation(String),
    #[error("unable to add viewer to record(s): {}", .failed.join(", "))]
    PartialFailure { failed: Vec<String> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Integer primary key of a record; its canonical decimal string is the
/// store key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl RecordId {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        value.parse::<i64>().ok().map(Self)
    }

    #[must_use]
    pub fn storage_key(self) -> String {
        self.0.to_string()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One student's credential data. Immutable after creation; every text field
/// is lowercase-normalized before it is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub record_id: RecordId,
    pub first_name: String,
    pub last_name: String,
    pub student_id: String,
    pub university: String,
    pub degree: String,
    pub gpa: String,
    pub major_gpa: String,
}

/// The stored unit: a record plus its mutable access-control state. The
/// record fields are flattened so filters can select on them directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordEnvelope {
    #[serde(rename = "docType")]
    pub doc_type: String,
    #[serde(flatten)]
    pub record: Record,
    pub owner: String,
    pub validated: bool,
    #[serde(default)]
    pub viewers: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRecordRequest {
    pub record_id: RecordId,
    pub first_name: String,
    pub last_name: String,
    pub student_id: String,
    pub university: String,
    pub degree: String,
    pub gpa: String,
    pub major_gpa: String,
    pub owner: String,
}

impl CreateRecordRequest {
    /// Check that every creation field carries a value.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidArgument`] naming the first empty field.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let fields = [
            ("firstName", &self.first_name),
            ("lastName", &self.last_name),
            ("studentId", &self.student_id),
            ("university", &self.university),
            ("degree", &self.degree),
            ("gpa", &self.gpa),
            ("majorGpa", &self.major_gpa),
            ("owner", &self.owner),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(LedgerError::InvalidArgument(format!(
                    "{name} must be a non-empty string"
                )));
            }
        }
        Ok(())
    }
}

impl RecordEnvelope {
    /// Build the initial envelope for a creation request: viewers start
    /// empty, the validation flag starts false, and every comparable field
    /// is lowercase-normalized.
    #[must_use]
    pub fn new(request: &CreateRecordRequest) -> Self {
        Self {
            doc_type: RECORD_DOC_TYPE.to_string(),
            record: Record {
                record_id: request.record_id,
                first_name: normalize(&request.first_name),
                last_name: normalize(&request.last_name),
                student_id: normalize(&request.student_id),
                university: normalize(&request.university),
                degree: normalize(&request.degree),
                gpa: normalize(&request.gpa),
                major_gpa: normalize(&request.major_gpa),
            },
            owner: normalize(&request.owner),
            validated: false,
            viewers: BTreeSet::new(),
        }
    }
}

/// Lowercase a comparable value. Applied uniformly on every write and every
/// comparison so authorization checks are case-insensitive by construction.
#[must_use]
pub fn normalize(value: &str) -> String {
    value.to_lowercase()
}

/// One historical version of a key, as yielded by a store adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub tx_id: String,
    pub value: Vec<u8>,
    pub written_at: OffsetDateTime,
}

/// Thin interface over the external versioned key-value store. The store
/// owns durability, ordering, and conflict resolution; the engine is a pure
/// request/response transformer on top of it.
pub trait StateStore {
    /// Point lookup of the current value for a key.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying store call fails.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write the current value for a key. Every write is captured by the
    /// store's own history mechanism.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying store call fails.
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Execute a filter expression, returning matching `(key, value)` pairs
    /// in store-defined order.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the filter cannot be parsed or executed.
    fn query_by_filter(&self, filter: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// All historical versions of a key, newest first. Absent keys yield an
    /// empty sequence.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying store call fails.
    fn history_of(&self, key: &str) -> Result<Vec<HistoryEntry>, StoreError>;
}

/// Structured filter contract shared by the engine and the store adapters:
/// an equality conjunction over top-level fields of the stored JSON value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selector {
    pub selector: BTreeMap<String, serde_json::Value>,
}

impl Selector {
    /// The parameterized by-owner filter: `docType = "record" AND owner = x`.
    #[must_use]
    pub fn by_owner(owner: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            "docType".to_string(),
            serde_json::Value::String(RECORD_DOC_TYPE.to_string()),
        );
        fields.insert("owner".to_string(), serde_json::Value::String(owner.to_string()));
        Self { selector: fields }
    }

    /// Parse a caller-supplied filter expression.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the expression is not a selector document;
    /// malformed ad hoc filters surface as store-level failures, not domain
    /// validation errors.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw)
            .map_err(|err| StoreError::new(format!("invalid filter expression: {err}")))
    }

    /// Serialize this selector to the store's filter language.
    ///
    /// # Errors
    /// Returns [`StoreError`] when serialization fails.
    pub fn to_filter_string(&self) -> Result<String, StoreError> {
        serde_json::to_string(self)
            .map_err(|err| StoreError::new(format!("failed to encode filter expression: {err}")))
    }

    #[must_use]
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        self.selector.iter().all(|(field, expected)| value.get(field) == Some(expected))
    }
}

/// In-memory reference adapter. Keeps current state plus an append-only
/// version log with deterministic transaction ids; doubles as the test
/// stand-in for a real backing store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: BTreeMap<String, Vec<u8>>,
    history: Vec<(String, HistoryEntry)>,
    next_seq: u64,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.next_seq += 1;
        let entry = HistoryEntry {
            tx_id: format!("txn_{:016x}", self.next_seq),
            value: value.to_vec(),
            written_at: OffsetDateTime::now_utc(),
        };
        self.history.push((key.to_string(), entry));
        self.state.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn query_by_filter(&self, filter: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let selector = Selector::parse(filter)?;
        let mut hits = Vec::new();
        for (key, value) in &self.state {
            let Ok(decoded) = serde_json::from_slice::<serde_json::Value>(value) else {
                continue;
            };
            if selector.matches(&decoded) {
                hits.push((key.clone(), value.clone()));
            }
        }
        Ok(hits)
    }

    fn history_of(&self, key: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut entries = self
            .history
            .iter()
            .filter(|(entry_key, _)| entry_key.as_str() == key)
            .map(|(_, entry)| entry.clone())
            .collect::<Vec<_>>();
        entries.reverse();
        Ok(entries)
    }
}

fn encode_envelope(envelope: &RecordEnvelope) -> Result<Vec<u8>, LedgerError> {
    serde_json::to_vec(envelope).map_err(|err| {
        LedgerError::Store(StoreError::new(format!("failed to encode record envelope: {err}")))
    })
}

fn load_envelope<S: StateStore>(store: &S, record_id: RecordId) -> Result<RecordEnvelope, LedgerError> {
    let key = record_id.storage_key();
    let bytes = store.get(&key)?.ok_or(LedgerError::NotFound(record_id))?;
    serde_json::from_slice(&bytes).map_err(|err| {
        LedgerError::Store(StoreError::new(format!(
            "stored value for key {key} is not a record envelope: {err}"
        )))
    })
}

/// Create a record exactly once. There is no implicit update path.
///
/// # Errors
/// Returns [`LedgerError::InvalidArgument`] when a field is empty,
/// [`LedgerError::AlreadyExists`] when the key is already present, or
/// [`LedgerError::Store`] when the backing store fails.
pub fn create_record<S: StateStore>(
    store: &mut S,
    request: &CreateRecordRequest,
) -> Result<(), LedgerError> {
    request.validate()?;
    let key = request.record_id.storage_key();
    if store.get(&key)?.is_some() {
        return Err(LedgerError::AlreadyExists(request.record_id));
    }
    let envelope = RecordEnvelope::new(request);
    store.put(&key, &encode_envelope(&envelope)?)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Validated,
    AlreadyValidated,
}

/// Flip the one-way validation flag. Re-validation is an idempotent success
/// that performs no write; the flag never reverts.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] when the record is absent, or
/// [`LedgerError::Store`] when the backing store fails.
pub fn validate_record<S: StateStore>(
    store: &mut S,
    record_id: RecordId,
) -> Result<ValidationOutcome, LedgerError> {
    let mut envelope = load_envelope(store, record_id)?;
    if envelope.validated {
        return Ok(ValidationOutcome::AlreadyValidated);
    }
    envelope.validated = true;
    store.put(&record_id.storage_key(), &encode_envelope(&envelope)?)?;
    Ok(ValidationOutcome::Validated)
}

/// Read a record on behalf of a requester. Only the owner and granted
/// viewers may read; a successful reader receives the record alone, never
/// the envelope's permission state.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] when the record is absent,
/// [`LedgerError::Unauthorized`] when the requester is neither owner nor
/// viewer, or [`LedgerError::Store`] when the backing store fails.
pub fn read_record<S: StateStore>(
    store: &S,
    record_id: RecordId,
    requester: &str,
) -> Result<Record, LedgerError> {
    let envelope = load_envelope(store, record_id)?;
    let requester = normalize(requester);
    if requester == envelope.owner || envelope.viewers.contains(&requester) {
        return Ok(envelope.record);
    }
    Err(LedgerError::Unauthorized { requester, owner: envelope.owner })
}

/// Grant one viewer on one record. Internal primitive of the batched grant:
/// fails silently (false) on empty identifiers, an absent record, an owner
/// mismatch, or a store failure; an already-present viewer is a successful
/// no-op.
pub fn grant_viewer<S: StateStore>(
    store: &mut S,
    record_id: RecordId,
    owner: &str,
    viewer: &str,
) -> bool {
    let owner = normalize(owner);
    let viewer = normalize(viewer);
    if owner.is_empty() || viewer.is_empty() {
        return false;
    }
    let Ok(Some(bytes)) = store.get(&record_id.storage_key()) else {
        return false;
    };
    let Ok(mut envelope) = serde_json::from_slice::<RecordEnvelope>(&bytes) else {
        return false;
    };
    if envelope.owner != owner {
        return false;
    }
    if envelope.viewers.contains(&viewer) {
        return true;
    }
    envelope.viewers.insert(viewer);
    let Ok(encoded) = serde_json::to_vec(&envelope) else {
        return false;
    };
    store.put(&record_id.storage_key(), &encoded).is_ok()
}

/// Apply [`grant_viewer`] independently to each id in a comma-delimited
/// list. Successful grants stay committed even when others fail; the
/// aggregated error names every failed id.
///
/// # Errors
/// Returns [`LedgerError::PartialFailure`] when any target fails.
pub fn grant_viewer_to_many<S: StateStore>(
    store: &mut S,
    record_ids: &str,
    owner: &str,
    viewer: &str,
) -> Result<(), LedgerError> {
    let mut failed = Vec::new();
    for raw_id in record_ids.split(',') {
        let raw_id = raw_id.trim();
        let granted = match RecordId::parse(raw_id) {
            Some(record_id) => grant_viewer(store, record_id, owner, viewer),
            None => false,
        };
        if !granted {
            failed.push(raw_id.to_string());
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(LedgerError::PartialFailure { failed })
    }
}

/// One query result: the store key and the stored envelope JSON, exactly as
/// the store returned it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryHit {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Record")]
    pub record: serde_json::Value,
}

/// One historical version: transaction id, the value as of that write, and
/// the write timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryHit {
    #[serde(rename = "TxId")]
    pub tx_id: String,
    #[serde(rename = "Value")]
    pub value: serde_json::Value,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

fn run_filter_query<S: StateStore>(store: &S, filter: &str) -> Result<Vec<QueryHit>, LedgerError> {
    let pairs = store.query_by_filter(filter)?;
    let mut hits = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        let record = serde_json::from_slice(&value).map_err(|err| {
            LedgerError::Store(StoreError::new(format!(
                "stored value for key {key} is not JSON: {err}"
            )))
        })?;
        hits.push(QueryHit { key, record });
    }
    Ok(hits)
}

/// Parameterized query: all records whose stored owner equals the
/// lowercase-normalized input. Result order is store-defined; the result set
/// is point-in-time best-effort with no isolation guarantee.
///
/// # Errors
/// Returns [`LedgerError::Store`] when the backing store query fails.
pub fn query_records_by_owner<S: StateStore>(
    store: &S,
    owner: &str,
) -> Result<Vec<QueryHit>, LedgerError> {
    let filter = Selector::by_owner(&normalize(owner)).to_filter_string()?;
    run_filter_query(store, &filter)
}

/// Ad hoc query: the caller-supplied filter expression is executed verbatim.
/// The caller is trusted to supply a well-formed filter; malformed ones
/// surface as store-level execution errors.
///
/// # Errors
/// Returns [`LedgerError::Store`] when the filter cannot be parsed or
/// executed by the backing store.
pub fn query_records<S: StateStore>(store: &S, filter: &str) -> Result<Vec<QueryHit>, LedgerError> {
    run_filter_query(store, filter)
}

/// All historical versions of a record, eagerly drained in store-defined
/// (newest-first) order. Absent keys yield an empty sequence.
///
/// # Errors
/// Returns [`LedgerError::Store`] when the backing store fails or yields a
/// non-JSON value.
pub fn history_for_record<S: StateStore>(
    store: &S,
    record_id: RecordId,
) -> Result<Vec<HistoryHit>, LedgerError> {
    let entries = store.history_of(&record_id.storage_key())?;
    let mut hits = Vec::with_capacity(entries.len());
    for entry in entries {
        let value = serde_json::from_slice(&entry.value).map_err(|err| {
            LedgerError::Store(StoreError::new(format!(
                "historical value for transaction {} is not JSON: {err}",
                entry.tx_id
            )))
        })?;
        let timestamp = entry.written_at.format(&Rfc3339).map_err(|err| {
            LedgerError::Store(StoreError::new(format!(
                "historical timestamp for transaction {} cannot be formatted: {err}",
                entry.tx_id
            )))
        })?;
        hits.push(HistoryHit { tx_id: entry.tx_id, value, timestamp });
    }
    Ok(hits)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    InitRecord,
    ReadRecord,
    ValidateRecord,
    AddViewerToRecords,
    QueryRecordsByOwner,
    QueryRecords,
    GetHistoryForRecord,
}

/// Registry entry: operation name plus its declared positional arity.
#[derive(Debug, Clone, Copy)]
pub struct OperationSpec {
    pub name: &'static str,
    pub arity: usize,
    pub kind: OperationKind,
}

/// The full operation registry. Dispatch resolves names here; arity lives on
/// the entry, not in a module-level constant.
pub const OPERATIONS: &[OperationSpec] = &[
    OperationSpec { name: "initRecord", arity: 9, kind: OperationKind::InitRecord },
    OperationSpec { name: "readRecord", arity: 2, kind: OperationKind::ReadRecord },
    OperationSpec { name: "validateRecord", arity: 1, kind: OperationKind::ValidateRecord },
    OperationSpec { name: "addViewerToRecords", arity: 3, kind: OperationKind::AddViewerToRecords },
    OperationSpec {
        name: "queryRecordsByOwner",
        arity: 1,
        kind: OperationKind::QueryRecordsByOwner,
    },
    OperationSpec { name: "queryRecords", arity: 1, kind: OperationKind::QueryRecords },
    OperationSpec {
        name: "getHistoryForRecord",
        arity: 1,
        kind: OperationKind::GetHistoryForRecord,
    },
];

impl OperationSpec {
    #[must_use]
    pub fn lookup(name: &str) -> Option<&'static Self> {
        OPERATIONS.iter().find(|spec| spec.name == name)
    }
}

/// Tagged success payload of one dispatched operation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum InvokePayload {
    Empty,
    Message(String),
    Json(serde_json::Value),
}

impl InvokePayload {
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Empty => Vec::new(),
            Self::Message(text) => text.into_bytes(),
            Self::Json(value) => value.to_string().into_bytes(),
        }
    }
}

fn parse_record_id(value: &str) -> Result<RecordId, LedgerError> {
    RecordId::parse(value).ok_or_else(|| {
        LedgerError::InvalidArgument(format!("record id must be a numeric string: {value}"))
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, LedgerError> {
    serde_json::to_value(value).map_err(|err| {
        LedgerError::Store(StoreError::new(format!("failed to encode response payload: {err}")))
    })
}

/// Resolve a named operation against the registry and execute it with a
/// positional argument list. Arity mismatches and empty-string arguments are
/// rejected before any store access.
///
/// # Errors
/// Returns [`LedgerError::UnknownOperation`] for unregistered names,
/// [`LedgerError::InvalidArgument`] for argument-shape failures, and
/// whatever the delegated handler fails with.
pub fn dispatch<S: StateStore>(
    store: &mut S,
    operation: &str,
    args: &[String],
) -> Result<InvokePayload, LedgerError> {
    let spec = OperationSpec::lookup(operation)
        .ok_or_else(|| LedgerError::UnknownOperation(operation.to_string()))?;
    if args.len() != spec.arity {
        return Err(LedgerError::InvalidArgument(format!(
            "incorrect number of arguments for {operation}: expecting {}, received {}",
            spec.arity,
            args.len()
        )));
    }
    for (index, arg) in args.iter().enumerate() {
        if arg.trim().is_empty() {
            return Err(LedgerError::InvalidArgument(format!(
                "argument {} must be a non-empty string",
                index + 1
            )));
        }
    }

    match spec.kind {
        OperationKind::InitRecord => {
            let request = CreateRecordRequest {
                record_id: parse_record_id(&args[0])?,
                first_name: args[1].clone(),
                last_name: args[2].clone(),
                student_id: args[3].clone(),
                university: args[4].clone(),
                degree: args[5].clone(),
                gpa: args[6].clone(),
                major_gpa: args[7].clone(),
                owner: args[8].clone(),
            };
            create_record(store, &request)?;
            Ok(InvokePayload::Empty)
        }
        OperationKind::ReadRecord => {
            let record = read_record(store, parse_record_id(&args[0])?, &args[1])?;
            Ok(InvokePayload::Json(to_json(&record)?))
        }
        OperationKind::ValidateRecord => {
            match validate_record(store, parse_record_id(&args[0])?)? {
                ValidationOutcome::Validated => Ok(InvokePayload::Empty),
                ValidationOutcome::AlreadyValidated => {
                    Ok(InvokePayload::Message("Record already validated!".to_string()))
                }
            }
        }
        OperationKind::AddViewerToRecords => {
            grant_viewer_to_many(store, &args[0], &args[1], &args[2])?;
            Ok(InvokePayload::Empty)
        }
        OperationKind::QueryRecordsByOwner => {
            Ok(InvokePayload::Json(to_json(&query_records_by_owner(store, &args[0])?)?))
        }
        OperationKind::QueryRecords => {
            Ok(InvokePayload::Json(to_json(&query_records(store, &args[0])?)?))
        }
        OperationKind::GetHistoryForRecord => {
            let hits = history_for_record(store, parse_record_id(&args[0])?)?;
            Ok(InvokePayload::Json(to_json(&hits)?))
        }
    }
}
