// 🧩 Funnel Service - engines wired to the document store
//
// UI event → engine computes the new client value → one patch to the store
// → subscribers see the refreshed roster. Every committed change also leaves
// a stage event behind as an audit trail ("every change is an event").

use crate::client::Client;
use crate::config::{FacilityConfig, DEFAULT_WORKPLACE_ID};
use crate::error::{FunnelError, FunnelResult, StoreError};
use crate::lost::{LostAccountingEngine, LostCounts};
use crate::retention::{FiscalYearCohort, RetentionRateCalculator};
use crate::stage::{LostReason, Stage};
use crate::store::{Record, Store, Subscription, ACTIVITY_LOGS, CLIENTS, STAGE_EVENTS, WORKPLACES};
use crate::transition::{Applied, GateResolution, MoveRequest, TransitionEngine};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

// Fields the lifecycle core owns on a client document
const STAGE_FIELDS: &[&str] = &["stage", "followUpCompletionDate"];
const EMPLOYMENT_FIELDS: &[&str] = &["stage", "employmentDate", "employmentCompany"];
const LOST_FIELDS: &[&str] = &[
    "stage",
    "lostAtPhase",
    "lostReason",
    "lostReasonDetails",
    "isRetired",
    "retiredAt",
];
const RETIRE_FIELDS: &[&str] = &["stage", "isRetired", "retiredAt"];

// ============================================================================
// STAGE EVENT (audit trail)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub from: Stage,
    pub to: Stage,
    #[serde(default)]
    pub data: Value,
}

impl StageEvent {
    pub fn new(event_type: &str, from: Stage, to: Stage, data: Value) -> Self {
        StageEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            from,
            to,
            data,
        }
    }
}

// ============================================================================
// FUNNEL SERVICE
// ============================================================================

pub struct FunnelService<S: Store> {
    store: S,
    workplace_id: String,
    transitions: TransitionEngine,
    lost: LostAccountingEngine,
    calculator: RetentionRateCalculator,
}

impl<S: Store> FunnelService<S> {
    pub fn new(store: S) -> Self {
        FunnelService::with_workplace(store, DEFAULT_WORKPLACE_ID)
    }

    pub fn with_workplace(store: S, workplace_id: &str) -> Self {
        FunnelService {
            store,
            workplace_id: workplace_id.to_string(),
            transitions: TransitionEngine::new(),
            lost: LostAccountingEngine::new(),
            calculator: RetentionRateCalculator::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transitions(&self) -> &TransitionEngine {
        &self.transitions
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn load_client(&self, id: &str) -> FunnelResult<Client> {
        let record = self
            .store
            .get_by_id(CLIENTS, id)?
            .ok_or_else(|| StoreError::NotFound {
                collection: CLIENTS.to_string(),
                id: id.to_string(),
            })?;

        Ok(decode_client(id, record)?)
    }

    /// Every readable client. Documents that fail to decode are skipped.
    pub fn load_roster(&self) -> FunnelResult<Vec<Client>> {
        let records = self.store.query(CLIENTS, &|_: &Record| true)?;
        Ok(decode_roster(records))
    }

    /// Facility settings; an absent document reads as "not configured"
    pub fn load_facility(&self) -> FunnelResult<FacilityConfig> {
        match self.store.get_by_id(WORKPLACES, &self.workplace_id)? {
            Some(record) => Ok(serde_json::from_value(Value::Object(record))
                .map_err(StoreError::from)?),
            None => {
                warn!(workplace = %self.workplace_id, "workplace document not found");
                Ok(FacilityConfig::default())
            }
        }
    }

    pub fn activity_log(&self, client_id: &str) -> FunnelResult<Vec<Record>> {
        Ok(self.store.children(ACTIVITY_LOGS, client_id)?)
    }

    pub fn stage_events(&self, client_id: &str) -> FunnelResult<Vec<StageEvent>> {
        self.store
            .children(STAGE_EVENTS, client_id)?
            .into_iter()
            .map(|r| serde_json::from_value::<StageEvent>(Value::Object(r)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FunnelError::from(StoreError::from(e)))
    }

    // ========================================================================
    // SEEDING
    // ========================================================================

    pub fn save_facility(&self, facility: &FacilityConfig) -> FunnelResult<()> {
        let mut record = self
            .store
            .get_by_id(WORKPLACES, &self.workplace_id)?
            .unwrap_or_default();
        record.extend(to_record(facility)?);

        self.store.put(WORKPLACES, &self.workplace_id, record)?;
        info!(workplace = %self.workplace_id, "facility settings saved");
        Ok(())
    }

    /// Create or replace a client document
    pub fn add_client(&self, client: &Client) -> FunnelResult<()> {
        let mut client = client.clone();
        client.updated_at = Some(Utc::now());
        self.store.put(CLIENTS, &client.id, to_record(&client)?)?;
        Ok(())
    }

    // ========================================================================
    // LIFECYCLE WRITES
    // ========================================================================

    /// Move a client along its table. A gate comes back without any write.
    pub fn move_client(&self, id: &str, request: MoveRequest) -> FunnelResult<Applied> {
        let client = self.load_client(id)?;
        let from = client.stage;

        match self.transitions.apply_request(client, request) {
            Applied::Moved(client) => {
                let client = self.commit(client, STAGE_FIELDS, "stage_moved", from, Value::Null)?;
                Ok(Applied::Moved(client))
            }
            Applied::Unchanged(client) => Ok(Applied::Unchanged(self.touch(client)?)),
            gate @ Applied::GateOpened { .. } => Ok(gate),
        }
    }

    pub fn resolve_gate(&self, id: &str, resolution: GateResolution) -> FunnelResult<Applied> {
        let client = self.load_client(id)?;
        let from = client.stage;

        match self.transitions.resolve_gate(client, resolution) {
            Applied::Moved(client) => {
                let data = serde_json::json!({ "gate": resolution.gate() });
                let client = self.commit(client, STAGE_FIELDS, "gate_resolved", from, data)?;
                Ok(Applied::Moved(client))
            }
            Applied::Unchanged(client) => Ok(Applied::Unchanged(self.touch(client)?)),
            gate @ Applied::GateOpened { .. } => Ok(gate),
        }
    }

    pub fn start_follow_up(
        &self,
        id: &str,
        employment_date: NaiveDate,
        company: &str,
    ) -> FunnelResult<Client> {
        let client = self.load_client(id)?;
        let from = client.stage;
        let client = self.transitions.start_follow_up(client, employment_date, company)?;

        let data = serde_json::json!({ "employmentDate": employment_date });
        self.commit(client, EMPLOYMENT_FIELDS, "follow_up_started", from, data)
    }

    /// Close a client; `origin` defaults to the stage it currently occupies
    pub fn close_client(
        &self,
        id: &str,
        origin: Option<Stage>,
        reason: LostReason,
        details: &str,
    ) -> FunnelResult<Client> {
        let client = self.load_client(id)?;
        let from = client.stage;
        let origin = origin.unwrap_or(from);
        let client = self.lost.close(client, origin, reason, details)?;

        let data = serde_json::json!({ "reason": reason });
        self.commit(client, LOST_FIELDS, "client_closed", from, data)
    }

    /// Flag a client as retired; with `terminal` it also moves to RETIRED
    pub fn retire_client(&self, id: &str, at: DateTime<Utc>, terminal: bool) -> FunnelResult<Client> {
        let client = self.load_client(id)?;
        let from = client.stage;
        let client = if terminal {
            client.retire(at)?
        } else {
            client.mark_retired(at)
        };

        self.commit(client, RETIRE_FIELDS, "client_retired", from, Value::Null)
    }

    // ========================================================================
    // AGGREGATES (recomputed on every call)
    // ========================================================================

    pub fn retention(&self, target_year: i32) -> FunnelResult<FiscalYearCohort> {
        let roster = self.load_roster()?;
        let facility = self.load_facility()?;
        self.calculator.compute(&roster, &facility, target_year)
    }

    pub fn lost_counts(&self) -> FunnelResult<LostCounts> {
        let roster = self.load_roster()?;
        Ok(self.lost.funnel_counts(&roster))
    }

    /// Re-run the retention calculation every time the roster changes.
    ///
    /// Facility settings are read once, when the subscription starts.
    pub fn watch_retention<F>(&self, target_year: i32, mut on_result: F) -> FunnelResult<Subscription>
    where
        F: FnMut(FunnelResult<FiscalYearCohort>) + Send + 'static,
    {
        let facility = self.load_facility()?;
        let calculator = RetentionRateCalculator::with_threshold(self.calculator.second_year_threshold);

        let subscription = self.store.subscribe(
            CLIENTS,
            Box::new(|_: &Record| true),
            Box::new(move |records: &[Record]| {
                let roster = decode_roster(records.to_vec());
                on_result(calculator.compute(&roster, &facility, target_year));
            }),
        )?;

        Ok(subscription)
    }

    pub fn unwatch(&self, subscription: Subscription) -> FunnelResult<bool> {
        Ok(self.store.unsubscribe(subscription)?)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Patch `keys` + updatedAt and append the audit event in one write
    fn commit(
        &self,
        mut client: Client,
        keys: &[&str],
        event_type: &str,
        from: Stage,
        data: Value,
    ) -> FunnelResult<Client> {
        client.updated_at = Some(Utc::now());

        let all = to_record(&client)?;
        let mut fields: Record = keys
            .iter()
            .chain(["updatedAt"].iter())
            .map(|k| (k.to_string(), all.get(*k).cloned().unwrap_or(Value::Null)))
            .collect();
        // Drop the pre-rename stage field if the document still carries it
        fields.insert("status".to_string(), Value::Null);

        let event = StageEvent::new(event_type, from, client.stage, data);
        self.store
            .patch_with_child(CLIENTS, &client.id, fields, STAGE_EVENTS, to_record(&event)?)?;

        info!(client = %client.id, event = event_type, from = %from, to = %client.stage, "client updated");
        Ok(client)
    }

    /// Refresh the last-modified marker only
    fn touch(&self, mut client: Client) -> FunnelResult<Client> {
        let now = Utc::now();
        client.updated_at = Some(now);

        let mut fields = Record::new();
        fields.insert("updatedAt".to_string(), serde_json::to_value(now).map_err(StoreError::from)?);
        self.store.patch(CLIENTS, &client.id, fields)?;
        Ok(client)
    }
}

fn to_record<T: Serialize>(value: &T) -> FunnelResult<Record> {
    match serde_json::to_value(value).map_err(StoreError::from)? {
        Value::Object(map) => Ok(map),
        other => Ok(Record::from_iter([("value".to_string(), other)])),
    }
}

fn decode_client(id: &str, record: Record) -> Result<Client, StoreError> {
    let mut client: Client = serde_json::from_value(Value::Object(record))?;
    if client.id.is_empty() {
        client.id = id.to_string();
    }
    Ok(client)
}

fn decode_roster(records: Vec<Record>) -> Vec<Client> {
    records
        .into_iter()
        .filter_map(|record| {
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            match decode_client(&id, record) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(client = %id, error = %e, "skipping unreadable client document");
                    None
                }
            }
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::RetentionRule;
    use crate::stage::ServiceMode;
    use crate::store::SqliteStore;
    use crate::transition::{Direction, Gate};
    use chrono::TimeZone;
    use crate::error::StoreResult;
    use std::sync::{Arc, Mutex};

    fn service() -> FunnelService<SqliteStore> {
        FunnelService::new(SqliteStore::open_in_memory().unwrap())
    }

    fn seed(service: &FunnelService<SqliteStore>, id: &str, stage: Stage) {
        service.add_client(&Client::with_stage(id, stage)).unwrap();
    }

    fn forward_from(stage: Stage) -> MoveRequest {
        MoveRequest {
            from: stage,
            direction: Direction::Forward,
        }
    }

    /// Store whose combined document + event write always fails
    struct RejectingEvents(SqliteStore);

    impl Store for RejectingEvents {
        fn get_by_id(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
            self.0.get_by_id(collection, id)
        }
        fn query(&self, collection: &str, predicate: &dyn Fn(&Record) -> bool) -> StoreResult<Vec<Record>> {
            self.0.query(collection, predicate)
        }
        fn subscribe(
            &self,
            collection: &str,
            predicate: crate::store::Predicate,
            on_change: crate::store::OnChange,
        ) -> StoreResult<Subscription> {
            self.0.subscribe(collection, predicate, on_change)
        }
        fn unsubscribe(&self, subscription: Subscription) -> StoreResult<bool> {
            self.0.unsubscribe(subscription)
        }
        fn put(&self, collection: &str, id: &str, record: Record) -> StoreResult<()> {
            self.0.put(collection, id, record)
        }
        fn patch(&self, collection: &str, id: &str, fields: Record) -> StoreResult<()> {
            self.0.patch(collection, id, fields)
        }
        fn patch_with_child(
            &self,
            _collection: &str,
            _id: &str,
            _fields: Record,
            _child_collection: &str,
            _child: Record,
        ) -> StoreResult<String> {
            Err(StoreError::Lock("events unavailable".to_string()))
        }
        fn append(&self, collection: &str, parent_id: &str, record: Record) -> StoreResult<String> {
            self.0.append(collection, parent_id, record)
        }
        fn children(&self, collection: &str, parent_id: &str) -> StoreResult<Vec<Record>> {
            self.0.children(collection, parent_id)
        }
    }

    #[test]
    fn test_failed_event_write_leaves_client_unchanged() {
        let service = FunnelService::new(RejectingEvents(SqliteStore::open_in_memory().unwrap()));
        service
            .add_client(&Client::with_stage("c-1", Stage::Trial))
            .unwrap();

        assert!(service.move_client("c-1", forward_from(Stage::Trial)).is_err());
        assert!(service
            .close_client("c-1", None, LostReason::Other, "")
            .is_err());

        let stored = service.load_client("c-1").unwrap();
        assert_eq!(stored.stage, Stage::Trial);
        assert!(stored.lost_at_phase.is_none());
        assert!(service.stage_events("c-1").unwrap().is_empty());
    }

    #[test]
    fn test_close_completed_client_rejected_and_stored_unchanged() {
        let service = service();
        let mut client = Client::with_stage("c-1", Stage::Completed);
        client.employment_date = NaiveDate::from_ymd_opt(2023, 1, 10);
        client.follow_up_completion_date = NaiveDate::from_ymd_opt(2023, 7, 10);
        service.add_client(&client).unwrap();

        let err = service
            .close_client("c-1", None, LostReason::Other, "")
            .unwrap_err();
        assert!(err.is_precondition());

        let stored = service.load_client("c-1").unwrap();
        assert_eq!(stored.stage, Stage::Completed);
        assert!(stored.lost_at_phase.is_none());
        assert!(stored.check_invariants().is_empty());
        assert!(service.stage_events("c-1").unwrap().is_empty());
    }

    #[test]
    fn test_close_from_follow_up_persists_retirement() {
        let service = service();
        seed(&service, "c-1", Stage::FollowUp2);

        service
            .close_client("c-1", None, LostReason::DropOut, "退職")
            .unwrap();

        let stored = service.load_client("c-1").unwrap();
        assert_eq!(stored.stage, Stage::Closed);
        assert!(stored.is_retired);
        assert!(stored.retired_at.is_some());
    }

    #[test]
    fn test_document_with_stage_and_status_stays_readable() {
        let service = service();
        service
            .save_facility(&FacilityConfig::new(10, NaiveDate::from_ymd_opt(2023, 4, 1).unwrap()))
            .unwrap();

        let record = serde_json::json!({
            "id": "c-1",
            "stage": "completed",
            "status": "completed",
            "employmentDate": "2023-05-01",
            "followUpCompletionDate": "2023-11-01"
        });
        let Value::Object(record) = record else { unreachable!() };
        service.store().put(CLIENTS, "c-1", record).unwrap();

        assert_eq!(service.load_client("c-1").unwrap().stage, Stage::Completed);
        assert_eq!(service.load_roster().unwrap().len(), 1);
        assert_eq!(service.retention(2023).unwrap().numerator, 1);
    }

    #[test]
    fn test_move_client_persists_and_logs() {
        let service = service();
        seed(&service, "c-1", Stage::Inquiry);

        let result = service.move_client("c-1", forward_from(Stage::Inquiry)).unwrap();
        assert!(result.is_moved());

        let stored = service.load_client("c-1").unwrap();
        assert_eq!(stored.stage, Stage::Interview);

        let events = service.stage_events("c-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "stage_moved");
        assert_eq!(events[0].from, Stage::Inquiry);
        assert_eq!(events[0].to, Stage::Interview);
    }

    #[test]
    fn test_repeated_move_only_touches() {
        let service = service();
        seed(&service, "c-1", Stage::Inquiry);

        service.move_client("c-1", forward_from(Stage::Inquiry)).unwrap();
        let again = service.move_client("c-1", forward_from(Stage::Inquiry)).unwrap();

        assert!(matches!(again, Applied::Unchanged(_)));
        assert_eq!(service.load_client("c-1").unwrap().stage, Stage::Interview);
        assert_eq!(service.stage_events("c-1").unwrap().len(), 1);
    }

    #[test]
    fn test_gate_then_resolution() {
        let service = service();
        seed(&service, "c-1", Stage::PreContract);

        let gate = service.move_client("c-1", forward_from(Stage::PreContract)).unwrap();
        assert!(matches!(gate, Applied::GateOpened { gate: Gate::ServiceMode, .. }));
        assert_eq!(service.load_client("c-1").unwrap().stage, Stage::PreContract);

        service
            .resolve_gate("c-1", GateResolution::ServiceMode(ServiceMode::Remote))
            .unwrap();
        assert_eq!(service.load_client("c-1").unwrap().stage, Stage::ActiveRemote);
    }

    #[test]
    fn test_legacy_status_field_is_replaced() {
        let service = service();
        let mut record = Record::new();
        record.insert("id".to_string(), Value::from("old"));
        record.insert("status".to_string(), Value::from("lead-consulting"));
        service.store().put(CLIENTS, "old", record).unwrap();

        service.move_client("old", forward_from(Stage::Interview)).unwrap();

        let raw = service.store().get_by_id(CLIENTS, "old").unwrap().unwrap();
        assert_eq!(raw["stage"], "trial");
        assert!(raw.get("status").is_none());
    }

    #[test]
    fn test_close_twice_fails() {
        let service = service();
        seed(&service, "c-1", Stage::Trial);

        let closed = service
            .close_client("c-1", None, LostReason::Mismatch, "")
            .unwrap();
        assert_eq!(closed.lost_at_stage(), Some(Stage::Trial));

        let err = service
            .close_client("c-1", Some(Stage::Inquiry), LostReason::Other, "")
            .unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(service.load_client("c-1").unwrap().lost_at_stage(), Some(Stage::Trial));
    }

    #[test]
    fn test_missing_client() {
        let service = service();
        let err = service.move_client("nobody", forward_from(Stage::Inquiry)).unwrap_err();
        assert!(matches!(err, FunnelError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_retention_requires_facility() {
        let service = service();
        assert!(service.retention(2024).unwrap_err().is_configuration());

        service
            .save_facility(&FacilityConfig::new(10, NaiveDate::from_ymd_opt(2022, 6, 1).unwrap()))
            .unwrap();
        let cohort = service.retention(2021).unwrap();
        assert_eq!(cohort.rule, RetentionRule::NotApplicable);
    }

    #[test]
    fn test_retire_client() {
        let service = service();
        seed(&service, "c-1", Stage::FollowUp3);
        let at = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();

        let flagged = service.retire_client("c-1", at, false).unwrap();
        assert_eq!(flagged.stage, Stage::FollowUp3);
        assert!(service.load_client("c-1").unwrap().is_retired);

        let retired = service.retire_client("c-1", at, true).unwrap();
        assert_eq!(retired.stage, Stage::Retired);
        assert_eq!(service.load_client("c-1").unwrap().stage, Stage::Retired);
    }

    #[test]
    fn test_watch_retention_recomputes() {
        let service = service();
        service
            .save_facility(&FacilityConfig::new(10, NaiveDate::from_ymd_opt(2022, 6, 1).unwrap()))
            .unwrap();

        let rates: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&rates);
        let sub = service
            .watch_retention(2022, move |result| {
                sink.lock().unwrap().push(result.unwrap().numerator);
            })
            .unwrap();

        let mut settled = Client::with_stage("s-1", Stage::Completed);
        settled.employment_date = NaiveDate::from_ymd_opt(2022, 7, 1);
        settled.follow_up_completion_date = NaiveDate::from_ymd_opt(2023, 1, 1);
        service.add_client(&settled).unwrap();

        assert_eq!(*rates.lock().unwrap(), vec![0, 1]);
        assert!(service.unwatch(sub).unwrap());
    }

    #[test]
    fn test_unreadable_documents_are_skipped() {
        let service = service();
        seed(&service, "ok", Stage::Trial);

        let mut broken = Record::new();
        broken.insert("stage".to_string(), Value::from("graduated"));
        service.store().put(CLIENTS, "broken", broken).unwrap();

        let roster = service.load_roster().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, "ok");
    }
}
