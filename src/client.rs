// 👤 Client - one record per service user
//
// The engines only ever read/write the fields below. Everything else the
// dashboard stores on a client document (contact details, billing info, ...)
// is ignored on read and left untouched by patches.

use crate::error::{FunnelError, FunnelResult};
use crate::stage::{LostReason, Stage};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use tracing::warn;

// ============================================================================
// LOST PHASE TAG
// ============================================================================

/// Stage a client occupied when it left the funnel.
///
/// Tags are normalized when read: any identifier `Stage::from_identifier`
/// understands becomes `Known`. Anything else is kept verbatim so it can be
/// reported as unmapped and written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LostPhase {
    Known(Stage),
    Unrecognized(String),
}

impl LostPhase {
    pub fn parse(raw: &str) -> LostPhase {
        match Stage::from_identifier(raw) {
            Some(stage) => LostPhase::Known(stage),
            None => LostPhase::Unrecognized(raw.to_string()),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            LostPhase::Known(stage) => Some(*stage),
            LostPhase::Unrecognized(_) => None,
        }
    }
}

impl From<Stage> for LostPhase {
    fn from(stage: Stage) -> Self {
        LostPhase::Known(stage)
    }
}

impl fmt::Display for LostPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LostPhase::Known(stage) => f.write_str(stage.as_str()),
            LostPhase::Unrecognized(raw) => f.write_str(raw),
        }
    }
}

impl Serialize for LostPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LostPhase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(LostPhase::parse(&raw))
    }
}

// Reasons written by older dashboard builds fall back to `Other`.
fn lenient_reason<'de, D>(deserializer: D) -> Result<Option<LostReason>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(|r| {
        r.parse::<LostReason>().unwrap_or_else(|_| {
            warn!(reason = %r, "unknown lost reason, treating as other");
            LostReason::Other
        })
    }))
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ClientDocument")]
pub struct Client {
    /// Document id, assigned by the store
    pub id: String,

    pub name: String,

    pub stage: Stage,

    // ========================================================================
    // LOST / CLOSED
    // ========================================================================
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_at_phase: Option<LostPhase>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_reason: Option<LostReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_reason_details: Option<String>,

    // ========================================================================
    // EMPLOYMENT / FOLLOW-UP
    // ========================================================================
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employment_date: Option<NaiveDate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub employment_company: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up_completion_date: Option<NaiveDate>,

    #[serde(skip_serializing_if = "is_false")]
    pub is_retired: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,

    /// Last-modified marker, owned by the store layer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Stored shape of a client, as written by any dashboard generation
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientDocument {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    stage: Option<Stage>,
    /// Pre-rename stage field; older builds may still write it next to `stage`
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    lost_at_phase: Option<LostPhase>,
    #[serde(default, deserialize_with = "lenient_reason")]
    lost_reason: Option<LostReason>,
    #[serde(default)]
    lost_reason_details: Option<String>,
    #[serde(default)]
    employment_date: Option<NaiveDate>,
    #[serde(default)]
    employment_company: Option<String>,
    #[serde(default)]
    follow_up_completion_date: Option<NaiveDate>,
    #[serde(default)]
    is_retired: bool,
    #[serde(default)]
    retired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<ClientDocument> for Client {
    type Error = String;

    // `stage` wins; `status` only fills in when `stage` is absent
    fn try_from(doc: ClientDocument) -> Result<Self, Self::Error> {
        let stage = match (doc.stage, doc.status.as_deref()) {
            (Some(stage), _) => stage,
            (None, Some(status)) => Stage::from_identifier(status)
                .ok_or_else(|| format!("unknown stage identifier: {}", status))?,
            (None, None) => return Err("missing field `stage`".to_string()),
        };

        Ok(Client {
            id: doc.id,
            name: doc.name,
            stage,
            lost_at_phase: doc.lost_at_phase,
            lost_reason: doc.lost_reason,
            lost_reason_details: doc.lost_reason_details,
            employment_date: doc.employment_date,
            employment_company: doc.employment_company,
            follow_up_completion_date: doc.follow_up_completion_date,
            is_retired: doc.is_retired,
            retired_at: doc.retired_at,
            updated_at: doc.updated_at,
        })
    }
}

impl Client {
    /// New inquiry with a fresh id
    pub fn new(name: &str) -> Self {
        Client::with_stage(&uuid::Uuid::new_v4().to_string(), Stage::Inquiry)
            .named(name)
    }

    /// Bare client at `stage`, no optional fields set
    pub fn with_stage(id: &str, stage: Stage) -> Self {
        Client {
            id: id.to_string(),
            name: String::new(),
            stage,
            lost_at_phase: None,
            lost_reason: None,
            lost_reason_details: None,
            employment_date: None,
            employment_company: None,
            follow_up_completion_date: None,
            is_retired: false,
            retired_at: None,
            updated_at: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn is_closed(&self) -> bool {
        self.stage == Stage::Closed
    }

    /// Normalized origin stage of a closed client
    pub fn lost_at_stage(&self) -> Option<Stage> {
        self.lost_at_phase.as_ref().and_then(LostPhase::stage)
    }

    /// List violations of the record invariants (empty = consistent)
    pub fn check_invariants(&self) -> Vec<String> {
        let mut violations = Vec::new();

        match (self.stage == Stage::Closed, self.lost_at_phase.is_some()) {
            (true, false) => violations.push("closed client has no lostAtPhase".to_string()),
            (false, true) => violations.push(format!(
                "lostAtPhase set on a client at stage {}",
                self.stage
            )),
            _ => {}
        }

        match (
            self.stage == Stage::Completed,
            self.follow_up_completion_date.is_some(),
        ) {
            (true, false) => {
                violations.push("completed client has no followUpCompletionDate".to_string())
            }
            (false, true) => violations.push(format!(
                "followUpCompletionDate set on a client at stage {}",
                self.stage
            )),
            _ => {}
        }

        violations
    }

    // ========================================================================
    // RETIREMENT (caller-side side transitions)
    // ========================================================================

    /// Flag the client as retired without touching its stage.
    ///
    /// A follow-up client that leaves its job may still owe a settlement
    /// count, so the flag is tracked independently of CLOSED/RETIRED.
    pub fn mark_retired(mut self, at: DateTime<Utc>) -> Client {
        if !self.is_retired {
            self.is_retired = true;
            self.retired_at = Some(at);
        }
        self
    }

    /// Flag the client as retired and move it to the RETIRED stage.
    pub fn retire(self, at: DateTime<Utc>) -> FunnelResult<Client> {
        if self.stage.is_terminal() {
            return Err(FunnelError::precondition(
                &self.id,
                format!("cannot retire a client at terminal stage {}", self.stage),
            ));
        }

        let mut next = self.mark_retired(at);
        next.stage = Stage::Retired;
        Ok(next)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_client() {
        let client = Client::new("山田 太郎");

        assert!(!client.id.is_empty());
        assert_eq!(client.name, "山田 太郎");
        assert_eq!(client.stage, Stage::Inquiry);
        assert!(client.check_invariants().is_empty());
    }

    #[test]
    fn test_deserialize_legacy_document() {
        let json = serde_json::json!({
            "id": "c-1",
            "name": "佐藤",
            "status": "closed-lost",
            "lostAtPhase": "lead-trial",
            "lostReason": "lost_in_trial",
            "lostReasonDetails": "",
            "furigana": "さとう"
        });

        let client: Client = serde_json::from_value(json).unwrap();

        assert_eq!(client.stage, Stage::Closed);
        assert_eq!(client.lost_at_phase, Some(LostPhase::Known(Stage::Trial)));
        assert_eq!(client.lost_reason, Some(LostReason::LostInTrial));
        assert!(client.check_invariants().is_empty());
    }

    #[test]
    fn test_stage_wins_over_status() {
        let json = serde_json::json!({
            "id": "c-2",
            "stage": "completed",
            "status": "follow-up",
            "employmentDate": "2023-01-10",
            "followUpCompletionDate": "2023-07-10"
        });

        let client: Client = serde_json::from_value(json).unwrap();
        assert_eq!(client.stage, Stage::Completed);
        assert!(client.check_invariants().is_empty());

        // Same value in both fields, as the older dashboard writes it
        let both = serde_json::json!({ "stage": "trial", "status": "trial" });
        let client: Client = serde_json::from_value(both).unwrap();
        assert_eq!(client.stage, Stage::Trial);

        // An unknown `status` next to a good `stage` is ignored
        let stray = serde_json::json!({ "stage": "trial", "status": "legacy-garbage" });
        let client: Client = serde_json::from_value(stray).unwrap();
        assert_eq!(client.stage, Stage::Trial);

        let back = serde_json::to_value(&client).unwrap();
        assert!(back.get("status").is_none());
    }

    #[test]
    fn test_missing_or_unknown_stage_fails() {
        assert!(serde_json::from_value::<Client>(serde_json::json!({ "name": "x" })).is_err());
        assert!(serde_json::from_value::<Client>(serde_json::json!({ "status": "waiting" })).is_err());
        assert!(serde_json::from_value::<Client>(serde_json::json!({ "stage": "waiting" })).is_err());
    }

    #[test]
    fn test_unrecognized_phase_is_preserved() {
        let json = serde_json::json!({
            "stage": "closed",
            "lostAtPhase": "waiting-list",
            "lostReason": "moved-away"
        });

        let client: Client = serde_json::from_value(json).unwrap();
        assert_eq!(
            client.lost_at_phase,
            Some(LostPhase::Unrecognized("waiting-list".to_string()))
        );
        assert_eq!(client.lost_at_stage(), None);
        assert_eq!(client.lost_reason, Some(LostReason::Other));

        let back = serde_json::to_value(&client).unwrap();
        assert_eq!(back["lostAtPhase"], "waiting-list");
    }

    #[test]
    fn test_serialize_uses_store_field_names() {
        let mut client = Client::with_stage("c-2", Stage::Completed);
        client.employment_date = NaiveDate::from_ymd_opt(2023, 5, 10);
        client.follow_up_completion_date = NaiveDate::from_ymd_opt(2023, 11, 10);

        let value = serde_json::to_value(&client).unwrap();

        assert_eq!(value["stage"], "completed");
        assert_eq!(value["employmentDate"], "2023-05-10");
        assert_eq!(value["followUpCompletionDate"], "2023-11-10");
        assert!(value.get("lostAtPhase").is_none());
        assert!(value.get("isRetired").is_none());
    }

    #[test]
    fn test_invariant_violations() {
        let closed = Client::with_stage("c-3", Stage::Closed);
        assert_eq!(closed.check_invariants().len(), 1);

        let mut completed = Client::with_stage("c-4", Stage::FollowUp3);
        completed.follow_up_completion_date = NaiveDate::from_ymd_opt(2024, 1, 1);
        completed.lost_at_phase = Some(LostPhase::Known(Stage::Trial));
        assert_eq!(completed.check_invariants().len(), 2);
    }

    #[test]
    fn test_mark_retired_keeps_stage() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let client = Client::with_stage("c-5", Stage::FollowUp4).mark_retired(at);

        assert_eq!(client.stage, Stage::FollowUp4);
        assert!(client.is_retired);
        assert_eq!(client.retired_at, Some(at));

        // Second mark keeps the first timestamp
        let later = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let client = client.mark_retired(later);
        assert_eq!(client.retired_at, Some(at));
    }

    #[test]
    fn test_retire_moves_to_terminal_stage() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();

        let retired = Client::with_stage("c-6", Stage::FollowUp2).retire(at).unwrap();
        assert_eq!(retired.stage, Stage::Retired);
        assert!(retired.is_retired);

        let err = Client::with_stage("c-7", Stage::Closed).retire(at).unwrap_err();
        assert!(err.is_precondition());
    }
}
