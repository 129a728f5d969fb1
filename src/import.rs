// 📥 Roster import - CSV exports from the old dashboard
//
// Stage columns may hold any naming generation; they are normalized here,
// on the way in. Rows whose stage nobody recognizes are skipped.

use crate::client::{Client, LostPhase};
use crate::stage::{LostReason, Stage};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterRow {
    id: Option<String>,
    #[serde(default)]
    name: String,
    stage: String,
    lost_at_phase: Option<String>,
    lost_reason: Option<String>,
    employment_date: Option<String>,
    follow_up_completion_date: Option<String>,
}

/// Parse `YYYY-MM-DD` or the dashboard's `YYYY/MM/DD`
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y/%m/%d"))
        .with_context(|| format!("Invalid date: {}", raw))
}

fn optional_date(raw: Option<String>) -> Result<Option<NaiveDate>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| parse_date(&s))
        .transpose()
}

pub fn load_roster_csv(csv_path: &Path) -> Result<Vec<Client>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut clients = Vec::new();
    let mut skipped = 0;

    for (line, result) in rdr.deserialize().enumerate() {
        let row: RosterRow = result.context("Failed to deserialize roster row")?;

        let Some(stage) = Stage::from_identifier(&row.stage) else {
            warn!(line = line + 2, stage = %row.stage, "skipping row with unknown stage");
            skipped += 1;
            continue;
        };

        let id = row
            .id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut client = Client::with_stage(&id, stage).named(&row.name);
        client.lost_at_phase = row
            .lost_at_phase
            .filter(|s| !s.trim().is_empty())
            .map(|s| LostPhase::parse(&s));
        client.lost_reason = row
            .lost_reason
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<LostReason>().unwrap_or(LostReason::Other));
        client.employment_date = optional_date(row.employment_date)
            .with_context(|| format!("Bad employmentDate on line {}", line + 2))?;
        client.follow_up_completion_date = optional_date(row.follow_up_completion_date)
            .with_context(|| format!("Bad followUpCompletionDate on line {}", line + 2))?;

        for violation in client.check_invariants() {
            warn!(client = %client.id, %violation, "imported client is inconsistent");
        }

        clients.push(client);
    }

    info!(loaded = clients.len(), skipped, "roster CSV loaded");
    Ok(clients)
}
