// 📉 Lost Accounting - closing clients and counting where the funnel leaks
//
// `lostAtPhase` is written exactly once, when a client is closed. The lost
// counter reads it back per funnel stage. Tags written under older stage
// names are already normalized by `LostPhase` deserialization; tags nobody
// recognizes end up in `unmapped` instead of failing the count.

use crate::client::{Client, LostPhase};
use crate::error::{FunnelError, FunnelResult};
use crate::stage::{LostReason, Stage, FUNNEL_STAGES};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

// ============================================================================
// LOST COUNTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LostCounts {
    /// Closed clients per queried funnel stage (zero entries included)
    pub counts: BTreeMap<Stage, usize>,

    /// Closed clients whose origin tag could not be mapped to any stage
    pub unmapped: usize,
}

impl LostCounts {
    pub fn get(&self, stage: Stage) -> usize {
        self.counts.get(&stage).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .counts
            .iter()
            .map(|(stage, count)| format!("{} {}人", stage.label(), count))
            .collect();

        format!("{} (unmapped: {})", parts.join(" / "), self.unmapped)
    }
}

// ============================================================================
// LOST ACCOUNTING ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct LostAccountingEngine;

impl LostAccountingEngine {
    pub fn new() -> Self {
        LostAccountingEngine
    }

    /// Close a client, tagging the stage it left from.
    ///
    /// Only a client at a non-terminal stage can be closed; a closed one's
    /// `lostAtPhase` is immutable. Leaving from follow-up also flags the
    /// client as retired (the job ended along with support).
    pub fn close(
        &self,
        mut client: Client,
        origin_stage: Stage,
        reason: LostReason,
        details: &str,
    ) -> FunnelResult<Client> {
        if client.is_closed() {
            return Err(FunnelError::precondition(
                &client.id,
                "client is already closed",
            ));
        }

        if client.stage.is_terminal() {
            return Err(FunnelError::precondition(
                &client.id,
                format!("cannot close a client at terminal stage {}", client.stage),
            ));
        }

        if origin_stage.is_terminal() {
            return Err(FunnelError::precondition(
                &client.id,
                format!("origin stage cannot be terminal ({})", origin_stage),
            ));
        }

        if origin_stage != client.stage {
            warn!(
                client = %client.id,
                stage = %client.stage,
                origin = %origin_stage,
                "closing with an origin stage different from the current stage"
            );
        }

        client.stage = Stage::Closed;
        client.lost_at_phase = Some(LostPhase::Known(origin_stage));
        client.lost_reason = Some(reason);
        client.lost_reason_details = Some(details.to_string());
        if origin_stage.is_follow_up() {
            client = client.mark_retired(Utc::now());
        }

        debug!(client = %client.id, origin = %origin_stage, reason = reason.as_str(), "client closed");
        Ok(client)
    }

    /// Count closed clients per origin stage.
    ///
    /// Only the four funnel stages are counted; other stages in `stages` are
    /// dropped from the query.
    pub fn count_by_origin_stage(&self, roster: &[Client], stages: &[Stage]) -> LostCounts {
        let mut result = LostCounts::default();

        for stage in stages.iter().filter(|s| s.is_funnel()) {
            result.counts.insert(*stage, 0);
        }

        for client in roster.iter().filter(|c| c.is_closed()) {
            match &client.lost_at_phase {
                Some(LostPhase::Known(stage)) => {
                    if let Some(count) = result.counts.get_mut(stage) {
                        *count += 1;
                    }
                }
                Some(LostPhase::Unrecognized(raw)) => {
                    warn!(client = %client.id, tag = %raw, "unmapped lostAtPhase tag");
                    result.unmapped += 1;
                }
                None => {
                    warn!(client = %client.id, "closed client without lostAtPhase");
                }
            }
        }

        result
    }

    /// The lost counter: all four funnel stages
    pub fn funnel_counts(&self, roster: &[Client]) -> LostCounts {
        self.count_by_origin_stage(roster, &FUNNEL_STAGES)
    }
}

// ============================================================================
// TESTS
// ============================================================================
