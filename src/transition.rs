// 🔀 Transition Engine - ordered moves through the funnel and follow-up
//
// Two linear tables:
//   funnel:    INQUIRY ⇄ INTERVIEW ⇄ TRIAL ⇄ PRE_CONTRACT ⇒ [service mode gate]
//   follow-up: FOLLOW_UP_1 ⇄ ... ⇄ FOLLOW_UP_5 ⇒ [completion gate]  (FOLLOW_UP_6 is last)
//
// Gates never mutate the client. The caller collects the missing input and
// commits through `resolve_gate`. Closing and retiring are side transitions
// handled elsewhere (lost.rs / Client::retire).

use crate::client::Client;
use crate::error::{FunnelError, FunnelResult};
use crate::stage::{ServiceMode, Stage, FOLLOW_UP_STAGES, FUNNEL_STAGES};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// MOVES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Backward,
    Forward,
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "backward" | "back" | "prev" => Ok(Direction::Backward),
            "forward" | "next" => Ok(Direction::Forward),
            other => Err(format!("Unknown direction: {}", other)),
        }
    }
}

/// A transition point that needs external input before a stage is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    /// PRE_CONTRACT → ACTIVE_ONSITE | ACTIVE_REMOTE
    ServiceMode,
    /// FOLLOW_UP_5 → COMPLETED, needs a completion date
    Completion,
}

impl Gate {
    /// Stage a client must occupy for this gate to be open
    pub fn source(&self) -> Stage {
        match self {
            Gate::ServiceMode => Stage::PreContract,
            Gate::Completion => Stage::FollowUp5,
        }
    }

    /// Every stage the gate can commit
    pub fn targets(&self) -> &'static [Stage] {
        match self {
            Gate::ServiceMode => &[Stage::ActiveOnsite, Stage::ActiveRemote],
            Gate::Completion => &[Stage::Completed],
        }
    }
}

/// Input that closes a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResolution {
    ServiceMode(ServiceMode),
    Completion(NaiveDate),
}

impl GateResolution {
    pub fn gate(&self) -> Gate {
        match self {
            GateResolution::ServiceMode(_) => Gate::ServiceMode,
            GateResolution::Completion(_) => Gate::Completion,
        }
    }

    pub fn target(&self) -> Stage {
        match self {
            GateResolution::ServiceMode(mode) => mode.stage(),
            GateResolution::Completion(_) => Stage::Completed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    Stage(Stage),
    Gate(Gate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegalMoves {
    pub backward: Option<Stage>,
    pub forward: Option<Forward>,
}

impl LegalMoves {
    const NONE: LegalMoves = LegalMoves {
        backward: None,
        forward: None,
    };

    pub fn get(&self, direction: Direction) -> Option<Forward> {
        match direction {
            Direction::Backward => self.backward.map(Forward::Stage),
            Direction::Forward => self.forward,
        }
    }
}

/// A move as the UI saw it: "from the stage I rendered, go this way"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRequest {
    pub from: Stage,
    pub direction: Direction,
}

/// Result of applying a move
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Moved(Client),
    Unchanged(Client),
    /// Nothing was written; the caller must collect input for `gate`
    GateOpened { client: Client, gate: Gate },
}

impl Applied {
    pub fn client(&self) -> &Client {
        match self {
            Applied::Moved(client) | Applied::Unchanged(client) => client,
            Applied::GateOpened { client, .. } => client,
        }
    }

    pub fn into_client(self) -> Client {
        match self {
            Applied::Moved(client) | Applied::Unchanged(client) => client,
            Applied::GateOpened { client, .. } => client,
        }
    }

    pub fn is_moved(&self) -> bool {
        matches!(self, Applied::Moved(_))
    }
}

// ============================================================================
// TRANSITION ENGINE
// ============================================================================

/// Forward overrides for table positions whose exit needs external input.
const GATED: [(Stage, Gate); 2] = [
    (Stage::PreContract, Gate::ServiceMode),
    (Stage::FollowUp5, Gate::Completion),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionEngine;

impl TransitionEngine {
    pub fn new() -> Self {
        TransitionEngine
    }

    /// Backward/forward moves available from `stage`
    pub fn legal_moves(&self, stage: Stage) -> LegalMoves {
        let table: &[Stage] = if stage.is_funnel() {
            &FUNNEL_STAGES
        } else if stage.is_follow_up() {
            &FOLLOW_UP_STAGES
        } else {
            return LegalMoves::NONE;
        };

        let Some(pos) = table.iter().position(|s| *s == stage) else {
            return LegalMoves::NONE;
        };

        let backward = pos.checked_sub(1).map(|i| table[i]);

        let forward = match GATED.iter().find(|(s, _)| *s == stage) {
            Some((_, gate)) => Some(Forward::Gate(*gate)),
            None => table.get(pos + 1).copied().map(Forward::Stage),
        };

        LegalMoves { backward, forward }
    }

    /// Where `direction` leads from `from`, if anywhere
    pub fn target(&self, from: Stage, direction: Direction) -> Option<Forward> {
        self.legal_moves(from).get(direction)
    }

    /// Apply a move from the client's current stage
    pub fn apply(&self, client: Client, direction: Direction) -> Applied {
        let from = client.stage;
        self.apply_request(client, MoveRequest { from, direction })
    }

    /// Apply a move computed from `request.from`.
    ///
    /// Repeating a request whose target the client already reached leaves it
    /// where it is; so does a request rendered from a stage the client has
    /// since left.
    pub fn apply_request(&self, mut client: Client, request: MoveRequest) -> Applied {
        match self.target(request.from, request.direction) {
            None => {
                debug!(client = %client.id, from = %request.from, ?request.direction, "no move in this direction");
                Applied::Unchanged(client)
            }
            Some(Forward::Gate(gate)) => {
                if client.stage == request.from {
                    debug!(client = %client.id, ?gate, "gate opened");
                    Applied::GateOpened { client, gate }
                } else {
                    Applied::Unchanged(client)
                }
            }
            Some(Forward::Stage(target)) => {
                if client.stage == request.from {
                    debug!(client = %client.id, from = %request.from, to = %target, "stage moved");
                    client.stage = target;
                    Applied::Moved(client)
                } else {
                    debug!(client = %client.id, stage = %client.stage, from = %request.from, "stale or repeated move request");
                    Applied::Unchanged(client)
                }
            }
        }
    }

    /// Commit a gate once the caller has the missing input
    pub fn resolve_gate(&self, mut client: Client, resolution: GateResolution) -> Applied {
        let gate = resolution.gate();

        if client.stage != gate.source() {
            debug!(client = %client.id, stage = %client.stage, ?gate, "gate not open for this stage");
            return Applied::Unchanged(client);
        }

        client.stage = resolution.target();
        if let GateResolution::Completion(date) = resolution {
            client.follow_up_completion_date = Some(date);
        }

        debug!(client = %client.id, to = %client.stage, "gate resolved");
        Applied::Moved(client)
    }

    /// Move an active client into follow-up after it found employment
    pub fn start_follow_up(
        &self,
        mut client: Client,
        employment_date: NaiveDate,
        company: &str,
    ) -> FunnelResult<Client> {
        if !client.stage.is_active() {
            return Err(FunnelError::precondition(
                &client.id,
                format!("follow-up starts from an active stage, not {}", client.stage),
            ));
        }

        let company = company.trim();
        if company.is_empty() {
            return Err(FunnelError::precondition(
                &client.id,
                "employment company is required",
            ));
        }

        client.stage = Stage::FollowUp1;
        client.employment_date = Some(employment_date);
        client.employment_company = Some(company.to_string());
        Ok(client)
    }
}

// ============================================================================
// TESTS
// ============================================================================
