// 🧭 Stage Taxonomy - the closed set of lifecycle stages
//
// Funnel:     INQUIRY → INTERVIEW → TRIAL → PRE_CONTRACT
// Branch:     PRE_CONTRACT ⇒ ACTIVE_ONSITE | ACTIVE_REMOTE
// Follow-up:  FOLLOW_UP_1 → ... → FOLLOW_UP_6
// Terminal:   COMPLETED, CLOSED, RETIRED
//
// Stored data carries at least two naming generations ("lead-new" vs
// "inquiry", "closed-lost" vs "closed"). Every read boundary goes through
// `Stage::from_identifier`, which is the only place that knows about them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// STAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// New inquiry (新規問合せ)
    Inquiry,
    /// Interview / facility visit (面談・見学)
    Interview,
    /// Trial attendance (体験利用)
    Trial,
    /// Preparing the service contract (契約準備中)
    PreContract,
    /// Using the service inside the facility
    ActiveOnsite,
    /// Using the service outside the facility
    ActiveRemote,
    FollowUp1,
    FollowUp2,
    FollowUp3,
    FollowUp4,
    FollowUp5,
    FollowUp6,
    /// Follow-up finished, counts as settled
    Completed,
    /// Left the funnel (lost)
    Closed,
    /// Left employment
    Retired,
}

/// The four pre-activation stages, in funnel order
pub const FUNNEL_STAGES: [Stage; 4] = [
    Stage::Inquiry,
    Stage::Interview,
    Stage::Trial,
    Stage::PreContract,
];

/// The six monthly follow-up sub-stages, in order
pub const FOLLOW_UP_STAGES: [Stage; 6] = [
    Stage::FollowUp1,
    Stage::FollowUp2,
    Stage::FollowUp3,
    Stage::FollowUp4,
    Stage::FollowUp5,
    Stage::FollowUp6,
];

pub const ALL_STAGES: [Stage; 15] = [
    Stage::Inquiry,
    Stage::Interview,
    Stage::Trial,
    Stage::PreContract,
    Stage::ActiveOnsite,
    Stage::ActiveRemote,
    Stage::FollowUp1,
    Stage::FollowUp2,
    Stage::FollowUp3,
    Stage::FollowUp4,
    Stage::FollowUp5,
    Stage::FollowUp6,
    Stage::Completed,
    Stage::Closed,
    Stage::Retired,
];

/// Identifiers from earlier naming generations still present in stored data.
const LEGACY_IDENTIFIERS: &[(&str, Stage)] = &[
    ("lead-new", Stage::Inquiry),
    ("新規問合せ", Stage::Inquiry),
    ("lead-consulting", Stage::Interview),
    ("相談・見学", Stage::Interview),
    ("面談・見学", Stage::Interview),
    ("lead-trial", Stage::Trial),
    ("体験利用", Stage::Trial),
    ("contract-prep", Stage::PreContract),
    ("契約準備中", Stage::PreContract),
    ("client-active", Stage::ActiveOnsite),
    ("closed-lost", Stage::Closed),
    // Single follow-up column, before the monthly split
    ("follow-up", Stage::FollowUp1),
    ("follow_up", Stage::FollowUp1),
    ("employed", Stage::FollowUp1),
];

impl Stage {
    /// Current persisted identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Inquiry => "inquiry",
            Stage::Interview => "interview",
            Stage::Trial => "trial",
            Stage::PreContract => "pre_contract",
            Stage::ActiveOnsite => "active_onsite",
            Stage::ActiveRemote => "active_remote",
            Stage::FollowUp1 => "follow-up-m1",
            Stage::FollowUp2 => "follow-up-m2",
            Stage::FollowUp3 => "follow-up-m3",
            Stage::FollowUp4 => "follow-up-m4",
            Stage::FollowUp5 => "follow-up-m5",
            Stage::FollowUp6 => "follow-up-m6",
            Stage::Completed => "completed",
            Stage::Closed => "closed",
            Stage::Retired => "retired",
        }
    }

    /// Display label used on the staff dashboard
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Inquiry => "新規問合せ",
            Stage::Interview => "面談・見学",
            Stage::Trial => "体験利用",
            Stage::PreContract => "契約準備中",
            Stage::ActiveOnsite => "施設内利用",
            Stage::ActiveRemote => "施設外利用",
            Stage::FollowUp1 => "定着支援1ヶ月目",
            Stage::FollowUp2 => "定着支援2ヶ月目",
            Stage::FollowUp3 => "定着支援3ヶ月目",
            Stage::FollowUp4 => "定着支援4ヶ月目",
            Stage::FollowUp5 => "定着支援5ヶ月目",
            Stage::FollowUp6 => "定着支援6ヶ月目",
            Stage::Completed => "定着完了",
            Stage::Closed => "利用終了",
            Stage::Retired => "離職",
        }
    }

    /// Resolve a stored identifier (current or legacy) to a stage.
    ///
    /// Returns `None` for identifiers no generation of the taxonomy used.
    pub fn from_identifier(raw: &str) -> Option<Stage> {
        let trimmed = raw.trim();

        if let Some(stage) = ALL_STAGES.iter().find(|s| s.as_str() == trimmed) {
            return Some(*stage);
        }

        LEGACY_IDENTIFIERS
            .iter()
            .find(|(legacy, _)| *legacy == trimmed)
            .map(|(_, stage)| *stage)
    }

    pub fn is_funnel(&self) -> bool {
        FUNNEL_STAGES.contains(self)
    }

    pub fn is_follow_up(&self) -> bool {
        FOLLOW_UP_STAGES.contains(self)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Stage::ActiveOnsite | Stage::ActiveRemote)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Closed | Stage::Retired)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::from_identifier(s).ok_or_else(|| format!("Unknown stage identifier: {}", s))
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Stage::from_identifier(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown stage identifier: {}", raw)))
    }
}

// ============================================================================
// SERVICE MODE (the PRE_CONTRACT branch)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Onsite,
    Remote,
}

impl ServiceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceMode::Onsite => "onsite",
            ServiceMode::Remote => "remote",
        }
    }

    /// Stage committed when the branch resolves to this mode
    pub fn stage(&self) -> Stage {
        match self {
            ServiceMode::Onsite => Stage::ActiveOnsite,
            ServiceMode::Remote => Stage::ActiveRemote,
        }
    }
}

impl FromStr for ServiceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "onsite" => Ok(ServiceMode::Onsite),
            "remote" => Ok(ServiceMode::Remote),
            other => Err(format!("Unknown service mode: {}", other)),
        }
    }
}

// ============================================================================
// LOST REASON
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LostReason {
    Unreachable,
    ChoseCompetitor,
    Premature,
    Mismatch,
    /// Dropped before the facility visit
    LostPreVisit,
    /// Declined after the facility visit
    LostPostVisit,
    LostInTrial,
    LostPreContract,
    /// Left mid-service
    DropOut,
    /// Service period ran out
    Expired,
    /// Moved to another agency
    Transferred,
    Other,
}

const ALL_LOST_REASONS: [LostReason; 12] = [
    LostReason::Unreachable,
    LostReason::ChoseCompetitor,
    LostReason::Premature,
    LostReason::Mismatch,
    LostReason::LostPreVisit,
    LostReason::LostPostVisit,
    LostReason::LostInTrial,
    LostReason::LostPreContract,
    LostReason::DropOut,
    LostReason::Expired,
    LostReason::Transferred,
    LostReason::Other,
];

impl LostReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LostReason::Unreachable => "unreachable",
            LostReason::ChoseCompetitor => "chose_competitor",
            LostReason::Premature => "premature",
            LostReason::Mismatch => "mismatch",
            LostReason::LostPreVisit => "lost_pre_visit",
            LostReason::LostPostVisit => "lost_post_visit",
            LostReason::LostInTrial => "lost_in_trial",
            LostReason::LostPreContract => "lost_pre_contract",
            LostReason::DropOut => "drop_out",
            LostReason::Expired => "expired",
            LostReason::Transferred => "transferred",
            LostReason::Other => "other",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LostReason::Unreachable => "連絡不通",
            LostReason::ChoseCompetitor => "他事業所を選択",
            LostReason::Premature => "時期尚早",
            LostReason::Mismatch => "ミスマッチ",
            LostReason::LostPreVisit => "見学前離脱",
            LostReason::LostPostVisit => "見学後辞退",
            LostReason::LostInTrial => "体験中辞退",
            LostReason::LostPreContract => "契約直前辞退",
            LostReason::DropOut => "途中退所",
            LostReason::Expired => "期間満了",
            LostReason::Transferred => "他機関へ移行",
            LostReason::Other => "その他",
        }
    }
}

impl FromStr for LostReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        ALL_LOST_REASONS
            .iter()
            .find(|r| r.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("Unknown lost reason: {}", s))
    }
}

// ============================================================================
// TESTS
// ============================================================================
