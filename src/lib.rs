// Support Funnel - Core Library
// Client lifecycle state machine, lost accounting and retention rate
// calculation for a vocational-support facility. Used by the CLI and tests.

pub mod stage;      // Stage taxonomy + legacy identifier normalization
pub mod client;     // Client record
pub mod error;
pub mod transition; // Funnel / follow-up moves and decision gates
pub mod lost;       // Closing clients, lost counter
pub mod retention;  // Fiscal-year settlement rate
pub mod config;
pub mod store;      // Document store collaborator (SQLite)
pub mod service;    // Engines wired to the store
pub mod import;     // CSV roster import

// Re-export commonly used types
pub use stage::{
    Stage, ServiceMode, LostReason,
    FUNNEL_STAGES, FOLLOW_UP_STAGES, ALL_STAGES,
};
pub use client::{Client, LostPhase};
pub use error::{FunnelError, FunnelResult, StoreError, StoreResult};
pub use transition::{
    TransitionEngine, LegalMoves, Forward, Gate, GateResolution,
    Direction, MoveRequest, Applied,
};
pub use lost::{LostAccountingEngine, LostCounts};
pub use retention::{
    RetentionRateCalculator, FiscalYearCohort, RetentionRule,
    ReportingBracket, BreakdownEntry, fiscal_year,
};
pub use config::{AppConfig, FacilityConfig};
pub use store::{Store, SqliteStore, Record, Subscription};
pub use service::{FunnelService, StageEvent};
pub use import::load_roster_csv;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
