//! Error taxonomy shared by the engine, the stores and the coordinator.
//!
//! Every variant carries a stable `code()` so relay clients can branch on it
//! without parsing the human-readable message.

use thiserror::Error;

use crate::engine::session::GateKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    /// Bad command shape or arguments; nothing was touched.
    #[error("invalid command: {0}")]
    Validation(String),
    #[error(transparent)]
    Rule(#[from] RuleViolation),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl GameError {
    pub fn code(&self) -> &'static str {
        match self {
            GameError::Validation(_) => "validation",
            GameError::Rule(r) => r.code(),
            GameError::Content(c) => c.code(),
            GameError::Persistence(p) => p.code(),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            GameError::Validation(_) => "validation",
            GameError::Rule(_) => "rule",
            GameError::Content(_) => "content",
            GameError::Persistence(_) => "persistence",
        }
    }
}

/// A well-formed command that the rules do not allow right now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleViolation {
    #[error("a round is already in progress")]
    AlreadyInRound,
    #[error("no round is in progress")]
    NoActiveRound,
    #[error("blocked by open {gate} gate; send ClearGate for it first")]
    GateBlocked { gate: GateKind },
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
    #[error("invalid gate response: {0}")]
    InvalidGateResponse(String),
    #[error("there is no open gate to clear")]
    NoOpenGate,
    #[error("game over: this player has already won")]
    GameOver,
    #[error("roll the dice before choosing columns")]
    NotRolled,
    #[error("dice already rolled; choose columns first")]
    AlreadyRolled,
    #[error("must keep rolling {remaining} more time(s) before banking")]
    MustKeepRolling { remaining: u32 },
    #[error("you do not hold {0}")]
    ItemNotHeld(String),
    #[error("{0} cannot be used")]
    ItemNotUsable(String),
}

impl RuleViolation {
    pub fn code(&self) -> &'static str {
        match self {
            RuleViolation::AlreadyInRound => "already_in_round",
            RuleViolation::NoActiveRound => "no_active_round",
            RuleViolation::GateBlocked { .. } => "gate_blocked",
            RuleViolation::InvalidSelection(_) => "invalid_selection",
            RuleViolation::InvalidGateResponse(_) => "invalid_gate_response",
            RuleViolation::NoOpenGate => "no_open_gate",
            RuleViolation::GameOver => "game_over",
            RuleViolation::NotRolled => "not_rolled",
            RuleViolation::AlreadyRolled => "already_rolled",
            RuleViolation::MustKeepRolling { .. } => "must_keep_rolling",
            RuleViolation::ItemNotHeld(_) => "item_not_held",
            RuleViolation::ItemNotUsable(_) => "item_not_usable",
        }
    }
}

/// Defects in the static board or catalog tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("unknown content {kind}{id}")]
    UnknownContent { kind: char, id: u32 },
    #[error("column {0} is not on the board")]
    ColumnOutOfRange(u8),
    #[error("column {column} has no cell {index}")]
    IndexOutOfRange { column: u8, index: usize },
    #[error("malformed content: {0}")]
    Malformed(String),
    #[error("catalog entry {0} has no unconditional fallback branch")]
    NoFallbackBranch(String),
}

impl ContentError {
    pub fn code(&self) -> &'static str {
        match self {
            ContentError::UnknownContent { .. } => "unknown_content",
            ContentError::ColumnOutOfRange(_) => "column_out_of_range",
            ContentError::IndexOutOfRange { .. } => "index_out_of_range",
            ContentError::Malformed(_) => "malformed_content",
            ContentError::NoFallbackBranch(_) => "no_fallback_branch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("persistence {op} timed out after {ms}ms")]
    Timeout { op: String, ms: u64 },
    #[error("persistence backend error: {0}")]
    Backend(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error("record not found: {0}")]
    NotFound(String),
    /// The stored version was not the one this write was computed from.
    #[error("version conflict for {player_id}: expected stored version {expected}, found {found}")]
    Conflict { player_id: String, expected: u64, found: u64 },
}

impl PersistenceError {
    pub fn code(&self) -> &'static str {
        match self {
            PersistenceError::Timeout { .. } => "persistence_timeout",
            PersistenceError::Backend(_) => "persistence_backend",
            PersistenceError::Corrupt(_) => "persistence_corrupt",
            PersistenceError::NotFound(_) => "not_found",
            PersistenceError::Conflict { .. } => "persistence_conflict",
        }
    }

    /// The write may or may not have landed; only a fresh read can tell.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, PersistenceError::Timeout { .. } | PersistenceError::Conflict { .. })
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceError::Backend(err.to_string())
    }
}
