//! Command intake and outcome records.
//!
//! Commands arrive already parsed from the relay as `{type, player_id, args}`.
//! `Command::parse_action` turns the loose args map into a typed `Action`, so
//! shape errors are reported before any session is loaded.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::board::ColumnId;
use crate::engine::session::{Faction, GateKind, PublicState};
use crate::error::GameError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    StartRound,
    Roll,
    ChooseColumns,
    Bank,
    ClearGate,
    QueryState,
    ChooseFaction,
    FormContract,
    DissolveContract,
    Abandon,
    UseItem,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::StartRound => "StartRound",
            CommandKind::Roll => "Roll",
            CommandKind::ChooseColumns => "ChooseColumns",
            CommandKind::Bank => "Bank",
            CommandKind::ClearGate => "ClearGate",
            CommandKind::QueryState => "QueryState",
            CommandKind::ChooseFaction => "ChooseFaction",
            CommandKind::FormContract => "FormContract",
            CommandKind::DissolveContract => "DissolveContract",
            CommandKind::Abandon => "Abandon",
            CommandKind::UseItem => "UseItem",
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, CommandKind::QueryState)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub player_id: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// A command with validated arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    StartRound,
    Roll,
    ChooseColumns(Vec<ColumnId>),
    Bank,
    ClearGate { gate: GateKind, selection: Option<String> },
    QueryState,
    ChooseFaction(Faction),
    FormContract { counterpart: String, faction: Faction },
    DissolveContract,
    Abandon,
    UseItem(String),
}

impl Command {
    pub fn new(kind: CommandKind, player_id: &str) -> Self {
        Self {
            kind,
            player_id: player_id.to_string(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_string(), value);
        self
    }

    fn str_arg(&self, key: &str) -> Result<&str, GameError> {
        match self.args.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
            Some(_) => Err(GameError::Validation(format!("{}: `{}` must be a non-empty string", self.kind.as_str(), key))),
            None => Err(GameError::Validation(format!("{}: missing `{}`", self.kind.as_str(), key))),
        }
    }

    fn faction_arg(&self, key: &str) -> Result<Faction, GameError> {
        self.str_arg(key)?
            .parse()
            .map_err(|e: String| GameError::Validation(format!("{}: {}", self.kind.as_str(), e)))
    }

    pub fn parse_action(&self) -> Result<Action, GameError> {
        if self.player_id.trim().is_empty() {
            return Err(GameError::Validation("player_id must not be empty".to_string()));
        }
        Ok(match self.kind {
            CommandKind::StartRound => Action::StartRound,
            CommandKind::Roll => Action::Roll,
            CommandKind::Bank => Action::Bank,
            CommandKind::QueryState => Action::QueryState,
            CommandKind::DissolveContract => Action::DissolveContract,
            CommandKind::Abandon => Action::Abandon,
            CommandKind::ChooseColumns => {
                let raw = self
                    .args
                    .get("columns")
                    .and_then(Value::as_array)
                    .ok_or_else(|| GameError::Validation("ChooseColumns: `columns` must be an array".to_string()))?;
                let mut cols = Vec::with_capacity(raw.len());
                for v in raw {
                    let c = v
                        .as_u64()
                        .and_then(|n| ColumnId::try_from(n).ok())
                        .ok_or_else(|| GameError::Validation(format!("ChooseColumns: bad column {}", v)))?;
                    cols.push(c);
                }
                if cols.is_empty() || cols.len() > 2 {
                    return Err(GameError::Validation(format!(
                        "ChooseColumns: expected 1 or 2 columns, got {}",
                        cols.len()
                    )));
                }
                cols.sort_unstable();
                Action::ChooseColumns(cols)
            }
            CommandKind::ClearGate => {
                let gate = self
                    .str_arg("gate")?
                    .parse()
                    .map_err(|e: String| GameError::Validation(format!("ClearGate: {}", e)))?;
                let selection = match self.args.get("selection") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => {
                        return Err(GameError::Validation(format!("ClearGate: bad selection {}", other)))
                    }
                };
                Action::ClearGate { gate, selection }
            }
            CommandKind::ChooseFaction => Action::ChooseFaction(self.faction_arg("faction")?),
            CommandKind::UseItem => Action::UseItem(self.str_arg("item")?.trim().to_string()),
            CommandKind::FormContract => Action::FormContract {
                counterpart: self.str_arg("counterpart")?.to_string(),
                faction: self.faction_arg("faction")?,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Busted,
    Blocked,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: Status,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub new_public_state: Option<PublicState>,
}

impl Outcome {
    pub fn error(err: &GameError, state: Option<PublicState>) -> Self {
        Self {
            status: Status::Error,
            detail: err.to_string(),
            error_code: Some(err.code().to_string()),
            new_public_state: state,
        }
    }
}
