//! Pure reducer: (PlayerSession, Action) -> Transition
//!
//! All game rules live here. The reducer mutates the session it is handed and
//! never performs I/O; the coordinator passes in a copy and only persists it
//! when the reducer returns `Ok`. An `Err` therefore leaves no trace.
//!
//! Instead of logging, every step is recorded as an `EngineEvent` which the
//! caller writes out after the transition commits.

use serde::Serialize;

use crate::board::{Board, CellKind, ColumnId};
use crate::catalog::{EffectCatalog, ResolveContext};
use crate::config::RulesConfig;
use crate::engine::command::{Action, Status};
use crate::engine::dice::{pair_roll, DiceSource, Roll};
use crate::engine::effects::{apply_outcome, nullify_trap, RoundEffect};
use crate::engine::session::{
    Achievement, Contract, Counter, Faction, Flag, Gate, GateKind, Phase, PlayerSession,
};
use crate::error::{GameError, RuleViolation};

/// Read-only tables shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct Tables<'a> {
    pub board: &'a Board,
    pub catalog: &'a EffectCatalog,
    pub rules: &'a RulesConfig,
}

/// One observable step of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RoundStarted,
    Rolled { dice: Vec<u8>, fixed: bool, playable: bool },
    RollSkipped { remaining: u32 },
    Advanced { column: ColumnId, from: Option<usize>, to: usize },
    Triggered { column: ColumnId, index: usize, cell: String, name: String, branch: usize, fields: Vec<String> },
    TrapNullified { cell: String, remaining: u32 },
    Message { source: String, text: String },
    ItemGranted { item: String },
    ItemRemoved { item: String, held: bool },
    ScoreChanged { delta: i64, score: i64 },
    FlagSet { flag: Flag },
    CounterSet { counter: Counter, value: u32 },
    NextRollFixed { dice: Vec<u8> },
    ColumnsBlocked { columns: Vec<ColumnId> },
    Retreated { column: ColumnId, from: usize, to: Option<usize> },
    GateOpened { gate: GateKind, source: String },
    GateCleared { gate: GateKind, selection: Option<String> },
    RoundEndDeferred { source: String },
    Banked { columns: Vec<(ColumnId, usize)> },
    ColumnCompleted { column: ColumnId },
    Busted { reason: String },
    Abandoned,
    Won { completed: Vec<ColumnId> },
    FactionChosen { faction: Faction },
    ContractFormed { counterpart: String, faction: Faction },
    ContractDissolved { had_contract: bool },
    ItemUsed { item: String, name: String, branch: usize, fields: Vec<String> },
    AchievementEarned { achievement: Achievement, reward: i64 },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::RoundStarted => "round_started",
            EngineEvent::Rolled { .. } => "rolled",
            EngineEvent::RollSkipped { .. } => "roll_skipped",
            EngineEvent::Advanced { .. } => "advanced",
            EngineEvent::Triggered { .. } => "triggered",
            EngineEvent::TrapNullified { .. } => "trap_nullified",
            EngineEvent::Message { .. } => "message",
            EngineEvent::ItemGranted { .. } => "item_granted",
            EngineEvent::ItemRemoved { .. } => "item_removed",
            EngineEvent::ScoreChanged { .. } => "score_changed",
            EngineEvent::FlagSet { .. } => "flag_set",
            EngineEvent::CounterSet { .. } => "counter_set",
            EngineEvent::NextRollFixed { .. } => "next_roll_fixed",
            EngineEvent::ColumnsBlocked { .. } => "columns_blocked",
            EngineEvent::Retreated { .. } => "retreated",
            EngineEvent::GateOpened { .. } => "gate_opened",
            EngineEvent::GateCleared { .. } => "gate_cleared",
            EngineEvent::RoundEndDeferred { .. } => "round_end_deferred",
            EngineEvent::Banked { .. } => "banked",
            EngineEvent::ColumnCompleted { .. } => "column_completed",
            EngineEvent::Busted { .. } => "busted",
            EngineEvent::Abandoned => "abandoned",
            EngineEvent::Won { .. } => "won",
            EngineEvent::FactionChosen { .. } => "faction_chosen",
            EngineEvent::ContractFormed { .. } => "contract_formed",
            EngineEvent::ContractDissolved { .. } => "contract_dissolved",
            EngineEvent::ItemUsed { .. } => "item_used",
            EngineEvent::AchievementEarned { .. } => "achievement_earned",
        }
    }

    /// One-line, player-facing description.
    pub fn summary(&self) -> String {
        match self {
            EngineEvent::RoundStarted => "round started".to_string(),
            EngineEvent::Rolled { dice, fixed, playable } => format!(
                "rolled {:?}{}{}",
                dice,
                if *fixed { " (fixed)" } else { "" },
                if *playable { "" } else { ", nothing playable" }
            ),
            EngineEvent::RollSkipped { remaining } => {
                format!("sitting out this roll, {} pause(s) left", remaining)
            }
            EngineEvent::Advanced { column, to, .. } => format!("column {} -> cell {}", column, to),
            EngineEvent::Triggered { cell, name, .. } => format!("{} {}", cell, name),
            EngineEvent::TrapNullified { cell, remaining } => {
                format!("{} nullified by immunity, {} use(s) left", cell, remaining)
            }
            EngineEvent::Message { text, .. } => text.clone(),
            EngineEvent::ItemGranted { item } => format!("gained {}", item),
            EngineEvent::ItemRemoved { item, held } => {
                if *held {
                    format!("lost {}", item)
                } else {
                    format!("no {} to lose", item)
                }
            }
            EngineEvent::ScoreChanged { delta, score } => format!("score {:+} (now {})", delta, score),
            EngineEvent::FlagSet { flag } => format!("{:?} active", flag),
            EngineEvent::CounterSet { counter, value } => format!("{:?} = {}", counter, value),
            EngineEvent::NextRollFixed { dice } => format!("next roll fixed to {:?}", dice),
            EngineEvent::ColumnsBlocked { columns } => format!("columns {:?} blocked this round", columns),
            EngineEvent::Retreated { column, to, .. } => match to {
                Some(i) => format!("column {} back to cell {}", column, i),
                None => format!("column {} marker removed", column),
            },
            EngineEvent::GateOpened { gate, source } => format!("{} gate opened by {}", gate, source),
            EngineEvent::GateCleared { gate, selection } => match selection {
                Some(s) => format!("{} gate cleared with {:?}", gate, s),
                None => format!("{} gate cleared", gate),
            },
            EngineEvent::RoundEndDeferred { .. } => "round will end once open gates clear".to_string(),
            EngineEvent::Banked { columns } => format!("banked {} column(s)", columns.len()),
            EngineEvent::ColumnCompleted { column } => format!("column {} completed", column),
            EngineEvent::Busted { reason } => format!("bust: {}", reason),
            EngineEvent::Abandoned => "round abandoned".to_string(),
            EngineEvent::Won { completed } => format!("won with columns {:?}", completed),
            EngineEvent::FactionChosen { faction } => format!("joined {}", faction.as_str()),
            EngineEvent::ContractFormed { counterpart, faction } => {
                format!("contract with {} ({})", counterpart, faction.as_str())
            }
            EngineEvent::ContractDissolved { had_contract } => {
                if *had_contract {
                    "contract dissolved".to_string()
                } else {
                    "no contract to dissolve".to_string()
                }
            }
            EngineEvent::ItemUsed { item, name, .. } => {
                if name.is_empty() {
                    format!("used {}", item)
                } else {
                    format!("used {} ({})", item, name)
                }
            }
            EngineEvent::AchievementEarned { achievement, reward } => {
                if *reward > 0 {
                    format!("achievement: {} (+{})", achievement.title(), reward)
                } else {
                    format!("achievement: {}", achievement.title())
                }
            }
        }
    }
}

/// Result of one accepted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: Status,
    pub detail: String,
    pub events: Vec<EngineEvent>,
    pub state_hash: String,
}

/// Apply one action. On `Err` the session may be half-updated and must be dropped.
pub fn reduce(
    session: &mut PlayerSession,
    action: &Action,
    tables: &Tables<'_>,
    dice: &mut dyn DiceSource,
) -> Result<Transition, GameError> {
    if let Action::QueryState = action {
        return Ok(finish(session, Vec::new(), false));
    }
    if session.is_won() {
        return Err(RuleViolation::GameOver.into());
    }
    if let Some(gate) = session.open_gate() {
        if !matches!(action, Action::ClearGate { .. }) {
            return Err(RuleViolation::GateBlocked { gate: gate.kind() }.into());
        }
    }

    let mut events = Vec::new();
    let busted = match action {
        Action::StartRound => start_round(session, &mut events)?,
        Action::Roll => roll_dice(session, tables, dice, &mut events)?,
        Action::ChooseColumns(selection) => choose_columns(session, selection, tables, &mut events)?,
        Action::Bank => bank_round(session, tables, &mut events)?,
        Action::ClearGate { gate, selection } => clear_gate(session, *gate, selection.as_deref(), &mut events)?,
        Action::Abandon => abandon(session, &mut events)?,
        Action::UseItem(item) => use_item(session, item, tables, &mut events)?,
        Action::ChooseFaction(faction) => {
            session.faction = Some(*faction);
            events.push(EngineEvent::FactionChosen { faction: *faction });
            false
        }
        Action::FormContract { counterpart, faction } => {
            if counterpart == &session.player_id {
                return Err(GameError::Validation("cannot form a contract with yourself".to_string()));
            }
            session.contract = Some(Contract { faction: *faction, counterpart: counterpart.clone() });
            events.push(EngineEvent::ContractFormed { counterpart: counterpart.clone(), faction: *faction });
            false
        }
        Action::DissolveContract => {
            let had_contract = session.contract.take().is_some();
            events.push(EngineEvent::ContractDissolved { had_contract });
            false
        }
        Action::QueryState => false,
    };
    Ok(finish(session, events, busted))
}

fn finish(session: &PlayerSession, events: Vec<EngineEvent>, busted: bool) -> Transition {
    let status = if session.open_gate().is_some() {
        Status::Blocked
    } else if busted {
        Status::Busted
    } else {
        Status::Ok
    };
    let mut detail: Vec<String> = events.iter().map(EngineEvent::summary).collect();
    if let Some(gate) = session.open_gate() {
        detail.push(format!("waiting on {} gate from {}; send ClearGate", gate.kind(), gate.source()));
    }
    if detail.is_empty() {
        detail.push(session.phase.name().to_string());
    }
    Transition {
        status,
        detail: detail.join("; "),
        events,
        state_hash: session.hash(),
    }
}

fn require_round(session: &PlayerSession) -> Result<(), RuleViolation> {
    if session.active_round() {
        Ok(())
    } else {
        Err(RuleViolation::NoActiveRound)
    }
}

/// Whether a marker could move up `column` right now.
pub fn column_playable(session: &PlayerSession, tables: &Tables<'_>, column: ColumnId) -> bool {
    let Ok(col) = tables.board.column(column) else {
        return false;
    };
    if session.completed.contains(&column) || session.blocked.contains(&column) {
        return false;
    }
    if session.position(column) == Some(col.top_index()) {
        return false;
    }
    session.temporary.contains_key(&column) || session.temporary.len() < tables.rules.max_temp_columns
}

fn start_round(session: &mut PlayerSession, events: &mut Vec<EngineEvent>) -> Result<bool, GameError> {
    if session.active_round() {
        return Err(RuleViolation::AlreadyInRound.into());
    }
    session.clear_round();
    session.phase = Phase::Rolling;
    session.stats.rounds_started += 1;
    events.push(EngineEvent::RoundStarted);
    Ok(false)
}

fn roll_dice(
    session: &mut PlayerSession,
    tables: &Tables<'_>,
    dice: &mut dyn DiceSource,
    events: &mut Vec<EngineEvent>,
) -> Result<bool, GameError> {
    require_round(session)?;
    if let Phase::AwaitingColumnChoice { .. } = session.phase {
        return Err(RuleViolation::AlreadyRolled.into());
    }
    if session.counter(Counter::SkipRolls) > 0 {
        let remaining = session.decrement_counter(Counter::SkipRolls);
        session.stats.rolls_skipped += 1;
        events.push(EngineEvent::RollSkipped { remaining });
        return Ok(false);
    }

    let rules = tables.rules;
    let (faces, fixed) = match session.next_roll_fixed.take() {
        Some(mut fixed) => {
            if fixed.len() < rules.dice_count {
                let extra = dice.roll(rules.dice_count - fixed.len(), rules.die_faces);
                fixed.extend(extra);
            }
            fixed.truncate(rules.dice_count);
            for d in fixed.iter_mut() {
                *d = (*d).clamp(1, rules.die_faces);
            }
            (fixed, true)
        }
        None => (dice.roll(rules.dice_count, rules.die_faces), false),
    };
    session.stats.rolls += 1;
    session.dice_history.push(faces.clone());
    if faces.iter().all(|d| *d == 1) {
        award(session, Achievement::AllOnes, 0, events);
    }
    if faces.iter().all(|d| *d == rules.die_faces) {
        award(session, Achievement::AllTopFaces, 0, events);
    }

    let roll: Roll = pair_roll(faces, |c| column_playable(session, tables, c));
    let playable = roll.any_playable();
    events.push(EngineEvent::Rolled { dice: roll.dice.clone(), fixed, playable });
    if !playable {
        bust(session, "no playable pairing", events);
        return Ok(true);
    }
    session.phase = Phase::AwaitingColumnChoice { roll };
    Ok(false)
}

fn choose_columns(
    session: &mut PlayerSession,
    selection: &[ColumnId],
    tables: &Tables<'_>,
    events: &mut Vec<EngineEvent>,
) -> Result<bool, GameError> {
    require_round(session)?;
    let roll = match &session.phase {
        Phase::AwaitingColumnChoice { roll } => roll.clone(),
        _ => return Err(RuleViolation::NotRolled.into()),
    };

    let mut sorted = selection.to_vec();
    sorted.sort_unstable();
    if sorted.is_empty() || sorted.len() > 2 {
        return Err(RuleViolation::InvalidSelection(format!("pick 1 or 2 columns, got {}", sorted.len())).into());
    }
    if !roll.pairings.iter().any(|p| p.admits(&sorted)) {
        let offered: Vec<_> = roll.pairings.iter().filter(|p| p.is_playable()).map(|p| p.playable.clone()).collect();
        return Err(RuleViolation::InvalidSelection(format!(
            "{:?} is not playable from one pairing of this roll; offered {:?}",
            sorted, offered
        ))
        .into());
    }
    let mut distinct = sorted.clone();
    distinct.dedup();
    let new_columns = distinct.iter().filter(|c| !session.temporary.contains_key(c)).count();
    let cap = tables.rules.max_temp_columns;
    if session.temporary.len() + new_columns > cap {
        return Err(RuleViolation::InvalidSelection(format!(
            "would put temporary markers on {} columns; the cap is {}",
            session.temporary.len() + new_columns,
            cap
        ))
        .into());
    }

    session.phase = Phase::Rolling;
    if session.counter(Counter::ForceRolls) > 0 {
        session.decrement_counter(Counter::ForceRolls);
    }

    for column in distinct {
        let steps = sorted.iter().filter(|c| **c == column).count();
        let top = tables.board.column(column)?.top_index();
        let from = session.position(column);
        let to = match from {
            Some(i) => (i + steps).min(top),
            None => (steps - 1).min(top),
        };
        session.temporary.insert(column, to);
        session.current_column = Some(column);
        events.push(EngineEvent::Advanced { column, from, to });

        if trigger_cell(session, tables, column, to, events)? == RoundEffect::EndRound {
            bust(session, "the round was forced to end", events);
            return Ok(true);
        }
    }
    Ok(false)
}

fn trigger_cell(
    session: &mut PlayerSession,
    tables: &Tables<'_>,
    column: ColumnId,
    index: usize,
    events: &mut Vec<EngineEvent>,
) -> Result<RoundEffect, GameError> {
    let cell = tables.board.cell_at(column, index)?;
    let code = cell.to_string();
    if cell.kind == CellKind::Trap {
        session.stats.traps_triggered += 1;
        if let Some(remaining) = nullify_trap(session) {
            events.push(EngineEvent::TrapNullified { cell: code, remaining });
            return Ok(RoundEffect::Continue);
        }
    }
    let resolution = tables.catalog.resolve(&cell, &ResolveContext::of(session))?;
    events.push(EngineEvent::Triggered {
        column,
        index,
        cell: code.clone(),
        name: resolution.name.to_string(),
        branch: resolution.branch,
        fields: resolution.outcome.fields_present().into_iter().map(String::from).collect(),
    });
    let outcome = resolution.outcome.clone();
    Ok(apply_outcome(session, &outcome, &code, events))
}

fn bank_round(session: &mut PlayerSession, tables: &Tables<'_>, events: &mut Vec<EngineEvent>) -> Result<bool, GameError> {
    require_round(session)?;
    if let Phase::AwaitingColumnChoice { .. } = session.phase {
        return Err(RuleViolation::AlreadyRolled.into());
    }
    let owed = session.counter(Counter::ForceRolls);
    if owed > 0 {
        return Err(RuleViolation::MustKeepRolling { remaining: owed }.into());
    }

    let mut banked = Vec::new();
    let temporary = std::mem::take(&mut session.temporary);
    for (column, index) in temporary {
        let slot = session.permanent.entry(column).or_insert(index);
        *slot = (*slot).max(index);
        let merged = *slot;
        banked.push((column, merged));
        if tables.board.is_winning_index(column, merged)? && session.completed.insert(column) {
            events.push(EngineEvent::ColumnCompleted { column });
        }
    }
    events.push(EngineEvent::Banked { columns: banked });
    session.stats.rounds_banked += 1;
    session.clear_round();

    let winning: Vec<ColumnId> = session
        .completed
        .iter()
        .copied()
        .filter(|c| tables.board.column(*c).map(|col| col.counts_toward_win).unwrap_or(false))
        .collect();
    if winning.len() >= tables.rules.columns_to_win {
        session.phase = Phase::Won;
        events.push(EngineEvent::Won { completed: winning });
    }
    Ok(false)
}

/// Score reward for finishing the board first, second, third and fourth.
pub const FIRST_CLEAR_REWARDS: [i64; 4] = [100, 80, 50, 0];

/// Record a finishing place for a session that just won.
///
/// `earlier_finishers` counts players whose win was committed before this one;
/// placement is cross-player, so the coordinator supplies it. Only the first
/// four places earn an achievement.
pub fn award_first_clear(session: &mut PlayerSession, earlier_finishers: usize) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    if !session.is_won() {
        return events;
    }
    let already = session
        .achievements
        .iter()
        .any(|a| matches!(a, Achievement::FirstClear { .. }));
    if already {
        return events;
    }
    if let Some(reward) = FIRST_CLEAR_REWARDS.get(earlier_finishers) {
        let rank = earlier_finishers as u8 + 1;
        award(session, Achievement::FirstClear { rank }, *reward, &mut events);
    }
    events
}

fn award(session: &mut PlayerSession, achievement: Achievement, reward: i64, events: &mut Vec<EngineEvent>) {
    if !session.achievements.insert(achievement) {
        return;
    }
    session.score += reward;
    events.push(EngineEvent::AchievementEarned { achievement, reward });
}

fn clear_gate(
    session: &mut PlayerSession,
    kind: GateKind,
    selection: Option<&str>,
    events: &mut Vec<EngineEvent>,
) -> Result<bool, GameError> {
    let gate = session.open_gate().cloned().ok_or(RuleViolation::NoOpenGate)?;
    if gate.kind() != kind {
        return Err(RuleViolation::InvalidGateResponse(format!(
            "the open gate is {}, not {}",
            gate.kind(),
            kind
        ))
        .into());
    }

    let chosen = match &gate {
        Gate::Drawing { .. } => None,
        Gate::Choice { options, .. } => {
            let labels: Vec<&str> = options.iter().map(|o| o.label.as_str()).collect();
            let picked = selection
                .map(str::trim)
                .and_then(|s| options.iter().find(|o| o.label.eq_ignore_ascii_case(s)))
                .ok_or_else(|| {
                    RuleViolation::InvalidGateResponse(format!("choose one of {:?}", labels))
                })?;
            Some(picked.clone())
        }
    };

    session.gates.pop_front();
    events.push(EngineEvent::GateCleared {
        gate: kind,
        selection: chosen.as_ref().map(|o| o.label.clone()),
    });

    let mut end = false;
    if let Some(option) = chosen {
        end = apply_outcome(session, &option.outcome, gate.source(), events) == RoundEffect::EndRound;
    }
    if session.open_gate().is_none() && (end || session.round_end_deferred) {
        // an item used between rounds has no round to end
        if !session.active_round() {
            session.round_end_deferred = false;
            return Ok(false);
        }
        bust(session, "the round was forced to end", events);
        return Ok(true);
    }
    Ok(false)
}

/// Spend one copy of `item` and apply its use entry.
fn use_item(
    session: &mut PlayerSession,
    item: &str,
    tables: &Tables<'_>,
    events: &mut Vec<EngineEvent>,
) -> Result<bool, GameError> {
    if let Phase::AwaitingColumnChoice { .. } = session.phase {
        return Err(RuleViolation::AlreadyRolled.into());
    }
    if session.inventory.count(item) == 0 {
        return Err(RuleViolation::ItemNotHeld(item.to_string()).into());
    }
    if !tables.catalog.is_usable(item) {
        return Err(RuleViolation::ItemNotUsable(item.to_string()).into());
    }
    let resolution = tables.catalog.resolve_use(item, &ResolveContext::of(session))?;
    events.push(EngineEvent::ItemUsed {
        item: item.to_string(),
        name: resolution.name.to_string(),
        branch: resolution.branch,
        fields: resolution.outcome.fields_present().into_iter().map(String::from).collect(),
    });
    let outcome = resolution.outcome.clone();
    session.inventory.remove(item);
    events.push(EngineEvent::ItemRemoved { item: item.to_string(), held: true });

    let source = format!("use:{}", item);
    let effect = apply_outcome(session, &outcome, &source, events);
    if effect == RoundEffect::EndRound && session.active_round() {
        bust(session, "the round was forced to end", events);
        return Ok(true);
    }
    Ok(false)
}

fn abandon(session: &mut PlayerSession, events: &mut Vec<EngineEvent>) -> Result<bool, GameError> {
    require_round(session)?;
    session.stats.rounds_abandoned += 1;
    session.clear_round();
    events.push(EngineEvent::Abandoned);
    Ok(true)
}

/// End the round without banking. Banked markers are untouched.
fn bust(session: &mut PlayerSession, reason: &str, events: &mut Vec<EngineEvent>) {
    session.stats.rounds_busted += 1;
    session.clear_round();
    events.push(EngineEvent::Busted { reason: reason.to_string() });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dice::ScriptedDice;

    const BOARD: &str = r#"{"columns": [
        {"column": 4, "cells": ["E1", "T3", "I1"]},
        {"column": 6, "cells": ["E1", "E1", "E1"]},
        {"column": 7, "cells": ["E1", "E1", "E1", "E1"]},
        {"column": 8, "cells": ["E1", "T2", "E1"]},
        {"column": 10, "cells": ["E1", "E1", "E1"]},
        {"column": 3, "cells": ["E1", "E1", "E1"]}
    ]}"#;

    const CATALOG: &str = r#"{"entries": [
        {"trigger": "E1", "name": "Quiet Path", "branches": [{"outcome": {}}]},
        {"trigger": "I1", "name": "Doll", "branches": [{"outcome": {"grant_item": "doll", "trap_immunity_count": 2}}]},
        {"trigger": "T2", "name": "Fork", "branches": [{"outcome": {"requires_choice": {"prompt": "which way", "options": [
            {"label": "left", "outcome": {"score_delta": 1}},
            {"label": "right", "outcome": {"force_end_round": true}}
        ]}}}]},
        {"trigger": "T3", "name": "Wedding Ring", "branches": [
            {"when": ["has_contract"], "outcome": {"score_delta": 3}},
            {"outcome": {"force_end_round": true, "requires_drawing": true}}
        ]}
    ], "uses": [
        {"item": "doll", "name": "Doll", "branches": [{"outcome": {"score_delta": 4, "retreat": 1}}]},
        {"item": "bomb", "name": "Bomb", "branches": [{"outcome": {"force_end_round": true}}]},
        {"item": "map", "name": "Map", "branches": [
            {"when": ["has_contract"], "outcome": {"score_delta": 9}},
            {"outcome": {"requires_drawing": true, "force_end_round": true}}
        ]}
    ]}"#;

    struct Fixture {
        board: Board,
        catalog: EffectCatalog,
        rules: RulesConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                board: Board::from_json(BOARD).unwrap(),
                catalog: EffectCatalog::from_json(CATALOG).unwrap(),
                rules: RulesConfig::default(),
            }
        }

        fn tables(&self) -> Tables<'_> {
            Tables { board: &self.board, catalog: &self.catalog, rules: &self.rules }
        }
    }

    fn run(s: &mut PlayerSession, fx: &Fixture, dice: &mut ScriptedDice, action: Action) -> Result<Transition, GameError> {
        reduce(s, &action, &fx.tables(), dice)
    }

    #[test]
    fn test_start_round_twice_fails() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::default();
        let mut s = PlayerSession::new("p1");
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        assert!(s.active_round());
        let err = run(&mut s, &fx, &mut dice, Action::StartRound).unwrap_err();
        assert_eq!(err, RuleViolation::AlreadyInRound.into());
    }

    #[test]
    fn test_roll_requires_round() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::default();
        let mut s = PlayerSession::new("p1");
        let err = run(&mut s, &fx, &mut dice, Action::Roll).unwrap_err();
        assert_eq!(err.code(), "no_active_round");
        let err = run(&mut s, &fx, &mut dice, Action::Bank).unwrap_err();
        assert_eq!(err.code(), "no_active_round");
    }

    #[test]
    fn test_unplayable_roll_busts() {
        let fx = Fixture::new();
        // sums 18/18 only: no such column
        let mut dice = ScriptedDice::new(vec![vec![9, 9, 9, 9]]);
        let mut s = PlayerSession::new("p1");
        s.permanent.insert(7, 1);
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        assert_eq!(t.status, Status::Busted);
        assert!(!s.active_round());
        assert!(s.temporary.is_empty());
        assert_eq!(s.permanent.get(&7), Some(&1));
        assert_eq!(s.stats.rounds_busted, 1);
    }

    #[test]
    fn test_choose_and_bank() {
        let fx = Fixture::new();
        // pairings [6,6] [3,9] [5,7]
        let mut dice = ScriptedDice::new(vec![vec![1, 5, 2, 4]]);
        let mut s = PlayerSession::new("p1");
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![6, 6])).unwrap();
        assert_eq!(t.status, Status::Ok);
        assert_eq!(s.temporary.get(&6), Some(&1));
        run(&mut s, &fx, &mut dice, Action::Bank).unwrap();
        assert_eq!(s.permanent.get(&6), Some(&1));
        assert!(s.temporary.is_empty());
        assert_eq!(s.phase, Phase::Idle);
    }

    #[test]
    fn test_selection_must_come_from_one_pairing() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 3, 2, 5]]);
        let mut s = PlayerSession::new("p1");
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        let err = run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![4, 8])).unwrap_err();
        assert_eq!(err.code(), "invalid_selection");
    }

    #[test]
    fn test_cap_rejects_fourth_column() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 3, 2, 5]]);
        let mut s = PlayerSession::new("p1");
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        s.temporary.insert(3, 0);
        s.temporary.insert(6, 0);
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        let err = run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![4, 7])).unwrap_err();
        assert_eq!(err.code(), "invalid_selection");
        // one new column still fits
        run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![7])).unwrap();
        assert_eq!(s.temporary.len(), 3);
    }

    #[test]
    fn test_drawing_gate_blocks_until_cleared() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 3, 2, 5], vec![1, 3, 2, 5]]);
        let mut s = PlayerSession::new("p1");
        s.permanent.insert(4, 0);
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![4, 7])).unwrap();
        assert_eq!(t.status, Status::Blocked);
        assert_eq!(s.open_gate().map(Gate::kind), Some(GateKind::Drawing));

        for action in [Action::StartRound, Action::Roll, Action::ChooseColumns(vec![7]), Action::Bank] {
            let err = run(&mut s, &fx, &mut dice, action).unwrap_err();
            assert_eq!(err, RuleViolation::GateBlocked { gate: GateKind::Drawing }.into());
        }
        let err = run(
            &mut s,
            &fx,
            &mut dice,
            Action::ClearGate { gate: GateKind::Choice, selection: None },
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_gate_response");

        let t = run(&mut s, &fx, &mut dice, Action::ClearGate { gate: GateKind::Drawing, selection: None }).unwrap();
        // deferred force_end_round fires once the gate clears
        assert_eq!(t.status, Status::Busted);
        assert!(s.temporary.is_empty());
        assert_eq!(s.permanent.get(&4), Some(&0));
    }

    #[test]
    fn test_contract_routes_trap_to_other_branch() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 3, 2, 5]]);
        let mut s = PlayerSession::new("p1");
        s.permanent.insert(4, 0);
        s.contract = Some(Contract { faction: Faction::Adopter, counterpart: "p2".to_string() });
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![4])).unwrap();
        assert_eq!(t.status, Status::Ok);
        assert_eq!(s.score, 3);
    }

    #[test]
    fn test_choice_gate_applies_selected_outcome() {
        let fx = Fixture::new();
        // pairings [3,8] ...
        let mut dice = ScriptedDice::new(vec![vec![1, 2, 3, 5]]);
        let mut s = PlayerSession::new("p1");
        s.permanent.insert(8, 0);
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![8])).unwrap();
        assert_eq!(t.status, Status::Blocked);

        let err = run(
            &mut s,
            &fx,
            &mut dice,
            Action::ClearGate { gate: GateKind::Choice, selection: Some("up".to_string()) },
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_gate_response");
        assert!(s.open_gate().is_some());

        let t = run(
            &mut s,
            &fx,
            &mut dice,
            Action::ClearGate { gate: GateKind::Choice, selection: Some("left".to_string()) },
        )
        .unwrap();
        assert_eq!(t.status, Status::Ok);
        assert_eq!(s.score, 1);
        // round resumes where it stopped
        assert_eq!(s.phase, Phase::Rolling);
        assert_eq!(s.temporary.get(&8), Some(&1));
    }

    #[test]
    fn test_win_then_game_over() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 3, 2, 5]]);
        let mut s = PlayerSession::new("p1");
        s.permanent.insert(3, 2);
        s.permanent.insert(10, 2);
        s.completed.insert(3);
        s.completed.insert(10);
        s.permanent.insert(6, 1);
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![6])).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::Bank).unwrap();
        assert!(t.events.iter().any(|e| matches!(e, EngineEvent::Won { .. })));
        assert!(s.is_won());
        let err = run(&mut s, &fx, &mut dice, Action::StartRound).unwrap_err();
        assert_eq!(err, RuleViolation::GameOver.into());
        // reads are still answered
        assert!(run(&mut s, &fx, &mut dice, Action::QueryState).is_ok());
    }

    #[test]
    fn test_skip_rolls_consume_pause() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 3, 2, 5]]);
        let mut s = PlayerSession::new("p1");
        s.set_counter(Counter::SkipRolls, 1);
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        assert_eq!(t.events, vec![EngineEvent::RollSkipped { remaining: 0 }]);
        assert_eq!(s.phase, Phase::Rolling);
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        assert!(matches!(s.phase, Phase::AwaitingColumnChoice { .. }));
    }

    #[test]
    fn test_force_rolls_block_bank() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 3, 2, 5]]);
        let mut s = PlayerSession::new("p1");
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        s.set_counter(Counter::ForceRolls, 1);
        let err = run(&mut s, &fx, &mut dice, Action::Bank).unwrap_err();
        assert_eq!(err, RuleViolation::MustKeepRolling { remaining: 1 }.into());
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![7])).unwrap();
        assert!(run(&mut s, &fx, &mut dice, Action::Bank).is_ok());
    }

    #[test]
    fn test_fixed_next_roll() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![9, 9, 9, 9]]);
        let mut s = PlayerSession::new("p1");
        s.next_roll_fixed = Some(vec![1, 3, 2, 5]);
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        assert!(t.events.contains(&EngineEvent::Rolled { dice: vec![1, 3, 2, 5], fixed: true, playable: true }));
        assert!(s.next_roll_fixed.is_none());
    }

    #[test]
    fn test_abandon_discards_round() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 3, 2, 5]]);
        let mut s = PlayerSession::new("p1");
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        run(&mut s, &fx, &mut dice, Action::ChooseColumns(vec![7])).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::Abandon).unwrap();
        assert_eq!(t.status, Status::Busted);
        assert!(s.temporary.is_empty());
        assert!(s.permanent.is_empty());
    }

    #[test]
    fn test_query_does_not_mutate() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::default();
        let mut s = PlayerSession::new("p1");
        let before = s.clone();
        let t = run(&mut s, &fx, &mut dice, Action::QueryState).unwrap();
        assert_eq!(s, before);
        assert_eq!(t.state_hash, before.hash());
    }

    #[test]
    fn test_use_item_spends_one_copy() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::default();
        let mut s = PlayerSession::new("p1");
        s.inventory.add("doll");
        s.inventory.add("doll");
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        s.temporary.insert(7, 2);
        s.current_column = Some(7);

        let t = run(&mut s, &fx, &mut dice, Action::UseItem("doll".to_string())).unwrap();
        assert_eq!(t.status, Status::Ok);
        assert_eq!(s.inventory.count("doll"), 1);
        assert_eq!(s.score, 4);
        assert_eq!(s.temporary.get(&7), Some(&1));
        assert!(t.events.iter().any(|e| matches!(e, EngineEvent::ItemUsed { item, .. } if item == "doll")));
    }

    #[test]
    fn test_use_item_rejections_leave_inventory() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 3, 2, 5]]);
        let mut s = PlayerSession::new("p1");
        let err = run(&mut s, &fx, &mut dice, Action::UseItem("doll".to_string())).unwrap_err();
        assert_eq!(err.code(), "item_not_held");

        s.inventory.add("ring");
        let err = run(&mut s, &fx, &mut dice, Action::UseItem("ring".to_string())).unwrap_err();
        assert_eq!(err.code(), "item_not_usable");

        s.inventory.add("doll");
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        let err = run(&mut s, &fx, &mut dice, Action::UseItem("doll".to_string())).unwrap_err();
        assert_eq!(err.code(), "already_rolled");
        assert_eq!(s.inventory.count("doll"), 1);
    }

    #[test]
    fn test_use_item_can_end_the_round() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::default();
        let mut s = PlayerSession::new("p1");
        s.inventory.add("bomb");
        s.inventory.add("bomb");

        // between rounds there is nothing to end
        let t = run(&mut s, &fx, &mut dice, Action::UseItem("bomb".to_string())).unwrap();
        assert_eq!(t.status, Status::Ok);
        assert_eq!(s.stats.rounds_busted, 0);

        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        s.temporary.insert(6, 0);
        let t = run(&mut s, &fx, &mut dice, Action::UseItem("bomb".to_string())).unwrap();
        assert_eq!(t.status, Status::Busted);
        assert!(s.temporary.is_empty());
        assert_eq!(s.inventory.count("bomb"), 0);
    }

    #[test]
    fn test_item_gate_outside_round_clears_without_bust() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::default();
        let mut s = PlayerSession::new("p1");
        s.inventory.add("map");
        let t = run(&mut s, &fx, &mut dice, Action::UseItem("map".to_string())).unwrap();
        assert_eq!(t.status, Status::Blocked);
        let err = run(&mut s, &fx, &mut dice, Action::StartRound).unwrap_err();
        assert_eq!(err.code(), "gate_blocked");

        let t = run(&mut s, &fx, &mut dice, Action::ClearGate { gate: GateKind::Drawing, selection: None }).unwrap();
        assert_eq!(t.status, Status::Ok);
        assert!(!s.round_end_deferred);
        assert_eq!(s.stats.rounds_busted, 0);
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
    }

    #[test]
    fn test_dice_achievements_awarded_once() {
        let fx = Fixture::new();
        let mut dice = ScriptedDice::new(vec![vec![1, 1, 1, 1], vec![1, 1, 1, 1], vec![9, 9, 9, 9]]);
        let mut s = PlayerSession::new("p1");
        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        // sums of 2 are off the board, so the roll also busts
        assert_eq!(t.status, Status::Busted);
        assert!(s.achievements.contains(&Achievement::AllOnes));
        assert!(t.events.iter().any(|e| matches!(e, EngineEvent::AchievementEarned { .. })));

        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        let t = run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        assert!(!t.events.iter().any(|e| matches!(e, EngineEvent::AchievementEarned { .. })));

        run(&mut s, &fx, &mut dice, Action::StartRound).unwrap();
        run(&mut s, &fx, &mut dice, Action::Roll).unwrap();
        assert!(s.achievements.contains(&Achievement::AllTopFaces));
        assert_eq!(s.achievements.len(), 2);
        assert_eq!(s.score, 0);
    }

    #[test]
    fn test_first_clear_places_and_rewards() {
        let mut s = PlayerSession::new("p1");
        assert!(award_first_clear(&mut s, 0).is_empty());

        s.phase = Phase::Won;
        let events = award_first_clear(&mut s, 1);
        assert_eq!(
            events,
            vec![EngineEvent::AchievementEarned { achievement: Achievement::FirstClear { rank: 2 }, reward: 80 }]
        );
        assert_eq!(s.score, 80);
        // placement is settled once
        assert!(award_first_clear(&mut s, 0).is_empty());
        assert_eq!(s.score, 80);

        let mut late = PlayerSession::new("p5");
        late.phase = Phase::Won;
        assert!(award_first_clear(&mut late, 4).is_empty());
        assert!(late.achievements.is_empty());
    }
}
