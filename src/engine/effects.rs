//! Ordered application of effect outcomes to a session.
//!
//! Stages run in a fixed order so that inventory and counters already reflect
//! the triggering cell by the time a gate suspends play:
//!
//! 1. items and score
//! 2. counters and flags
//! 3. marker adjustments
//! 4. gates
//! 5. round ending
//!
//! Every field the catalog accepts is handled here; adding a field to
//! `EffectOutcome` without a stage below is a bug.

use crate::board::ColumnId;
use crate::catalog::{ChoiceOption, EffectOutcome};
use crate::engine::reducer::EngineEvent;
use crate::engine::session::{ChoiceKind, Counter, Flag, Gate, PlayerSession};

/// What the caller must do once the outcome has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundEffect {
    Continue,
    /// End the round now as a bust.
    EndRound,
}

pub fn apply_outcome(
    session: &mut PlayerSession,
    outcome: &EffectOutcome,
    source: &str,
    events: &mut Vec<EngineEvent>,
) -> RoundEffect {
    session.stats.effects_applied += 1;
    if let Some(text) = &outcome.message {
        events.push(EngineEvent::Message { source: source.to_string(), text: text.clone() });
    }

    apply_items(session, outcome, events);
    apply_counters(session, outcome, events);
    apply_markers(session, outcome, events);
    open_gates(session, outcome, source, events);

    if outcome.force_end_round {
        if session.open_gate().is_some() {
            session.round_end_deferred = true;
            events.push(EngineEvent::RoundEndDeferred { source: source.to_string() });
        } else {
            return RoundEffect::EndRound;
        }
    }
    RoundEffect::Continue
}

fn apply_items(session: &mut PlayerSession, outcome: &EffectOutcome, events: &mut Vec<EngineEvent>) {
    for item in &outcome.grant_item {
        session.inventory.add(item);
        events.push(EngineEvent::ItemGranted { item: item.clone() });
    }
    for item in &outcome.remove_item {
        let held = session.inventory.remove(item);
        events.push(EngineEvent::ItemRemoved { item: item.clone(), held });
    }
    if outcome.score_delta != 0 {
        session.score += outcome.score_delta;
        events.push(EngineEvent::ScoreChanged { delta: outcome.score_delta, score: session.score });
    }
}

fn apply_counters(session: &mut PlayerSession, outcome: &EffectOutcome, events: &mut Vec<EngineEvent>) {
    if outcome.trap_immunity_draw {
        session.flags.insert(Flag::TrapImmunity);
        events.push(EngineEvent::FlagSet { flag: Flag::TrapImmunity });
    }
    // an explicit count wins over the bare flag; loading rejects flag + 0
    if let Some(count) = outcome.trap_immunity_count {
        if count > 0 {
            session.flags.insert(Flag::TrapImmunity);
        }
        session.set_counter(Counter::TrapImmunity, count);
        events.push(EngineEvent::CounterSet { counter: Counter::TrapImmunity, value: count });
    }
    if outcome.skip_rolls > 0 {
        let value = session.counter(Counter::SkipRolls) + outcome.skip_rolls;
        session.set_counter(Counter::SkipRolls, value);
        events.push(EngineEvent::CounterSet { counter: Counter::SkipRolls, value });
    }
    if outcome.force_rolls > 0 {
        let value = session.counter(Counter::ForceRolls) + outcome.force_rolls;
        session.set_counter(Counter::ForceRolls, value);
        events.push(EngineEvent::CounterSet { counter: Counter::ForceRolls, value });
    }
    if let Some(faces) = &outcome.next_roll_fixed {
        session.next_roll_fixed = Some(faces.clone());
        events.push(EngineEvent::NextRollFixed { dice: faces.clone() });
    }
    if !outcome.block_columns.is_empty() {
        session.blocked.extend(outcome.block_columns.iter().copied());
        events.push(EngineEvent::ColumnsBlocked { columns: outcome.block_columns.clone() });
    }
}

fn apply_markers(session: &mut PlayerSession, outcome: &EffectOutcome, events: &mut Vec<EngineEvent>) {
    if outcome.retreat > 0 {
        if let Some(column) = session.current_column {
            retreat_column(session, column, outcome.retreat, events);
        }
    }
    if outcome.retreat_all > 0 {
        let columns: Vec<ColumnId> = session.temporary.keys().copied().collect();
        for column in columns {
            retreat_column(session, column, outcome.retreat_all, events);
        }
    }
    if outcome.clear_current_column {
        if let Some(column) = session.current_column {
            if let Some(from) = session.temporary.remove(&column) {
                events.push(EngineEvent::Retreated {
                    column,
                    from,
                    to: session.permanent.get(&column).copied(),
                });
            }
        }
    }
}

/// Move a temporary marker back `steps` cells, never below the banked marker.
/// A marker pushed back onto (or past) the banked one is lifted entirely, which
/// frees its slot under the temporary-column cap.
fn retreat_column(session: &mut PlayerSession, column: ColumnId, steps: u32, events: &mut Vec<EngineEvent>) {
    let Some(&from) = session.temporary.get(&column) else {
        return;
    };
    let floor = session.permanent.get(&column).copied();
    let target = from.checked_sub(steps as usize);
    let lifted = match (target, floor) {
        (None, _) => true,
        (Some(t), Some(p)) => t <= p,
        (Some(_), None) => false,
    };
    let to = if lifted {
        session.temporary.remove(&column);
        floor
    } else {
        session.temporary.insert(column, target.unwrap_or(0));
        target
    };
    events.push(EngineEvent::Retreated { column, from, to });
}

fn open_gates(session: &mut PlayerSession, outcome: &EffectOutcome, source: &str, events: &mut Vec<EngineEvent>) {
    let mut opened = Vec::new();
    if outcome.requires_drawing {
        opened.push(Gate::Drawing { source: source.to_string() });
    }
    if let Some(choice) = &outcome.requires_choice {
        opened.push(Gate::Choice {
            kind: ChoiceKind::Menu,
            source: source.to_string(),
            prompt: choice.prompt.clone(),
            options: choice.options.clone(),
        });
    }
    if let Some(duel) = &outcome.requires_duel {
        opened.push(Gate::Choice {
            kind: ChoiceKind::Duel,
            source: source.to_string(),
            prompt: duel.prompt.clone().unwrap_or_else(|| "report the duel result".to_string()),
            options: vec![
                ChoiceOption { label: "win".to_string(), outcome: (*duel.win).clone() },
                ChoiceOption { label: "lose".to_string(), outcome: (*duel.lose).clone() },
            ],
        });
    }
    for gate in opened {
        events.push(EngineEvent::GateOpened { gate: gate.kind(), source: source.to_string() });
        session.gates.push_back(gate);
    }
}

/// Spend trap immunity on a trap about to fire. Returns the uses left when
/// the trap is nullified, `None` when the player has no immunity.
///
/// With a counter the flag lasts until the counter hits zero. A bare flag
/// (no counter) covers exactly one trap.
pub fn nullify_trap(session: &mut PlayerSession) -> Option<u32> {
    if !session.has_flag(Flag::TrapImmunity) {
        return None;
    }
    session.stats.traps_nullified += 1;
    if session.counter(Counter::TrapImmunity) > 0 {
        Some(session.decrement_counter(Counter::TrapImmunity))
    } else {
        session.flags.remove(&Flag::TrapImmunity);
        Some(0)
    }
}
