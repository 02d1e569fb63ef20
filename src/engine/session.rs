//! Per-player session record.
//!
//! The session is plain data: the reducer clones it, mutates the clone and the
//! coordinator persists the result. Everything is kept in ordered maps so the
//! serialized form (and therefore `hash()`) is canonical.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::board::ColumnId;
use crate::catalog::ChoiceOption;
use crate::engine::dice::Roll;

pub type PlayerId = String;
pub type ItemId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Faction {
    Adopter,
    Aeonreth,
}

impl Faction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Faction::Adopter => "adopter",
            Faction::Aeonreth => "aeonreth",
        }
    }
}

impl FromStr for Faction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adopter" | "收养人" => Ok(Faction::Adopter),
            "aeonreth" => Ok(Faction::Aeonreth),
            other => Err(format!("unknown faction {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub faction: Faction,
    pub counterpart: PlayerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    TrapImmunity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    /// Remaining trap nullifications.
    TrapImmunity,
    /// Rolls to sit out.
    SkipRolls,
    /// Column choices still owed before banking is allowed.
    ForceRolls,
}

impl Counter {
    /// Flag that lives exactly as long as this counter is positive.
    pub fn linked_flag(&self) -> Option<Flag> {
        match self {
            Counter::TrapImmunity => Some(Flag::TrapImmunity),
            Counter::SkipRolls | Counter::ForceRolls => None,
        }
    }
}

/// Standing a player keeps across rounds and games.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Achievement {
    /// Every die in one roll showed 1.
    AllOnes,
    /// Every die in one roll showed the top face.
    AllTopFaces,
    /// Finished the board in this place, 1-based.
    FirstClear { rank: u8 },
}

impl Achievement {
    pub fn title(&self) -> &'static str {
        match self {
            Achievement::AllOnes => "Snake Eyes",
            Achievement::AllTopFaces => "Top of the Die",
            Achievement::FirstClear { rank: 1 } => "Game King",
            Achievement::FirstClear { rank: 2 } => "Silver Flash",
            Achievement::FirstClear { rank: 3 } => "Lucky Trio",
            Achievement::FirstClear { .. } => "One Step Short",
        }
    }
}

/// Item multiset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inventory(BTreeMap<ItemId, u32>);

impl Inventory {
    pub fn add(&mut self, item: &str) {
        *self.0.entry(item.to_string()).or_insert(0) += 1;
    }

    /// Remove one copy. Returns false when the item was not held.
    pub fn remove(&mut self, item: &str) -> bool {
        match self.0.get_mut(item) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => {
                self.0.remove(item);
                true
            }
            None => false,
        }
    }

    pub fn count(&self, item: &str) -> u32 {
        self.0.get(item).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ItemId, &u32)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Drawing,
    Choice,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Drawing => "drawing",
            GateKind::Choice => "choice",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drawing" => Ok(GateKind::Drawing),
            "choice" | "duel" => Ok(GateKind::Choice),
            other => Err(format!("unknown gate {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceKind {
    Menu,
    Duel,
}

/// A pending requirement that suspends play until its clearing command arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum Gate {
    /// Player must confirm the drawing before anything else happens.
    Drawing { source: String },
    /// Player must pick one of the offered options.
    Choice {
        kind: ChoiceKind,
        source: String,
        prompt: String,
        options: Vec<ChoiceOption>,
    },
}

impl Gate {
    pub fn kind(&self) -> GateKind {
        match self {
            Gate::Drawing { .. } => GateKind::Drawing,
            Gate::Choice { .. } => GateKind::Choice,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Gate::Drawing { source } | Gate::Choice { source, .. } => source,
        }
    }

    pub fn view(&self, queued: usize) -> GateView {
        match self {
            Gate::Drawing { source } => GateView {
                kind: GateKind::Drawing,
                source: source.clone(),
                prompt: "confirm the drawing to continue".to_string(),
                options: Vec::new(),
                queued,
            },
            Gate::Choice { source, prompt, options, .. } => GateView {
                kind: GateKind::Choice,
                source: source.clone(),
                prompt: prompt.clone(),
                options: options.iter().map(|o| o.label.clone()).collect(),
                queued,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Rolling,
    AwaitingColumnChoice { roll: Roll },
    /// Terminal for this game instance.
    Won,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Rolling => "rolling",
            Phase::AwaitingColumnChoice { .. } => "awaiting_column_choice",
            Phase::Won => "won",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub rounds_started: u64,
    pub rounds_banked: u64,
    pub rounds_busted: u64,
    pub rounds_abandoned: u64,
    pub rolls: u64,
    pub rolls_skipped: u64,
    pub traps_triggered: u64,
    pub traps_nullified: u64,
    pub effects_applied: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSession {
    pub player_id: PlayerId,
    pub phase: Phase,
    /// Banked progress: column -> cell index the marker stands on.
    pub permanent: BTreeMap<ColumnId, usize>,
    /// This round's progress; discarded on bust.
    pub temporary: BTreeMap<ColumnId, usize>,
    pub completed: BTreeSet<ColumnId>,
    /// Columns unusable for the rest of the round.
    pub blocked: BTreeSet<ColumnId>,
    pub inventory: Inventory,
    pub score: i64,
    pub flags: BTreeSet<Flag>,
    pub counters: BTreeMap<Counter, u32>,
    /// Front gate is the active one.
    pub gates: VecDeque<Gate>,
    /// Round end requested while a gate was open.
    pub round_end_deferred: bool,
    pub next_roll_fixed: Option<Vec<u8>>,
    /// Column most recently advanced this round.
    pub current_column: Option<ColumnId>,
    pub contract: Option<Contract>,
    pub faction: Option<Faction>,
    pub achievements: BTreeSet<Achievement>,
    pub dice_history: Vec<Vec<u8>>,
    pub stats: SessionStats,
    /// Committed transitions; bumped by the coordinator on every save.
    pub version: u64,
}

impl PlayerSession {
    pub fn new(player_id: &str) -> Self {
        Self {
            player_id: player_id.to_string(),
            phase: Phase::Idle,
            permanent: BTreeMap::new(),
            temporary: BTreeMap::new(),
            completed: BTreeSet::new(),
            blocked: BTreeSet::new(),
            inventory: Inventory::default(),
            score: 0,
            flags: BTreeSet::new(),
            counters: BTreeMap::new(),
            gates: VecDeque::new(),
            round_end_deferred: false,
            next_roll_fixed: None,
            current_column: None,
            contract: None,
            faction: None,
            achievements: BTreeSet::new(),
            dice_history: Vec::new(),
            stats: SessionStats::default(),
            version: 0,
        }
    }

    pub fn active_round(&self) -> bool {
        matches!(self.phase, Phase::Rolling | Phase::AwaitingColumnChoice { .. })
    }

    pub fn is_won(&self) -> bool {
        matches!(self.phase, Phase::Won)
    }

    pub fn open_gate(&self) -> Option<&Gate> {
        self.gates.front()
    }

    /// Where the marker for `column` stands right now: temporary first, then banked.
    pub fn position(&self, column: ColumnId) -> Option<usize> {
        self.temporary
            .get(&column)
            .or_else(|| self.permanent.get(&column))
            .copied()
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn counter(&self, counter: Counter) -> u32 {
        self.counters.get(&counter).copied().unwrap_or(0)
    }

    /// Overwrite a counter. Zero removes it and clears its linked flag.
    pub fn set_counter(&mut self, counter: Counter, value: u32) {
        if value == 0 {
            self.counters.remove(&counter);
            if let Some(flag) = counter.linked_flag() {
                self.flags.remove(&flag);
            }
        } else {
            self.counters.insert(counter, value);
        }
    }

    /// Decrement without going below zero; returns the new value.
    pub fn decrement_counter(&mut self, counter: Counter) -> u32 {
        let next = self.counter(counter).saturating_sub(1);
        self.set_counter(counter, next);
        next
    }

    /// Drop every round-scoped field. Banked state is untouched.
    pub fn clear_round(&mut self) {
        self.phase = Phase::Idle;
        self.temporary.clear();
        self.blocked.clear();
        self.round_end_deferred = false;
        self.current_column = None;
        self.dice_history.clear();
        self.set_counter(Counter::ForceRolls, 0);
    }

    /// SHA-256 over the canonical JSON form.
    pub fn hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn public_state(&self) -> PublicState {
        PublicState {
            player_id: self.player_id.clone(),
            phase: self.phase.name().to_string(),
            active_round: self.active_round(),
            won: self.is_won(),
            permanent: self.permanent.clone(),
            temporary: self.temporary.clone(),
            completed: self.completed.iter().copied().collect(),
            blocked: self.blocked.iter().copied().collect(),
            inventory: self.inventory.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            score: self.score,
            flags: self.flags.iter().copied().collect(),
            counters: self.counters.clone(),
            open_gate: self.gates.front().map(|g| g.view(self.gates.len() - 1)),
            last_roll: match &self.phase {
                Phase::AwaitingColumnChoice { roll } => Some(roll.clone()),
                _ => None,
            },
            contract: self.contract.clone(),
            faction: self.faction,
            achievements: self.achievements.iter().copied().collect(),
            stats: self.stats.clone(),
            dice_history: self.dice_history.clone(),
        }
    }
}

/// What a gate asks for, without the nested outcomes behind each option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateView {
    pub kind: GateKind,
    pub source: String,
    pub prompt: String,
    pub options: Vec<String>,
    /// Gates waiting behind this one.
    pub queued: usize,
}

/// The player-facing projection returned with every outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicState {
    pub player_id: PlayerId,
    pub phase: String,
    pub active_round: bool,
    pub won: bool,
    pub permanent: BTreeMap<ColumnId, usize>,
    pub temporary: BTreeMap<ColumnId, usize>,
    pub completed: Vec<ColumnId>,
    pub blocked: Vec<ColumnId>,
    pub inventory: BTreeMap<ItemId, u32>,
    pub score: i64,
    pub flags: Vec<Flag>,
    pub counters: BTreeMap<Counter, u32>,
    pub open_gate: Option<GateView>,
    pub last_roll: Option<Roll>,
    pub contract: Option<Contract>,
    pub faction: Option<Faction>,
    pub achievements: Vec<Achievement>,
    pub stats: SessionStats,
    pub dice_history: Vec<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_zero_state() {
        let s = PlayerSession::new("p1");
        assert_eq!(s.phase, Phase::Idle);
        assert!(!s.active_round());
        assert!(s.permanent.is_empty());
        assert!(s.open_gate().is_none());
        assert_eq!(s.inventory.total(), 0);
    }

    #[test]
    fn test_counter_zero_clears_linked_flag() {
        let mut s = PlayerSession::new("p1");
        s.flags.insert(Flag::TrapImmunity);
        s.set_counter(Counter::TrapImmunity, 2);
        assert_eq!(s.decrement_counter(Counter::TrapImmunity), 1);
        assert!(s.has_flag(Flag::TrapImmunity));
        assert_eq!(s.decrement_counter(Counter::TrapImmunity), 0);
        assert!(!s.has_flag(Flag::TrapImmunity));
        // never below zero
        assert_eq!(s.decrement_counter(Counter::TrapImmunity), 0);
        assert!(!s.counters.contains_key(&Counter::TrapImmunity));
    }

    #[test]
    fn test_inventory_multiset() {
        let mut inv = Inventory::default();
        inv.add("doll");
        inv.add("doll");
        assert_eq!(inv.count("doll"), 2);
        assert!(inv.remove("doll"));
        assert_eq!(inv.count("doll"), 1);
        assert!(inv.remove("doll"));
        assert!(!inv.remove("doll"));
        assert_eq!(inv.total(), 0);
    }

    #[test]
    fn test_hash_tracks_content() {
        let a = PlayerSession::new("p1");
        let mut b = a.clone();
        assert_eq!(a.hash(), b.hash());
        b.score = 1;
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn test_clear_round_keeps_banked_progress() {
        let mut s = PlayerSession::new("p1");
        s.phase = Phase::Rolling;
        s.permanent.insert(7, 2);
        s.temporary.insert(7, 4);
        s.blocked.insert(9);
        s.set_counter(Counter::ForceRolls, 2);
        s.set_counter(Counter::SkipRolls, 1);
        s.clear_round();
        assert_eq!(s.position(7), Some(2));
        assert!(s.blocked.is_empty());
        assert_eq!(s.counter(Counter::ForceRolls), 0);
        // pauses outlive the round
        assert_eq!(s.counter(Counter::SkipRolls), 1);
    }

    #[test]
    fn test_session_serde_round_trip() {
        let mut s = PlayerSession::new("p1");
        s.gates.push_back(Gate::Drawing { source: "T3".to_string() });
        s.contract = Some(Contract { faction: Faction::Aeonreth, counterpart: "p2".to_string() });
        let text = serde_json::to_string(&s).unwrap();
        let back: PlayerSession = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
        assert_eq!(back.public_state().open_gate.unwrap().kind, GateKind::Drawing);
    }

    #[test]
    fn test_achievements_survive_round_reset() {
        let mut s = PlayerSession::new("p1");
        s.achievements.insert(Achievement::AllOnes);
        s.achievements.insert(Achievement::FirstClear { rank: 2 });
        s.phase = Phase::Rolling;
        s.clear_round();
        assert_eq!(s.achievements.len(), 2);
        let text = serde_json::to_string(&s).unwrap();
        let back: PlayerSession = serde_json::from_str(&text).unwrap();
        assert_eq!(back.achievements, s.achievements);
        assert_eq!(Achievement::FirstClear { rank: 2 }.title(), "Silver Flash");
    }

    #[test]
    fn test_faction_parse() {
        assert_eq!("Adopter".parse::<Faction>(), Ok(Faction::Adopter));
        assert_eq!("收养人".parse::<Faction>(), Ok(Faction::Adopter));
        assert!("nobody".parse::<Faction>().is_err());
    }
}
