//! Effect catalog: what each board cell does when a marker lands on it.
//!
//! Each trigger (`E1`, `T3`, ...) owns an ordered list of guarded branches.
//! Resolution walks the list and the first branch whose conditions all hold
//! wins. Loading rejects entries whose last branch is guarded, so resolution
//! of a known trigger always yields exactly one branch.
//!
//! Items held in the inventory may also carry a use entry under `uses`,
//! resolved the same way when the player spends one copy.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::board::{Cell, CellKind, ColumnId};
use crate::engine::session::{Contract, Counter, Faction, Flag, Inventory, ItemId, PlayerSession};
use crate::error::ContentError;

fn one_or_many<'de, D>(de: D) -> Result<Vec<ItemId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(ItemId),
        Many(Vec<ItemId>),
    }
    Ok(match OneOrMany::deserialize(de)? {
        OneOrMany::One(item) => vec![item],
        OneOrMany::Many(items) => items,
    })
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// The named fields an effect may set. Unknown fields are a load error, so
/// every field the catalog uses is one the engine applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EffectOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    // stage 1: items and score
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub grant_item: Vec<ItemId>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub remove_item: Vec<ItemId>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub score_delta: i64,

    // stage 2: counters and flags
    #[serde(default, skip_serializing_if = "is_false")]
    pub trap_immunity_draw: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trap_immunity_count: Option<u32>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub skip_rolls: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub force_rolls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_roll_fixed: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_columns: Vec<ColumnId>,

    // stage 3: marker adjustments
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub retreat: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub retreat_all: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub clear_current_column: bool,

    // stage 4: gates, queued in this order
    #[serde(default, skip_serializing_if = "is_false")]
    pub requires_drawing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_choice: Option<ChoiceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_duel: Option<DuelSpec>,

    // stage 5: round ending
    #[serde(default, skip_serializing_if = "is_false")]
    pub force_end_round: bool,
}

impl EffectOutcome {
    /// Names of the fields this outcome sets, in application order.
    pub fn fields_present(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.grant_item.is_empty() {
            out.push("grant_item");
        }
        if !self.remove_item.is_empty() {
            out.push("remove_item");
        }
        if self.score_delta != 0 {
            out.push("score_delta");
        }
        if self.trap_immunity_draw {
            out.push("trap_immunity_draw");
        }
        if self.trap_immunity_count.is_some() {
            out.push("trap_immunity_count");
        }
        if self.skip_rolls > 0 {
            out.push("skip_rolls");
        }
        if self.force_rolls > 0 {
            out.push("force_rolls");
        }
        if self.next_roll_fixed.is_some() {
            out.push("next_roll_fixed");
        }
        if !self.block_columns.is_empty() {
            out.push("block_columns");
        }
        if self.retreat > 0 {
            out.push("retreat");
        }
        if self.retreat_all > 0 {
            out.push("retreat_all");
        }
        if self.clear_current_column {
            out.push("clear_current_column");
        }
        if self.requires_drawing {
            out.push("requires_drawing");
        }
        if self.requires_choice.is_some() {
            out.push("requires_choice");
        }
        if self.requires_duel.is_some() {
            out.push("requires_duel");
        }
        if self.force_end_round {
            out.push("force_end_round");
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.fields_present().is_empty()
    }

    fn validate(&self, owner: &str) -> Result<(), ContentError> {
        if self.trap_immunity_draw && self.trap_immunity_count == Some(0) {
            return Err(ContentError::Malformed(format!(
                "{}: trap_immunity_draw contradicts trap_immunity_count 0",
                owner
            )));
        }
        if let Some(faces) = &self.next_roll_fixed {
            if faces.is_empty() || faces.contains(&0) {
                return Err(ContentError::Malformed(format!("{}: next_roll_fixed needs non-zero faces", owner)));
            }
        }
        if let Some(choice) = &self.requires_choice {
            if choice.options.is_empty() {
                return Err(ContentError::Malformed(format!("{}: requires_choice has no options", owner)));
            }
            let labels: BTreeSet<&str> = choice.options.iter().map(|o| o.label.as_str()).collect();
            if labels.len() != choice.options.len() {
                return Err(ContentError::Malformed(format!("{}: duplicate choice labels", owner)));
            }
            for opt in &choice.options {
                opt.outcome.validate(owner)?;
            }
        }
        if let Some(duel) = &self.requires_duel {
            duel.win.validate(owner)?;
            duel.lose.validate(owner)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChoiceSpec {
    pub prompt: String,
    pub options: Vec<ChoiceOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChoiceOption {
    pub label: String,
    #[serde(default)]
    pub outcome: EffectOutcome,
}

/// A duel is settled outside the engine; the player reports `win` or `lose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DuelSpec {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub win: Box<EffectOutcome>,
    #[serde(default)]
    pub lose: Box<EffectOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    HasContract,
    NoContract,
    ContractFaction(Faction),
    Faction(Faction),
    NoFaction,
    HasItem(ItemId),
    LacksItem(ItemId),
    Flag(Flag),
    CounterAtLeast { counter: Counter, value: u32 },
}

impl Condition {
    pub fn holds(&self, ctx: &ResolveContext<'_>) -> bool {
        match self {
            Condition::HasContract => ctx.contract.is_some(),
            Condition::NoContract => ctx.contract.is_none(),
            Condition::ContractFaction(f) => ctx.contract.map(|c| c.faction == *f).unwrap_or(false),
            Condition::Faction(f) => ctx.faction == Some(*f),
            Condition::NoFaction => ctx.faction.is_none(),
            Condition::HasItem(item) => ctx.inventory.count(item) > 0,
            Condition::LacksItem(item) => ctx.inventory.count(item) == 0,
            Condition::Flag(flag) => ctx.flags.contains(flag),
            Condition::CounterAtLeast { counter, value } => {
                ctx.counters.get(counter).copied().unwrap_or(0) >= *value
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Branch {
    #[serde(default)]
    pub when: Vec<Condition>,
    #[serde(default)]
    pub outcome: EffectOutcome,
}

impl Branch {
    pub fn matches(&self, ctx: &ResolveContext<'_>) -> bool {
        self.when.iter().all(|c| c.holds(ctx))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EffectSpec {
    /// Cell code, e.g. `T3`.
    pub trigger: String,
    #[serde(default)]
    pub name: String,
    pub branches: Vec<Branch>,
}

/// What spending one copy of an inventory item does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemUseSpec {
    pub item: ItemId,
    #[serde(default)]
    pub name: String,
    pub branches: Vec<Branch>,
}

fn check_branches(owner: &str, branches: &[Branch]) -> Result<(), ContentError> {
    match branches.last() {
        Some(last) if last.when.is_empty() => {}
        _ => return Err(ContentError::NoFallbackBranch(owner.to_string())),
    }
    for branch in branches {
        branch.outcome.validate(owner)?;
    }
    Ok(())
}

fn first_match<'a>(
    owner: &str,
    name: &'a str,
    branches: &'a [Branch],
    ctx: &ResolveContext<'_>,
) -> Result<Resolution<'a>, ContentError> {
    branches
        .iter()
        .enumerate()
        .find(|(_, b)| b.matches(ctx))
        .map(|(i, b)| Resolution { name, branch: i, outcome: &b.outcome })
        .ok_or_else(|| ContentError::NoFallbackBranch(owner.to_string()))
}

/// The slice of session state that branch conditions may look at.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub flags: &'a BTreeSet<Flag>,
    pub counters: &'a BTreeMap<Counter, u32>,
    pub contract: Option<&'a Contract>,
    pub faction: Option<Faction>,
    pub inventory: &'a Inventory,
}

impl<'a> ResolveContext<'a> {
    pub fn of(session: &'a PlayerSession) -> Self {
        Self {
            flags: &session.flags,
            counters: &session.counters,
            contract: session.contract.as_ref(),
            faction: session.faction,
            inventory: &session.inventory,
        }
    }
}

/// The branch chosen for one trigger evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub name: &'a str,
    pub branch: usize,
    pub outcome: &'a EffectOutcome,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    entries: Vec<EffectSpec>,
    #[serde(default)]
    uses: Vec<ItemUseSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectCatalog {
    entries: BTreeMap<(CellKind, u32), EffectSpec>,
    uses: BTreeMap<ItemId, ItemUseSpec>,
}

impl EffectCatalog {
    pub fn new(specs: Vec<EffectSpec>, item_uses: Vec<ItemUseSpec>) -> Result<Self, ContentError> {
        let mut entries = BTreeMap::new();
        for spec in specs {
            let cell = Cell::parse(&spec.trigger)?;
            check_branches(&spec.trigger, &spec.branches)?;
            if entries.insert((cell.kind, cell.content_id), spec).is_some() {
                return Err(ContentError::Malformed(format!("duplicate trigger {}", cell)));
            }
        }
        let mut uses = BTreeMap::new();
        for spec in item_uses {
            if spec.item.trim().is_empty() {
                return Err(ContentError::Malformed("item use without an item".to_string()));
            }
            check_branches(&spec.item, &spec.branches)?;
            if let Some(dup) = uses.insert(spec.item.clone(), spec) {
                return Err(ContentError::Malformed(format!("duplicate item use {}", dup.item)));
            }
        }
        Ok(Self { entries, uses })
    }

    pub fn from_json(text: &str) -> Result<Self, ContentError> {
        let raw: RawCatalog =
            serde_json::from_str(text).map_err(|e| ContentError::Malformed(format!("catalog: {}", e)))?;
        Self::new(raw.entries, raw.uses)
    }

    pub fn load(path: &Path) -> Result<Self, ContentError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ContentError::Malformed(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn contains(&self, cell: &Cell) -> bool {
        self.entries.contains_key(&(cell.kind, cell.content_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick the first matching branch for `cell`. Pure: same inputs, same branch.
    pub fn resolve<'a>(&'a self, cell: &Cell, ctx: &ResolveContext<'_>) -> Result<Resolution<'a>, ContentError> {
        let spec = self
            .entries
            .get(&(cell.kind, cell.content_id))
            .ok_or(ContentError::UnknownContent {
                kind: cell.kind.code(),
                id: cell.content_id,
            })?;
        first_match(&spec.trigger, &spec.name, &spec.branches, ctx)
    }

    pub fn is_usable(&self, item: &str) -> bool {
        self.uses.contains_key(item)
    }

    /// Pick the first matching branch of `item`'s use entry.
    pub fn resolve_use<'a>(&'a self, item: &str, ctx: &ResolveContext<'_>) -> Result<Resolution<'a>, ContentError> {
        let spec = self
            .uses
            .get(item)
            .ok_or_else(|| ContentError::Malformed(format!("{} has no use entry", item)))?;
        first_match(&spec.item, &spec.name, &spec.branches, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::PlayerSession;

    const CATALOG: &str = r#"{"entries": [
        {"trigger": "T3", "name": "Wedding Ring", "branches": [
            {"when": [{"contract_faction": "adopter"}], "outcome": {"score_delta": 5, "message": "the contract protects you"}},
            {"when": ["has_contract"], "outcome": {"grant_item": "ring"}},
            {"outcome": {"force_end_round": true, "requires_drawing": true}}
        ]},
        {"trigger": "I1", "name": "Doll", "branches": [
            {"outcome": {"grant_item": ["doll", "doll"]}}
        ]}
    ]}"#;

    fn trap3() -> Cell {
        Cell::parse("T3").unwrap()
    }

    #[test]
    fn test_fallback_branch_without_contract() {
        let catalog = EffectCatalog::from_json(CATALOG).unwrap();
        let session = PlayerSession::new("p1");
        let res = catalog.resolve(&trap3(), &ResolveContext::of(&session)).unwrap();
        assert_eq!(res.branch, 2);
        assert!(res.outcome.force_end_round);
        assert!(res.outcome.requires_drawing);
        assert_eq!(res.name, "Wedding Ring");
    }

    #[test]
    fn test_first_matching_branch_wins() {
        let catalog = EffectCatalog::from_json(CATALOG).unwrap();
        let mut session = PlayerSession::new("p1");
        session.contract = Some(Contract { faction: Faction::Adopter, counterpart: "p2".to_string() });
        let res = catalog.resolve(&trap3(), &ResolveContext::of(&session)).unwrap();
        // both guarded branches hold; the earlier one is chosen
        assert_eq!(res.branch, 0);
        assert_eq!(res.outcome.score_delta, 5);

        session.contract = Some(Contract { faction: Faction::Aeonreth, counterpart: "p2".to_string() });
        let res = catalog.resolve(&trap3(), &ResolveContext::of(&session)).unwrap();
        assert_eq!(res.branch, 1);
        assert_eq!(res.outcome.grant_item, vec!["ring".to_string()]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let catalog = EffectCatalog::from_json(CATALOG).unwrap();
        let session = PlayerSession::new("p1");
        let ctx = ResolveContext::of(&session);
        let a = catalog.resolve(&trap3(), &ctx).unwrap();
        let b = catalog.resolve(&trap3(), &ctx).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_content() {
        let catalog = EffectCatalog::from_json(CATALOG).unwrap();
        let session = PlayerSession::new("p1");
        let err = catalog
            .resolve(&Cell::parse("E99").unwrap(), &ResolveContext::of(&session))
            .unwrap_err();
        assert_eq!(err, ContentError::UnknownContent { kind: 'E', id: 99 });
    }

    #[test]
    fn test_grant_item_accepts_list() {
        let catalog = EffectCatalog::from_json(CATALOG).unwrap();
        let session = PlayerSession::new("p1");
        let res = catalog
            .resolve(&Cell::parse("I1").unwrap(), &ResolveContext::of(&session))
            .unwrap();
        assert_eq!(res.outcome.grant_item.len(), 2);
    }

    #[test]
    fn test_guarded_last_branch_rejected() {
        let text = r#"{"entries": [
            {"trigger": "T1", "branches": [{"when": ["has_contract"], "outcome": {}}]}
        ]}"#;
        assert_eq!(
            EffectCatalog::from_json(text),
            Err(ContentError::NoFallbackBranch("T1".to_string()))
        );
    }

    #[test]
    fn test_unknown_outcome_field_rejected() {
        let text = r#"{"entries": [
            {"trigger": "T1", "branches": [{"outcome": {"teleport_somewhere": true}}]}
        ]}"#;
        assert!(matches!(EffectCatalog::from_json(text), Err(ContentError::Malformed(_))));
    }

    #[test]
    fn test_choice_needs_options() {
        let text = r#"{"entries": [
            {"trigger": "E1", "branches": [{"outcome": {"requires_choice": {"prompt": "?", "options": []}}}]}
        ]}"#;
        assert!(EffectCatalog::from_json(text).is_err());
    }

    #[test]
    fn test_item_use_entries() {
        let text = r#"{"entries": [], "uses": [
            {"item": "lucky_charm", "name": "Lucky Charm", "branches": [
                {"when": ["has_contract"], "outcome": {"score_delta": 10}},
                {"outcome": {"trap_immunity_draw": true}}
            ]}
        ]}"#;
        let catalog = EffectCatalog::from_json(text).unwrap();
        assert!(catalog.is_usable("lucky_charm"));
        assert!(!catalog.is_usable("doll"));
        let session = PlayerSession::new("p1");
        let res = catalog.resolve_use("lucky_charm", &ResolveContext::of(&session)).unwrap();
        assert_eq!(res.branch, 1);
        assert!(res.outcome.trap_immunity_draw);
        assert!(catalog.resolve_use("doll", &ResolveContext::of(&session)).is_err());
    }

    #[test]
    fn test_item_use_needs_fallback() {
        let text = r#"{"entries": [], "uses": [
            {"item": "map", "branches": [{"when": ["has_contract"], "outcome": {}}]}
        ]}"#;
        assert_eq!(
            EffectCatalog::from_json(text),
            Err(ContentError::NoFallbackBranch("map".to_string()))
        );
    }

    #[test]
    fn test_immunity_flag_with_zero_count_rejected() {
        let text = r#"{"entries": [
            {"trigger": "I2", "branches": [{"outcome": {"trap_immunity_draw": true, "trap_immunity_count": 0}}]}
        ]}"#;
        assert!(matches!(EffectCatalog::from_json(text), Err(ContentError::Malformed(_))));
    }

    #[test]
    fn test_fields_present_in_application_order() {
        let outcome = EffectOutcome {
            grant_item: vec!["x".to_string()],
            requires_drawing: true,
            force_end_round: true,
            ..Default::default()
        };
        assert_eq!(
            outcome.fields_present(),
            vec!["grant_item", "requires_drawing", "force_end_round"]
        );
    }
}
