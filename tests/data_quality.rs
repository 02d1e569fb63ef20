//! Shipped content tables: they must load, cross-reference and resolve.

use std::path::Path;

use dicerace::board::{Board, CellKind, MAX_COLUMN, MIN_COLUMN};
use dicerace::catalog::{EffectCatalog, ResolveContext};
use dicerace::engine::session::{Contract, Faction, PlayerSession};
use dicerace::storage::{SessionStore, SqliteStore};

const BOARD_PATH: &str = "data/board.json";
const CATALOG_PATH: &str = "data/catalog.json";

fn shipped() -> (Board, EffectCatalog) {
    let board = Board::load(Path::new(BOARD_PATH)).unwrap_or_else(|e| panic!("{}: {}", BOARD_PATH, e));
    let catalog = EffectCatalog::load(Path::new(CATALOG_PATH)).unwrap_or_else(|e| panic!("{}: {}", CATALOG_PATH, e));
    (board, catalog)
}

#[test]
fn d01_board_covers_every_sum() {
    let (board, _) = shipped();
    let ids: Vec<u8> = board.columns().map(|c| c.id).collect();
    assert_eq!(ids, (MIN_COLUMN..=MAX_COLUMN).collect::<Vec<_>>());
    // shortest at the edges, tallest in the middle
    assert_eq!(board.height(MIN_COLUMN).unwrap(), 3);
    assert_eq!(board.height(MAX_COLUMN).unwrap(), 3);
    assert_eq!(board.height(10).unwrap(), 10);
    assert_eq!(board.height(11).unwrap(), 10);
}

#[test]
fn d02_every_cell_has_catalog_content() {
    let (board, catalog) = shipped();
    board.validate_content(&catalog).unwrap();
}

#[test]
fn d03_every_cell_resolves_for_a_fresh_player() {
    let (board, catalog) = shipped();
    let fresh = PlayerSession::new("p1");
    let mut contracted = PlayerSession::new("p2");
    contracted.faction = Some(Faction::Aeonreth);
    contracted.contract = Some(Contract { faction: Faction::Adopter, counterpart: "p1".to_string() });

    for col in board.columns() {
        for cell in &col.cells {
            for session in [&fresh, &contracted] {
                let res = catalog
                    .resolve(cell, &ResolveContext::of(session))
                    .unwrap_or_else(|e| panic!("{} in column {}: {}", cell, col.id, e));
                assert!(!res.name.is_empty(), "{} has no name", cell);
            }
        }
    }
}

#[test]
fn d04_wedding_ring_branches() {
    let (board, catalog) = shipped();
    let ring = board
        .columns()
        .flat_map(|c| c.cells.iter())
        .find(|c| c.kind == CellKind::Trap && c.content_id == 3)
        .copied()
        .expect("board places the wedding ring");

    let fresh = PlayerSession::new("p1");
    let res = catalog.resolve(&ring, &ResolveContext::of(&fresh)).unwrap();
    assert!(res.outcome.force_end_round);
    assert!(res.outcome.requires_drawing);

    let mut bound = PlayerSession::new("p1");
    bound.contract = Some(Contract { faction: Faction::Aeonreth, counterpart: "p2".to_string() });
    let res = catalog.resolve(&ring, &ResolveContext::of(&bound)).unwrap();
    assert_eq!(res.branch, 0);
    assert!(!res.outcome.force_end_round);
}

#[tokio::test]
async fn d05_sqlite_import_of_shipped_files() {
    let store = SqliteStore::in_memory().unwrap();
    store
        .import_content_files(Path::new(BOARD_PATH), Path::new(CATALOG_PATH))
        .unwrap();
    let (board, catalog) = shipped();
    assert_eq!(store.load_board().await.unwrap(), board);
    assert_eq!(store.load_catalog().await.unwrap(), catalog);
}

#[test]
fn d06_shipped_items_can_be_used() {
    let (_, catalog) = shipped();
    let mut holder = PlayerSession::new("p1");
    holder.faction = Some(Faction::Adopter);
    for item in ["lucky_charm", "girl_doll", "golden_die", "nitro_booster", "thousand_and_one_stories"] {
        assert!(catalog.is_usable(item), "{} has no use entry", item);
        holder.inventory.add(item);
        let res = catalog
            .resolve_use(item, &ResolveContext::of(&holder))
            .unwrap_or_else(|e| panic!("{}: {}", item, e));
        assert!(!res.outcome.is_empty(), "{} does nothing when used", item);
    }
    // adopters get the stronger doll
    let doll = catalog.resolve_use("girl_doll", &ResolveContext::of(&holder)).unwrap();
    assert_eq!(doll.outcome.trap_immunity_count, Some(2));
    assert!(!catalog.is_usable("small_trophy"));
}
