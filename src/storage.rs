//! Persistence adapter.
//!
//! The engine only sees `SessionStore`. `SqliteStore` keeps one row per player
//! with a column per field; composite fields are JSON-encoded so the schema can
//! grow without migrations. `MemoryStore` backs tests and can inject faults.
//!
//! Saves are compare-and-set on `version`: a session computed from stored
//! version `n` only lands if the row still holds `n`. A SQLite write whose
//! caller stopped waiting rolls back instead of committing late.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::board::Board;
use crate::catalog::EffectCatalog;
use crate::engine::session::{Contract, Faction, PlayerSession};
use crate::error::{GameError, PersistenceError};
use crate::logging::ts_now;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `NotFound` when the player has never been saved.
    async fn load(&self, player_id: &str) -> Result<PlayerSession, PersistenceError>;
    /// Replace the stored session in one atomic write. Fails with `Conflict`
    /// unless the stored row is at `session.version - 1` or absent.
    async fn save(&self, session: &PlayerSession) -> Result<(), PersistenceError>;
    async fn list_players(&self) -> Result<Vec<String>, PersistenceError>;
    /// Players with a round in progress.
    async fn list_active(&self) -> Result<Vec<String>, PersistenceError>;
    /// Players who have finished the board.
    async fn count_winners(&self) -> Result<usize, PersistenceError>;
    async fn load_board(&self) -> Result<Board, GameError>;
    async fn load_catalog(&self) -> Result<EffectCatalog, GameError>;
}

fn encode<T: Serialize>(field: &str, value: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|e| PersistenceError::Backend(format!("encode {}: {}", field, e)))
}

fn decode<T: DeserializeOwned>(field: &str, text: &str) -> Result<T, PersistenceError> {
    serde_json::from_str(text).map_err(|e| PersistenceError::Corrupt(format!("{}: {}", field, e)))
}

/// How long a writer waits on another connection's lock before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const BOARD_KEY: &str = "board";
const CATALOG_KEY: &str = "catalog";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS game_state (
                player_id TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                active_round INTEGER NOT NULL,
                won INTEGER NOT NULL,
                score INTEGER NOT NULL,
                permanent TEXT NOT NULL,
                temporary TEXT NOT NULL,
                completed TEXT NOT NULL,
                blocked TEXT NOT NULL,
                inventory TEXT NOT NULL,
                flags TEXT NOT NULL,
                counters TEXT NOT NULL,
                gates TEXT NOT NULL,
                round_end_deferred INTEGER NOT NULL,
                next_roll_fixed TEXT,
                current_column INTEGER,
                faction TEXT,
                achievements TEXT NOT NULL DEFAULT '[]',
                dice_history TEXT NOT NULL,
                stats TEXT NOT NULL,
                version INTEGER NOT NULL,
                state_hash TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS player_contracts (
                player_id TEXT PRIMARY KEY,
                counterpart_id TEXT NOT NULL,
                faction TEXT NOT NULL,
                formed_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS content_snapshots (
                name TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                loaded_at TEXT NOT NULL
            );
            COMMIT;",
        )?;
        // files created before achievements were tracked
        let has_achievements = conn
            .prepare("SELECT 1 FROM pragma_table_info('game_state') WHERE name = 'achievements'")?
            .exists([])?;
        if !has_achievements {
            conn.execute_batch("ALTER TABLE game_state ADD COLUMN achievements TEXT NOT NULL DEFAULT '[]'")?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PersistenceError> {
        self.conn
            .lock()
            .map_err(|_| PersistenceError::Backend("connection mutex poisoned".to_string()))
    }

    /// Store the board and catalog tables the server was started with.
    /// Both are validated before anything is written.
    pub fn import_content(&self, board_json: &str, catalog_json: &str) -> Result<(), GameError> {
        let board = Board::from_json(board_json)?;
        let catalog = EffectCatalog::from_json(catalog_json)?;
        board.validate_content(&catalog)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(PersistenceError::from)?;
        let now = ts_now();
        for (name, body) in [(BOARD_KEY, board_json), (CATALOG_KEY, catalog_json)] {
            tx.execute(
                "INSERT INTO content_snapshots (name, body, loaded_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET body = excluded.body, loaded_at = excluded.loaded_at",
                params![name, body, now],
            )
            .map_err(PersistenceError::from)?;
        }
        tx.commit().map_err(PersistenceError::from)?;
        Ok(())
    }

    pub fn import_content_files(&self, board_path: &Path, catalog_path: &Path) -> Result<(), GameError> {
        let read = |p: &Path| {
            std::fs::read_to_string(p)
                .map_err(|e| PersistenceError::NotFound(format!("{}: {}", p.display(), e)))
        };
        self.import_content(&read(board_path)?, &read(catalog_path)?)
    }

    async fn content(&self, name: &'static str) -> Result<String, PersistenceError> {
        let conn = self.conn.clone();
        run_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| PersistenceError::Backend("connection mutex poisoned".to_string()))?;
            let body: Option<String> = conn
                .query_row("SELECT body FROM content_snapshots WHERE name = ?1", params![name], |r| r.get(0))
                .optional()?;
            body.ok_or_else(|| PersistenceError::NotFound(format!("content snapshot {}", name)))
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, PersistenceError>
where
    F: FnOnce() -> Result<T, PersistenceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PersistenceError::Backend(format!("blocking task failed: {}", e)))?
}

const SESSION_COLUMNS: &str = "s.player_id, s.phase, s.score, s.permanent, s.temporary, s.completed, s.blocked,
     s.inventory, s.flags, s.counters, s.gates, s.round_end_deferred, s.next_roll_fixed, s.current_column,
     s.faction, s.dice_history, s.stats, s.version, c.counterpart_id, c.faction, s.achievements";

fn row_to_session(row: &Row<'_>) -> Result<PlayerSession, PersistenceError> {
    let text = |i: usize| -> Result<String, PersistenceError> { Ok(row.get::<_, String>(i)?) };
    let faction: Option<String> = row.get(14)?;
    let counterpart: Option<String> = row.get(18)?;
    let contract_faction: Option<String> = row.get(19)?;
    let parse_faction = |s: String| s.parse::<Faction>().map_err(PersistenceError::Corrupt);

    let next_roll_fixed: Option<String> = row.get(12)?;
    Ok(PlayerSession {
        player_id: text(0)?,
        phase: decode("phase", &text(1)?)?,
        score: row.get(2)?,
        permanent: decode("permanent", &text(3)?)?,
        temporary: decode("temporary", &text(4)?)?,
        completed: decode("completed", &text(5)?)?,
        blocked: decode("blocked", &text(6)?)?,
        inventory: decode("inventory", &text(7)?)?,
        flags: decode("flags", &text(8)?)?,
        counters: decode("counters", &text(9)?)?,
        gates: decode("gates", &text(10)?)?,
        round_end_deferred: row.get::<_, i64>(11)? != 0,
        next_roll_fixed: next_roll_fixed.map(|t| decode("next_roll_fixed", &t)).transpose()?,
        current_column: row.get(13)?,
        faction: faction.map(parse_faction).transpose()?,
        achievements: decode("achievements", &text(20)?)?,
        dice_history: decode("dice_history", &text(15)?)?,
        stats: decode("stats", &text(16)?)?,
        version: row.get::<_, i64>(17)? as u64,
        contract: match (counterpart, contract_faction) {
            (Some(counterpart), Some(f)) => Some(Contract { faction: parse_faction(f)?, counterpart }),
            _ => None,
        },
    })
}

/// Raised when the async caller gives up on a write it started.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn check_abandoned(abandoned: &AtomicBool, player_id: &str) -> Result<(), PersistenceError> {
    if abandoned.load(Ordering::SeqCst) {
        return Err(PersistenceError::Backend(format!("save for {} abandoned by its caller", player_id)));
    }
    Ok(())
}

fn write_session(conn: &mut Connection, session: &PlayerSession, abandoned: &AtomicBool) -> Result<(), PersistenceError> {
    check_abandoned(abandoned, &session.player_id)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = ts_now();
    let changed = tx.execute(
        "INSERT INTO game_state (player_id, phase, active_round, won, score, permanent, temporary, completed,
             blocked, inventory, flags, counters, gates, round_end_deferred, next_roll_fixed, current_column,
             faction, dice_history, stats, version, state_hash, updated_at, achievements)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
         ON CONFLICT(player_id) DO UPDATE SET
             phase = excluded.phase, active_round = excluded.active_round, won = excluded.won,
             score = excluded.score, permanent = excluded.permanent, temporary = excluded.temporary,
             completed = excluded.completed, blocked = excluded.blocked, inventory = excluded.inventory,
             flags = excluded.flags, counters = excluded.counters, gates = excluded.gates,
             round_end_deferred = excluded.round_end_deferred, next_roll_fixed = excluded.next_roll_fixed,
             current_column = excluded.current_column, faction = excluded.faction,
             dice_history = excluded.dice_history, stats = excluded.stats, version = excluded.version,
             state_hash = excluded.state_hash, updated_at = excluded.updated_at,
             achievements = excluded.achievements
         WHERE game_state.version = excluded.version - 1",
        params![
            session.player_id,
            encode("phase", &session.phase)?,
            session.active_round() as i64,
            session.is_won() as i64,
            session.score,
            encode("permanent", &session.permanent)?,
            encode("temporary", &session.temporary)?,
            encode("completed", &session.completed)?,
            encode("blocked", &session.blocked)?,
            encode("inventory", &session.inventory)?,
            encode("flags", &session.flags)?,
            encode("counters", &session.counters)?,
            encode("gates", &session.gates)?,
            session.round_end_deferred as i64,
            session.next_roll_fixed.as_ref().map(|d| encode("next_roll_fixed", d)).transpose()?,
            session.current_column,
            session.faction.map(|f| f.as_str()),
            encode("dice_history", &session.dice_history)?,
            encode("stats", &session.stats)?,
            session.version as i64,
            session.hash(),
            now,
            encode("achievements", &session.achievements)?,
        ],
    )?;
    if changed == 0 {
        let found: i64 = tx.query_row(
            "SELECT version FROM game_state WHERE player_id = ?1",
            params![session.player_id],
            |r| r.get(0),
        )?;
        return Err(PersistenceError::Conflict {
            player_id: session.player_id.clone(),
            expected: session.version.saturating_sub(1),
            found: found as u64,
        });
    }
    match &session.contract {
        Some(contract) => {
            tx.execute(
                "INSERT INTO player_contracts (player_id, counterpart_id, faction, formed_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(player_id) DO UPDATE SET counterpart_id = excluded.counterpart_id,
                     faction = excluded.faction,
                     formed_at = CASE WHEN player_contracts.counterpart_id = excluded.counterpart_id
                                 THEN player_contracts.formed_at ELSE excluded.formed_at END",
                params![session.player_id, contract.counterpart, contract.faction.as_str(), now],
            )?;
        }
        None => {
            tx.execute("DELETE FROM player_contracts WHERE player_id = ?1", params![session.player_id])?;
        }
    }
    // dropping `tx` here rolls the whole write back
    check_abandoned(abandoned, &session.player_id)?;
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load(&self, player_id: &str) -> Result<PlayerSession, PersistenceError> {
        let conn = self.conn.clone();
        let id = player_id.to_string();
        run_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| PersistenceError::Backend("connection mutex poisoned".to_string()))?;
            let sql = format!(
                "SELECT {} FROM game_state s LEFT JOIN player_contracts c ON c.player_id = s.player_id
                 WHERE s.player_id = ?1",
                SESSION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![id])?;
            let found = match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(PersistenceError::NotFound(format!("player {}", id))),
            };
            found
        })
        .await
    }

    async fn save(&self, session: &PlayerSession) -> Result<(), PersistenceError> {
        let conn = self.conn.clone();
        let session = session.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _abandon = AbandonOnDrop(abandoned.clone());
        run_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| PersistenceError::Backend("connection mutex poisoned".to_string()))?;
            write_session(&mut conn, &session, &abandoned)
        })
        .await
    }

    async fn list_players(&self) -> Result<Vec<String>, PersistenceError> {
        let conn = self.conn.clone();
        run_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| PersistenceError::Backend("connection mutex poisoned".to_string()))?;
            let mut stmt = conn.prepare("SELECT player_id FROM game_state ORDER BY player_id")?;
            let ids = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn list_active(&self) -> Result<Vec<String>, PersistenceError> {
        let conn = self.conn.clone();
        run_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| PersistenceError::Backend("connection mutex poisoned".to_string()))?;
            let mut stmt =
                conn.prepare("SELECT player_id FROM game_state WHERE active_round = 1 ORDER BY player_id")?;
            let ids = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn count_winners(&self) -> Result<usize, PersistenceError> {
        let conn = self.conn.clone();
        run_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| PersistenceError::Backend("connection mutex poisoned".to_string()))?;
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM game_state WHERE won = 1", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    async fn load_board(&self) -> Result<Board, GameError> {
        let body = self.content(BOARD_KEY).await?;
        Ok(Board::from_json(&body)?)
    }

    async fn load_catalog(&self) -> Result<EffectCatalog, GameError> {
        let body = self.content(CATALOG_KEY).await?;
        Ok(EffectCatalog::from_json(&body)?)
    }
}

/// Deterministic faults for exercising the coordinator's timeout and retry paths.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Fail this many upcoming saves with a backend error.
    pub fail_saves: u32,
    /// Fail this many upcoming loads with a backend error.
    pub fail_loads: u32,
    /// Sleep this long inside every save, before the write.
    pub save_delay: Option<Duration>,
    /// Sleep this long after a save has landed, before acknowledging it.
    pub ack_delay: Option<Duration>,
    /// Sleep this long inside every load.
    pub load_delay: Option<Duration>,
}

/// In-process store holding sessions as plain values.
pub struct MemoryStore {
    sessions: tokio::sync::Mutex<HashMap<String, PlayerSession>>,
    faults: Mutex<FaultPlan>,
    board: Board,
    catalog: EffectCatalog,
}

impl MemoryStore {
    pub fn new(board: Board, catalog: EffectCatalog) -> Self {
        Self {
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            faults: Mutex::new(FaultPlan::default()),
            board,
            catalog,
        }
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        if let Ok(mut f) = self.faults.lock() {
            *f = plan;
        }
    }

    fn ack_delay(&self) -> Option<Duration> {
        self.faults.lock().ok().and_then(|f| f.ack_delay)
    }

    /// Pop one injected failure for `op`, and report the delay to apply.
    fn take_fault(&self, save: bool) -> (bool, Option<Duration>) {
        let Ok(mut f) = self.faults.lock() else {
            return (false, None);
        };
        let counter = if save { &mut f.fail_saves } else { &mut f.fail_loads };
        let fail = *counter > 0;
        if fail {
            *counter -= 1;
        }
        (fail, if save { f.save_delay } else { f.load_delay })
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, player_id: &str) -> Result<PlayerSession, PersistenceError> {
        let (fail, delay) = self.take_fault(false);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if fail {
            return Err(PersistenceError::Backend("injected load failure".to_string()));
        }
        self.sessions
            .lock()
            .await
            .get(player_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("player {}", player_id)))
    }

    async fn save(&self, session: &PlayerSession) -> Result<(), PersistenceError> {
        let (fail, delay) = self.take_fault(true);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if fail {
            return Err(PersistenceError::Backend("injected save failure".to_string()));
        }
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(stored) = sessions.get(&session.player_id) {
                if stored.version + 1 != session.version {
                    return Err(PersistenceError::Conflict {
                        player_id: session.player_id.clone(),
                        expected: session.version.saturating_sub(1),
                        found: stored.version,
                    });
                }
            }
            sessions.insert(session.player_id.clone(), session.clone());
        }
        if let Some(d) = self.ack_delay() {
            tokio::time::sleep(d).await;
        }
        Ok(())
    }

    async fn list_players(&self) -> Result<Vec<String>, PersistenceError> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_active(&self) -> Result<Vec<String>, PersistenceError> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|s| s.active_round())
            .map(|s| s.player_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn count_winners(&self) -> Result<usize, PersistenceError> {
        Ok(self.sessions.lock().await.values().filter(|s| s.is_won()).count())
    }

    async fn load_board(&self) -> Result<Board, GameError> {
        Ok(self.board.clone())
    }

    async fn load_catalog(&self) -> Result<EffectCatalog, GameError> {
        Ok(self.catalog.clone())
    }
}
