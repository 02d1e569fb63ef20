//! Session coordinator: the only entry point that mutates game state.
//!
//! Per command: validate -> take the player's lock -> load -> reduce a copy ->
//! save the copy -> journal -> report. Commands for one player run strictly one
//! at a time; different players only share the read-only board and catalog.
//! A command that fails anywhere before the save commits leaves the stored
//! session exactly as it was. When a save times out or loses a version race,
//! the stored row is read back: the command is reported as applied only if
//! that row is exactly the state this command produced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::board::{Board, BoardSnapshot};
use crate::catalog::EffectCatalog;
use crate::config::RulesConfig;
use crate::engine::command::{Action, Command, Outcome, Status};
use crate::engine::dice::{DiceSource, SharedDice};
use crate::engine::reducer::{award_first_clear, reduce, EngineEvent, Tables, Transition};
use crate::engine::session::{PlayerSession, PublicState};
use crate::error::{GameError, PersistenceError};
use crate::journal::{Journal, JournalEntry};
use crate::logging::{self, log, obj, v_str, Domain, Level};
use crate::reliability::retry::{persist_call, RetryConfig};
use crate::storage::SessionStore;

type PlayerLock = Arc<tokio::sync::Mutex<()>>;

pub struct Coordinator {
    store: Arc<dyn SessionStore>,
    board: Arc<Board>,
    catalog: Arc<EffectCatalog>,
    rules: RulesConfig,
    retry: RetryConfig,
    dice: SharedDice,
    locks: tokio::sync::Mutex<HashMap<String, PlayerLock>>,
    /// Held from counting earlier finishers until a win is saved.
    podium: tokio::sync::Mutex<()>,
    journal: Option<Mutex<Journal>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        board: Board,
        catalog: EffectCatalog,
        rules: RulesConfig,
        retry: RetryConfig,
        dice: Box<dyn DiceSource>,
    ) -> Result<Self, GameError> {
        rules.validate().map_err(GameError::Validation)?;
        board.validate_content(&catalog)?;
        Ok(Self {
            store,
            board: Arc::new(board),
            catalog: Arc::new(catalog),
            rules,
            retry,
            dice: SharedDice::new(dice),
            locks: tokio::sync::Mutex::new(HashMap::new()),
            podium: tokio::sync::Mutex::new(()),
            journal: None,
        })
    }

    /// Build from the tables the store holds.
    pub async fn from_store(
        store: Arc<dyn SessionStore>,
        rules: RulesConfig,
        retry: RetryConfig,
        dice: Box<dyn DiceSource>,
    ) -> Result<Self, GameError> {
        let board = store.load_board().await?;
        let catalog = store.load_catalog().await?;
        log(
            Level::Info,
            Domain::System,
            "content_loaded",
            obj(&[
                ("columns", serde_json::json!(board.columns().count())),
                ("catalog_entries", serde_json::json!(catalog.len())),
            ]),
        );
        Self::new(store, board, catalog, rules, retry, dice)
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    async fn player_lock(&self, player_id: &str) -> PlayerLock {
        let mut locks = self.locks.lock().await;
        locks
            .entry(player_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop our handle and forget the lock once nobody else holds or awaits it.
    async fn release_lock(&self, player_id: &str, lock: PlayerLock) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks.get(player_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(player_id);
        }
    }

    async fn load_or_new(&self, player_id: &str) -> Result<PlayerSession, PersistenceError> {
        let store = self.store.clone();
        let id = player_id.to_string();
        let found = persist_call(&self.retry, "load", player_id, || {
            let store = store.clone();
            let id = id.clone();
            async move {
                match store.load(&id).await {
                    Err(PersistenceError::NotFound(_)) => Ok(None),
                    other => other.map(Some),
                }
            }
        })
        .await?;
        Ok(found.unwrap_or_else(|| PlayerSession::new(player_id)))
    }

    async fn save(&self, session: &PlayerSession) -> Result<(), PersistenceError> {
        let store = self.store.clone();
        persist_call(&self.retry, "save", &session.player_id, || {
            let store = store.clone();
            let session = session.clone();
            async move { store.save(&session).await }
        })
        .await
    }

    /// Save `next`; after an ambiguous failure, read back and accept the row
    /// only if it is exactly `next`.
    async fn commit(&self, next: &PlayerSession) -> Result<(), PersistenceError> {
        let err = match self.save(next).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_ambiguous() => err,
            Err(err) => return Err(err),
        };
        let store = self.store.clone();
        let id = next.player_id.clone();
        let stored = persist_call(&self.retry, "confirm", &next.player_id, || {
            let store = store.clone();
            let id = id.clone();
            async move { store.load(&id).await }
        })
        .await;
        match stored {
            Ok(stored) if stored.version == next.version && stored.hash() == next.hash() => {
                log(
                    Level::Warn,
                    Domain::Store,
                    "save_confirmed_after_error",
                    obj(&[
                        ("player_id", v_str(&next.player_id)),
                        ("version", serde_json::json!(next.version)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                Ok(())
            }
            _ => Err(err),
        }
    }

    async fn count_winners(&self) -> Result<usize, PersistenceError> {
        let store = self.store.clone();
        persist_call(&self.retry, "count_winners", "*", || {
            let store = store.clone();
            async move { store.count_winners().await }
        })
        .await
    }

    /// Settle a fresh win's finishing place; the returned guard must be held
    /// until the session is saved.
    async fn place_finisher(
        &self,
        next: &mut PlayerSession,
        transition: &mut Transition,
    ) -> Result<Option<tokio::sync::MutexGuard<'_, ()>>, PersistenceError> {
        if !transition.events.iter().any(|e| matches!(e, EngineEvent::Won { .. })) {
            return Ok(None);
        }
        let guard = self.podium.lock().await;
        let earlier = self.count_winners().await?;
        for event in award_first_clear(next, earlier) {
            transition.detail.push_str("; ");
            transition.detail.push_str(&event.summary());
            transition.events.push(event);
        }
        Ok(Some(guard))
    }

    /// Process one command to completion.
    pub async fn submit(&self, command: Command) -> Outcome {
        let started = Instant::now();
        let kind = command.kind.as_str();
        let player_id = command.player_id.clone();

        let (outcome, state_hash) = self.run(&command).await;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        logging::log_command(
            &player_id,
            kind,
            &format!("{:?}", outcome.status),
            outcome.error_code.as_deref(),
            state_hash.as_deref(),
            elapsed,
        );
        outcome
    }

    /// The outcome plus the committed state hash, if anything was committed.
    async fn run(&self, command: &Command) -> (Outcome, Option<String>) {
        let action = match command.parse_action() {
            Ok(a) => a,
            Err(err) => return (Outcome::error(&err, None), None),
        };
        let player_id = command.player_id.as_str();

        let lock = self.player_lock(player_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.run_locked(command, &action).await
        };
        self.release_lock(player_id, lock).await;
        result
    }

    async fn run_locked(&self, command: &Command, action: &Action) -> (Outcome, Option<String>) {
        let player_id = command.player_id.as_str();
        let current = match self.load_or_new(player_id).await {
            Ok(s) => s,
            Err(err) => return (Outcome::error(&GameError::from(err), None), None),
        };

        let mut next = current.clone();
        let result = {
            let tables = Tables {
                board: &self.board,
                catalog: &self.catalog,
                rules: &self.rules,
            };
            let mut dice = self.dice.clone();
            reduce(&mut next, action, &tables, &mut dice)
        };
        let mut transition = match result {
            Ok(t) => t,
            Err(err) => {
                if let GameError::Content(_) = err {
                    log(
                        Level::Error,
                        Domain::System,
                        "content_defect",
                        obj(&[("player_id", v_str(player_id)), ("error", v_str(&err.to_string()))]),
                    );
                }
                return (Outcome::error(&err, Some(current.public_state())), None);
            }
        };

        if command.kind.is_read_only() {
            let outcome = Outcome {
                status: transition.status,
                detail: transition.detail,
                error_code: None,
                new_public_state: Some(current.public_state()),
            };
            return (outcome, None);
        }

        let podium = match self.place_finisher(&mut next, &mut transition).await {
            Ok(guard) => guard,
            Err(err) => return (Outcome::error(&GameError::from(err), Some(current.public_state())), None),
        };
        next.version += 1;
        if let Err(err) = self.commit(&next).await {
            return (Outcome::error(&GameError::from(err), Some(current.public_state())), None);
        }
        drop(podium);
        let state_hash = next.hash();

        for event in &transition.events {
            logging::log_transition(player_id, event);
        }
        logging::log_audit(player_id, command.kind.as_str(), next.version, &state_hash);
        self.journal_commit(player_id, command, &transition.status, next.version, &state_hash);

        let outcome = Outcome {
            status: transition.status,
            detail: transition.detail,
            error_code: None,
            new_public_state: Some(next.public_state()),
        };
        (outcome, Some(state_hash))
    }

    fn journal_commit(
        &self,
        player_id: &str,
        command: &Command,
        status: &Status,
        version: u64,
        state_hash: &str,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let entry = JournalEntry::Command {
            ts: logging::ts_epoch_ms(),
            player_id: player_id.to_string(),
            command: command.kind.as_str().to_string(),
            status: format!("{:?}", status),
            version,
            state_hash: state_hash.to_string(),
        };
        let mut journal = journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = journal.append(&entry) {
            // the store already committed; the journal is only an audit trail
            log(
                Level::Error,
                Domain::Audit,
                "journal_append_failed",
                obj(&[("player_id", v_str(player_id)), ("error", v_str(&err.to_string()))]),
            );
        }
    }

    // =========================================================================
    // Read-only query surface
    // =========================================================================

    pub async fn get_player_public_state(&self, player_id: &str) -> Result<PublicState, GameError> {
        let store = self.store.clone();
        let id = player_id.to_string();
        let session = persist_call(&self.retry, "load", player_id, || {
            let store = store.clone();
            let id = id.clone();
            async move { store.load(&id).await }
        })
        .await?;
        Ok(session.public_state())
    }

    pub async fn list_active_players(&self) -> Result<Vec<String>, GameError> {
        let store = self.store.clone();
        let ids = persist_call(&self.retry, "list_active", "*", || {
            let store = store.clone();
            async move { store.list_active().await }
        })
        .await?;
        Ok(ids)
    }

    pub async fn list_players(&self) -> Result<Vec<String>, GameError> {
        let store = self.store.clone();
        let ids = persist_call(&self.retry, "list_players", "*", || {
            let store = store.clone();
            async move { store.list_players().await }
        })
        .await?;
        Ok(ids)
    }

    pub fn get_board_snapshot(&self) -> BoardSnapshot {
        self.board.snapshot()
    }
}
