//! Relay stand-in: one JSON request per stdin line, one JSON reply per stdout line.
//!
//! Game commands look like `{"type": "Roll", "player_id": "p1", "args": {}}`.
//! Admin queries look like `{"admin": "active_players"}`,
//! `{"admin": "board"}` or `{"admin": "player", "player_id": "p1"}`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use dicerace::config::Config;
use dicerace::coordinator::Coordinator;
use dicerace::engine::command::{Command, Outcome};
use dicerace::engine::dice::RandomDice;
use dicerace::error::GameError;
use dicerace::journal::{Journal, JournalEntry};
use dicerace::logging::{self, log, obj, v_str, Domain, Level};
use dicerace::reliability::retry::RetryConfig;
use dicerace::storage::SqliteStore;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Request {
    Admin {
        admin: String,
        #[serde(default)]
        player_id: Option<String>,
    },
    Command(Command),
}

async fn handle_admin(coord: &Coordinator, query: &str, player_id: Option<&str>) -> Value {
    let result = match (query, player_id) {
        ("board", _) => serde_json::to_value(coord.get_board_snapshot()).map_err(|e| e.to_string()),
        ("active_players", _) => coord
            .list_active_players()
            .await
            .map(|ids| json!(ids))
            .map_err(|e| e.to_string()),
        ("players", _) => coord.list_players().await.map(|ids| json!(ids)).map_err(|e| e.to_string()),
        ("player", Some(id)) => match coord.get_player_public_state(id).await {
            Ok(state) => serde_json::to_value(state).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        },
        (other, _) => Err(format!("unknown admin query {:?}", other)),
    };
    match result {
        Ok(v) => json!({"admin": query, "ok": true, "result": v}),
        Err(e) => json!({"admin": query, "ok": false, "error": e}),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate().map_err(|e| anyhow!("invalid configuration: {}", e))?;

    let store = SqliteStore::open(&cfg.sqlite_path)?;
    store.import_content_files(Path::new(&cfg.board_path), Path::new(&cfg.catalog_path))?;

    let recovery = Journal::recover(&cfg.journal_path)?;
    log(
        Level::Info,
        Domain::System,
        "journal_recovery",
        obj(&[
            ("path", v_str(&cfg.journal_path)),
            ("commands", json!(recovery.commands)),
            ("players", json!(recovery.last_hash.len())),
            ("skipped", json!(recovery.skipped)),
        ]),
    );
    let mut journal = Journal::open(&cfg.journal_path)?;
    journal.append(&JournalEntry::Start {
        ts: logging::ts_epoch_ms(),
        run_id: std::env::var("RUN_ID").unwrap_or_default(),
    })?;

    let coord = Coordinator::from_store(
        Arc::new(store),
        cfg.rules(),
        RetryConfig::from_config(&cfg),
        Box::new(RandomDice::new(cfg.dice_seed)),
    )
    .await?
    .with_journal(journal);

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("dice_count", json!(cfg.dice_count)),
            ("die_faces", json!(cfg.die_faces)),
            ("seeded", json!(cfg.dice_seed.is_some())),
        ]),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(Request::Command(cmd)) => {
                let player_id = cmd.player_id.clone();
                let outcome = coord.submit(cmd).await;
                json!({"player_id": player_id, "outcome": outcome})
            }
            Ok(Request::Admin { admin, player_id }) => handle_admin(&coord, &admin, player_id.as_deref()).await,
            Err(e) => {
                let err = GameError::Validation(format!("unreadable request: {}", e));
                json!({"outcome": Outcome::error(&err, None)})
            }
        };
        stdout.write_all(reply.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    log(Level::Info, Domain::System, "shutdown", obj(&[]));
    logging::flush();
    Ok(())
}
