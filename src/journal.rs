//! Append-only command journal.
//!
//! One JSON line per committed command, written after the session store
//! accepted the new state. `recover` folds the file back into the last known
//! state hash per player, which lets an operator cross-check the store.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct Journal {
    file: File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    Command {
        ts: u64,
        player_id: String,
        command: String,
        status: String,
        version: u64,
        state_hash: String,
    },
    /// Process start; separates runs in one file.
    Start { ts: u64, run_id: String },
}

/// What replaying the journal tells us.
#[derive(Debug, Clone, Default)]
pub struct RecoveryState {
    pub last_hash: HashMap<String, String>,
    pub last_version: HashMap<String, u64>,
    pub commands: usize,
    pub starts: usize,
    /// Lines that did not parse; a torn final write shows up here.
    pub skipped: usize,
}

impl Journal {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, entry: &JournalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }

    /// Read all lines from the journal file
    pub fn replay(path: &str) -> std::io::Result<Vec<String>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(reader.lines().map_while(Result::ok).collect())
    }

    pub fn recover(path: &str) -> std::io::Result<RecoveryState> {
        let mut state = RecoveryState::default();
        for line in Self::replay(path)? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(JournalEntry::Command { player_id, version, state_hash, .. }) => {
                    state.commands += 1;
                    state.last_version.insert(player_id.clone(), version);
                    state.last_hash.insert(player_id, state_hash);
                }
                Ok(JournalEntry::Start { .. }) => state.starts += 1,
                Err(_) => state.skipped += 1,
            }
        }
        Ok(state)
    }
}
