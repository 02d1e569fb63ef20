use std::time::Duration;

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub sqlite_path: String,
    pub board_path: String,
    pub catalog_path: String,
    pub journal_path: String,
    pub persist_timeout_ms: u64,
    pub persist_retries: u32,
    pub dice_count: usize,
    pub die_faces: u8,
    pub max_temp_columns: usize,
    pub columns_to_win: usize,
    /// Fixed RNG seed; unset means entropy-seeded dice.
    pub dice_seed: Option<u64>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./dicerace.sqlite".to_string()),
            board_path: std::env::var("BOARD_PATH").unwrap_or_else(|_| "data/board.json".to_string()),
            catalog_path: std::env::var("CATALOG_PATH").unwrap_or_else(|_| "data/catalog.json".to_string()),
            journal_path: std::env::var("JOURNAL_PATH").unwrap_or_else(|_| "./dicerace.journal".to_string()),
            persist_timeout_ms: std::env::var("PERSIST_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(2000),
            persist_retries: std::env::var("PERSIST_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
            dice_count: std::env::var("DICE_COUNT").ok().and_then(|v| v.parse().ok()).unwrap_or(4),
            die_faces: std::env::var("DIE_FACES").ok().and_then(|v| v.parse().ok()).unwrap_or(9),
            max_temp_columns: std::env::var("MAX_TEMP_COLUMNS").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            columns_to_win: std::env::var("COLUMNS_TO_WIN").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            dice_seed: std::env::var("DICE_SEED").ok().and_then(|v| v.parse().ok()),
        }
    }

    pub fn rules(&self) -> RulesConfig {
        RulesConfig {
            dice_count: self.dice_count,
            die_faces: self.die_faces,
            max_temp_columns: self.max_temp_columns,
            columns_to_win: self.columns_to_win,
        }
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    /// Reject combinations the engine cannot play with.
    pub fn validate(&self) -> Result<(), String> {
        self.rules().validate()?;
        if self.persist_timeout_ms == 0 {
            return Err("PERSIST_TIMEOUT_MS must be positive".to_string());
        }
        Ok(())
    }
}

/// The part of the configuration the engine itself reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesConfig {
    pub dice_count: usize,
    pub die_faces: u8,
    pub max_temp_columns: usize,
    pub columns_to_win: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dice_count: 4,
            die_faces: 9,
            max_temp_columns: 3,
            columns_to_win: 3,
        }
    }
}

impl RulesConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.dice_count < 2 || self.dice_count % 2 != 0 || self.dice_count > 16 {
            return Err(format!("dice count must be even and in 2..=16, got {}", self.dice_count));
        }
        if self.die_faces < 2 {
            return Err(format!("die needs at least 2 faces, got {}", self.die_faces));
        }
        if self.max_temp_columns == 0 || self.columns_to_win == 0 {
            return Err("column limits must be positive".to_string());
        }
        Ok(())
    }
}
