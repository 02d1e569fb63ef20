//! Static board: numbered columns of content cells.
//!
//! The board is loaded once, validated eagerly and shared read-only by every
//! session. Lookups only fail on authoring bugs, which `Board::from_json`
//! already rules out for the loaded table.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::EffectCatalog;
use crate::error::ContentError;

pub type ColumnId = u8;

pub const MIN_COLUMN: ColumnId = 3;
pub const MAX_COLUMN: ColumnId = 18;
pub const MIN_HEIGHT: usize = 3;
pub const MAX_HEIGHT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Encounter,
    Item,
    Trap,
}

impl CellKind {
    pub fn code(&self) -> char {
        match self {
            CellKind::Encounter => 'E',
            CellKind::Item => 'I',
            CellKind::Trap => 'T',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        match c {
            'E' | 'e' => Some(CellKind::Encounter),
            'I' | 'i' => Some(CellKind::Item),
            'T' | 't' => Some(CellKind::Trap),
            _ => None,
        }
    }
}

/// A board cell: its kind plus the catalog content it triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub kind: CellKind,
    pub content_id: u32,
}

impl Cell {
    /// Parse the compact `E12` / `I3` / `T7` notation used by the board table.
    pub fn parse(code: &str) -> Result<Self, ContentError> {
        let mut chars = code.trim().chars();
        let kind = chars
            .next()
            .and_then(CellKind::from_code)
            .ok_or_else(|| ContentError::Malformed(format!("bad cell code {:?}", code)))?;
        let content_id = chars
            .as_str()
            .parse::<u32>()
            .map_err(|_| ContentError::Malformed(format!("bad content id in {:?}", code)))?;
        Ok(Self { kind, content_id })
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.code(), self.content_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub id: ColumnId,
    pub cells: Vec<Cell>,
    /// Whether topping this column counts toward the win.
    pub counts_toward_win: bool,
}

impl Column {
    pub fn height(&self) -> usize {
        self.cells.len()
    }

    pub fn top_index(&self) -> usize {
        self.cells.len() - 1
    }
}

#[derive(Debug, Deserialize)]
struct RawBoard {
    columns: Vec<RawColumn>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    column: ColumnId,
    cells: Vec<String>,
    #[serde(default = "default_true")]
    counts_toward_win: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Board {
    columns: BTreeMap<ColumnId, Column>,
}

impl Board {
    /// Build a board from already-parsed columns, validating ranges.
    pub fn new(columns: Vec<Column>) -> Result<Self, ContentError> {
        let mut map = BTreeMap::new();
        for col in columns {
            if !(MIN_COLUMN..=MAX_COLUMN).contains(&col.id) {
                return Err(ContentError::ColumnOutOfRange(col.id));
            }
            let h = col.height();
            if !(MIN_HEIGHT..=MAX_HEIGHT).contains(&h) {
                return Err(ContentError::Malformed(format!(
                    "column {} has height {}, expected {}..={}",
                    col.id, h, MIN_HEIGHT, MAX_HEIGHT
                )));
            }
            if map.insert(col.id, col).is_some() {
                return Err(ContentError::Malformed("duplicate column definition".to_string()));
            }
        }
        if map.is_empty() {
            return Err(ContentError::Malformed("board has no columns".to_string()));
        }
        Ok(Self { columns: map })
    }

    pub fn from_json(text: &str) -> Result<Self, ContentError> {
        let raw: RawBoard =
            serde_json::from_str(text).map_err(|e| ContentError::Malformed(format!("board: {}", e)))?;
        let mut columns = Vec::with_capacity(raw.columns.len());
        for rc in raw.columns {
            let cells = rc
                .cells
                .iter()
                .map(|c| Cell::parse(c))
                .collect::<Result<Vec<_>, _>>()?;
            columns.push(Column {
                id: rc.column,
                cells,
                counts_toward_win: rc.counts_toward_win,
            });
        }
        Self::new(columns)
    }

    pub fn load(path: &Path) -> Result<Self, ContentError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ContentError::Malformed(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn column(&self, column: ColumnId) -> Result<&Column, ContentError> {
        self.columns.get(&column).ok_or(ContentError::ColumnOutOfRange(column))
    }

    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.values()
    }

    pub fn height(&self, column: ColumnId) -> Result<usize, ContentError> {
        Ok(self.column(column)?.height())
    }

    pub fn cell_at(&self, column: ColumnId, index: usize) -> Result<Cell, ContentError> {
        self.column(column)?
            .cells
            .get(index)
            .copied()
            .ok_or(ContentError::IndexOutOfRange { column, index })
    }

    /// True when `index` is the top cell of `column`.
    pub fn is_winning_index(&self, column: ColumnId, index: usize) -> Result<bool, ContentError> {
        let col = self.column(column)?;
        if index >= col.height() {
            return Err(ContentError::IndexOutOfRange { column, index });
        }
        Ok(index == col.top_index())
    }

    /// Every cell must reference content the catalog knows about.
    pub fn validate_content(&self, catalog: &EffectCatalog) -> Result<(), ContentError> {
        for col in self.columns.values() {
            for cell in &col.cells {
                if !catalog.contains(cell) {
                    return Err(ContentError::UnknownContent {
                        kind: cell.kind.code(),
                        id: cell.content_id,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            columns: self
                .columns
                .values()
                .map(|c| ColumnSnapshot {
                    column: c.id,
                    height: c.height(),
                    cells: c.cells.iter().map(|cell| cell.to_string()).collect(),
                    counts_toward_win: c.counts_toward_win,
                })
                .collect(),
        }
    }
}

/// Read-only view handed to the admin console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub columns: Vec<ColumnSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    pub column: ColumnId,
    pub height: usize,
    pub cells: Vec<String>,
    pub counts_toward_win: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"{"columns": [
        {"column": 4, "cells": ["E1", "T3", "I2"]},
        {"column": 7, "cells": ["E1", "E2", "I1", "T1"]}
    ]}"#;

    #[test]
    fn test_parse_cell_codes() {
        let cell = Cell::parse("T12").unwrap();
        assert_eq!(cell.kind, CellKind::Trap);
        assert_eq!(cell.content_id, 12);
        assert_eq!(cell.to_string(), "T12");
        assert!(Cell::parse("X1").is_err());
        assert!(Cell::parse("E").is_err());
    }

    #[test]
    fn test_lookups() {
        let board = Board::from_json(SMALL).unwrap();
        assert_eq!(board.height(7).unwrap(), 4);
        assert_eq!(board.cell_at(4, 1).unwrap(), Cell { kind: CellKind::Trap, content_id: 3 });
        assert!(board.is_winning_index(4, 2).unwrap());
        assert!(!board.is_winning_index(4, 1).unwrap());
    }

    #[test]
    fn test_out_of_range_lookups() {
        let board = Board::from_json(SMALL).unwrap();
        assert_eq!(board.cell_at(5, 0), Err(ContentError::ColumnOutOfRange(5)));
        assert_eq!(
            board.cell_at(4, 3),
            Err(ContentError::IndexOutOfRange { column: 4, index: 3 })
        );
        assert!(board.is_winning_index(4, 9).is_err());
    }

    #[test]
    fn test_load_rejects_bad_tables() {
        let too_short = r#"{"columns": [{"column": 4, "cells": ["E1", "E2"]}]}"#;
        assert!(matches!(Board::from_json(too_short), Err(ContentError::Malformed(_))));

        let off_board = r#"{"columns": [{"column": 19, "cells": ["E1", "E2", "E3"]}]}"#;
        assert_eq!(Board::from_json(off_board), Err(ContentError::ColumnOutOfRange(19)));

        let dup = r#"{"columns": [
            {"column": 4, "cells": ["E1", "E2", "E3"]},
            {"column": 4, "cells": ["E1", "E2", "E3"]}
        ]}"#;
        assert!(Board::from_json(dup).is_err());
    }

    #[test]
    fn test_snapshot_lists_every_column() {
        let board = Board::from_json(SMALL).unwrap();
        let snap = board.snapshot();
        assert_eq!(snap.columns.len(), 2);
        assert_eq!(snap.columns[1].cells, vec!["E1", "E2", "I1", "T1"]);
    }
}
