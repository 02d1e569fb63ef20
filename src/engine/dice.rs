//! Dice sources and the pairing rule.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::board::ColumnId;

/// Anything that can produce a roll. The engine never touches an RNG directly.
pub trait DiceSource: Send {
    fn roll(&mut self, count: usize, faces: u8) -> Vec<u8>;
}

/// Uniform dice backed by `StdRng`; seeded for replayable sessions.
#[derive(Debug)]
pub struct RandomDice {
    rng: StdRng,
}

impl RandomDice {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl DiceSource for RandomDice {
    fn roll(&mut self, count: usize, faces: u8) -> Vec<u8> {
        (0..count).map(|_| self.rng.gen_range(1..=faces)).collect()
    }
}

/// Replays a fixed script of rolls. Once the script runs out the last roll repeats.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDice {
    script: VecDeque<Vec<u8>>,
    last: Vec<u8>,
}

impl ScriptedDice {
    pub fn new(rolls: Vec<Vec<u8>>) -> Self {
        Self {
            script: rolls.into(),
            last: Vec::new(),
        }
    }
}

impl DiceSource for ScriptedDice {
    fn roll(&mut self, count: usize, faces: u8) -> Vec<u8> {
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        if self.last.is_empty() {
            return vec![1; count];
        }
        // scripts may be written for a different dice count; pad or cut to fit
        let mut out: Vec<u8> = self.last.iter().map(|d| (*d).clamp(1, faces)).collect();
        out.resize(count, 1);
        out
    }
}

/// One source behind a cheap cloneable handle.
///
/// Each clone locks the source for a single `roll` and nothing longer, so
/// commands for different players only meet for the instant dice are drawn.
#[derive(Clone)]
pub struct SharedDice {
    source: Arc<Mutex<Box<dyn DiceSource>>>,
}

impl SharedDice {
    pub fn new(source: Box<dyn DiceSource>) -> Self {
        Self { source: Arc::new(Mutex::new(source)) }
    }
}

impl DiceSource for SharedDice {
    fn roll(&mut self, count: usize, faces: u8) -> Vec<u8> {
        let mut source = self.source.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        source.roll(count, faces)
    }
}

/// One way of splitting the dice into two equal halves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pairing {
    pub sums: [u32; 2],
    /// Sums usable as columns right now; a doubled sum appears twice.
    pub playable: Vec<ColumnId>,
}

impl Pairing {
    pub fn is_playable(&self) -> bool {
        !self.playable.is_empty()
    }

    /// True when `selection` (sorted) can be taken from this pairing's sums.
    pub fn admits(&self, selection: &[ColumnId]) -> bool {
        let mut pool = self.playable.clone();
        for col in selection {
            match pool.iter().position(|c| c == col) {
                Some(i) => {
                    pool.swap_remove(i);
                }
                None => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roll {
    pub dice: Vec<u8>,
    pub pairings: Vec<Pairing>,
}

impl Roll {
    pub fn any_playable(&self) -> bool {
        self.pairings.iter().any(Pairing::is_playable)
    }
}

/// Every distinct split of `dice` into two halves, as half-sums.
///
/// Index 0 always goes to the first half, so each split shows up once:
/// 4 dice give 3 splits, 6 dice give 10. Identical sum pairs collapse.
pub fn split_sums(dice: &[u8]) -> Vec<[u32; 2]> {
    let n = dice.len();
    if n < 2 || n % 2 != 0 || n > 16 {
        return Vec::new();
    }
    let half = n / 2;
    let total: u32 = dice.iter().map(|d| *d as u32).sum();
    let mut out: Vec<[u32; 2]> = Vec::new();
    for mask in 0u32..(1 << n) {
        if mask & 1 == 0 || mask.count_ones() as usize != half {
            continue;
        }
        let first: u32 = (0..n).filter(|i| mask & (1 << i) != 0).map(|i| dice[i] as u32).sum();
        let mut sums = [first, total - first];
        sums.sort_unstable();
        if !out.contains(&sums) {
            out.push(sums);
        }
    }
    out
}

/// Build the roll record, marking each sum through `playable`.
pub fn pair_roll<F>(dice: Vec<u8>, mut playable: F) -> Roll
where
    F: FnMut(ColumnId) -> bool,
{
    let pairings = split_sums(&dice)
        .into_iter()
        .map(|sums| {
            let playable = sums
                .iter()
                .filter_map(|s| ColumnId::try_from(*s).ok())
                .filter(|c| playable(*c))
                .collect();
            Pairing { sums, playable }
        })
        .collect();
    Roll { dice, pairings }
}
