//! Dice-race game engine: a "Can't Stop" variant with a catalog of cell
//! effects, persistent per-player sessions and a per-player command
//! coordinator.

pub mod board;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod journal;
pub mod logging;
pub mod reliability;
pub mod storage;
