//! Game engine with deterministic, replayable transitions.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Command    │────►│   Reducer    │────►│  Transition  │
//! │  (parsed)    │     │  (pure fn)   │     │  (events)    │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │   Session    │◄────│   Effects    │
//!                      │  (hashed)    │     │  (staged)    │
//!                      └──────────────┘     └──────────────┘
//! ```

pub mod command;
pub mod dice;
pub mod effects;
pub mod reducer;
pub mod session;
