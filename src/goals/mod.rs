//! Writing goals: daily targets, the per-day word ledger, rollover

pub mod ledger;
pub mod models;

pub use ledger::{daily_target, handle_midnight_rollover, progress, words_written_today};
pub use models::{Goal, GoalMode, GoalProgress};
