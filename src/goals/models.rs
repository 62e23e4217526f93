use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// How the daily target reacts to progress
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GoalMode {
    /// Remaining words spread over remaining writing days; falling behind
    /// raises the target, getting ahead lowers it
    Elastic,
    /// Fixed daily quota computed once from the full schedule
    Strict,
}

/// A word-count goal with a deadline and a writing-day schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    /// Total words to reach by the deadline
    pub target: u32,
    pub start_date: NaiveDate,
    pub deadline: NaiveDate,
    /// Which weekdays count as writing days, Monday first
    pub writing_days: [bool; 7],
    /// Specific dates excluded from the schedule (vacations)
    #[serde(default)]
    pub days_off: BTreeSet<NaiveDate>,
    pub mode: GoalMode,
    /// Net words banked per past day, written at midnight rollover.
    /// May be negative: deleting text on a day banks a negative entry.
    #[serde(default)]
    pub ledger: BTreeMap<NaiveDate, i64>,
    /// The day the ledger was last rolled forward to; None before the
    /// first progress calculation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_calculated_date: Option<NaiveDate>,
}

impl Goal {
    pub fn new(target: u32, start_date: NaiveDate, deadline: NaiveDate, mode: GoalMode) -> Self {
        Self {
            target,
            start_date,
            deadline,
            writing_days: [true; 7],
            days_off: BTreeSet::new(),
            mode,
            ledger: BTreeMap::new(),
            last_calculated_date: None,
        }
    }

    /// Whether a date is on the writing schedule
    pub fn is_writing_day(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday().num_days_from_monday() as usize;
        self.writing_days[weekday] && !self.days_off.contains(&date)
    }
}

/// Snapshot for the goal progress display
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalProgress {
    pub target: u32,
    /// Words banked in the ledger plus today's net change
    pub total_written: i64,
    pub written_today: i64,
    pub daily_target: u32,
    pub remaining_writing_days: u32,
    pub on_schedule: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_weekday_mask_is_monday_first() {
        let mut goal = Goal::new(1000, date(2026, 8, 3), date(2026, 8, 31), GoalMode::Elastic);
        goal.writing_days = [true, false, false, false, false, false, false];
        // 2026-08-03 is a Monday
        assert_eq!(date(2026, 8, 3).weekday().num_days_from_monday(), 0);
        assert!(goal.is_writing_day(date(2026, 8, 3)));
        assert!(!goal.is_writing_day(date(2026, 8, 4)));
    }

    #[test]
    fn test_days_off_override_the_mask() {
        let mut goal = Goal::new(1000, date(2026, 8, 3), date(2026, 8, 31), GoalMode::Elastic);
        goal.days_off.insert(date(2026, 8, 3));
        assert!(!goal.is_writing_day(date(2026, 8, 3)));
    }
}
