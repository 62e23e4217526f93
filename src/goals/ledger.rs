use chrono::NaiveDate;

use super::models::{Goal, GoalMode, GoalProgress};

/// Count writing days between two dates, inclusive on both ends
pub fn writing_days_between(goal: &Goal, from: NaiveDate, to: NaiveDate) -> u32 {
    if from > to {
        return 0;
    }
    let mut count = 0;
    let mut day = from;
    while day <= to {
        if goal.is_writing_day(day) {
            count += 1;
        }
        day = day.succ_opt().expect("date within range");
    }
    count
}

/// Sum of all banked daily entries
pub fn ledger_total(goal: &Goal) -> i64 {
    goal.ledger.values().sum()
}

/// Net words written today: the live total minus everything banked for
/// past days. Negative when today's editing deleted more than it added.
pub fn words_written_today(goal: &Goal, total_words: usize) -> i64 {
    total_words as i64 - ledger_total(goal)
}

/// Today's word target under the goal's mode.
///
/// Elastic: remaining words spread over remaining writing days (deadline
/// inclusive); past the deadline or out of writing days, everything left is
/// due now. Strict: the quota fixed by the full schedule, at least 1.
pub fn daily_target(goal: &Goal, total_words: usize, today: NaiveDate) -> u32 {
    match goal.mode {
        GoalMode::Elastic => {
            let remaining = (goal.target as i64 - total_words as i64).max(0) as u64;
            if remaining == 0 {
                return 0;
            }
            let days = writing_days_between(goal, today, goal.deadline) as u64;
            if days == 0 {
                return remaining.min(u32::MAX as u64) as u32;
            }
            remaining.div_ceil(days) as u32
        }
        GoalMode::Strict => {
            let days = writing_days_between(goal, goal.start_date, goal.deadline) as u64;
            if days == 0 {
                return goal.target.max(1);
            }
            ((goal.target as u64).div_ceil(days) as u32).max(1)
        }
    }
}

/// Bank past progress at the first calculation of a new day.
///
/// Idempotent: once the ledger has rolled forward to `today`, repeated calls
/// are no-ops until the date changes again. The very first calculation for a
/// goal only records the date; there is no prior baseline to bank.
/// Returns whether the goal changed and needs persisting.
pub fn handle_midnight_rollover(goal: &mut Goal, total_words: usize, today: NaiveDate) -> bool {
    match goal.last_calculated_date {
        Some(last) if last >= today => false,
        Some(last) => {
            // Everything not yet banked belongs to the last active day
            let unbanked = total_words as i64 - ledger_total(goal);
            goal.ledger.insert(last, unbanked);
            goal.last_calculated_date = Some(today);
            log::debug!("Goals: rolled over {} net words banked for {}", unbanked, last);
            true
        }
        None => {
            goal.last_calculated_date = Some(today);
            true
        }
    }
}

/// Build the progress snapshot (rollover must already have run for `today`)
pub fn progress(goal: &Goal, total_words: usize, today: NaiveDate) -> GoalProgress {
    let written_today = words_written_today(goal, total_words);
    let target_today = daily_target(goal, total_words, today);
    GoalProgress {
        target: goal.target,
        total_written: total_words as i64,
        written_today,
        daily_target: target_today,
        remaining_writing_days: writing_days_between(goal, today, goal.deadline),
        on_schedule: !goal.is_writing_day(today) || written_today >= target_today as i64,
    }
}
