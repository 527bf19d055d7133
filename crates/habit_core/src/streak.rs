use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::json;
use tracing::debug;

use crate::clock::Clock;
use crate::date::{next_day, previous_day, previous_week, week_start, YearAndDay};
use crate::habit::{Habit, HabitId, Streak};
use crate::store::{DocPath, DocumentStore, FieldPath};

const DAYS_PER_WEEK: u8 = 7;

/// One cell of the weekly grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayStatus {
    pub value: Option<String>,
    pub date: YearAndDay,
    /// The day before has a value, even when it lies in the previous week.
    pub has_previous_value: bool,
    pub has_next_value: bool,
}

/// Computes streaks and owns the write path for per-day habit statuses.
pub struct StreakEngine {
    store: Arc<dyn DocumentStore>,
    owner_uid: String,
    clock: Arc<dyn Clock>,
    streaks: RwLock<HashMap<HabitId, Streak>>,
}

impl StreakEngine {
    pub fn new(store: Arc<dyn DocumentStore>, owner_uid: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            owner_uid: owner_uid.into(),
            clock,
            streaks: RwLock::new(HashMap::new()),
        }
    }

    /// Last computed streak, or the disabled streak if none was computed yet.
    pub fn streak(&self, habit_id: &str) -> Streak {
        self.streaks
            .read()
            .get(habit_id)
            .copied()
            .unwrap_or_else(Streak::disabled)
    }

    pub fn forget(&self, habit_id: &str) {
        self.streaks.write().remove(habit_id);
    }

    pub fn status<'a>(&self, habit: &'a Habit, date: YearAndDay) -> Option<&'a str> {
        habit.status_on(date)
    }

    pub fn weekly_habit_status_data(&self, habit: &Habit, week_start: YearAndDay) -> Vec<DayStatus> {
        let mut days = Vec::with_capacity(usize::from(DAYS_PER_WEEK));
        let mut date = week_start;
        for _ in 0..DAYS_PER_WEEK {
            days.push(DayStatus {
                value: habit.status_on(date).map(str::to_string),
                date,
                has_previous_value: habit.has_status_on(previous_day(date)),
                has_next_value: habit.has_status_on(next_day(date)),
            });
            date = next_day(date);
        }
        days
    }

    /// Records `new_status` for `date`, returning the value now stored.
    ///
    /// Setting the current value again is a no-op without a write. `None`
    /// clears the day.
    pub fn set_habit_status(
        &self,
        habit: &mut Habit,
        date: YearAndDay,
        new_status: Option<&str>,
    ) -> Result<Option<String>> {
        let existing = habit.status_on(date).map(str::to_string);
        if existing.as_deref() == new_status {
            return Ok(existing);
        }
        let Some(new_status) = new_status else {
            self.clear_habit_status(habit, date)?;
            return Ok(None);
        };

        habit
            .statuses
            .get_or_insert_with(Default::default)
            .entry(date.year)
            .or_default()
            .insert(date.day_of_year, new_status.to_string());
        self.refresh_streak(habit);

        let path = DocPath::habit(&self.owner_uid, &habit.id);
        debug!(habit_id = %habit.id, %date, "writing habit status");
        self.store
            .merge(&path, json!({ "statuses": habit.statuses }))
            .with_context(|| format!("failed to write status for habit `{}`", habit.id))?;
        Ok(Some(new_status.to_string()))
    }

    /// Removes the status for `date`. An emptied year bucket is removed too.
    pub fn clear_habit_status(&self, habit: &mut Habit, date: YearAndDay) -> Result<()> {
        let Some(statuses) = habit.statuses.as_mut() else {
            return Ok(());
        };
        let Some(year) = statuses.get_mut(&date.year) else {
            return Ok(());
        };
        if year.remove(&date.day_of_year).is_none() {
            return Ok(());
        }
        let field = if year.is_empty() {
            statuses.remove(&date.year);
            FieldPath::new(["statuses".to_string(), date.year.to_string()])
        } else {
            FieldPath::new([
                "statuses".to_string(),
                date.year.to_string(),
                date.day_of_year.to_string(),
            ])
        };
        self.refresh_streak(habit);

        let path = DocPath::habit(&self.owner_uid, &habit.id);
        debug!(habit_id = %habit.id, %field, "clearing habit status");
        self.store
            .delete_fields(&path, &[field])
            .with_context(|| format!("failed to clear status for habit `{}`", habit.id))?;
        Ok(())
    }

    pub fn refresh_streak(&self, habit: &Habit) -> Streak {
        let streak = match (habit.statuses.as_ref(), habit.weekly_frequency) {
            (Some(_), Some(frequency)) if frequency >= DAYS_PER_WEEK => self.daily_streak(habit),
            (Some(_), Some(frequency)) if frequency > 0 => self.weekly_streak(habit, frequency),
            _ => Streak::disabled(),
        };
        self.streaks.write().insert(habit.id.clone(), streak);
        streak
    }

    fn daily_streak(&self, habit: &Habit) -> Streak {
        let today = YearAndDay::from(self.clock.today());
        let has_today = habit.has_status_on(today);
        let mut count = u32::from(has_today);
        let mut cursor = previous_day(today);
        while habit.has_status_on(cursor) {
            count += 1;
            cursor = previous_day(cursor);
        }
        Streak {
            count,
            is_pending: !has_today,
        }
    }

    fn weekly_streak(&self, habit: &Habit, frequency: u8) -> Streak {
        let this_week = YearAndDay::from(week_start(self.clock.today()));
        let satisfied = week_satisfied(habit, this_week, frequency);
        let mut count = u32::from(satisfied);
        let mut cursor = previous_week(this_week);
        while week_satisfied(habit, cursor, frequency) {
            count += 1;
            cursor = previous_week(cursor);
        }
        Streak {
            count,
            is_pending: !satisfied,
        }
    }
}

fn week_satisfied(habit: &Habit, start: YearAndDay, frequency: u8) -> bool {
    let mut marked = 0u8;
    let mut date = start;
    for _ in 0..DAYS_PER_WEEK {
        if habit.has_status_on(date) {
            marked += 1;
            if marked >= frequency {
                return true;
            }
        }
        date = next_day(date);
    }
    false
}
