pub mod subscriptions;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use habit_core::clock::Clock;
use habit_core::date::YearAndDay;
use habit_core::habit::{FriendSummary, Habit, LinkedHabitRecord, Streak};
use habit_core::registry::{HabitChange, HabitRegistry};
use habit_core::{DocumentStore, StreakEngine, WeekView};
use parking_lot::RwLock;
use tracing::{info, instrument};

pub use crate::subscriptions::{HabitInView, HabitOwner, HabitSubscriptionManager, ViewEvent, ViewState, ViewTarget};

/// The service graph for one signed-in user.
///
/// Built once at sign-in and handed out by reference; nothing here is looked
/// up globally.
pub struct HabitSession {
    owner_uid: String,
    clock: Arc<dyn Clock>,
    registry: Arc<RwLock<HabitRegistry>>,
    streaks: Arc<StreakEngine>,
    subscriptions: HabitSubscriptionManager,
    week: WeekView,
}

/// A row of the habits in view with its resolved habit and streak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HabitRow {
    pub entry: HabitInView,
    pub habit: Habit,
    pub streak: Streak,
}

impl HabitSession {
    #[instrument(skip(store, clock))]
    pub fn open(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, owner_uid: &str) -> Result<Self> {
        let registry = HabitRegistry::load(Arc::clone(&store), owner_uid)
            .with_context(|| format!("failed to load habits for `{owner_uid}`"))?;
        let streaks = Arc::new(StreakEngine::new(Arc::clone(&store), owner_uid, Arc::clone(&clock)));
        for habit in registry.habits_in_order() {
            streaks.refresh_streak(habit);
        }
        let registry = Arc::new(RwLock::new(registry));
        let subscriptions =
            HabitSubscriptionManager::new(Arc::clone(&store), Arc::clone(&registry), Arc::clone(&streaks));
        let week = WeekView::new(Arc::clone(&store), owner_uid, clock.today());

        info!(%owner_uid, "habit session opened");
        Ok(Self {
            owner_uid: owner_uid.to_string(),
            clock,
            registry,
            streaks,
            subscriptions,
            week,
        })
    }

    pub fn owner_uid(&self) -> &str {
        &self.owner_uid
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn registry(&self) -> &Arc<RwLock<HabitRegistry>> {
        &self.registry
    }

    pub fn streaks(&self) -> &StreakEngine {
        &self.streaks
    }

    pub fn subscriptions(&self) -> &HabitSubscriptionManager {
        &self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut HabitSubscriptionManager {
        &mut self.subscriptions
    }

    pub fn week(&self) -> &WeekView {
        &self.week
    }

    pub fn week_mut(&mut self) -> &mut WeekView {
        &mut self.week
    }

    /// Switches the page and applies whatever snapshots are already queued.
    pub fn view_user(&mut self, friend_uid: Option<&str>) {
        self.subscriptions.view_user(friend_uid);
        self.subscriptions.process_events();
    }

    pub fn pump(&mut self) -> usize {
        self.subscriptions.process_events()
    }

    pub fn set_friends(&mut self, friends: &[FriendSummary]) {
        self.subscriptions.set_friends(friends);
    }

    pub fn rows(&self) -> Vec<HabitRow> {
        self.subscriptions
            .habits_in_view()
            .iter()
            .filter_map(|entry| {
                let habit = self.subscriptions.resolve(entry)?;
                let streak = self.streaks.streak(&habit.id);
                Some(HabitRow {
                    entry: entry.clone(),
                    habit,
                    streak,
                })
            })
            .collect()
    }

    pub fn save_habit(&mut self, habit: Habit) -> Result<Option<HabitChange>> {
        self.streaks.refresh_streak(&habit);
        let change = self.registry.write().set_habit(habit);
        self.refresh_own_page();
        change
    }

    pub fn set_habit_status(
        &mut self,
        habit_id: &str,
        date: YearAndDay,
        status: Option<&str>,
    ) -> Result<Option<String>> {
        let streaks = &self.streaks;
        let result = self
            .registry
            .write()
            .update_habit(habit_id, |habit| streaks.set_habit_status(habit, date, status))?;
        self.refresh_own_page();
        result
    }

    /// Deletes an own habit. Friend habits linked to it stop being followed.
    pub fn delete_habit(&mut self, habit_id: &str) -> Result<()> {
        let result = self.registry.write().delete_habit_by_id(habit_id);
        self.streaks.forget(habit_id);
        self.subscriptions.release_unlinked();
        self.refresh_own_page();
        result
    }

    pub fn archive_habit(&mut self, habit_id: &str) -> Result<()> {
        let result = self.registry.write().archive_habit_by_id(habit_id);
        self.streaks.forget(habit_id);
        self.subscriptions.release_unlinked();
        self.refresh_own_page();
        result
    }

    pub fn restore_habit(&mut self, habit_id: &str) -> Result<()> {
        let result = self.registry.write().restore_archived_habit_by_id(habit_id);
        if let Some(habit) = self.registry.read().habit(habit_id) {
            self.streaks.refresh_streak(habit);
        }
        self.refresh_own_page();
        result
    }

    pub fn reorder_habits(&mut self, moved: &str, target: &str) -> Result<()> {
        let result = self.registry.write().reorder_habits(moved, target);
        self.refresh_own_page();
        result
    }

    /// Links an own habit to a friend's habit and starts listening to it.
    pub fn link_habit(
        &mut self,
        local_id: &str,
        friend_uid: &str,
        friend_habit_id: &str,
    ) -> Result<LinkedHabitRecord> {
        let record = self
            .registry
            .write()
            .link_habit(local_id, friend_uid, friend_habit_id)?;
        if self.subscriptions.target() == Some(&ViewTarget::Mine) {
            self.view_user(None);
        }
        Ok(record)
    }

    pub fn unlink_habit(&mut self, friend_habit_id: &str) -> Result<bool> {
        let removed = self.registry.write().unlink_habit(friend_habit_id)?;
        self.subscriptions.release_unlinked();
        self.refresh_own_page();
        Ok(removed)
    }

    pub fn view_week(&mut self, date: NaiveDate, cached_icon: Option<String>) -> Result<()> {
        self.week.view_week(date, cached_icon)
    }

    /// Releases every open subscription.
    pub fn close(mut self) {
        self.subscriptions.close();
        info!(owner_uid = %self.owner_uid, "habit session closed");
    }
}

impl HabitSession {
    fn refresh_own_page(&mut self) {
        if self.subscriptions.target() == Some(&ViewTarget::Mine) && !self.subscriptions.is_loading() {
            self.subscriptions.refresh_habits_in_view();
        }
    }
}
