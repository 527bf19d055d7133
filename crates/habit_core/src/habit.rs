use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::date::YearAndDay;

pub type HabitId = String;

/// Sparse per-day status record: year -> day of year -> emoji.
pub type Statuses = BTreeMap<i32, BTreeMap<u32, String>>;

const HABIT_ID_LEN: usize = 8;

pub fn generate_habit_id() -> HabitId {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(HABIT_ID_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

impl Visibility {
    /// Name of the membership bucket inside the habit details document.
    pub fn bucket(self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    pub id: HabitId,
    pub name: String,
    pub icon: String,
    #[serde(default)]
    pub palette: Vec<String>,
    #[serde(default)]
    pub timeable: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub archived: bool,
    pub creation_time: DateTime<Utc>,
    /// Number of days per week the habit should be marked. `None` disables streaks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_frequency: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Statuses>,
}

impl Habit {
    pub fn new(name: impl Into<String>, icon: impl Into<String>) -> Self {
        Self {
            id: generate_habit_id(),
            name: name.into(),
            icon: icon.into(),
            palette: Vec::new(),
            timeable: false,
            visibility: Visibility::Private,
            archived: false,
            creation_time: Utc::now(),
            weekly_frequency: None,
            statuses: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<HabitId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_frequency(mut self, weekly_frequency: u8) -> Self {
        self.weekly_frequency = Some(weekly_frequency);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn status_on(&self, date: YearAndDay) -> Option<&str> {
        self.statuses
            .as_ref()?
            .get(&date.year)?
            .get(&date.day_of_year)
            .map(String::as_str)
    }

    pub fn has_status_on(&self, date: YearAndDay) -> bool {
        self.status_on(date).is_some()
    }
}

/// A read-only projection of another user's habit, alive only while subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendHabit {
    pub habit: Habit,
    pub friend_uid: String,
}

/// Links one of our habits to a friend's habit so both render together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkedHabitRecord {
    pub friend_habit_id: HabitId,
    pub friend_uid: String,
    pub linked_habit_id: HabitId,
    pub time: DateTime<Utc>,
}

/// Minimal projection kept for archived habits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedHabit {
    pub name: String,
    pub icon: String,
    pub archive_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Streak {
    pub count: u32,
    pub is_pending: bool,
}

impl Streak {
    pub fn disabled() -> Self {
        Self {
            count: 0,
            is_pending: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendSummary {
    pub uid: String,
    #[serde(default)]
    pub display_name: String,
}
