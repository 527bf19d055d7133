pub mod clock;
pub mod date;
pub mod error;
pub mod habit;
pub mod memory;
pub mod observe;
pub mod registry;
pub mod store;
pub mod streak;
pub mod week;

pub use crate::error::{HabitError, StoreError};
pub use crate::habit::{FriendHabit, Habit, HabitId, LinkedHabitRecord, Streak, Visibility};
pub use crate::registry::HabitRegistry;
pub use crate::store::{DocPath, DocumentStore};
pub use crate::streak::StreakEngine;
pub use crate::week::WeekView;
