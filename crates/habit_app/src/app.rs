use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use habit_core::clock::{Clock, FixedClock, SystemClock};
use habit_core::habit::FriendSummary;
use habit_core::memory::MemoryStore;
use habit_core::DocPath;
use habit_sync::{HabitOwner, HabitSession};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub(crate) user_uid: String,
    pub(crate) seed_file: Option<PathBuf>,
    pub(crate) view_friend: Option<String>,
    pub(crate) today: Option<NaiveDate>,
    pub(crate) friends: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any variable source; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(uid) = lookup("HABITS_USER_UID") {
            let uid = uid.trim();
            if uid.is_empty() {
                warn!("ignoring empty HABITS_USER_UID");
            } else {
                config.user_uid = uid.to_string();
            }
        }
        if let Some(path) = lookup("HABITS_SEED_FILE") {
            if !path.trim().is_empty() {
                config.seed_file = Some(PathBuf::from(path.trim()));
            }
        }
        if let Some(friend) = lookup("HABITS_VIEW_FRIEND") {
            if !friend.trim().is_empty() {
                config.view_friend = Some(friend.trim().to_string());
            }
        }
        if let Some(today) = lookup("HABITS_TODAY") {
            match NaiveDate::parse_from_str(today.trim(), "%Y-%m-%d") {
                Ok(date) => config.today = Some(date),
                Err(err) => warn!(value = %today, %err, "ignoring invalid HABITS_TODAY"),
            }
        }
        if let Some(list) = lookup("HABITS_FRIENDS") {
            for uid in list.split(',').map(str::trim).filter(|uid| !uid.is_empty()) {
                if !config.friends.iter().any(|existing| existing == uid) {
                    config.friends.push(uid.to_string());
                }
            }
        }
        Ok(config)
    }

    pub fn user_uid(&self) -> &str {
        &self.user_uid
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user_uid: "me".to_string(),
            seed_file: None,
            view_friend: None,
            today: None,
            friends: Vec::new(),
        }
    }
}

/// Reads a `{ "<doc path>": <document> }` seed file into a fresh store.
pub fn load_seed(path: &Path) -> Result<MemoryStore> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse seed file {}", path.display()))?;
    let Value::Object(documents) = value else {
        bail!("seed file {} must contain a JSON object", path.display());
    };
    info!(path = %path.display(), documents = documents.len(), "seeding store");
    Ok(MemoryStore::with_documents(
        documents
            .into_iter()
            .map(|(path, document)| (DocPath::new(path), document)),
    ))
}

/// Opens a session for the configured user and pages to the requested view.
pub fn open_session(config: &AppConfig) -> Result<HabitSession> {
    let store = match &config.seed_file {
        Some(path) => load_seed(path)?,
        None => MemoryStore::new(),
    };
    let clock: Arc<dyn Clock> = match config.today {
        Some(date) => Arc::new(FixedClock(date)),
        None => Arc::new(SystemClock),
    };
    let mut session = HabitSession::open(Arc::new(store), clock, &config.user_uid)
        .context("failed to open habit session")?;

    if !config.friends.is_empty() {
        let friends: Vec<FriendSummary> = config
            .friends
            .iter()
            .map(|uid| FriendSummary {
                uid: uid.clone(),
                display_name: uid.clone(),
            })
            .collect();
        session.set_friends(&friends);
    }
    session.view_user(config.view_friend.as_deref());
    let today = session.today();
    session
        .view_week(today, None)
        .context("failed to load current week")?;
    Ok(session)
}

/// Text report of the habits in view with their streaks and this week's trackers.
pub fn render(session: &HabitSession) -> String {
    let mut out = String::new();
    let page = session
        .subscriptions()
        .target()
        .map(|target| match target {
            habit_sync::ViewTarget::Mine => session.owner_uid().to_string(),
            habit_sync::ViewTarget::Friend(uid) => uid.clone(),
        })
        .unwrap_or_default();
    let week = session
        .week()
        .start()
        .map(|start| start.to_string())
        .unwrap_or_else(|| "-".to_string());
    let _ = writeln!(out, "Habits for {page} (week of {week})");

    let rows = session.rows();
    if rows.is_empty() {
        let _ = writeln!(out, "  no habits");
    }
    for row in rows {
        let streak = if row.streak.is_pending {
            format!("{} pending", row.streak.count)
        } else {
            row.streak.count.to_string()
        };
        let indent = if row.entry.linked_to.is_some() { "    ↳ " } else { "  " };
        let owner = match &row.entry.owner {
            HabitOwner::Me => String::new(),
            HabitOwner::Friend(uid) => format!(" ({uid})"),
        };
        let trackers = if row.entry.owner == HabitOwner::Me {
            week_cells(session, &row.habit.id)
        } else {
            String::new()
        };
        let _ = writeln!(
            out,
            "{indent}{} {}{owner}  streak {streak}{trackers}",
            row.habit.icon, row.habit.name
        );
    }
    out
}

fn week_cells(session: &HabitSession, habit_id: &str) -> String {
    let Some(days) = session.week().data().trackers.get(habit_id) else {
        return String::new();
    };
    let cells: Vec<&str> = (0..7u8)
        .map(|weekday| days.get(&weekday).map(String::as_str).unwrap_or("·"))
        .collect();
    format!("  [{}]", cells.join(" "))
}

pub fn run(config: AppConfig) -> Result<()> {
    info!(user_uid = %config.user_uid, friend = ?config.view_friend, "starting habits");
    let session = open_session(&config)?;
    print!("{}", render(&session));
    session.close();
    Ok(())
}
