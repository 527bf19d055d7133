use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::date::week_start;
use crate::error::HabitError;
use crate::habit::HabitId;
use crate::observe::{ObserverId, Observers};
use crate::store::{read_document, DocPath, DocumentStore, FieldPath};

/// Monday = 0 .. Sunday = 6.
pub type Weekday = u8;
pub type NoteId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NoteMeta {
    pub habit_id: HabitId,
    pub weekday: Weekday,
    pub created_at: DateTime<Utc>,
}

/// Contents of one week document. Absent entries mean "no data"; empty
/// containers are removed rather than stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct WeekData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub trackers: BTreeMap<HabitId, BTreeMap<Weekday, String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub focused_time: BTreeMap<HabitId, BTreeMap<Weekday, u32>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub notes: BTreeMap<HabitId, Vec<NoteId>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub note_metadata: BTreeMap<NoteId, NoteMeta>,
}

impl WeekData {
    pub fn has_data(&self, habit_id: &str, mode: ViewMode) -> bool {
        match mode {
            ViewMode::Trackers => self.trackers.contains_key(habit_id),
            ViewMode::FocusedTime => self.focused_time.contains_key(habit_id),
            ViewMode::Notes => self.notes.contains_key(habit_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ViewMode {
    #[default]
    Trackers,
    FocusedTime,
    Notes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeekEvent {
    WeekChanged(NaiveDate),
    LoadingChanged(bool),
    DataChanged(HabitId),
}

/// Per-week tracker statuses, focused time and notes for the habits in view.
pub struct WeekView {
    store: Arc<dyn DocumentStore>,
    owner_uid: String,
    start: Option<NaiveDate>,
    data: WeekData,
    loading: bool,
    latest_week: NaiveDate,
    mode: ViewMode,
    observers: Observers<WeekEvent>,
}

impl WeekView {
    pub fn new(store: Arc<dyn DocumentStore>, owner_uid: impl Into<String>, latest_week: NaiveDate) -> Self {
        Self {
            store,
            owner_uid: owner_uid.into(),
            start: None,
            data: WeekData::default(),
            loading: false,
            latest_week: week_start(latest_week),
            mode: ViewMode::default(),
            observers: Observers::new(),
        }
    }

    pub fn start(&self) -> Option<NaiveDate> {
        self.start
    }

    pub fn data(&self) -> &WeekData {
        &self.data
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn latest_week(&self) -> NaiveDate {
        self.latest_week
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ViewMode) {
        self.mode = mode;
    }

    pub fn subscribe(&mut self, callback: impl Fn(&WeekEvent) + Send + Sync + 'static) -> ObserverId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Switches to the week containing `date`.
    ///
    /// Viewers immediately see an empty week (with `cached_icon` if given)
    /// while the document loads. A week later than the latest known one gets
    /// its document created on first view.
    #[instrument(skip(self))]
    pub fn view_week(&mut self, date: NaiveDate, cached_icon: Option<String>) -> Result<()> {
        let start = week_start(date);
        if self.start == Some(start) {
            return Ok(());
        }
        self.start = Some(start);
        self.data = WeekData {
            icon: cached_icon,
            ..WeekData::default()
        };
        self.set_loading(true);
        self.observers.notify(&WeekEvent::WeekChanged(start));

        let result = self.fetch_week(start);
        self.set_loading(false);
        result
    }

    pub fn set_tracker_status(
        &mut self,
        habit_id: &str,
        weekday: Weekday,
        status: Option<&str>,
    ) -> Result<Option<String>> {
        check_weekday(weekday)?;
        let path = self.week_path()?;
        let existing = self
            .data
            .trackers
            .get(habit_id)
            .and_then(|days| days.get(&weekday))
            .cloned();
        if existing.as_deref() == status {
            return Ok(existing);
        }
        let Some(status) = status else {
            self.clear_tracker_status(habit_id, weekday)?;
            return Ok(None);
        };

        self.data
            .trackers
            .entry(habit_id.to_string())
            .or_default()
            .insert(weekday, status.to_string());
        self.observers.notify(&WeekEvent::DataChanged(habit_id.to_string()));

        let field = FieldPath::new(["trackers".to_string(), habit_id.to_string(), weekday.to_string()]);
        self.store
            .merge(&path, field.patch(json!(status)))
            .with_context(|| format!("failed to write tracker status to `{path}`"))?;
        Ok(Some(status.to_string()))
    }

    pub fn clear_tracker_status(&mut self, habit_id: &str, weekday: Weekday) -> Result<()> {
        check_weekday(weekday)?;
        let path = self.week_path()?;
        let Some(field) = remove_day(&mut self.data.trackers, "trackers", habit_id, weekday) else {
            return Ok(());
        };
        self.observers.notify(&WeekEvent::DataChanged(habit_id.to_string()));

        self.store
            .delete_fields(&path, &[field])
            .with_context(|| format!("failed to clear tracker status in `{path}`"))
    }

    /// Sets focused seconds for a day. Zero clears the entry.
    pub fn set_focused_time(&mut self, habit_id: &str, weekday: Weekday, seconds: u32) -> Result<u32> {
        check_weekday(weekday)?;
        let path = self.week_path()?;
        let existing = self.focused_time(habit_id, weekday);
        if existing == seconds {
            return Ok(existing);
        }
        if seconds == 0 {
            if let Some(field) = remove_day(&mut self.data.focused_time, "focusedTime", habit_id, weekday) {
                self.observers.notify(&WeekEvent::DataChanged(habit_id.to_string()));
                self.store
                    .delete_fields(&path, &[field])
                    .with_context(|| format!("failed to clear focused time in `{path}`"))?;
            }
            return Ok(0);
        }

        self.data
            .focused_time
            .entry(habit_id.to_string())
            .or_default()
            .insert(weekday, seconds);
        self.observers.notify(&WeekEvent::DataChanged(habit_id.to_string()));

        let field = FieldPath::new(["focusedTime".to_string(), habit_id.to_string(), weekday.to_string()]);
        self.store
            .merge(&path, field.patch(json!(seconds)))
            .with_context(|| format!("failed to write focused time to `{path}`"))?;
        Ok(seconds)
    }

    pub fn add_focused_time(&mut self, habit_id: &str, weekday: Weekday, seconds: u32) -> Result<u32> {
        let total = self.focused_time(habit_id, weekday).saturating_add(seconds);
        self.set_focused_time(habit_id, weekday, total)
    }

    pub fn focused_time(&self, habit_id: &str, weekday: Weekday) -> u32 {
        self.data
            .focused_time
            .get(habit_id)
            .and_then(|days| days.get(&weekday))
            .copied()
            .unwrap_or(0)
    }

    pub fn attach_note(&mut self, habit_id: &str, weekday: Weekday, note_id: &str) -> Result<()> {
        check_weekday(weekday)?;
        let path = self.week_path()?;
        let notes = self.data.notes.entry(habit_id.to_string()).or_default();
        if notes.iter().any(|existing| existing == note_id) {
            return Ok(());
        }
        notes.push(note_id.to_string());
        let meta = NoteMeta {
            habit_id: habit_id.to_string(),
            weekday,
            created_at: Utc::now(),
        };
        self.data.note_metadata.insert(note_id.to_string(), meta.clone());
        let patch = json!({
            "notes": { habit_id: notes.clone() },
            "noteMetadata": { note_id: meta },
        });
        self.observers.notify(&WeekEvent::DataChanged(habit_id.to_string()));

        self.store
            .merge(&path, patch)
            .with_context(|| format!("failed to attach note to `{path}`"))
    }

    /// Detaches `note_id` from the habit. Returns whether it was attached.
    pub fn detach_note(&mut self, habit_id: &str, note_id: &str) -> Result<bool> {
        let path = self.week_path()?;
        let Some(notes) = self.data.notes.get_mut(habit_id) else {
            return Ok(false);
        };
        let before = notes.len();
        notes.retain(|existing| existing != note_id);
        if notes.len() == before {
            return Ok(false);
        }
        let remaining = if notes.is_empty() {
            self.data.notes.remove(habit_id);
            None
        } else {
            Some(notes.clone())
        };
        self.data.note_metadata.remove(note_id);
        self.observers.notify(&WeekEvent::DataChanged(habit_id.to_string()));

        let mut deletes = vec![if self.data.note_metadata.is_empty() {
            FieldPath::new(["noteMetadata"])
        } else {
            FieldPath::new(["noteMetadata", note_id])
        }];
        match remaining {
            Some(notes) => {
                self.store
                    .merge(&path, json!({ "notes": { habit_id: notes } }))
                    .with_context(|| format!("failed to detach note in `{path}`"))?;
            }
            None if self.data.notes.is_empty() => deletes.push(FieldPath::new(["notes"])),
            None => deletes.push(FieldPath::new(["notes", habit_id])),
        }
        self.store
            .delete_fields(&path, &deletes)
            .with_context(|| format!("failed to detach note in `{path}`"))?;
        Ok(true)
    }

    pub fn is_latest_week(&self) -> bool {
        self.start == Some(self.latest_week)
    }

    pub fn habit_has_data(&self, habit_id: &str) -> bool {
        self.data.has_data(habit_id, self.mode)
    }

    /// Past weeks hide habits without data whenever the user has active habits.
    pub fn should_condense(&self, active_ids: &[HabitId]) -> bool {
        !self.is_latest_week() && !active_ids.is_empty()
    }

    /// The "show all" toggle only matters when some active habit is hidden.
    pub fn show_condense_toggle(&self, active_ids: &[HabitId]) -> bool {
        !self.is_latest_week() && active_ids.iter().any(|id| !self.habit_has_data(id))
    }

    pub fn visible_habit_ids(&self, in_view: &[HabitId], active_ids: &[HabitId], show_all: bool) -> Vec<HabitId> {
        if show_all || !self.should_condense(active_ids) {
            return in_view.to_vec();
        }
        in_view
            .iter()
            .filter(|id| self.habit_has_data(id))
            .cloned()
            .collect()
    }
}

impl WeekView {
    fn week_path(&self) -> Result<DocPath, HabitError> {
        self.start
            .map(|start| DocPath::week(&self.owner_uid, start))
            .ok_or(HabitError::NoWeekInView)
    }

    fn set_loading(&mut self, loading: bool) {
        if self.loading != loading {
            self.loading = loading;
            self.observers.notify(&WeekEvent::LoadingChanged(loading));
        }
    }

    fn fetch_week(&mut self, start: NaiveDate) -> Result<()> {
        let path = DocPath::week(&self.owner_uid, start);
        let fetched: Option<WeekData> = read_document(self.store.as_ref(), &path)
            .with_context(|| format!("failed to read `{path}`"))?;
        let exists = fetched.is_some();
        if let Some(data) = fetched {
            self.data = data;
        }
        debug!(%path, exists, "fetched week");

        if start > self.latest_week {
            info!(week = %start, "advancing latest week");
            self.latest_week = start;
            if !exists {
                self.store
                    .set(&path, json!({}))
                    .with_context(|| format!("failed to create `{path}`"))?;
            }
        }
        Ok(())
    }
}

fn check_weekday(weekday: Weekday) -> Result<(), HabitError> {
    if weekday > 6 {
        return Err(HabitError::InvalidWeekday(weekday));
    }
    Ok(())
}

/// Removes one day entry, dropping the habit's map and then the section once
/// empty. Returns the outermost field to delete remotely.
fn remove_day<V>(
    section: &mut BTreeMap<HabitId, BTreeMap<Weekday, V>>,
    section_name: &str,
    habit_id: &str,
    weekday: Weekday,
) -> Option<FieldPath> {
    let days = section.get_mut(habit_id)?;
    days.remove(&weekday)?;
    if days.is_empty() {
        section.remove(habit_id);
        if section.is_empty() {
            return Some(FieldPath::new([section_name]));
        }
        return Some(FieldPath::new([section_name, habit_id]));
    }
    Some(FieldPath::new([
        section_name.to_string(),
        habit_id.to_string(),
        weekday.to_string(),
    ]))
}
