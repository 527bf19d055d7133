use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::error::HabitError;
use crate::habit::{ArchivedHabit, Habit, HabitId, LinkedHabitRecord, Visibility};
use crate::observe::{ObserverId, Observers};
use crate::store::{read_document, DocPath, DocumentStore, FieldPath};

/// Contents of a user's habit details document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct HabitDetails {
    pub order: Vec<HabitId>,
    pub active_ids: ActiveIds,
    pub linked_habits: BTreeMap<HabitId, LinkedHabitRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActiveIds {
    pub public: BTreeMap<HabitId, bool>,
    pub private: BTreeMap<HabitId, bool>,
}

impl ActiveIds {
    pub fn bucket(&self, visibility: Visibility) -> &BTreeMap<HabitId, bool> {
        match visibility {
            Visibility::Public => &self.public,
            Visibility::Private => &self.private,
        }
    }

    /// Ids flagged active in either bucket.
    pub fn all(&self) -> impl Iterator<Item = &HabitId> {
        self.public
            .iter()
            .chain(self.private.iter())
            .filter(|(_, active)| **active)
            .map(|(id, _)| id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HabitChange {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    HabitSaved(HabitId),
    HabitRemoved(HabitId),
    OrderChanged,
    LinksChanged,
}

/// Canonical list and order of the habits owned by the signed-in user.
///
/// Every mutation updates the in-memory state first and then writes the
/// matching documents. A failed write is returned to the caller; the local
/// state keeps the new value.
pub struct HabitRegistry {
    store: Arc<dyn DocumentStore>,
    owner_uid: String,
    order: Vec<HabitId>,
    habits: HashMap<HabitId, Habit>,
    linked_habits: BTreeMap<HabitId, LinkedHabitRecord>,
    archived: Option<BTreeMap<HabitId, ArchivedHabit>>,
    observers: Observers<RegistryEvent>,
}

impl HabitRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, owner_uid: impl Into<String>) -> Self {
        Self {
            store,
            owner_uid: owner_uid.into(),
            order: Vec::new(),
            habits: HashMap::new(),
            linked_habits: BTreeMap::new(),
            archived: None,
            observers: Observers::new(),
        }
    }

    /// Loads active habits, order and links for `owner_uid`.
    ///
    /// Active habits missing from the persisted order are appended, and the
    /// healed order is written back.
    #[instrument(skip(store))]
    pub fn load(store: Arc<dyn DocumentStore>, owner_uid: &str) -> Result<Self> {
        let details_path = DocPath::habit_details(owner_uid);
        let details: HabitDetails = read_document(store.as_ref(), &details_path)
            .with_context(|| format!("failed to read `{details_path}`"))?
            .unwrap_or_default();

        let mut registry = Self::new(Arc::clone(&store), owner_uid);
        for id in details.active_ids.all() {
            let path = DocPath::habit(owner_uid, id);
            match read_document::<Habit>(store.as_ref(), &path) {
                Ok(Some(habit)) if !habit.archived => {
                    registry.habits.insert(id.clone(), habit);
                }
                Ok(Some(_)) => warn!(habit_id = %id, "active id points at an archived habit"),
                Ok(None) => warn!(habit_id = %id, "active id has no habit document"),
                Err(err) => warn!(habit_id = %id, %err, "skipping unreadable habit"),
            }
        }

        let mut order: Vec<HabitId> = details
            .order
            .iter()
            .filter(|id| registry.habits.contains_key(*id))
            .cloned()
            .collect();
        let mut missing: Vec<&Habit> = registry
            .habits
            .values()
            .filter(|habit| !order.contains(&habit.id))
            .collect();
        missing.sort_by(|a, b| a.creation_time.cmp(&b.creation_time).then_with(|| a.id.cmp(&b.id)));
        let missing: Vec<HabitId> = missing.into_iter().map(|habit| habit.id.clone()).collect();
        order.extend(missing.iter().cloned());
        registry.order = order;
        registry.linked_habits = details.linked_habits;

        if !missing.is_empty() {
            info!(count = missing.len(), "recovered habits missing from order");
        }
        if registry.order != details.order {
            registry.write_order()?;
        }
        info!(habits = registry.order.len(), links = registry.linked_habits.len(), "loaded habits");
        Ok(registry)
    }

    pub fn owner_uid(&self) -> &str {
        &self.owner_uid
    }

    pub fn order(&self) -> &[HabitId] {
        &self.order
    }

    pub fn habit(&self, id: &str) -> Option<&Habit> {
        self.habits.get(id)
    }

    /// Runs `edit` against a loaded habit. Observers see `HabitSaved` when the
    /// habit changed, whatever `edit` returns.
    pub fn update_habit<R>(&mut self, id: &str, edit: impl FnOnce(&mut Habit) -> R) -> Result<R, HabitError> {
        let habit = self
            .habits
            .get_mut(id)
            .ok_or_else(|| HabitError::UnknownHabit(id.to_string()))?;
        let before = habit.clone();
        let result = edit(habit);
        if *habit != before {
            self.observers.notify(&RegistryEvent::HabitSaved(id.to_string()));
        }
        Ok(result)
    }

    pub fn habits_in_order(&self) -> Vec<&Habit> {
        self.order.iter().filter_map(|id| self.habits.get(id)).collect()
    }

    pub fn active_ids(&self) -> Vec<HabitId> {
        self.order.clone()
    }

    pub fn linked_habits(&self) -> &BTreeMap<HabitId, LinkedHabitRecord> {
        &self.linked_habits
    }

    pub fn link_for(&self, friend_habit_id: &str) -> Option<&LinkedHabitRecord> {
        self.linked_habits.get(friend_habit_id)
    }

    /// Links displayed under `local_id`, oldest first.
    pub fn links_anchored_to(&self, local_id: &str) -> Vec<&LinkedHabitRecord> {
        let mut links: Vec<&LinkedHabitRecord> = self
            .linked_habits
            .values()
            .filter(|link| link.linked_habit_id == local_id)
            .collect();
        links.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.friend_habit_id.cmp(&b.friend_habit_id)));
        links
    }

    pub fn subscribe(&mut self, callback: impl Fn(&RegistryEvent) + Send + Sync + 'static) -> ObserverId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Inserts or updates `habit`. Returns `None` when nothing changed.
    pub fn set_habit(&mut self, habit: Habit) -> Result<Option<HabitChange>> {
        let id = habit.id.clone();
        let path = DocPath::habit(&self.owner_uid, &id);
        let document = serde_json::to_value(&habit).context("failed to encode habit")?;

        let Some(existing) = self.habits.get(&id) else {
            self.order.push(id.clone());
            let visibility = habit.visibility;
            self.habits.insert(id.clone(), habit);
            self.observers.notify(&RegistryEvent::HabitSaved(id.clone()));
            self.observers.notify(&RegistryEvent::OrderChanged);

            debug!(habit_id = %id, "creating habit");
            self.store
                .set(&path, document)
                .with_context(|| format!("failed to write `{path}`"))?;
            self.store
                .merge(
                    &self.details_path(),
                    json!({
                        "order": self.order,
                        "activeIds": { visibility.bucket(): { id.as_str(): true } },
                    }),
                )
                .context("failed to record new habit in details")?;
            return Ok(Some(HabitChange::Created));
        };

        if *existing == habit {
            return Ok(None);
        }
        let previous_visibility = existing.visibility;
        let visibility = habit.visibility;
        self.habits.insert(id.clone(), habit);
        self.observers.notify(&RegistryEvent::HabitSaved(id.clone()));

        debug!(habit_id = %id, "updating habit");
        self.store
            .set(&path, document)
            .with_context(|| format!("failed to write `{path}`"))?;
        if previous_visibility != visibility {
            self.move_bucket(&id, previous_visibility, visibility)?;
        }
        Ok(Some(HabitChange::Updated))
    }

    pub fn delete_habit_by_id(&mut self, id: &str) -> Result<()> {
        let habit = self
            .habits
            .remove(id)
            .ok_or_else(|| HabitError::UnknownHabit(id.to_string()))?;
        self.order.retain(|candidate| candidate != id);
        self.observers.notify(&RegistryEvent::HabitRemoved(id.to_string()));
        self.observers.notify(&RegistryEvent::OrderChanged);

        info!(habit_id = %id, "deleting habit");
        self.leave_active_set(id, habit.visibility)?;
        self.drop_links_anchored_to(id)?;
        let path = DocPath::habit(&self.owner_uid, id);
        self.store
            .delete(&path)
            .with_context(|| format!("failed to delete `{path}`"))?;
        Ok(())
    }

    /// Removes the habit from the active set while keeping its document, so
    /// statuses and week data stay addressable by id.
    pub fn archive_habit_by_id(&mut self, id: &str) -> Result<()> {
        let mut habit = self
            .habits
            .remove(id)
            .ok_or_else(|| HabitError::UnknownHabit(id.to_string()))?;
        habit.archived = true;
        self.order.retain(|candidate| candidate != id);
        let projection = ArchivedHabit {
            name: habit.name.clone(),
            icon: habit.icon.clone(),
            archive_time: Utc::now(),
        };
        if let Some(archived) = self.archived.as_mut() {
            archived.insert(id.to_string(), projection.clone());
        }
        self.observers.notify(&RegistryEvent::HabitRemoved(id.to_string()));
        self.observers.notify(&RegistryEvent::OrderChanged);

        info!(habit_id = %id, "archiving habit");
        self.leave_active_set(id, habit.visibility)?;
        self.drop_links_anchored_to(id)?;
        self.store
            .merge(
                &DocPath::archived_habits(&self.owner_uid),
                json!({ id: projection }),
            )
            .context("failed to record archived habit")?;
        let path = DocPath::habit(&self.owner_uid, id);
        self.store
            .merge(&path, json!({ "archived": true }))
            .with_context(|| format!("failed to mark `{path}` archived"))?;
        Ok(())
    }

    pub fn restore_archived_habit_by_id(&mut self, id: &str) -> Result<()> {
        let path = DocPath::habit(&self.owner_uid, id);
        let mut habit: Habit = read_document(self.store.as_ref(), &path)
            .with_context(|| format!("failed to read `{path}`"))?
            .ok_or_else(|| HabitError::UnknownHabit(id.to_string()))?;
        if !habit.archived || self.habits.contains_key(id) {
            return Err(HabitError::NotArchived(id.to_string()).into());
        }
        habit.archived = false;
        let visibility = habit.visibility;
        self.order.push(id.to_string());
        self.habits.insert(id.to_string(), habit);
        if let Some(archived) = self.archived.as_mut() {
            archived.remove(id);
        }
        self.observers.notify(&RegistryEvent::HabitSaved(id.to_string()));
        self.observers.notify(&RegistryEvent::OrderChanged);

        info!(habit_id = %id, "restoring archived habit");
        self.store
            .merge(&path, json!({ "archived": false }))
            .with_context(|| format!("failed to unarchive `{path}`"))?;
        self.store
            .merge(
                &self.details_path(),
                json!({
                    "order": self.order,
                    "activeIds": { visibility.bucket(): { id: true } },
                }),
            )
            .context("failed to record restored habit in details")?;
        self.store
            .delete_fields(&DocPath::archived_habits(&self.owner_uid), &[FieldPath::new([id])])
            .context("failed to drop archived projection")?;
        Ok(())
    }

    /// Archived habit projections, read from the store on first use.
    pub fn archived_habits(&mut self) -> Result<&BTreeMap<HabitId, ArchivedHabit>> {
        if self.archived.is_none() {
            let path = DocPath::archived_habits(&self.owner_uid);
            let loaded: BTreeMap<HabitId, ArchivedHabit> = read_document(self.store.as_ref(), &path)
                .with_context(|| format!("failed to read `{path}`"))?
                .unwrap_or_default();
            debug!(count = loaded.len(), "loaded archived habits");
            self.archived = Some(loaded);
        }
        Ok(self.archived.get_or_insert_with(BTreeMap::new))
    }

    /// Moves `moved` into the slot currently held by `target`.
    pub fn reorder_habits(&mut self, moved: &str, target: &str) -> Result<()> {
        let from = self.position(moved)?;
        let to = self.position(target)?;
        if from == to {
            return Ok(());
        }
        let id = self.order.remove(from);
        self.order.insert(to, id);
        self.observers.notify(&RegistryEvent::OrderChanged);
        self.write_order()
    }

    pub fn link_habit(
        &mut self,
        local_id: &str,
        friend_uid: &str,
        friend_habit_id: &str,
    ) -> Result<LinkedHabitRecord> {
        if !self.habits.contains_key(local_id) {
            return Err(HabitError::UnknownHabit(local_id.to_string()).into());
        }
        let record = LinkedHabitRecord {
            friend_habit_id: friend_habit_id.to_string(),
            friend_uid: friend_uid.to_string(),
            linked_habit_id: local_id.to_string(),
            time: Utc::now(),
        };
        self.linked_habits
            .insert(friend_habit_id.to_string(), record.clone());
        self.observers.notify(&RegistryEvent::LinksChanged);

        debug!(habit_id = %local_id, %friend_uid, %friend_habit_id, "linking habit");
        self.store
            .merge(
                &self.details_path(),
                json!({ "linkedHabits": { friend_habit_id: record } }),
            )
            .context("failed to record habit link")?;
        Ok(record)
    }

    /// Removes the link to `friend_habit_id`. Returns whether a link existed.
    pub fn unlink_habit(&mut self, friend_habit_id: &str) -> Result<bool> {
        if self.linked_habits.remove(friend_habit_id).is_none() {
            return Ok(false);
        }
        self.observers.notify(&RegistryEvent::LinksChanged);

        debug!(%friend_habit_id, "unlinking habit");
        self.store
            .delete_fields(
                &self.details_path(),
                &[FieldPath::new(["linkedHabits", friend_habit_id])],
            )
            .context("failed to remove habit link")?;
        Ok(true)
    }
}

impl HabitRegistry {
    fn details_path(&self) -> DocPath {
        DocPath::habit_details(&self.owner_uid)
    }

    fn position(&self, id: &str) -> Result<usize, HabitError> {
        self.order
            .iter()
            .position(|candidate| candidate == id)
            .ok_or_else(|| HabitError::UnknownHabit(id.to_string()))
    }

    fn write_order(&self) -> Result<()> {
        self.store
            .merge(&self.details_path(), json!({ "order": self.order }))
            .context("failed to write habit order")
    }

    fn move_bucket(&self, id: &str, from: Visibility, to: Visibility) -> Result<()> {
        let details = self.details_path();
        self.store
            .merge(&details, json!({ "activeIds": { to.bucket(): { id: true } } }))
            .context("failed to add habit to visibility bucket")?;
        self.store
            .delete_fields(&details, &[FieldPath::new(["activeIds", from.bucket(), id])])
            .context("failed to remove habit from visibility bucket")
    }

    fn leave_active_set(&self, id: &str, visibility: Visibility) -> Result<()> {
        let details = self.details_path();
        self.store
            .merge(&details, json!({ "order": self.order }))
            .context("failed to write habit order")?;
        self.store
            .delete_fields(&details, &[FieldPath::new(["activeIds", visibility.bucket(), id])])
            .context("failed to remove habit from visibility bucket")
    }

    fn drop_links_anchored_to(&mut self, local_id: &str) -> Result<()> {
        let stale: Vec<HabitId> = self
            .links_anchored_to(local_id)
            .into_iter()
            .map(|link| link.friend_habit_id.clone())
            .collect();
        for friend_habit_id in stale {
            self.unlink_habit(&friend_habit_id)?;
        }
        Ok(())
    }
}
