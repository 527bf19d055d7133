use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use habit_core::habit::{FriendHabit, FriendSummary, Habit, HabitId};
use habit_core::observe::{ObserverId, Observers};
use habit_core::registry::{HabitDetails, HabitRegistry};
use habit_core::store::{decode, DocPath, DocumentStore, Snapshot, Subscription};
use habit_core::StreakEngine;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewTarget {
    /// The signed-in user's own page, including linked friend habits.
    Mine,
    Friend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Idle,
    LoadingOwn,
    LoadingFriend,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HabitOwner {
    Me,
    Friend(String),
}

/// One row of the aggregated habit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HabitInView {
    pub habit_id: HabitId,
    pub owner: HabitOwner,
    /// Own habit this friend habit is displayed under.
    pub linked_to: Option<HabitId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    StateChanged(ViewState),
    HabitsInViewChanged,
    FriendHabitUpdated(HabitId),
}

struct HabitListener {
    friend_uid: String,
    subscription: Subscription,
    /// First snapshot (or error) has been seen and the loading slot released.
    loaded: bool,
}

struct FriendPage {
    uid: String,
    details: Option<Subscription>,
    details_loaded: bool,
    order: Vec<HabitId>,
    /// Habits that failed to load on this page; not re-subscribed until the page is reopened.
    unavailable: HashSet<HabitId>,
}

/// Keeps the "habits in view" list in sync with remote habit documents.
///
/// Owns every per-habit subscription and the cache of friend habits. Each
/// habit id has at most one open subscription. Snapshots are applied when
/// [`HabitSubscriptionManager::process_events`] drains them.
pub struct HabitSubscriptionManager {
    store: Arc<dyn DocumentStore>,
    registry: Arc<RwLock<HabitRegistry>>,
    streaks: Arc<StreakEngine>,
    target: Option<ViewTarget>,
    state: ViewState,
    generation: u64,
    pending: Option<u64>,
    listeners: HashMap<HabitId, HabitListener>,
    friend_habits: HashMap<HabitId, FriendHabit>,
    friend_page: Option<FriendPage>,
    loading_count: usize,
    friends: Option<HashSet<String>>,
    habits_in_view: Vec<HabitInView>,
    observers: Observers<ViewEvent>,
}

impl HabitSubscriptionManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<RwLock<HabitRegistry>>,
        streaks: Arc<StreakEngine>,
    ) -> Self {
        Self {
            store,
            registry,
            streaks,
            target: None,
            state: ViewState::Idle,
            generation: 0,
            pending: None,
            listeners: HashMap::new(),
            friend_habits: HashMap::new(),
            friend_page: None,
            loading_count: 0,
            friends: None,
            habits_in_view: Vec::new(),
            observers: Observers::new(),
        }
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn target(&self) -> Option<&ViewTarget> {
        self.target.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn loading_count(&self) -> usize {
        self.loading_count
    }

    /// Open subscriptions for `habit_id`; always 0 or 1.
    pub fn listener_count(&self, habit_id: &str) -> usize {
        usize::from(self.listeners.contains_key(habit_id))
    }

    pub fn open_listeners(&self) -> usize {
        self.listeners.len()
    }

    pub fn habits_in_view(&self) -> &[HabitInView] {
        &self.habits_in_view
    }

    pub fn friend_habit(&self, habit_id: &str) -> Option<&FriendHabit> {
        self.friend_habits.get(habit_id)
    }

    /// Resolves a row to the habit value it shows.
    pub fn resolve(&self, entry: &HabitInView) -> Option<Habit> {
        match &entry.owner {
            HabitOwner::Me => self.registry.read().habit(&entry.habit_id).cloned(),
            HabitOwner::Friend(_) => self
                .friend_habits
                .get(&entry.habit_id)
                .map(|friend| friend.habit.clone()),
        }
    }

    pub fn subscribe(&mut self, callback: impl Fn(&ViewEvent) + Send + Sync + 'static) -> ObserverId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Replaces the friends list published by the social layer.
    pub fn set_friends(&mut self, friends: &[FriendSummary]) {
        self.friends = Some(friends.iter().map(|friend| friend.uid.clone()).collect());
        if self.state == ViewState::Ready {
            self.refresh_habits_in_view();
        }
    }

    /// Switches between "my page" (`None`) and a friend's page.
    ///
    /// Only the most recent call can complete loading; listeners the new view
    /// does not need are closed right away.
    #[instrument(skip(self))]
    pub fn view_user(&mut self, friend_uid: Option<&str>) {
        match friend_uid {
            None => self.view_own_page(),
            Some(uid) => self.view_friend_page(uid),
        }
    }

    /// Applies every queued snapshot. Returns how many were handled.
    pub fn process_events(&mut self) -> usize {
        let mut total = 0;
        loop {
            let mut handled = 0;

            let details = self
                .friend_page
                .as_ref()
                .and_then(|page| page.details.as_ref().map(|sub| (page.uid.clone(), sub.drain())));
            if let Some((uid, snapshots)) = details {
                for snapshot in snapshots {
                    handled += 1;
                    self.apply_details(&uid, snapshot);
                }
            }

            let ids: Vec<HabitId> = self.listeners.keys().cloned().collect();
            for id in ids {
                let Some(listener) = self.listeners.get(&id) else {
                    continue;
                };
                for snapshot in listener.subscription.drain() {
                    handled += 1;
                    self.apply_habit_snapshot(&id, snapshot);
                    if !self.listeners.contains_key(&id) {
                        break;
                    }
                }
            }

            if handled == 0 {
                break;
            }
            total += handled;
        }
        total
    }

    /// Rebuilds the aggregated list for the current target.
    ///
    /// On "my page" each own habit is followed by the friend habits linked to
    /// it, oldest link first. Links to users who are no longer friends are
    /// removed first.
    pub fn refresh_habits_in_view(&mut self) {
        self.prune_links_to_non_friends();

        let mut rows = Vec::new();
        match &self.target {
            Some(ViewTarget::Mine) => {
                let registry = self.registry.read();
                for id in registry.order() {
                    if registry.habit(id).is_none() {
                        continue;
                    }
                    rows.push(HabitInView {
                        habit_id: id.clone(),
                        owner: HabitOwner::Me,
                        linked_to: None,
                    });
                    for link in registry.links_anchored_to(id) {
                        if let Some(friend) = self.friend_habits.get(&link.friend_habit_id) {
                            rows.push(HabitInView {
                                habit_id: link.friend_habit_id.clone(),
                                owner: HabitOwner::Friend(friend.friend_uid.clone()),
                                linked_to: Some(id.clone()),
                            });
                        }
                    }
                }
            }
            Some(ViewTarget::Friend(uid)) => {
                if let Some(page) = self.friend_page.as_ref() {
                    for id in &page.order {
                        if let Some(friend) = self.friend_habits.get(id) {
                            if &friend.friend_uid == uid {
                                rows.push(HabitInView {
                                    habit_id: id.clone(),
                                    owner: HabitOwner::Friend(uid.clone()),
                                    linked_to: None,
                                });
                            }
                        }
                    }
                }
            }
            None => {}
        }

        self.habits_in_view = rows;
        self.observers.notify(&ViewEvent::HabitsInViewChanged);
    }

    /// Closes listeners whose link is gone and that the open friend page does
    /// not show. Returns how many were closed.
    pub fn release_unlinked(&mut self) -> usize {
        let linked = self.linked_ids();
        let shown: HashSet<HabitId> = self
            .friend_page
            .as_ref()
            .map(|page| page.order.iter().cloned().collect())
            .unwrap_or_default();
        let stale: Vec<HabitId> = self
            .listeners
            .keys()
            .filter(|id| !linked.contains(*id) && !shown.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            debug!(habit_id = %id, "closing listener for removed link");
            self.remove_listener(id);
        }
        if !stale.is_empty() && self.pending.is_none() {
            self.refresh_habits_in_view();
        }
        self.try_complete();
        stale.len()
    }

    /// Closes every subscription and returns to idle.
    pub fn close(&mut self) {
        self.generation += 1;
        self.pending = None;
        self.target = None;
        self.close_friend_page();
        let ids: Vec<HabitId> = self.listeners.keys().cloned().collect();
        for id in ids {
            self.remove_listener(&id);
        }
        self.habits_in_view.clear();
        self.set_state(ViewState::Idle);
    }
}

impl HabitSubscriptionManager {
    fn view_own_page(&mut self) {
        self.generation += 1;
        self.target = Some(ViewTarget::Mine);
        self.close_friend_page();

        let links: Vec<(HabitId, String)> = self
            .registry
            .read()
            .linked_habits()
            .values()
            .map(|link| (link.friend_habit_id.clone(), link.friend_uid.clone()))
            .collect();
        let linked: HashSet<&HabitId> = links.iter().map(|(id, _)| id).collect();
        let stale: Vec<HabitId> = self
            .listeners
            .keys()
            .filter(|id| !linked.contains(id))
            .cloned()
            .collect();
        for id in stale {
            self.remove_listener(&id);
        }
        for (habit_id, friend_uid) in &links {
            self.ensure_listener(friend_uid, habit_id);
        }

        debug!(links = links.len(), generation = self.generation, "viewing own page");
        self.pending = Some(self.generation);
        self.set_state(ViewState::LoadingOwn);
        self.try_complete();
    }

    fn view_friend_page(&mut self, uid: &str) {
        if self.target == Some(ViewTarget::Friend(uid.to_string())) {
            return;
        }
        self.generation += 1;
        self.target = Some(ViewTarget::Friend(uid.to_string()));
        self.close_friend_page();

        let linked = self.linked_ids();
        let stale: Vec<HabitId> = self
            .listeners
            .keys()
            .filter(|id| !linked.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            self.remove_listener(&id);
        }

        let details = self.store.subscribe(&DocPath::habit_details(uid));
        self.friend_page = Some(FriendPage {
            uid: uid.to_string(),
            details: Some(details),
            details_loaded: false,
            order: Vec::new(),
            unavailable: HashSet::new(),
        });

        debug!(friend_uid = %uid, generation = self.generation, "viewing friend page");
        self.pending = Some(self.generation);
        self.habits_in_view.clear();
        self.observers.notify(&ViewEvent::HabitsInViewChanged);
        self.set_state(ViewState::LoadingFriend);
    }

    fn apply_details(&mut self, uid: &str, snapshot: Snapshot) {
        let path = DocPath::habit_details(uid);
        let details = match snapshot {
            Snapshot::Document(Some(value)) => match decode::<HabitDetails>(&path, value) {
                Ok(details) => details,
                Err(err) => {
                    warn!(friend_uid = %uid, %err, "unreadable friend habit details");
                    HabitDetails::default()
                }
            },
            Snapshot::Document(None) => {
                debug!(friend_uid = %uid, "friend has no habit details");
                HabitDetails::default()
            }
            Snapshot::Error(err) => {
                warn!(friend_uid = %uid, %err, "friend habit details unavailable");
                if let Some(subscription) = self.friend_page.as_mut().and_then(|page| page.details.take()) {
                    subscription.unsubscribe();
                }
                HabitDetails::default()
            }
        };

        let public: HashSet<HabitId> = details
            .active_ids
            .public
            .iter()
            .filter(|(_, active)| **active)
            .map(|(id, _)| id.clone())
            .collect();
        let unavailable = self
            .friend_page
            .as_ref()
            .map(|page| page.unavailable.clone())
            .unwrap_or_default();
        let mut order: Vec<HabitId> = details
            .order
            .into_iter()
            .filter(|id| public.contains(id) && !unavailable.contains(id))
            .collect();
        let mut unordered: Vec<HabitId> = public
            .iter()
            .filter(|id| !order.contains(id) && !unavailable.contains(*id))
            .cloned()
            .collect();
        unordered.sort();
        order.extend(unordered);

        let linked = self.linked_ids();
        let hidden: Vec<HabitId> = self
            .listeners
            .iter()
            .filter(|(id, listener)| {
                listener.friend_uid == uid && !public.contains(*id) && !linked.contains(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in hidden {
            debug!(habit_id = %id, "friend habit no longer public");
            self.remove_listener(&id);
        }
        for id in &order {
            self.ensure_listener(uid, id);
        }

        if let Some(page) = self.friend_page.as_mut() {
            page.order = order;
            page.details_loaded = true;
        }
        if self.pending.is_none() {
            self.refresh_habits_in_view();
        }
        self.try_complete();
    }

    fn apply_habit_snapshot(&mut self, habit_id: &str, snapshot: Snapshot) {
        let path = match self.listeners.get(habit_id) {
            Some(listener) => DocPath::habit(&listener.friend_uid, habit_id),
            None => return,
        };
        let habit = match snapshot {
            Snapshot::Document(Some(value)) => match decode::<Habit>(&path, value) {
                Ok(habit) if !habit.archived => Some(habit),
                Ok(_) => {
                    debug!(%path, "friend habit archived");
                    None
                }
                Err(err) => {
                    warn!(%path, %err, "unreadable friend habit, keeping its link");
                    self.hide_habit(habit_id);
                    return;
                }
            },
            Snapshot::Document(None) => {
                debug!(%path, "friend habit missing");
                None
            }
            Snapshot::Error(err) => {
                debug!(%path, %err, "friend habit subscription failed");
                None
            }
        };

        let Some(mut habit) = habit else {
            self.drop_unavailable(habit_id);
            return;
        };
        habit.id = habit_id.to_string();
        self.streaks.refresh_streak(&habit);

        let Some(listener) = self.listeners.get_mut(habit_id) else {
            return;
        };
        let friend_uid = listener.friend_uid.clone();
        if !listener.loaded {
            listener.loaded = true;
            self.loading_count = self.loading_count.saturating_sub(1);
        }

        match self.friend_habits.get_mut(habit_id) {
            Some(existing) => {
                existing.habit = habit;
                self.observers
                    .notify(&ViewEvent::FriendHabitUpdated(habit_id.to_string()));
            }
            None => {
                self.friend_habits
                    .insert(habit_id.to_string(), FriendHabit { habit, friend_uid });
                if self.pending.is_none() {
                    self.refresh_habits_in_view();
                }
            }
        }
        self.try_complete();
    }

    /// A friend habit we can no longer read: forget it and any link to it.
    fn drop_unavailable(&mut self, habit_id: &str) {
        info!(habit_id = %habit_id, "friend habit unavailable");
        let unlinked = self.registry.write().unlink_habit(habit_id);
        if let Err(err) = unlinked {
            warn!(habit_id = %habit_id, %err, "failed to remove stale link");
        }
        self.hide_habit(habit_id);
    }

    /// Closes the habit's listener and keeps it out of the current friend page.
    fn hide_habit(&mut self, habit_id: &str) {
        let owner = self
            .listeners
            .get(habit_id)
            .map(|listener| listener.friend_uid.clone());
        if let (Some(owner), Some(page)) = (owner, self.friend_page.as_mut()) {
            if page.uid == owner {
                page.order.retain(|id| id != habit_id);
                page.unavailable.insert(habit_id.to_string());
            }
        }
        self.remove_listener(habit_id);
        if self.pending.is_none() {
            self.refresh_habits_in_view();
        }
        self.try_complete();
    }

    fn try_complete(&mut self) {
        let Some(generation) = self.pending else {
            return;
        };
        if generation != self.generation || self.loading_count > 0 {
            return;
        }
        if let Some(ViewTarget::Friend(_)) = self.target {
            let loaded = self
                .friend_page
                .as_ref()
                .map(|page| page.details_loaded)
                .unwrap_or(false);
            if !loaded {
                return;
            }
        }
        self.pending = None;
        self.refresh_habits_in_view();
        self.set_state(ViewState::Ready);
        info!(rows = self.habits_in_view.len(), "habits in view ready");
    }

    fn ensure_listener(&mut self, friend_uid: &str, habit_id: &str) {
        if self.listeners.contains_key(habit_id) {
            return;
        }
        let subscription = self.store.subscribe(&DocPath::habit(friend_uid, habit_id));
        self.loading_count += 1;
        self.listeners.insert(
            habit_id.to_string(),
            HabitListener {
                friend_uid: friend_uid.to_string(),
                subscription,
                loaded: false,
            },
        );
    }

    fn remove_listener(&mut self, habit_id: &str) {
        let Some(listener) = self.listeners.remove(habit_id) else {
            return;
        };
        if !listener.loaded {
            self.loading_count = self.loading_count.saturating_sub(1);
        }
        listener.subscription.unsubscribe();
        self.friend_habits.remove(habit_id);
        self.streaks.forget(habit_id);
    }

    fn close_friend_page(&mut self) {
        if let Some(page) = self.friend_page.take() {
            if let Some(details) = page.details {
                details.unsubscribe();
            }
        }
    }

    fn linked_ids(&self) -> HashSet<HabitId> {
        self.registry.read().linked_habits().keys().cloned().collect()
    }

    fn prune_links_to_non_friends(&mut self) {
        let Some(friends) = self.friends.as_ref() else {
            return;
        };
        let stale: Vec<(HabitId, String)> = self
            .registry
            .read()
            .linked_habits()
            .values()
            .filter(|link| !friends.contains(&link.friend_uid))
            .map(|link| (link.friend_habit_id.clone(), link.friend_uid.clone()))
            .collect();

        for (habit_id, friend_uid) in stale {
            info!(habit_id = %habit_id, friend_uid = %friend_uid, "dropping link to former friend");
            if let Err(err) = self.registry.write().unlink_habit(&habit_id) {
                warn!(habit_id = %habit_id, %err, "failed to remove link");
            }
            let shown_on_page = self
                .friend_page
                .as_ref()
                .map(|page| page.uid == friend_uid && page.order.contains(&habit_id))
                .unwrap_or(false);
            if !shown_on_page {
                self.remove_listener(&habit_id);
            }
        }
    }

    fn set_state(&mut self, state: ViewState) {
        if self.state != state {
            self.state = state;
            self.observers.notify(&ViewEvent::StateChanged(state));
        }
    }
}

impl Drop for HabitSubscriptionManager {
    fn drop(&mut self) {
        self.close_friend_page();
        for (_, listener) in self.listeners.drain() {
            listener.subscription.unsubscribe();
        }
    }
}
