use std::sync::Arc;

use chrono::NaiveDate;
use habit_core::clock::FixedClock;
use habit_core::date::YearAndDay;
use habit_core::habit::{FriendSummary, Habit, Streak, Visibility};
use habit_core::memory::MemoryStore;
use habit_core::store::{DocPath, DocumentStore};
use habit_sync::{HabitOwner, HabitSession, ViewEvent, ViewState};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 6).unwrap()
}

fn friend(uid: &str) -> FriendSummary {
    FriendSummary {
        uid: uid.to_string(),
        display_name: uid.to_uppercase(),
    }
}

/// Writes a public habit for `owner` and lists it in their details document.
fn publish(store: &MemoryStore, owner: &str, habit: Habit) {
    let id = habit.id.clone();
    let habit = habit.with_visibility(Visibility::Public);
    store
        .set(&DocPath::habit(owner, &id), serde_json::to_value(&habit).unwrap())
        .unwrap();
    let details = DocPath::habit_details(owner);
    let mut order: Vec<String> = store
        .document(&details)
        .and_then(|doc| serde_json::from_value(doc["order"].clone()).ok())
        .unwrap_or_default();
    order.push(id.clone());
    store
        .merge(
            &details,
            json!({ "order": order, "activeIds": { "public": { id.as_str(): true } } }),
        )
        .unwrap();
}

fn open_session(store: &Arc<MemoryStore>) -> HabitSession {
    HabitSession::open(store.clone(), Arc::new(FixedClock(today())), "me").unwrap()
}

fn row_ids(session: &HabitSession) -> Vec<String> {
    session
        .subscriptions()
        .habits_in_view()
        .iter()
        .map(|row| row.habit_id.clone())
        .collect()
}

#[test]
fn own_page_interleaves_linked_habits_after_their_anchor() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun").with_frequency(7));
    publish(&store, "ben", Habit::new("Jog", "🏃").with_id("gJog"));

    let mut session = open_session(&store);
    session.save_habit(Habit::new("Run", "🏃").with_id("run")).unwrap();
    session.save_habit(Habit::new("Read", "📚").with_id("read")).unwrap();
    session.link_habit("run", "ana", "fRun").unwrap();
    session.link_habit("run", "ben", "gJog").unwrap();

    session.view_user(None);

    assert_eq!(session.subscriptions().state(), ViewState::Ready);
    assert_eq!(row_ids(&session), vec!["run", "fRun", "gJog", "read"]);
    let rows = session.subscriptions().habits_in_view();
    assert_eq!(rows[1].owner, HabitOwner::Friend("ana".into()));
    assert_eq!(rows[1].linked_to.as_deref(), Some("run"));
    assert_eq!(session.subscriptions().loading_count(), 0);
}

#[test]
fn viewing_own_page_twice_keeps_one_listener_per_habit() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    let mut session = open_session(&store);
    session.save_habit(Habit::new("Run", "🏃").with_id("run")).unwrap();
    session.link_habit("run", "ana", "fRun").unwrap();

    session.view_user(None);
    session.view_user(None);

    assert_eq!(session.subscriptions().listener_count("fRun"), 1);
    assert_eq!(store.listener_count(&DocPath::habit("ana", "fRun")), 1);
    assert_eq!(session.subscriptions().state(), ViewState::Ready);
}

#[test]
fn removed_friend_drops_link_and_subscription() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    let mut session = open_session(&store);
    session.save_habit(Habit::new("Run", "🏃").with_id("run")).unwrap();
    session.link_habit("run", "ana", "fRun").unwrap();
    session.set_friends(&[friend("ana")]);
    session.view_user(None);
    assert_eq!(row_ids(&session), vec!["run", "fRun"]);

    session.set_friends(&[]);
    session.subscriptions_mut().refresh_habits_in_view();

    assert_eq!(row_ids(&session), vec!["run"]);
    assert!(session.registry().read().link_for("fRun").is_none());
    assert_eq!(session.subscriptions().listener_count("fRun"), 0);
    assert_eq!(store.listener_count(&DocPath::habit("ana", "fRun")), 0);
    let details = store.document(&DocPath::habit_details("me")).unwrap();
    assert!(details["linkedHabits"].get("fRun").is_none());
}

#[test]
fn friend_habit_becoming_inaccessible_unlinks_it() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    let mut session = open_session(&store);
    session.save_habit(Habit::new("Run", "🏃").with_id("run")).unwrap();
    session.link_habit("run", "ana", "fRun").unwrap();
    session.view_user(None);

    store.deny(&DocPath::habit("ana", "fRun"));
    session.pump();

    assert_eq!(row_ids(&session), vec!["run"]);
    assert!(session.registry().read().link_for("fRun").is_none());
    assert_eq!(session.subscriptions().listener_count("fRun"), 0);
}

#[test]
fn archived_friend_habit_counts_toward_readiness_but_is_hidden() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    publish(&store, "ana", Habit::new("Swim", "🏊").with_id("fSwim"));
    store
        .merge(&DocPath::habit("ana", "fSwim"), json!({ "archived": true }))
        .unwrap();

    let mut session = open_session(&store);
    session.view_user(Some("ana"));

    assert_eq!(session.subscriptions().state(), ViewState::Ready);
    assert_eq!(session.subscriptions().loading_count(), 0);
    assert_eq!(row_ids(&session), vec!["fRun"]);
    assert_eq!(session.subscriptions().listener_count("fSwim"), 0);
}

#[test]
fn friend_page_waits_for_details_and_every_habit() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    publish(&store, "ana", Habit::new("Swim", "🏊").with_id("fSwim"));
    let mut session = open_session(&store);

    session.subscriptions_mut().view_user(Some("ana"));
    assert_eq!(session.subscriptions().state(), ViewState::LoadingFriend);
    assert!(row_ids(&session).is_empty());

    session.pump();

    assert_eq!(session.subscriptions().state(), ViewState::Ready);
    assert_eq!(row_ids(&session), vec!["fRun", "fSwim"]);
}

#[test]
fn switching_friends_before_load_shows_only_the_last_friend() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    publish(&store, "ben", Habit::new("Jog", "🏃").with_id("fJog"));
    let mut session = open_session(&store);

    session.subscriptions_mut().view_user(Some("ana"));
    session.subscriptions_mut().view_user(Some("ben"));
    session.pump();

    assert_eq!(session.subscriptions().state(), ViewState::Ready);
    assert_eq!(row_ids(&session), vec!["fJog"]);
    assert!(session.subscriptions().friend_habit("fRun").is_none());
    assert_eq!(store.listener_count(&DocPath::habit_details("ana")), 0);
    assert_eq!(store.listener_count(&DocPath::habit("ana", "fRun")), 0);
}

#[test]
fn switching_friends_drops_late_snapshots_from_previous_friend() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    publish(&store, "ben", Habit::new("Jog", "🏃").with_id("fJog"));
    let mut session = open_session(&store);
    session.view_user(Some("ana"));
    assert_eq!(row_ids(&session), vec!["fRun"]);

    store
        .merge(&DocPath::habit("ana", "fRun"), json!({ "name": "Sprint" }))
        .unwrap();
    session.subscriptions_mut().view_user(Some("ben"));
    session.pump();

    assert_eq!(row_ids(&session), vec!["fJog"]);
    assert_eq!(session.subscriptions().open_listeners(), 1);
    assert_eq!(store.total_listeners(), 2);
}

#[test]
fn viewing_same_friend_again_is_a_noop() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    let mut session = open_session(&store);
    session.view_user(Some("ana"));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session
        .subscriptions_mut()
        .subscribe(move |event| sink.lock().push(event.clone()));

    session.view_user(Some("ana"));

    assert!(events.lock().is_empty());
    assert_eq!(store.listener_count(&DocPath::habit_details("ana")), 1);
}

#[test]
fn friend_updates_apply_in_place_and_refresh_streaks() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun").with_frequency(7));
    let mut session = open_session(&store);
    session.view_user(Some("ana"));
    assert_eq!(session.streaks().streak("fRun"), Streak::disabled());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session
        .subscriptions_mut()
        .subscribe(move |event| sink.lock().push(event.clone()));
    let day = YearAndDay::from(today());
    store
        .merge(
            &DocPath::habit("ana", "fRun"),
            json!({ "statuses": { day.year.to_string(): { day.day_of_year.to_string(): "✅" } } }),
        )
        .unwrap();
    session.pump();

    assert_eq!(*events.lock(), vec![ViewEvent::FriendHabitUpdated("fRun".into())]);
    assert_eq!(
        session.streaks().streak("fRun"),
        Streak {
            count: 1,
            is_pending: false
        }
    );
    assert_eq!(row_ids(&session), vec!["fRun"]);
}

#[test]
fn friend_making_habit_private_removes_it_from_their_page() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    publish(&store, "ana", Habit::new("Swim", "🏊").with_id("fSwim"));
    let mut session = open_session(&store);
    session.view_user(Some("ana"));

    store
        .merge(
            &DocPath::habit_details("ana"),
            json!({ "activeIds": { "public": { "fSwim": false } } }),
        )
        .unwrap();
    session.pump();

    assert_eq!(row_ids(&session), vec!["fRun"]);
    assert_eq!(store.listener_count(&DocPath::habit("ana", "fSwim")), 0);
}

#[test]
fn returning_home_keeps_only_linked_listeners() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    publish(&store, "ana", Habit::new("Swim", "🏊").with_id("fSwim"));
    let mut session = open_session(&store);
    session.save_habit(Habit::new("Run", "🏃").with_id("run")).unwrap();
    session.link_habit("run", "ana", "fRun").unwrap();
    session.view_user(Some("ana"));
    assert_eq!(session.subscriptions().open_listeners(), 2);

    session.view_user(None);

    assert_eq!(session.subscriptions().open_listeners(), 1);
    assert_eq!(session.subscriptions().listener_count("fRun"), 1);
    assert_eq!(store.listener_count(&DocPath::habit_details("ana")), 0);
    assert_eq!(row_ids(&session), vec!["run", "fRun"]);
}

#[test]
fn own_status_writes_flow_through_session() {
    let store = Arc::new(MemoryStore::new());
    let mut session = open_session(&store);
    session
        .save_habit(Habit::new("Read", "📚").with_id("read").with_frequency(7))
        .unwrap();
    session.view_user(None);

    let day = YearAndDay::from(today());
    session.set_habit_status("read", day, Some("🌟")).unwrap();

    let rows = session.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].streak, Streak { count: 1, is_pending: false });
    assert!(session.set_habit_status("missing", day, Some("🌟")).is_err());
}

#[test]
fn close_releases_every_subscription() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    let mut session = open_session(&store);
    session.view_user(Some("ana"));
    assert!(store.total_listeners() > 0);

    session.close();

    assert_eq!(store.total_listeners(), 0);
}

fn own_page_linked_to_ana(store: &Arc<MemoryStore>) -> HabitSession {
    publish(store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    let mut session = open_session(store);
    session.save_habit(Habit::new("Run", "🏃").with_id("run")).unwrap();
    session.link_habit("run", "ana", "fRun").unwrap();
    session.view_user(None);
    assert_eq!(row_ids(&session), vec!["run", "fRun"]);
    session
}

#[test]
fn deleting_anchor_habit_closes_linked_subscription() {
    let store = Arc::new(MemoryStore::new());
    let mut session = own_page_linked_to_ana(&store);

    session.delete_habit("run").unwrap();

    assert!(session.registry().read().link_for("fRun").is_none());
    assert_eq!(session.subscriptions().listener_count("fRun"), 0);
    assert!(session.subscriptions().friend_habit("fRun").is_none());
    assert_eq!(store.listener_count(&DocPath::habit("ana", "fRun")), 0);
    assert!(row_ids(&session).is_empty());
}

#[test]
fn archiving_anchor_habit_closes_linked_subscription() {
    let store = Arc::new(MemoryStore::new());
    let mut session = own_page_linked_to_ana(&store);

    session.archive_habit("run").unwrap();

    assert_eq!(session.subscriptions().listener_count("fRun"), 0);
    assert!(session.subscriptions().friend_habit("fRun").is_none());
    assert_eq!(store.listener_count(&DocPath::habit("ana", "fRun")), 0);
    assert!(row_ids(&session).is_empty());
}

#[test]
fn unlinking_on_friend_page_keeps_the_shown_habit() {
    let store = Arc::new(MemoryStore::new());
    let mut session = own_page_linked_to_ana(&store);
    session.view_user(Some("ana"));

    assert!(session.unlink_habit("fRun").unwrap());

    assert_eq!(session.subscriptions().listener_count("fRun"), 1);
    assert_eq!(row_ids(&session), vec!["fRun"]);

    session.view_user(None);

    assert_eq!(session.subscriptions().listener_count("fRun"), 0);
    assert_eq!(row_ids(&session), vec!["run"]);
}

#[test]
fn returning_home_before_friend_page_loads_drops_it() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    let mut session = open_session(&store);
    session.save_habit(Habit::new("Read", "📚").with_id("read")).unwrap();

    session.subscriptions_mut().view_user(Some("ana"));
    session.view_user(None);
    session.pump();

    assert_eq!(session.subscriptions().state(), ViewState::Ready);
    assert_eq!(row_ids(&session), vec!["read"]);
    assert!(session.subscriptions().friend_habit("fRun").is_none());
    assert_eq!(store.total_listeners(), 0);
}

#[test]
fn status_writes_notify_registry_and_view_observers() {
    let store = Arc::new(MemoryStore::new());
    let mut session = open_session(&store);
    session
        .save_habit(Habit::new("Read", "📚").with_id("read").with_frequency(7))
        .unwrap();
    session.view_user(None);

    let registry_events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&registry_events);
    session
        .registry()
        .write()
        .subscribe(move |event| sink.lock().push(event.clone()));
    let view_events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&view_events);
    session
        .subscriptions_mut()
        .subscribe(move |event| sink.lock().push(event.clone()));

    let day = YearAndDay::from(today());
    session.set_habit_status("read", day, Some("🌟")).unwrap();

    assert_eq!(
        *registry_events.lock(),
        vec![habit_core::registry::RegistryEvent::HabitSaved("read".into())]
    );
    assert!(view_events.lock().contains(&ViewEvent::HabitsInViewChanged));

    session.set_habit_status("read", day, Some("🌟")).unwrap();
    assert_eq!(registry_events.lock().len(), 1);
}

#[test]
fn unreadable_linked_habit_is_hidden_but_stays_linked() {
    let store = Arc::new(MemoryStore::new());
    let mut session = own_page_linked_to_ana(&store);

    store
        .set(&DocPath::habit("ana", "fRun"), json!({ "name": 5 }))
        .unwrap();
    session.pump();

    assert_eq!(row_ids(&session), vec!["run"]);
    assert!(session.registry().read().link_for("fRun").is_some());
    assert_eq!(session.subscriptions().listener_count("fRun"), 0);
    assert_eq!(session.subscriptions().loading_count(), 0);
}

#[test]
fn unavailable_friend_habit_is_not_resubscribed_on_details_change() {
    let store = Arc::new(MemoryStore::new());
    publish(&store, "ana", Habit::new("Run", "🏃").with_id("fRun"));
    publish(&store, "ana", Habit::new("Swim", "🏊").with_id("fSwim"));
    store
        .merge(&DocPath::habit("ana", "fSwim"), json!({ "archived": true }))
        .unwrap();
    let mut session = open_session(&store);
    session.view_user(Some("ana"));
    let opened = store.subscriptions_opened();

    store
        .merge(
            &DocPath::habit_details("ana"),
            json!({ "activeIds": { "public": { "fNew": false } } }),
        )
        .unwrap();
    session.pump();

    assert_eq!(store.subscriptions_opened(), opened);
    assert_eq!(session.subscriptions().state(), ViewState::Ready);
    assert_eq!(session.subscriptions().loading_count(), 0);
    assert_eq!(row_ids(&session), vec!["fRun"]);
}
