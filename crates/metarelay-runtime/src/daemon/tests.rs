//! Scenario tests for the relay state machine: dedup across delivery
//! paths, gap fill, crash recovery, and cursor semantics.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use metarelay_core::{
    DispatchOutcome, DispatchRecord, EventSubscription, HandlerConfig,
};
use metarelay_store::SqliteEventStore;

use super::*;

fn event(id: i64, repo: &str) -> Event {
    Event {
        id,
        repo: repo.to_string(),
        event_type: "check_run".to_string(),
        action: "completed".to_string(),
        ref_name: None,
        actor: None,
        summary: None,
        payload: json!({"conclusion": "failure"}),
        delivery_id: Some(format!("d{id}")),
        created_at: Utc::now(),
    }
}

fn notify_handler() -> HandlerConfig {
    HandlerConfig {
        name: "notify".to_string(),
        event_type: "check_run".to_string(),
        action: "completed".to_string(),
        command: "echo {{repo}}".to_string(),
        filters: Vec::new(),
        timeout_seconds: 30,
        enabled: true,
    }
}

/// Cloud stub backed by an in-memory event table. `fetch_since` behaves
/// like the real paginated query; live subscriptions are fed by the test
/// through the senders it hands out.
struct ScriptedCloud {
    table: Mutex<Vec<Event>>,
    live_senders: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl ScriptedCloud {
    fn new(initial: Vec<Event>) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(initial),
            live_senders: Mutex::new(Vec::new()),
        })
    }

    fn insert(&self, event: Event) {
        self.table.lock().expect("table lock").push(event);
    }

    async fn live_sender(&self) -> mpsc::Sender<Event> {
        for _ in 0..500 {
            if let Some(sender) = self.live_senders.lock().expect("senders lock").last().cloned()
            {
                return sender;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("no live subscription was opened");
    }
}

#[async_trait]
impl CloudEvents for ScriptedCloud {
    async fn fetch_since(
        &self,
        repo: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>, CloudError> {
        let mut events: Vec<Event> = self
            .table
            .lock()
            .expect("table lock")
            .iter()
            .filter(|event| event.repo == repo && event.id > after_id)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.id);
        events.truncate(limit);
        Ok(events)
    }

    async fn subscribe(&self, _repo: &str) -> Result<EventSubscription, CloudError> {
        let (sender, subscription) = EventSubscription::channel(64);
        self.live_senders.lock().expect("senders lock").push(sender);
        Ok(subscription)
    }
}

/// Dispatcher stub that records through the store like the real one and
/// remembers every invocation.
struct RecordingDispatcher {
    store: Arc<dyn EventStore>,
    outcome: DispatchOutcome,
    exit_status: Option<i32>,
    calls: Mutex<Vec<(i64, String)>>,
}

impl RecordingDispatcher {
    fn new(store: Arc<dyn EventStore>, outcome: DispatchOutcome) -> Arc<Self> {
        let exit_status = match outcome {
            DispatchOutcome::Success => Some(0),
            DispatchOutcome::Failure => Some(1),
            DispatchOutcome::Timeout => Some(-15),
            DispatchOutcome::Skipped => None,
        };
        Arc::new(Self {
            store,
            outcome,
            exit_status,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(i64, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl HandlerDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        handler: &HandlerConfig,
        event: &Event,
    ) -> Result<DispatchRecord, StoreError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((event.id, handler.name.clone()));
        let now = Utc::now();
        let record = DispatchRecord {
            remote_id: event.id,
            handler_name: handler.name.clone(),
            outcome: self.outcome,
            exit_status: self.exit_status,
            stdout: String::new(),
            stderr: String::new(),
            started_at: now,
            ended_at: now,
        };
        self.store.record_dispatch(&record)?;
        Ok(record)
    }
}

struct Harness {
    store: Arc<SqliteEventStore>,
    cloud: Arc<ScriptedCloud>,
    dispatcher: Arc<RecordingDispatcher>,
    daemon: Daemon,
}

fn harness(repos: Vec<RepoConfig>, initial_events: Vec<Event>) -> Harness {
    harness_with_outcome(repos, initial_events, DispatchOutcome::Success)
}

fn harness_with_outcome(
    repos: Vec<RepoConfig>,
    initial_events: Vec<Event>,
    outcome: DispatchOutcome,
) -> Harness {
    let store = Arc::new(SqliteEventStore::open_in_memory().expect("store"));
    let cloud = ScriptedCloud::new(initial_events);
    let dispatcher = RecordingDispatcher::new(store.clone(), outcome);
    let registry = Arc::new(HandlerRegistry::load(vec![notify_handler()]).expect("registry"));
    let daemon = Daemon::new(
        store.clone(),
        cloud.clone(),
        dispatcher.clone(),
        registry,
        repos,
    );
    Harness {
        store,
        cloud,
        dispatcher,
        daemon,
    }
}

fn repo(name: &str) -> RepoConfig {
    RepoConfig {
        name: name.to_string(),
        path: None,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn dedup_collapses_catch_up_and_live_delivery() {
    let harness = harness(vec![repo("o/r")], vec![event(10, "o/r")]);
    let store = harness.store.clone();
    let cloud = harness.cloud.clone();
    let dispatcher = harness.dispatcher.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = harness.daemon;
    let running = tokio::spawn(async move { daemon.run(shutdown_rx).await });

    // Catch-up drains event 10 before the subscription opens.
    let sender = cloud.live_sender().await;
    {
        let store = store.clone();
        wait_until(move || store.get_cursor("o/r").expect("cursor") == Some(10)).await;
    }

    // The same row arrives again live, then a fresh one.
    sender.send(event(10, "o/r")).await.expect("send dup");
    sender.send(event(11, "o/r")).await.expect("send next");
    {
        let store = store.clone();
        wait_until(move || store.get_cursor("o/r").expect("cursor") == Some(11)).await;
    }

    shutdown_tx.send(true).expect("signal shutdown");
    running.await.expect("join").expect("daemon result");

    let calls = dispatcher.calls();
    assert_eq!(
        calls,
        vec![(10, "notify".to_string()), (11, "notify".to_string())],
        "event 10 must dispatch exactly once across both paths"
    );
    assert_eq!(store.list_dispatches(10).expect("rows").len(), 1);
}

#[tokio::test]
async fn live_gap_triggers_catch_up_fill_in_order() {
    let harness = harness(vec![repo("o/r")], Vec::new());
    let store = harness.store.clone();
    let cloud = harness.cloud.clone();
    let dispatcher = harness.dispatcher.clone();
    store.set_cursor("o/r", 5).expect("seed cursor");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = harness.daemon;
    let running = tokio::spawn(async move { daemon.run(shutdown_rx).await });

    let sender = cloud.live_sender().await;

    // Rows 6..8 land remotely, but only 8 arrives on the live stream.
    cloud.insert(event(6, "o/r"));
    cloud.insert(event(7, "o/r"));
    cloud.insert(event(8, "o/r"));
    sender.send(event(8, "o/r")).await.expect("send live");

    {
        let store = store.clone();
        wait_until(move || store.get_cursor("o/r").expect("cursor") == Some(8)).await;
    }
    shutdown_tx.send(true).expect("signal shutdown");
    running.await.expect("join").expect("daemon result");

    let calls = dispatcher.calls();
    assert_eq!(
        calls,
        vec![
            (6, "notify".to_string()),
            (7, "notify".to_string()),
            (8, "notify".to_string())
        ],
        "gap fill must dispatch 6 and 7 before 8, and 8 exactly once"
    );
}

#[tokio::test]
async fn live_events_below_cursor_are_claimed_but_not_dispatched() {
    let harness = harness(vec![repo("o/r")], Vec::new());
    let store = harness.store.clone();
    let cloud = harness.cloud.clone();
    let dispatcher = harness.dispatcher.clone();
    store.set_cursor("o/r", 10).expect("seed cursor");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = harness.daemon;
    let running = tokio::spawn(async move { daemon.run(shutdown_rx).await });

    let sender = cloud.live_sender().await;
    sender.send(event(9, "o/r")).await.expect("send stale");

    {
        let store = store.clone();
        wait_until(move || store.any_claimed_between("o/r", 8, 10).expect("probe")).await;
    }
    shutdown_tx.send(true).expect("signal shutdown");
    running.await.expect("join").expect("daemon result");

    assert!(dispatcher.calls().is_empty());
    assert_eq!(store.get_cursor("o/r").expect("cursor"), Some(10));
}

#[tokio::test]
async fn crash_after_claim_is_not_redispatched() {
    let harness = harness(vec![repo("o/r")], vec![event(10, "o/r")]);
    // Simulates a previous run that died between try_claim and dispatch.
    assert!(harness.store.try_claim(&event(10, "o/r")).expect("claim"));

    harness.daemon.sync_once().await.expect("sync");

    assert!(harness.dispatcher.calls().is_empty());
    assert_eq!(harness.store.get_cursor("o/r").expect("cursor"), Some(10));
    assert!(harness.store.list_dispatches(10).expect("rows").is_empty());
}

#[tokio::test]
async fn restart_produces_identical_dispatch_log() {
    let harness = harness(
        vec![repo("o/r")],
        vec![event(1, "o/r"), event(2, "o/r")],
    );
    harness.daemon.sync_once().await.expect("first sync");
    let first: Vec<_> = [1, 2]
        .iter()
        .flat_map(|id| harness.store.list_dispatches(*id).expect("rows"))
        .map(|row| (row.remote_id, row.handler_name.clone(), row.outcome))
        .collect();

    harness.daemon.sync_once().await.expect("second sync");
    let second: Vec<_> = [1, 2]
        .iter()
        .flat_map(|id| harness.store.list_dispatches(*id).expect("rows"))
        .map(|row| (row.remote_id, row.handler_name.clone(), row.outcome))
        .collect();

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    assert_eq!(harness.dispatcher.calls().len(), 2, "no second-run dispatches");
}

#[tokio::test]
async fn failed_and_timed_out_handlers_still_advance_the_cursor() {
    let harness = harness_with_outcome(
        vec![repo("o/r")],
        vec![event(3, "o/r")],
        DispatchOutcome::Timeout,
    );
    harness.daemon.sync_once().await.expect("sync");

    assert_eq!(harness.store.get_cursor("o/r").expect("cursor"), Some(3));
    let rows = harness.store.list_dispatches(3).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].outcome, DispatchOutcome::Timeout);
    assert_eq!(rows[0].exit_status, Some(-15));
}

#[tokio::test]
async fn repos_advance_independently() {
    let harness = harness(
        vec![repo("a/one"), repo("b/two")],
        vec![
            event(1, "a/one"),
            event(2, "b/two"),
            event(3, "a/one"),
            event(4, "b/two"),
        ],
    );
    harness.daemon.sync_once().await.expect("sync");

    assert_eq!(harness.store.get_cursor("a/one").expect("cursor"), Some(3));
    assert_eq!(harness.store.get_cursor("b/two").expect("cursor"), Some(4));
}

#[tokio::test]
async fn journal_receives_each_claimed_event_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo_config = RepoConfig {
        name: "o/r".to_string(),
        path: Some(dir.path().to_path_buf()),
    };
    let harness = harness(
        vec![repo_config],
        vec![event(1, "o/r"), event(2, "o/r")],
    );

    harness.daemon.sync_once().await.expect("first sync");
    harness.daemon.sync_once().await.expect("second sync");

    let raw = std::fs::read_to_string(dir.path().join(".metarelay/events.jsonl")).expect("read");
    let ids: Vec<i64> = raw
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).expect("json")["id"]
                .as_i64()
                .expect("id")
        })
        .collect();
    assert_eq!(ids, vec![1, 2], "dedup hits must not re-journal");
}

#[tokio::test]
async fn empty_catch_up_page_reaches_subscribe_and_shutdown_drains() {
    let harness = harness(vec![repo("o/r")], Vec::new());
    let cloud = harness.cloud.clone();
    let store = harness.store.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = harness.daemon;
    let running = tokio::spawn(async move { daemon.run(shutdown_rx).await });

    // Subscription opening proves CATCHUP exited on the empty page.
    let _sender = cloud.live_sender().await;
    shutdown_tx.send(true).expect("signal shutdown");
    running.await.expect("join").expect("daemon result");

    assert_eq!(store.get_cursor("o/r").expect("cursor"), None);
}

#[tokio::test]
async fn sync_runs_real_handler_processes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hits = dir.path().join("hits.log");

    let store = Arc::new(SqliteEventStore::open_in_memory().expect("store"));
    let cloud = ScriptedCloud::new(vec![event(1, "o/r")]);
    let dispatcher = Arc::new(metarelay_dispatch::ProcessDispatcher::new(store.clone(), 2));
    let mut handler = notify_handler();
    handler.command = format!("echo {{{{repo}}}} >> {}", hits.display());
    let registry = Arc::new(HandlerRegistry::load(vec![handler]).expect("registry"));

    let daemon = Daemon::new(
        store.clone(),
        cloud,
        dispatcher,
        registry,
        vec![repo("o/r")],
    );
    daemon.sync_once().await.expect("sync");

    let contents = std::fs::read_to_string(&hits).expect("handler output");
    assert_eq!(contents.trim(), "o/r");
    let rows = store.list_dispatches(1).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].outcome, DispatchOutcome::Success);
    assert_eq!(store.get_cursor("o/r").expect("cursor"), Some(1));
}

#[test]
fn reconnect_delay_doubles_to_the_cap_with_bounded_jitter() {
    let first = reconnect_delay("o/r", 1);
    assert!(first >= Duration::from_secs(1));
    assert!(first < Duration::from_millis(1_500));

    let capped = reconnect_delay("o/r", 12);
    assert!(capped >= Duration::from_secs(30));
    assert!(capped < Duration::from_millis(30_500));

    assert_eq!(reconnect_delay("o/r", 3), reconnect_delay("o/r", 3));
    assert!(
        reconnect_delay("a/one", 2) != reconnect_delay("b/two", 2)
            || reconnect_delay("a/one", 3) != reconnect_delay("b/two", 3),
        "jitter should separate repos"
    );
}
