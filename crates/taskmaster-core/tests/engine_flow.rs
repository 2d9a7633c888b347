use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskmaster_core::channel::{SnapshotEvent, Subscription, TaskChannel};
use taskmaster_core::config::Config;
use taskmaster_core::context::AppContext;
use taskmaster_core::datastore::DocumentStore;
use taskmaster_core::engine::ReconciliationEngine;
use taskmaster_core::error::ChannelError;
use taskmaster_core::preference::{
    FileKeyValueStore, MemoryKeyValueStore, PreferenceStore, RootMarker,
};
use taskmaster_core::session::{
    LocalAccount, LocalIdentityProvider, SessionGate, SessionState, uid_for_email,
};
use taskmaster_core::task::{Identity, Task, TaskId};
use taskmaster_core::view::{Screen, SyncSettings, TaskView, UserAction, await_snapshot};
use tempfile::tempdir;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

fn ada() -> Identity {
    Identity {
        uid: "ada".to_string(),
        display_name: Some("Ada".to_string()),
        email: Some("ada@example.com".to_string()),
    }
}

fn texts(engine: &ReconciliationEngine) -> Vec<(String, bool)> {
    engine
        .tasks()
        .iter()
        .map(|task| (task.text.clone(), task.completed))
        .collect()
}

fn fast_sync() -> SyncSettings {
    SyncSettings {
        snapshot_timeout: WAIT,
        poll_interval: Duration::from_millis(20),
        retry_base: Duration::from_millis(10),
        retry_max: Duration::from_millis(40),
    }
}

#[derive(Default)]
struct RecordingScreen {
    frames: Vec<Vec<(String, bool)>>,
    stale: Vec<Option<String>>,
    notices: Vec<String>,
}

impl Screen for RecordingScreen {
    fn redraw(&mut self, engine: &ReconciliationEngine) -> anyhow::Result<()> {
        self.frames.push(texts(engine));
        self.stale.push(engine.last_error().map(str::to_string));
        Ok(())
    }

    fn notice(&mut self, message: &str) -> anyhow::Result<()> {
        self.notices.push(message.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn add_toggle_delete_round_through_the_store() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(DocumentStore::open(temp.path()).expect("open store"));
    let mut engine = ReconciliationEngine::new(store.clone());
    engine.attach(ada());
    assert!(await_snapshot(&mut engine, WAIT).await);
    assert!(engine.tasks().is_empty());

    engine.request_add("Buy milk").expect("add").settled().await;
    assert!(await_snapshot(&mut engine, WAIT).await);
    assert_eq!(texts(&engine), vec![("Buy milk".to_string(), false)]);

    let id = engine.tasks()[0].id.clone();
    engine.request_toggle(&id).expect("toggle").settled().await;
    assert!(await_snapshot(&mut engine, WAIT).await);
    assert_eq!(texts(&engine), vec![("Buy milk".to_string(), true)]);

    engine.request_delete(&id).expect("delete").settled().await;
    assert!(await_snapshot(&mut engine, WAIT).await);
    assert!(engine.tasks().is_empty());
}

#[tokio::test]
async fn two_views_of_one_account_stay_in_step() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(DocumentStore::open(temp.path()).expect("open store"));
    let mut first = ReconciliationEngine::new(store.clone());
    let mut second = ReconciliationEngine::new(store.clone());
    first.attach(ada());
    second.attach(ada());
    assert!(await_snapshot(&mut first, WAIT).await);
    assert!(await_snapshot(&mut second, WAIT).await);
    assert_eq!(store.listener_count("ada"), 2);

    first.request_add("Walk dog").expect("add").settled().await;
    assert!(await_snapshot(&mut second, WAIT).await);
    assert_eq!(texts(&second), vec![("Walk dog".to_string(), false)]);

    drop(first);
    assert_eq!(store.listener_count("ada"), 1);
    second.detach();
    assert_eq!(store.listener_count("ada"), 0);
}

#[tokio::test]
async fn accounts_do_not_see_each_other() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(DocumentStore::open(temp.path()).expect("open store"));
    store.insert_task("grace", "Compile").expect("insert");

    let mut engine = ReconciliationEngine::new(store.clone());
    engine.attach(ada());
    assert!(await_snapshot(&mut engine, WAIT).await);
    assert!(engine.tasks().is_empty());

    engine.attach(Identity::new("grace"));
    assert!(await_snapshot(&mut engine, WAIT).await);
    assert_eq!(texts(&engine), vec![("Compile".to_string(), false)]);
    assert_eq!(store.listener_count("ada"), 0);
}

#[tokio::test]
async fn refresh_sees_writes_from_another_process() {
    let temp = tempdir().expect("tempdir");
    let ours = Arc::new(DocumentStore::open(temp.path()).expect("open store"));
    let theirs = DocumentStore::open(temp.path()).expect("open second store");

    let mut engine = ReconciliationEngine::new(ours.clone());
    engine.attach(ada());
    assert!(await_snapshot(&mut engine, WAIT).await);

    theirs.insert_task("ada", "From elsewhere").expect("insert");
    engine.refresh();
    assert!(await_snapshot(&mut engine, WAIT).await);
    assert_eq!(texts(&engine), vec![("From elsewhere".to_string(), false)]);
}

#[test]
fn dark_mode_survives_a_restart() {
    let temp = tempdir().expect("tempdir");

    let marker = RootMarker::default();
    let prefs = PreferenceStore::load(
        Arc::new(FileKeyValueStore::open(temp.path())),
        Arc::new(marker.clone()),
    );
    assert!(!prefs.get());
    assert!(prefs.toggle());
    assert!(marker.is_dark());

    let restarted_marker = RootMarker::default();
    let restarted = PreferenceStore::load(
        Arc::new(FileKeyValueStore::open(temp.path())),
        Arc::new(restarted_marker.clone()),
    );
    assert!(restarted.get());
    assert!(restarted_marker.is_dark());
}

#[tokio::test]
async fn context_signs_in_and_records_the_profile() {
    let temp = tempdir().expect("tempdir");
    let account = LocalAccount {
        name: Some("Ada".to_string()),
        email: Some("Ada@Example.com".to_string()),
    };
    let ctx = AppContext::init(Config::default(), temp.path(), account).expect("context");
    assert_eq!(ctx.session.resolve().await, SessionState::Unauthenticated);

    let identity = ctx.session.sign_in().await.expect("sign in");
    assert_eq!(identity.uid, uid_for_email("ada@example.com"));

    let profile = ctx
        .store
        .load_profile(&identity.uid)
        .expect("load profile")
        .expect("profile exists");
    assert_eq!(profile["name"], "Ada");
    assert_eq!(profile["email"], "Ada@Example.com");

    let next_run = AppContext::init(Config::default(), temp.path(), LocalAccount::default())
        .expect("context");
    assert_eq!(
        next_run.session.resolve().await,
        SessionState::Authenticated(identity)
    );
}

#[tokio::test]
async fn task_view_applies_actions_and_follows_sign_out() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(DocumentStore::open(temp.path()).expect("open store"));
    let storage = Arc::new(MemoryKeyValueStore::default());
    let provider = Arc::new(LocalIdentityProvider::new(
        storage.clone(),
        LocalAccount {
            name: None,
            email: Some("ada@example.com".to_string()),
        },
    ));
    let session = Arc::new(SessionGate::new(provider, store.clone()));
    session.resolve().await;
    let identity = session.sign_in().await.expect("sign in");

    let preferences = Arc::new(PreferenceStore::load(
        storage,
        Arc::new(RootMarker::default()),
    ));
    let mut view = TaskView::new(
        ReconciliationEngine::new(store.clone()),
        session.clone(),
        preferences.clone(),
        fast_sync(),
    );

    let (actions_tx, actions_rx) = mpsc::unbounded_channel();
    let driver = tokio::spawn(async move {
        actions_tx.send(UserAction::Add("Write tests".to_string())).ok();
        tokio::time::sleep(Duration::from_millis(100)).await;
        actions_tx.send(UserAction::Toggle(1)).ok();
        tokio::time::sleep(Duration::from_millis(100)).await;
        actions_tx.send(UserAction::Delete(7)).ok();
        actions_tx.send(UserAction::ToggleTheme).ok();
        actions_tx.send(UserAction::SignOut).ok();
    });

    let mut screen = RecordingScreen::default();
    view.run(actions_rx, &mut screen).await.expect("view");
    driver.await.expect("driver");

    assert!(
        screen
            .frames
            .contains(&vec![("Write tests".to_string(), false)])
    );
    assert!(
        screen
            .frames
            .contains(&vec![("Write tests".to_string(), true)])
    );
    assert!(screen.notices.iter().any(|n| n == "no task at position 7"));
    assert!(preferences.get());
    assert_eq!(session.state(), SessionState::Unauthenticated);
    assert!(!view.engine().is_attached());
    assert_eq!(store.listener_count(&identity.uid), 0);
}

#[tokio::test]
async fn task_view_without_a_session_only_explains() {
    let temp = tempdir().expect("tempdir");
    let ctx = AppContext::init(Config::default(), temp.path(), LocalAccount::default())
        .expect("context");
    ctx.session.resolve().await;

    let mut view = ctx.task_view();
    let (_actions_tx, actions_rx) = mpsc::unbounded_channel();
    let mut screen = RecordingScreen::default();
    view.run(actions_rx, &mut screen).await.expect("view");

    assert!(screen.frames.is_empty());
    assert_eq!(
        screen.notices,
        vec!["not signed in; run `taskmaster login` first".to_string()]
    );
}

/// Channel whose n-th subscription replays the n-th script and then stays
/// open.
#[derive(Default)]
struct ScriptedChannel {
    scripts: Mutex<VecDeque<Vec<SnapshotEvent>>>,
    open: Mutex<Vec<tokio::sync::mpsc::UnboundedSender<SnapshotEvent>>>,
    released: Arc<Mutex<usize>>,
}

#[async_trait]
impl TaskChannel for ScriptedChannel {
    fn subscribe(&self, _identity: &Identity) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in self.scripts.lock().pop_front().unwrap_or_default() {
            tx.send(event).ok();
        }
        let mut open = self.open.lock();
        open.push(tx);
        let released = self.released.clone();
        Subscription::new(open.len() as u64, rx, move || *released.lock() += 1)
    }

    async fn create(&self, _identity: &Identity, _text: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn set_completed(
        &self,
        _identity: &Identity,
        _id: &TaskId,
        _completed: bool,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn delete(&self, _identity: &Identity, _id: &TaskId) -> Result<(), ChannelError> {
        Ok(())
    }
}

async fn signed_in_session(
    profiles: Arc<DocumentStore>,
) -> (Arc<SessionGate>, Arc<PreferenceStore>, Identity) {
    let storage = Arc::new(MemoryKeyValueStore::default());
    let provider = Arc::new(LocalIdentityProvider::new(
        storage.clone(),
        LocalAccount {
            name: None,
            email: Some("ada@example.com".to_string()),
        },
    ));
    let session = Arc::new(SessionGate::new(provider, profiles));
    session.resolve().await;
    let identity = session.sign_in().await.expect("sign in");
    let preferences = Arc::new(PreferenceStore::load(
        storage,
        Arc::new(RootMarker::default()),
    ));
    (session, preferences, identity)
}

#[tokio::test]
async fn task_view_keeps_the_stale_list_and_resubscribes_after_an_error() {
    let temp = tempdir().expect("tempdir");
    let profiles = Arc::new(DocumentStore::open(temp.path()).expect("open store"));
    let (session, preferences, _identity) = signed_in_session(profiles).await;

    let two = vec![Task::new("a", "x", false), Task::new("b", "y", true)];
    let mut three = two.clone();
    three.push(Task::new("c", "z", false));
    let channel = Arc::new(ScriptedChannel::default());
    channel.scripts.lock().extend([
        vec![Ok(two), Err(ChannelError::unavailable("network down"))],
        vec![Ok(three)],
    ]);

    let mut view = TaskView::new(
        ReconciliationEngine::new(channel.clone()),
        session,
        preferences,
        fast_sync(),
    );
    let (actions_tx, actions_rx) = mpsc::unbounded_channel();
    let driver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        actions_tx.send(UserAction::Quit).ok();
    });

    let mut screen = RecordingScreen::default();
    view.run(actions_rx, &mut screen).await.expect("view");
    driver.await.expect("driver");

    let frames: Vec<(usize, bool)> = screen
        .frames
        .iter()
        .zip(&screen.stale)
        .map(|(tasks, stale)| (tasks.len(), stale.is_some()))
        .collect();
    assert_eq!(frames, vec![(2, false), (2, true), (3, false)]);
    assert!(
        screen.stale[1]
            .as_deref()
            .is_some_and(|reason| reason.contains("network down"))
    );
    assert_eq!(channel.open.lock().len(), 2);
    assert_eq!(*channel.released.lock(), 2);
}

#[test]
fn queued_add_survives_leaving_the_shell() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(DocumentStore::open(temp.path()).expect("open store"));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let uid = runtime.block_on(async {
        let (session, preferences, identity) = signed_in_session(store.clone()).await;
        let mut view = TaskView::new(
            ReconciliationEngine::new(store.clone()),
            session,
            preferences,
            fast_sync(),
        );
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        actions_tx.send(UserAction::Add("buy milk".to_string())).ok();
        actions_tx.send(UserAction::Quit).ok();

        let mut screen = RecordingScreen::default();
        view.run(actions_rx, &mut screen).await.expect("view");
        identity.uid
    });
    runtime.shutdown_background();

    let texts: Vec<String> = store
        .snapshot(&uid)
        .expect("snapshot")
        .into_iter()
        .map(|task| task.text)
        .collect();
    assert_eq!(texts, vec!["buy milk"]);
}
