use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{MutationTicket, ReconciliationEngine};
use crate::preference::PreferenceStore;
use crate::session::{SessionGate, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub snapshot_timeout: Duration,
    pub poll_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl SyncSettings {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let settings = Self {
            snapshot_timeout: cfg.get_millis("sync.snapshot_timeout_ms", 2000)?,
            poll_interval: cfg.get_millis("sync.poll_interval_ms", 500)?,
            retry_base: cfg.get_millis("sync.retry_base_ms", 250)?,
            retry_max: cfg.get_millis("sync.retry_max_ms", 8000)?,
        };
        if settings.poll_interval.is_zero() {
            return Err(anyhow!("sync.poll_interval_ms must be greater than zero"));
        }
        Ok(settings)
    }
}

/// Exponential retry delay, doubling from `base` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    Add(String),
    Toggle(usize),
    Delete(usize),
    ToggleTheme,
    SignOut,
    Help,
    Unrecognized(String),
    Quit,
}

/// Output side of the task view.
pub trait Screen {
    fn redraw(&mut self, engine: &ReconciliationEngine) -> anyhow::Result<()>;
    fn notice(&mut self, message: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Live task view: keeps the engine attached to whoever is signed in and
/// feeds it snapshots and user actions, one event at a time.
pub struct TaskView {
    engine: ReconciliationEngine,
    session: Arc<SessionGate>,
    preferences: Arc<PreferenceStore>,
    settings: SyncSettings,
    in_flight: Vec<MutationTicket>,
}

impl TaskView {
    pub fn new(
        engine: ReconciliationEngine,
        session: Arc<SessionGate>,
        preferences: Arc<PreferenceStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            engine,
            session,
            preferences,
            settings,
            in_flight: Vec::new(),
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    #[tracing::instrument(skip_all)]
    pub async fn run<S: Screen>(
        &mut self,
        mut actions: mpsc::UnboundedReceiver<UserAction>,
        screen: &mut S,
    ) -> anyhow::Result<()> {
        let mut identity_rx = self.session.subscribe();
        let initial = identity_rx.borrow_and_update().clone();
        if !self.follow_identity(initial) {
            screen.notice("not signed in; run `taskmaster login` first")?;
            return Ok(());
        }

        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut backoff = Backoff::new(self.settings.retry_base, self.settings.retry_max);
        let mut retry_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                changed = identity_rx.changed() => {
                    if changed.is_err() {
                        debug!("session gate dropped; leaving task view");
                        break;
                    }
                    let state = identity_rx.borrow_and_update().clone();
                    retry_at = None;
                    backoff.reset();
                    if !self.follow_identity(state) {
                        screen.notice("signed out")?;
                        break;
                    }
                    screen.redraw(&self.engine)?;
                }

                action = actions.recv() => {
                    let Some(action) = action else {
                        break;
                    };
                    if self.handle(action, screen)? == Flow::Stop {
                        break;
                    }
                }

                event = self.engine.next_event() => {
                    let healthy = match event {
                        Some(event) => self.engine.apply(event),
                        None => {
                            warn!("subscription ended by the channel");
                            false
                        }
                    };
                    screen.redraw(&self.engine)?;
                    if healthy {
                        backoff.reset();
                    } else {
                        let delay = backoff.next_delay();
                        info!(delay_ms = delay.as_millis() as u64, "resubscribing after backoff");
                        self.engine.suspend();
                        retry_at = Some(Instant::now() + delay);
                    }
                }

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                    let state = self.session.state();
                    if !self.follow_identity(state) {
                        break;
                    }
                }

                _ = poll.tick() => {
                    self.engine.refresh();
                }
            }
        }

        self.settle_in_flight().await;
        self.engine.detach();
        Ok(())
    }

    /// Waits, up to the snapshot timeout, for mutations still on their way
    /// to the channel.
    async fn settle_in_flight(&mut self) {
        let pending: Vec<MutationTicket> = self.in_flight.drain(..).collect();
        if pending.is_empty() {
            return;
        }
        let count = pending.len();
        let drain = async move {
            for ticket in pending {
                ticket.settled().await;
            }
        };
        if timeout(self.settings.snapshot_timeout, drain).await.is_err() {
            warn!(count, "leaving with mutations still in flight");
        } else {
            debug!(count, "in-flight mutations settled");
        }
    }

    fn track(&mut self, ticket: MutationTicket) {
        self.in_flight.retain(|held| !held.is_settled());
        self.in_flight.push(ticket);
    }

    /// Attaches to the identity in `state`. Returns `false` when nobody is
    /// signed in, after the engine has been torn down.
    fn follow_identity(&mut self, state: SessionState) -> bool {
        match state {
            SessionState::Authenticated(identity) => {
                self.engine.attach(identity);
                true
            }
            SessionState::Unauthenticated | SessionState::Unknown => {
                self.engine.detach();
                false
            }
        }
    }

    fn handle<S: Screen>(&mut self, action: UserAction, screen: &mut S) -> anyhow::Result<Flow> {
        debug!(?action, "handling user action");
        match action {
            UserAction::Add(text) => match self.engine.request_add(&text) {
                Some(ticket) => self.track(ticket),
                None => screen.notice("task text is empty")?,
            },
            UserAction::Toggle(position) => {
                let ticket = self
                    .engine
                    .task_at(position)
                    .map(|task| task.id.clone())
                    .and_then(|id| self.engine.request_toggle(&id));
                match ticket {
                    Some(ticket) => self.track(ticket),
                    None => screen.notice(&format!("no task at position {position}"))?,
                }
            }
            UserAction::Delete(position) => {
                let ticket = self
                    .engine
                    .task_at(position)
                    .map(|task| task.id.clone())
                    .and_then(|id| self.engine.request_delete(&id));
                match ticket {
                    Some(ticket) => self.track(ticket),
                    None => screen.notice(&format!("no task at position {position}"))?,
                }
            }
            UserAction::ToggleTheme => {
                self.preferences.toggle();
                screen.redraw(&self.engine)?;
            }
            UserAction::SignOut => {
                self.engine.detach();
                let _provider_call = self.session.sign_out();
                screen.notice("signed out")?;
                return Ok(Flow::Stop);
            }
            UserAction::Help => screen.notice(crate::shell::HELP)?,
            UserAction::Unrecognized(message) => screen.notice(&message)?,
            UserAction::Quit => return Ok(Flow::Stop),
        }
        Ok(Flow::Continue)
    }
}

/// Waits for the next good snapshot and applies it. Error events are
/// applied too and end the wait with `false`; so does the timeout.
pub async fn await_snapshot(engine: &mut ReconciliationEngine, limit: Duration) -> bool {
    match timeout(limit, engine.next_event()).await {
        Ok(Some(event)) => engine.apply(event),
        Ok(None) => {
            warn!("subscription ended before a snapshot arrived");
            false
        }
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "no snapshot before timeout");
            false
        }
    }
}
