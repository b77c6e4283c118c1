//! Decides when sync cycles run.
//!
//! ```text
//! Idle --trigger--> Syncing --ok-----> Idle
//!                      \----error--> Idle, retry scheduled with backoff
//! Offline --connectivity observed--> Idle
//! ```
//!
//! The coordinator is a tokio task owning the session. Callers talk to it
//! through a [`SyncHandle`]. Only one cycle runs at a time; triggers that
//! arrive during a cycle fold into a single follow-up run. Local mutations
//! are debounced on the trailing edge: each one restarts the quiet period.

use futures::future::OptionFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::backoff::RetryPolicy;
use super::context::SyncContext;
use super::events::{EventBus, SyncEvent};
use super::pull::{PullHandler, PullReport};
use super::push::{PushHandler, PushReport};
use super::transport::SyncTransport;
use super::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    /// No connectivity; cycles are skipped without touching the network.
    Offline,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    AppForeground,
    NetworkRestored,
    /// Debounced; a burst of edits produces one cycle.
    LocalMutation,
    ForceSync,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub page_size: usize,
    pub debounce: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            page_size: 200,
            debounce: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub push: PushReport,
    pub pull: PullReport,
}

/// One sync cycle: push everything sendable, then pull.
///
/// Undecodable local state is discarded together with all checkpoints, and
/// the pull then rebuilds each collection from a full snapshot.
pub async fn run_cycle<T: SyncTransport>(
    ctx: &SyncContext,
    transport: &T,
    options: &SyncOptions,
) -> Result<CycleReport, SyncError> {
    let pusher = PushHandler::new(options.batch_size, options.request_timeout);
    let puller = PullHandler::new(options.page_size, options.request_timeout);

    let push = match pusher.run(ctx, transport).await {
        Err(SyncError::StorageCorruption(reason)) => {
            recover(ctx, &reason).await?;
            PushReport::default()
        }
        other => other?,
    };

    let pull = match puller.run(ctx, transport).await {
        Err(SyncError::StorageCorruption(reason)) => {
            recover(ctx, &reason).await?;
            puller.run(ctx, transport).await?
        }
        other => other?,
    };

    tracing::info!(
        "Sync cycle done: {} pushed, {} pulled",
        push.pushed,
        pull.applied
    );
    Ok(CycleReport { push, pull })
}

async fn recover(ctx: &SyncContext, reason: &str) -> Result<(), SyncError> {
    tracing::error!("Local store corrupted ({}); resyncing from server", reason);
    let purged = ctx.store().purge_undecodable().await?;
    ctx.store().reset_checkpoints().await?;
    tracing::warn!("Discarded {} unreadable document(s)", purged);
    Ok(())
}

type Waiter = oneshot::Sender<Result<CycleReport, SyncError>>;

enum Command {
    Trigger(Trigger),
    SetOnline(bool),
    SyncNow(Waiter),
}

const COMMAND_BUFFER: usize = 32;

/// Control surface of a running coordinator. Clones talk to the same task.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SyncState>,
    shutdown: Arc<watch::Sender<bool>>,
    events: EventBus,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Trigger(trigger) => write!(f, "Trigger({:?})", trigger),
            Command::SetOnline(online) => write!(f, "SetOnline({})", online),
            Command::SyncNow(_) => write!(f, "SyncNow"),
        }
    }
}

impl SyncHandle {
    /// Never blocks. When the command buffer is full a cycle is already
    /// pending, so the trigger is dropped.
    pub fn trigger(&self, trigger: Trigger) {
        if let Err(e) = self.commands.try_send(Command::Trigger(trigger)) {
            tracing::debug!("Sync trigger {:?} not delivered: {}", trigger, e);
        }
    }

    /// Reports connectivity. Coming back online starts a cycle.
    pub async fn set_online(&self, online: bool) {
        if self.commands.send(Command::SetOnline(online)).await.is_err() {
            tracing::debug!("Sync coordinator is gone; ignoring connectivity change");
        }
    }

    /// Runs a cycle as soon as possible and waits for its outcome.
    pub async fn sync_now(&self) -> Result<CycleReport, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SyncNow(tx))
            .await
            .map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Stops the coordinator, cancelling a cycle in flight. Queue and
    /// checkpoints are left as they were before that cycle's last commit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Sync coordinator ended abnormally: {}", e);
            }
        }
    }
}

pub struct SyncCoordinator<T> {
    ctx: SyncContext,
    transport: T,
    options: SyncOptions,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<SyncState>,
    shutdown: watch::Receiver<bool>,
    online: bool,
    /// Set once the server refuses our credentials.
    paused: bool,
    /// Restarted by every local mutation; fires once edits go quiet.
    debounce_at: Option<Instant>,
    retry_at: Option<Instant>,
    attempt: u32,
    waiters: Vec<Waiter>,
}

impl<T: SyncTransport> SyncCoordinator<T> {
    pub fn spawn(ctx: SyncContext, transport: T, options: SyncOptions) -> SyncHandle {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let events = ctx.events().clone();

        let coordinator = Self {
            ctx,
            transport,
            options,
            commands,
            state: state_tx,
            shutdown,
            online: true,
            paused: false,
            debounce_at: None,
            retry_at: None,
            attempt: 0,
            waiters: Vec::new(),
        };
        let task = tokio::spawn(coordinator.run());

        SyncHandle {
            commands: command_tx,
            state: state_rx,
            shutdown: Arc::new(shutdown_tx),
            events,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(mut self) {
        self.check_store().await;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let timer: OptionFuture<_> = self.next_run().map(tokio::time::sleep_until).into();
            let run_now = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    false
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.accept(command),
                    None => break,
                },
                Some(()) = timer => {
                    self.clear_timers();
                    true
                }
            };

            if run_now && !self.run_until_settled().await {
                break;
            }
        }

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(SyncError::Cancelled));
        }
        tracing::debug!("Sync coordinator stopped");
    }

    async fn check_store(&self) {
        match self.ctx.store().integrity_check().await {
            Ok(()) => {}
            Err(SyncError::StorageCorruption(reason)) => {
                if let Err(e) = recover(&self.ctx, &reason).await {
                    tracing::error!("Local store recovery failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("Local store check failed: {}", e),
        }
    }

    /// Returns whether a cycle should start right away.
    fn accept(&mut self, command: Command) -> bool {
        tracing::debug!("Sync command: {:?}", command);
        match command {
            Command::Trigger(Trigger::LocalMutation) => {
                self.debounce_at = Some(Instant::now() + self.options.debounce);
                false
            }
            Command::Trigger(Trigger::NetworkRestored) => {
                self.set_online(true);
                true
            }
            Command::Trigger(_) => true,
            Command::SetOnline(online) => {
                let restored = online && !self.online;
                self.set_online(online);
                restored
            }
            Command::SyncNow(waiter) => {
                self.waiters.push(waiter);
                true
            }
        }
    }

    fn schedule_retry(&mut self, delay: Duration) {
        let at = Instant::now() + delay;
        self.retry_at = Some(self.retry_at.map_or(at, |pending| pending.min(at)));
    }

    fn next_run(&self) -> Option<Instant> {
        match (self.debounce_at, self.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn clear_timers(&mut self) {
        self.debounce_at = None;
        self.retry_at = None;
    }

    fn set_online(&mut self, online: bool) {
        self.online = online;
        if online {
            if *self.state.borrow() == SyncState::Offline {
                self.publish_state(SyncState::Idle);
            }
        } else {
            self.publish_state(SyncState::Offline);
        }
    }

    fn publish_state(&self, state: SyncState) {
        if self.state.send_replace(state) != state {
            self.ctx.events().publish(SyncEvent::StateChanged(state));
        }
    }

    /// Runs cycles until no trigger arrived during the last one. Returns
    /// false once the coordinator has to stop.
    async fn run_until_settled(&mut self) -> bool {
        loop {
            if !self.cycle().await {
                return false;
            }

            let mut again = false;
            while let Ok(command) = self.commands.try_recv() {
                again |= self.accept(command);
            }
            if !again {
                return true;
            }
        }
    }

    async fn cycle(&mut self) -> bool {
        let waiters = std::mem::take(&mut self.waiters);

        if self.paused {
            reply(waiters, &Err(SyncError::AuthExpired));
            return true;
        }
        if !self.online {
            tracing::debug!("Offline; skipping sync cycle");
            self.publish_state(SyncState::Offline);
            reply(
                waiters,
                &Err(SyncError::NetworkUnavailable("device is offline".to_string())),
            );
            return true;
        }

        self.clear_timers();
        self.publish_state(SyncState::Syncing);

        let result = tokio::select! {
            result = run_cycle(&self.ctx, &self.transport, &self.options) => result,
            _ = stopped(&mut self.shutdown) => Err(SyncError::Cancelled),
        };

        let cancelled = matches!(result, Err(SyncError::Cancelled));
        self.finish(&result);
        reply(waiters, &result);
        !cancelled
    }

    fn finish(&mut self, result: &Result<CycleReport, SyncError>) {
        match result {
            Ok(report) => {
                self.attempt = 0;
                self.publish_state(SyncState::Idle);
                self.ctx.events().publish(SyncEvent::CycleCompleted(*report));
            }
            Err(SyncError::Cancelled) => {
                tracing::info!("Sync cycle cancelled");
                self.publish_state(SyncState::Idle);
            }
            Err(SyncError::AuthExpired) => {
                tracing::warn!("Server refused credentials; sync paused");
                self.paused = true;
                self.publish_state(SyncState::Idle);
                self.ctx.events().publish(SyncEvent::AuthExpired);
            }
            Err(e) if e.is_retryable() => {
                self.attempt = self.attempt.saturating_add(1);
                let delay = self.options.retry.delay_for_attempt(self.attempt);
                self.schedule_retry(delay);
                tracing::warn!(
                    "Sync attempt {} failed, retrying in {:?}: {}",
                    self.attempt,
                    delay,
                    e
                );
                self.publish_state(SyncState::Idle);
                self.ctx.events().publish(SyncEvent::CycleFailed {
                    message: e.to_string(),
                    retry_in_ms: Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
                });
            }
            Err(e) => {
                tracing::error!("Sync failed: {}", e);
                self.publish_state(SyncState::Idle);
                self.ctx.events().publish(SyncEvent::CycleFailed {
                    message: e.to_string(),
                    retry_in_ms: None,
                });
            }
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn reply(waiters: Vec<Waiter>, result: &Result<CycleReport, SyncError>) {
    for waiter in waiters {
        let outcome = match result {
            Ok(report) => Ok(*report),
            Err(e) => Err(e.to_shared()),
        };
        let _ = waiter.send(outcome);
    }
}
