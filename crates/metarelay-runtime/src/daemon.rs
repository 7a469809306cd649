//! Per-repo relay workers and the daemon that runs them.
//!
//! Each configured repository gets one worker task walking the
//! catch-up → subscribe → reconnect state machine. Workers are independent;
//! the only shared state is the event store and the dispatcher pool. A
//! watch channel roots cooperative shutdown: workers stop reading, finish
//! in-flight dispatches, and exit with the cursor already persisted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use metarelay_core::{
    CloudError, CloudEvents, Event, EventStore, HandlerDispatcher, RepoConfig, StoreError,
};
use metarelay_handlers::HandlerRegistry;

use crate::journal::EventJournal;

const CATCH_UP_PAGE_LIMIT: usize = 100;
const RECONNECT_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
enum WorkerError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkerError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Cloud(error) if error.is_transient())
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

#[derive(Debug, Default)]
struct CatchUpReport {
    fetched: usize,
    dedup_hits: usize,
}

pub struct Daemon {
    store: Arc<dyn EventStore>,
    cloud: Arc<dyn CloudEvents>,
    dispatcher: Arc<dyn HandlerDispatcher>,
    registry: Arc<HandlerRegistry>,
    repos: Vec<RepoConfig>,
}

impl Daemon {
    pub fn new(
        store: Arc<dyn EventStore>,
        cloud: Arc<dyn CloudEvents>,
        dispatcher: Arc<dyn HandlerDispatcher>,
        registry: Arc<HandlerRegistry>,
        repos: Vec<RepoConfig>,
    ) -> Self {
        Self {
            store,
            cloud,
            dispatcher,
            registry,
            repos,
        }
    }

    /// Runs one worker per repo until `shutdown` flips true or a worker
    /// hits a fatal error. A fatal error cancels the remaining workers,
    /// waits for them to drain, and surfaces after the join.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        let forward_cancel = cancel_tx.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    let _ = forward_cancel.send(true);
                    return;
                }
                if shutdown.changed().await.is_err() {
                    let _ = forward_cancel.send(true);
                    return;
                }
            }
        });

        let mut workers = JoinSet::new();
        for repo in &self.repos {
            let worker = self.worker_for(repo)?;
            let cancel = cancel_rx.clone();
            workers.spawn(async move {
                let repo_name = worker.repo.name.clone();
                worker.run(cancel).await.map_err(|error| (repo_name, error))
            });
        }
        drop(cancel_rx);

        let mut first_failure: Option<anyhow::Error> = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.context("repo worker panicked")?;
            if let Err((repo, error)) = outcome {
                tracing::error!(%repo, %error, "repo worker failed; shutting down");
                let _ = cancel_tx.send(true);
                if first_failure.is_none() {
                    first_failure =
                        Some(anyhow::Error::new(error).context(format!("repo {repo} failed")));
                }
            }
        }

        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// One-shot catch-up for every repo, no subscription. Used by the
    /// `sync` subcommand.
    pub async fn sync_once(&self) -> Result<()> {
        let (_halt_tx, halt_rx) = watch::channel(false);
        for repo in &self.repos {
            let mut worker = self.worker_for(repo)?;
            let mut halt = halt_rx.clone();
            worker.cursor = worker
                .store
                .get_cursor(&worker.repo.name)
                .with_context(|| format!("failed to read cursor for {}", repo.name))?
                .unwrap_or(0);
            let report = worker
                .catch_up(&mut halt)
                .await
                .map_err(anyhow::Error::new)
                .with_context(|| format!("catch-up failed for {}", repo.name))?;
            tracing::info!(
                repo = %repo.name,
                fetched = report.fetched,
                dedup_hits = report.dedup_hits,
                cursor = worker.cursor,
                "sync complete"
            );
        }
        Ok(())
    }

    fn worker_for(&self, repo: &RepoConfig) -> Result<RepoWorker> {
        let journal = match &repo.path {
            Some(path) => Some(
                EventJournal::open(path)
                    .with_context(|| format!("failed to open event journal for {}", repo.name))?,
            ),
            None => None,
        };
        Ok(RepoWorker {
            repo: repo.clone(),
            store: self.store.clone(),
            cloud: self.cloud.clone(),
            dispatcher: self.dispatcher.clone(),
            registry: self.registry.clone(),
            journal,
            cursor: 0,
        })
    }
}

struct RepoWorker {
    repo: RepoConfig,
    store: Arc<dyn EventStore>,
    cloud: Arc<dyn CloudEvents>,
    dispatcher: Arc<dyn HandlerDispatcher>,
    registry: Arc<HandlerRegistry>,
    journal: Option<EventJournal>,
    cursor: i64,
}

impl RepoWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        self.cursor = self.store.get_cursor(&self.repo.name)?.unwrap_or(0);
        tracing::info!(repo = %self.repo.name, cursor = self.cursor, "worker starting");

        let mut failure_streak = 0_usize;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.catch_up(&mut shutdown).await {
                Ok(report) => {
                    if report.fetched > 0 {
                        tracing::info!(
                            repo = %self.repo.name,
                            fetched = report.fetched,
                            dedup_hits = report.dedup_hits,
                            cursor = self.cursor,
                            "catch-up complete"
                        );
                    }
                }
                Err(error) if error.is_transient() => {
                    failure_streak = failure_streak.saturating_add(1);
                    tracing::warn!(
                        repo = %self.repo.name,
                        %error,
                        failure_streak,
                        "catch-up failed; backing off"
                    );
                    self.backoff(failure_streak, &mut shutdown).await;
                    continue;
                }
                Err(error) => return Err(error),
            }

            if *shutdown.borrow() {
                break;
            }

            match self.live_session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected) => {
                    failure_streak = 0;
                    tracing::info!(repo = %self.repo.name, "live stream ended; reconnecting");
                    self.backoff(1, &mut shutdown).await;
                }
                Err(error) if error.is_transient() => {
                    failure_streak = failure_streak.saturating_add(1);
                    tracing::warn!(
                        repo = %self.repo.name,
                        %error,
                        failure_streak,
                        "subscription failed; backing off"
                    );
                    self.backoff(failure_streak, &mut shutdown).await;
                }
                Err(error) => return Err(error),
            }
        }

        tracing::info!(repo = %self.repo.name, cursor = self.cursor, "worker stopped");
        Ok(())
    }

    /// Paginates the catch-up API until an empty page. Each event is fully
    /// dispatched (or dedup-skipped) and the cursor advanced before the
    /// next one starts.
    async fn catch_up(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CatchUpReport, WorkerError> {
        let mut report = CatchUpReport::default();
        loop {
            if *shutdown.borrow() {
                return Ok(report);
            }
            let page = self
                .cloud
                .fetch_since(&self.repo.name, self.cursor, CATCH_UP_PAGE_LIMIT)
                .await?;
            if page.is_empty() {
                return Ok(report);
            }
            report.fetched += page.len();
            for event in &page {
                if !self.process_event(event).await? {
                    report.dedup_hits += 1;
                }
            }
        }
    }

    /// Consumes the live stream until shutdown or disconnect. Live arrival
    /// order is not id order; an event landing beyond `cursor + 1` with no
    /// intermediate claims re-enters catch-up to fill the hole first.
    async fn live_session(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, WorkerError> {
        let mut subscription = self.cloud.subscribe(&self.repo.name).await?;
        tracing::info!(repo = %self.repo.name, "live subscription established");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                event = subscription.next_event() => {
                    let Some(event) = event else {
                        return Ok(SessionEnd::Disconnected);
                    };
                    if event.id <= self.cursor {
                        // Everything at or below the cursor was already
                        // dispatched or deliberately skipped; accept the
                        // row for dedup accounting only.
                        if self.store.try_claim(&event)? {
                            if let Some(journal) = &self.journal {
                                journal.append(&event)?;
                            }
                            tracing::debug!(
                                repo = %self.repo.name,
                                event_id = event.id,
                                cursor = self.cursor,
                                "late event below cursor; not redispatched"
                            );
                        } else {
                            tracing::debug!(
                                repo = %self.repo.name,
                                event_id = event.id,
                                "duplicate event skipped"
                            );
                        }
                        continue;
                    }
                    if self.gap_before(&event)? {
                        tracing::debug!(
                            repo = %self.repo.name,
                            cursor = self.cursor,
                            arrived = event.id,
                            "gap in live stream; re-entering catch-up"
                        );
                        self.catch_up(shutdown).await?;
                    }
                    self.process_event(&event).await?;
                }
            }
        }
    }

    fn gap_before(&self, event: &Event) -> Result<bool, WorkerError> {
        if event.id <= self.cursor + 1 {
            return Ok(false);
        }
        let filled = self
            .store
            .any_claimed_between(&self.repo.name, self.cursor, event.id)?;
        Ok(!filled)
    }

    /// The per-event procedure shared by catch-up and the live path:
    /// claim → journal → match → dispatch all → advance cursor. Returns
    /// false on a dedup hit (the cursor still advances past the event).
    async fn process_event(&mut self, event: &Event) -> Result<bool, WorkerError> {
        let claimed = self.store.try_claim(event)?;

        if claimed {
            if let Some(journal) = &self.journal {
                journal.append(event)?;
            }

            let matched = self.registry.match_event(event);
            if !matched.is_empty() {
                let dispatches = matched
                    .iter()
                    .map(|handler| self.dispatcher.dispatch(handler, event));
                for outcome in future::join_all(dispatches).await {
                    let record = outcome?;
                    tracing::info!(
                        repo = %self.repo.name,
                        event_id = event.id,
                        handler = %record.handler_name,
                        outcome = record.outcome.as_str(),
                        "handler finished"
                    );
                }
            } else {
                tracing::debug!(
                    repo = %self.repo.name,
                    event_id = event.id,
                    event_type = %event.event_type,
                    action = %event.action,
                    "no handlers matched"
                );
            }
        } else {
            tracing::debug!(
                repo = %self.repo.name,
                event_id = event.id,
                "duplicate event skipped"
            );
        }

        if event.id > self.cursor {
            self.store.set_cursor(&self.repo.name, event.id)?;
            self.cursor = event.id;
        }
        Ok(claimed)
    }

    async fn backoff(&self, attempt: usize, shutdown: &mut watch::Receiver<bool>) {
        let delay = reconnect_delay(&self.repo.name, attempt);
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Exponential backoff from 1 s doubling to a 30 s cap, with deterministic
/// jitter derived from the repo name so workers do not reconnect in
/// lockstep.
fn reconnect_delay(seed: &str, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5) as u32;
    let base = Duration::from_secs(1 << exponent).min(RECONNECT_CAP);

    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    let mut seed_bytes = [0_u8; 8];
    seed_bytes.copy_from_slice(&digest[..8]);
    let jitter_ms = u64::from_le_bytes(seed_bytes) % 500;

    base + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests;
