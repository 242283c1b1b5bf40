//! Collection scheduler
//!
//! One `Collector` drives one fetcher. Each tick reads the newest stored
//! event of the fetcher's kind, asks the upstream for what follows it and
//! appends the page to the store. Failures are logged and backed off; the
//! loop only ends when its cancellation token fires.

use billing_core::{
    config::CollectorConfig,
    models::{EventKind, RawEvent, RawEventFilter},
    traits::{EventFetcher, RawEventRepository},
    AppError, AppResult,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduling state of a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    /// Nothing fetched yet
    Syncing,

    /// Last page brought new events, poll again soon
    Collecting,

    /// Caught up or backing off after a failure
    Scheduled,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorState::Syncing => write!(f, "syncing"),
            CollectorState::Collecting => write!(f, "collecting"),
            CollectorState::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Polls one fetcher and appends its pages to the raw event store
pub struct Collector<R: RawEventRepository> {
    store: Arc<R>,
    fetcher: Arc<dyn EventFetcher>,
    config: CollectorConfig,
    state: Mutex<CollectorState>,
    events_collected: AtomicU64,
}

impl<R: RawEventRepository> Collector<R> {
    /// Create a collector, rejecting configurations outside the allowed limits
    pub fn new(
        store: Arc<R>,
        fetcher: Arc<dyn EventFetcher>,
        config: CollectorConfig,
    ) -> AppResult<Self> {
        config.check()?;
        Ok(Self {
            store,
            fetcher,
            config,
            state: Mutex::new(CollectorState::Syncing),
            events_collected: AtomicU64::new(0),
        })
    }

    /// Kind of events this collector stores
    pub fn kind(&self) -> EventKind {
        self.fetcher.kind()
    }

    /// Current scheduling state
    pub async fn state(&self) -> CollectorState {
        *self.state.lock().await
    }

    /// Number of events stored since start
    pub fn events_collected(&self) -> u64 {
        self.events_collected.load(Ordering::Relaxed)
    }

    /// Wait before the next tick in `state`
    pub fn wait_time(&self, state: CollectorState) -> Duration {
        match state {
            CollectorState::Syncing => self.config.initial_wait(),
            CollectorState::Collecting => self.config.min_wait_time(),
            CollectorState::Scheduled => self.config.schedule(),
        }
    }

    /// Run one fetch-and-store cycle and return the new state
    pub async fn tick(&self, cancel: &CancellationToken) -> CollectorState {
        let mut state = self.state.lock().await;
        let next = self.collect(cancel).await;
        if *state != next {
            debug!("{} collector: {} -> {}", self.kind(), *state, next);
        }
        *state = next;
        next
    }

    async fn collect(&self, cancel: &CancellationToken) -> CollectorState {
        let kind = self.kind();

        let last_known: Option<RawEvent> =
            match self.store.get_events(&RawEventFilter::latest(kind)).await {
                Ok(mut events) => events.pop(),
                Err(e) => {
                    error!("{} collector: failed to read last stored event: {}", kind, e);
                    return CollectorState::Scheduled;
                }
            };

        let events = match self.fetcher.fetch_events(cancel, last_known.as_ref()).await {
            Ok(events) => events,
            Err(AppError::Cancelled) => {
                debug!("{} collector: fetch cancelled", kind);
                return CollectorState::Scheduled;
            }
            Err(e) => {
                error!(
                    transient = e.is_transient(),
                    "{} collector: fetch failed: {}", kind, e
                );
                return CollectorState::Scheduled;
            }
        };

        let Some(tail) = events.last() else {
            debug!("{} collector: no new events", kind);
            return CollectorState::Scheduled;
        };
        if last_known.as_ref().is_some_and(|last| last.guid == tail.guid) {
            debug!("{} collector: upstream has nothing after {}", kind, tail.guid);
            return CollectorState::Scheduled;
        }

        match self.store.store_events(&events).await {
            Ok(stored) => {
                self.events_collected.fetch_add(stored as u64, Ordering::Relaxed);
                info!(
                    "{} collector: stored {} events after {}",
                    kind,
                    stored,
                    last_known.as_ref().map_or("the beginning", |e| e.guid.as_str())
                );
                CollectorState::Collecting
            }
            Err(e @ AppError::DuplicateEvent { .. }) => {
                warn!("{} collector: page rejected: {}", kind, e);
                CollectorState::Scheduled
            }
            Err(e) => {
                error!("{} collector: failed to store events: {}", kind, e);
                CollectorState::Scheduled
            }
        }
    }

    /// Poll until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let kind = self.kind();
        info!("{} collector started", kind);

        let mut wait = self.wait_time(self.state().await);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let state = self.tick(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            wait = self.wait_time(state);
        }

        info!(
            "{} collector stopped after storing {} events",
            kind,
            self.events_collected()
        );
    }
}
