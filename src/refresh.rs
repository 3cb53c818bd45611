//! Refresh coordination.
//!
//! One refresh cycle fetches the four collections for a query concurrently and
//! joins them before anything downstream sees the result; a cycle either
//! produces a complete [`JourneySnapshot`] or fails as a whole.
//!
//! Cycles can overlap (a poll tick racing a manual refresh, or the user
//! switching agent mid-fetch). Every cycle is tagged with a generation from a
//! monotonically increasing counter, and [`RefreshCoordinator::commit`] only
//! accepts the latest generation issued, and only once. Late results from
//! superseded cycles are discarded even if nothing newer has committed yet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RefreshConfig;
use crate::engine::EngineCommand;
use crate::error::Result;
use crate::repository::{CachePolicy, CollectionSource, Freshness, Repository};
use crate::time_window::DateRange;
use crate::types::{ClientLocation, ExpenseRecord, JourneySnapshot, Meeting, Ping};

/// The (agent, date range) a journey is computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JourneyQuery {
    pub agent_id: String,
    pub range: DateRange,
}

impl JourneyQuery {
    pub fn new(agent_id: &str, range: DateRange) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            range,
        }
    }
}

/// Backend collections for one agent.
///
/// Clients are not scoped to a query; the other three are.
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn fetch_pings<'a>(&'a self, query: &'a JourneyQuery) -> BoxFuture<'a, Result<Vec<Ping>>>;

    fn fetch_meetings<'a>(&'a self, query: &'a JourneyQuery)
        -> BoxFuture<'a, Result<Vec<Meeting>>>;

    fn fetch_expenses<'a>(
        &'a self,
        query: &'a JourneyQuery,
    ) -> BoxFuture<'a, Result<Vec<ExpenseRecord>>>;

    fn fetch_clients(&self) -> BoxFuture<'_, Result<Vec<ClientLocation>>>;
}

/// Fetch all four collections concurrently, with no caching.
///
/// Any failure fails the whole fetch. Records with unusable coordinates are
/// dropped or repaired before the snapshot is returned.
pub async fn fetch_all<D: DataSource + ?Sized>(
    source: &D,
    query: &JourneyQuery,
) -> Result<JourneySnapshot> {
    let (pings, meetings, clients, expenses) = futures::try_join!(
        source.fetch_pings(query),
        source.fetch_meetings(query),
        source.fetch_clients(),
        source.fetch_expenses(query),
    )?;

    debug!(
        "[Refresh] {} fetched {} pings, {} meetings, {} clients, {} expenses for '{}'",
        source.name(),
        pings.len(),
        meetings.len(),
        clients.len(),
        expenses.len(),
        query.agent_id
    );

    let mut snapshot = JourneySnapshot {
        agent_id: query.agent_id.clone(),
        pings,
        meetings,
        clients,
        expenses,
    };
    snapshot.sanitize();
    Ok(snapshot)
}

// ============================================================================
// Repository adapters
// ============================================================================

/// Query-scoped collections, fetched together.
#[derive(Debug, Clone, Default)]
struct AgentActivity {
    pings: Vec<Ping>,
    meetings: Vec<Meeting>,
    expenses: Vec<ExpenseRecord>,
}

struct ActivityFeed<D: ?Sized> {
    source: Arc<D>,
}

impl<D: DataSource + ?Sized> CollectionSource for ActivityFeed<D> {
    type Key = JourneyQuery;
    type Item = AgentActivity;

    fn name(&self) -> &str {
        self.source.name()
    }

    fn fetch<'a>(&'a self, query: &'a JourneyQuery) -> BoxFuture<'a, Result<AgentActivity>> {
        async move {
            futures::try_join!(
                self.source.fetch_pings(query),
                self.source.fetch_meetings(query),
                self.source.fetch_expenses(query),
            )
            .map(|(pings, meetings, expenses)| AgentActivity {
                pings,
                meetings,
                expenses,
            })
        }
        .boxed()
    }
}

struct ClientDirectory<D: ?Sized> {
    source: Arc<D>,
}

impl<D: DataSource + ?Sized> CollectionSource for ClientDirectory<D> {
    type Key = ();
    type Item = Vec<ClientLocation>;

    fn name(&self) -> &str {
        self.source.name()
    }

    fn fetch<'a>(&'a self, _key: &'a ()) -> BoxFuture<'a, Result<Vec<ClientLocation>>> {
        self.source.fetch_clients()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// A complete snapshot produced by one cycle, not yet committed.
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub query: JourneyQuery,
    pub snapshot: Arc<JourneySnapshot>,
    /// Worst freshness of the parts the snapshot was assembled from
    pub freshness: Freshness,
}

/// A snapshot accepted by [`RefreshCoordinator::commit`].
#[derive(Debug, Clone)]
pub struct CommittedSnapshot {
    pub generation: u64,
    pub query: JourneyQuery,
    pub snapshot: Arc<JourneySnapshot>,
    pub freshness: Freshness,
}

impl CommittedSnapshot {
    /// Command that loads this snapshot into a [`crate::JourneyEngine`].
    pub fn to_command(&self) -> EngineCommand {
        EngineCommand::LoadSnapshot {
            generation: self.generation,
            snapshot: Arc::clone(&self.snapshot),
        }
    }
}

/// Runs refresh cycles and publishes the newest complete snapshot.
pub struct RefreshCoordinator<D: DataSource + ?Sized> {
    activity: Repository<ActivityFeed<D>>,
    clients: Repository<ClientDirectory<D>>,
    issued: AtomicU64,
    committed: AtomicU64,
    published: watch::Sender<Option<CommittedSnapshot>>,
}

impl<D: DataSource + ?Sized> RefreshCoordinator<D> {
    pub fn new(source: Arc<D>, config: &RefreshConfig) -> Self {
        let (published, _) = watch::channel(None);
        Self {
            activity: Repository::new(
                ActivityFeed {
                    source: Arc::clone(&source),
                },
                CachePolicy::always_fetch(config.snapshot_cache_capacity),
            ),
            clients: Repository::new(
                ClientDirectory { source },
                CachePolicy {
                    max_age: config.client_cache_max_age(),
                    capacity: 1,
                },
            ),
            issued: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            published,
        }
    }

    /// Tag a new cycle. Generations start at 1.
    pub fn begin(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Generation of the newest committed snapshot, 0 if none.
    pub fn committed_generation(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// Accept `fetched` if `generation` is the latest issued and newer than
    /// the last commit.
    pub fn commit(&self, generation: u64, fetched: FetchedSnapshot) -> Option<CommittedSnapshot> {
        let latest = self.issued.load(Ordering::SeqCst);
        if generation < latest {
            debug!(
                "[Refresh] Discarding generation {} for '{}' (superseded by generation {})",
                generation, fetched.query.agent_id, latest
            );
            return None;
        }

        let previous = self.committed.fetch_max(generation, Ordering::SeqCst);
        if generation <= previous {
            debug!(
                "[Refresh] Discarding generation {} for '{}' (generation {} already committed)",
                generation, fetched.query.agent_id, previous
            );
            return None;
        }

        let committed = CommittedSnapshot {
            generation,
            query: fetched.query,
            snapshot: fetched.snapshot,
            freshness: fetched.freshness,
        };
        self.published.send_replace(Some(committed.clone()));
        info!(
            "[Refresh] Committed generation {} for '{}' ({:?})",
            generation, committed.query.agent_id, committed.freshness
        );
        Some(committed)
    }

    /// Receiver that sees every committed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Option<CommittedSnapshot>> {
        self.published.subscribe()
    }

    pub fn latest(&self) -> Option<CommittedSnapshot> {
        self.published.borrow().clone()
    }

    /// Fetch a complete snapshot for `query` through the caches.
    ///
    /// `force` bypasses the client cache (a manual refresh). Either part may be
    /// served stale if its fetch fails and a previous copy exists.
    pub async fn fetch(&self, query: &JourneyQuery, force: bool) -> Result<FetchedSnapshot> {
        let (activity, clients) = futures::try_join!(
            self.activity.get(query, force),
            self.clients.get(&(), force),
        )?;

        let mut snapshot = JourneySnapshot {
            agent_id: query.agent_id.clone(),
            pings: activity.value.pings.clone(),
            meetings: activity.value.meetings.clone(),
            clients: clients.value.as_ref().clone(),
            expenses: activity.value.expenses.clone(),
        };
        snapshot.sanitize();

        Ok(FetchedSnapshot {
            query: query.clone(),
            snapshot: Arc::new(snapshot),
            freshness: activity.freshness.combine(clients.freshness),
        })
    }

    /// Run one full cycle: tag, fetch, commit.
    ///
    /// Returns `Ok(None)` when a newer cycle committed first.
    pub async fn refresh(
        &self,
        query: &JourneyQuery,
        force: bool,
    ) -> Result<Option<CommittedSnapshot>> {
        let generation = self.begin();
        debug!(
            "[Refresh] Cycle {} for '{}' {} - {}{}",
            generation,
            query.agent_id,
            query.range.start,
            query.range.end,
            if force { " (forced)" } else { "" }
        );

        match self.fetch(query, force).await {
            Ok(fetched) => Ok(self.commit(generation, fetched)),
            Err(e) => {
                warn!("[Refresh] Cycle {} for '{}' failed: {}", generation, query.agent_id, e);
                Err(e)
            }
        }
    }
}

impl<D: DataSource + ?Sized + 'static> RefreshCoordinator<D> {
    /// Run a cycle for `query` now and then every `interval`, until the
    /// returned handle is cancelled or dropped.
    pub fn spawn_polling(self: &Arc<Self>, query: JourneyQuery, interval: Duration) -> PollHandle {
        let coordinator = Arc::clone(self);
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        let period = interval.max(Duration::from_millis(1));

        info!(
            "[Refresh] Polling '{}' every {:?}",
            query.agent_id, period
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => {
                        debug!("[Refresh] Polling '{}' cancelled", query.agent_id);
                        break;
                    }
                    _ = ticker.tick() => {
                        // Failures are logged by refresh(); the next tick retries
                        let _ = coordinator.refresh(&query, false).await;
                    }
                }
            }
        });

        PollHandle {
            cancel: Some(cancel),
            task,
        }
    }
}

/// Handle to a polling loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct PollHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Stop after the cycle in flight, if any.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JourneyError;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct FakeBackend {
        ping_calls: AtomicUsize,
        client_calls: AtomicUsize,
        meetings_down: AtomicBool,
        clients_down: AtomicBool,
        garbled_pings: AtomicBool,
    }

    fn unavailable() -> JourneyError {
        JourneyError::Http {
            message: "gateway timeout".to_string(),
            status_code: Some(504),
        }
    }

    impl DataSource for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        fn fetch_pings<'a>(&'a self, query: &'a JourneyQuery) -> BoxFuture<'a, Result<Vec<Ping>>> {
            async move {
                let call = self.ping_calls.fetch_add(1, Ordering::SeqCst);
                let at = query.range.start.and_hms_opt(9, 0, 0).unwrap().and_utc();
                let mut pings = vec![Ping::new(at, call as f64, 0.0)];
                if self.garbled_pings.load(Ordering::SeqCst) {
                    pings.push(Ping::new(at, f64::NAN, f64::NAN));
                }
                Ok(pings)
            }
            .boxed()
        }

        fn fetch_meetings<'a>(
            &'a self,
            _query: &'a JourneyQuery,
        ) -> BoxFuture<'a, Result<Vec<Meeting>>> {
            async move {
                if self.meetings_down.load(Ordering::SeqCst) {
                    return Err(unavailable());
                }
                Ok(Vec::new())
            }
            .boxed()
        }

        fn fetch_expenses<'a>(
            &'a self,
            _query: &'a JourneyQuery,
        ) -> BoxFuture<'a, Result<Vec<ExpenseRecord>>> {
            async { Ok(Vec::new()) }.boxed()
        }

        fn fetch_clients(&self) -> BoxFuture<'_, Result<Vec<ClientLocation>>> {
            async move {
                self.client_calls.fetch_add(1, Ordering::SeqCst);
                if self.clients_down.load(Ordering::SeqCst) {
                    return Err(unavailable());
                }
                Ok(vec![ClientLocation::new("c1", "Acme", None)])
            }
            .boxed()
        }
    }

    fn query(agent: &str) -> JourneyQuery {
        JourneyQuery::new(
            agent,
            DateRange::single_day(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()),
        )
    }

    fn coordinator() -> Arc<RefreshCoordinator<FakeBackend>> {
        Arc::new(RefreshCoordinator::new(
            Arc::new(FakeBackend::default()),
            &RefreshConfig::default(),
        ))
    }

    fn fetched(agent: &str) -> FetchedSnapshot {
        FetchedSnapshot {
            query: query(agent),
            snapshot: Arc::new(JourneySnapshot::new(agent)),
            freshness: Freshness::Fresh,
        }
    }

    #[tokio::test]
    async fn test_fetch_all_joins_collections() {
        let backend = FakeBackend::default();
        let snapshot = fetch_all(&backend, &query("agent-1")).await.unwrap();

        assert_eq!(snapshot.agent_id, "agent-1");
        assert_eq!(snapshot.pings.len(), 1);
        assert_eq!(snapshot.clients.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_all_fails_as_a_whole() {
        let backend = FakeBackend::default();
        backend.meetings_down.store(true, Ordering::SeqCst);

        let result = fetch_all(&backend, &query("agent-1")).await;
        assert_eq!(result, Err(unavailable()));
    }

    #[tokio::test]
    async fn test_unusable_pings_dropped_on_entry() {
        let backend = FakeBackend::default();
        backend.garbled_pings.store(true, Ordering::SeqCst);
        let snapshot = fetch_all(&backend, &query("agent-1")).await.unwrap();
        assert_eq!(snapshot.pings.len(), 1);

        let coordinator = coordinator();
        let source = coordinator.clients.source().source.clone();
        source.garbled_pings.store(true, Ordering::SeqCst);
        let fetched = coordinator.fetch(&query("agent-1"), false).await.unwrap();
        assert_eq!(fetched.snapshot.invalid_coordinate_count(), 0);
        assert_eq!(fetched.snapshot.pings.len(), 1);
    }

    #[test]
    fn test_stale_generation_discarded() {
        let coordinator = coordinator();
        let older = coordinator.begin();
        let newer = coordinator.begin();
        assert!(newer > older);

        assert!(coordinator.commit(newer, fetched("new")).is_some());
        assert!(coordinator.commit(older, fetched("old")).is_none());
        assert!(coordinator.commit(newer, fetched("dup")).is_none());

        let latest = coordinator.latest().unwrap();
        assert_eq!(latest.generation, newer);
        assert_eq!(latest.query.agent_id, "new");
        assert_eq!(coordinator.committed_generation(), newer);
    }

    #[test]
    fn test_superseded_generation_discarded_before_newer_commits() {
        let coordinator = coordinator();
        let older = coordinator.begin();
        let newer = coordinator.begin();

        // The older cycle finishes first but a newer one is already in flight
        assert!(coordinator.commit(older, fetched("old-range")).is_none());
        assert!(coordinator.latest().is_none());
        assert_eq!(coordinator.committed_generation(), 0);

        let committed = coordinator.commit(newer, fetched("new-range")).unwrap();
        assert_eq!(committed.generation, newer);
        assert_eq!(coordinator.committed_generation(), newer);
    }

    #[tokio::test]
    async fn test_refresh_publishes() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();

        let committed = coordinator.refresh(&query("agent-2"), false).await.unwrap().unwrap();
        assert_eq!(committed.generation, 1);
        assert_eq!(committed.freshness, Freshness::Fresh);

        rx.changed().await.unwrap();
        let seen = rx.borrow().clone().unwrap();
        assert_eq!(seen.snapshot.agent_id, "agent-2");
        assert!(matches!(
            seen.to_command(),
            EngineCommand::LoadSnapshot { generation: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_cached_until_forced() {
        let coordinator = coordinator();
        let q = query("agent-3");

        coordinator.refresh(&q, false).await.unwrap();
        let second = coordinator.refresh(&q, false).await.unwrap().unwrap();
        assert_eq!(second.freshness, Freshness::Cached);

        let backend = coordinator.clients.source().source.clone();
        assert_eq!(backend.client_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.ping_calls.load(Ordering::SeqCst), 2);

        let forced = coordinator.refresh(&q, true).await.unwrap().unwrap();
        assert_eq!(forced.freshness, Freshness::Fresh);
        assert_eq!(backend.client_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_degraded_mode_serves_last_good() {
        let coordinator = coordinator();
        let q = query("agent-4");
        let first = coordinator.refresh(&q, true).await.unwrap().unwrap();

        let backend = coordinator.clients.source().source.clone();
        backend.meetings_down.store(true, Ordering::SeqCst);
        backend.clients_down.store(true, Ordering::SeqCst);

        let degraded = coordinator.refresh(&q, true).await.unwrap().unwrap();
        assert!(degraded.freshness.is_stale());
        assert_eq!(degraded.snapshot.pings, first.snapshot.pings);
        assert_eq!(degraded.snapshot.clients.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_without_history() {
        let coordinator = coordinator();
        coordinator
            .clients
            .source()
            .source
            .meetings_down
            .store(true, Ordering::SeqCst);

        let err = coordinator.refresh(&query("agent-5"), false).await.unwrap_err();
        assert!(matches!(err, JourneyError::DataUnavailable { .. }));
        assert!(coordinator.latest().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_runs_until_cancelled() {
        let coordinator = coordinator();
        let backend = coordinator.clients.source().source.clone();

        let mut handle = coordinator.spawn_polling(query("agent-6"), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(backend.ping_calls.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.ping_calls.load(Ordering::SeqCst), 3);
        assert!(handle.is_finished());
        assert_eq!(coordinator.committed_generation(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_polling() {
        let coordinator = coordinator();
        let backend = coordinator.clients.source().source.clone();

        let handle = coordinator.spawn_polling(query("agent-7"), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(handle);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.ping_calls.load(Ordering::SeqCst), 1);
    }
}
