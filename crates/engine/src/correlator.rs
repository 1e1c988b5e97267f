//! Correlator — matches asynchronous response records to dispatched requests.
//!
//! The notification feed has no request/response semantics: it may deliver
//! late, twice, or not at all, and a response may be written before anyone
//! listens for it.  [`Correlator::await_response`] therefore races three
//! paths for a single correlation id:
//!
//! 1. an immediate store lookup (the response already exists),
//! 2. the live feed, filtered by schema and correlation tag,
//! 3. a periodic store poll as a safety net for lost notifications.
//!
//! Every path funnels into [`Correlator::resolve`], which removes the entry
//! from the pending table.  Whoever removes it wins; every later attempt is
//! a no-op.  An entry is also removed on timeout and when the waiting
//! future is dropped, so the table never outgrows the in-flight requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use records::{EventStream, NotificationFeed, RecordEvent, RecordFilter, RecordStore, StoreError};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::protocol::{CorrelationId, Response};

/// How a wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Response(Response),
    TimedOut,
}

/// An outstanding request in the pending table.
#[derive(Debug)]
pub struct PendingRequest {
    pub step_id: String,
    pub issued_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    /// Registration that owns the entry; a re-registered id gets a new one.
    waiter: u64,
    tx: oneshot::Sender<Response>,
}

/// Which store path a finished lookup came from.
#[derive(Debug, Clone, Copy)]
enum Source {
    /// Initial check or fallback poll.
    Lookup,
    /// Live event, fetched or parsed inline.
    Fetch(Uuid),
}

/// Counters since the correlator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub resolved: u64,
    pub timed_out: u64,
    /// Late or duplicate responses for ids no longer pending.
    pub ignored: u64,
}

pub struct Correlator {
    store: Arc<dyn RecordStore>,
    feed: Arc<dyn NotificationFeed>,
    pending: DashMap<CorrelationId, PendingRequest>,
    response_schema: String,
    poll_interval: Duration,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    ignored: AtomicU64,
    next_waiter: AtomicU64,
}

/// Removes the pending entry if the waiter goes away without resolving.
struct PendingGuard<'a> {
    pending: &'a DashMap<CorrelationId, PendingRequest>,
    id: CorrelationId,
    waiter: u64,
}

impl PendingGuard<'_> {
    /// Remove the entry only while it still belongs to this waiter.
    fn release(&self) -> bool {
        self.pending
            .remove_if(&self.id, |_, pending| pending.waiter == self.waiter)
            .is_some()
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.release() {
            debug!(correlation_id = %self.id, "waiter dropped; pending request discarded");
        }
    }
}

impl Correlator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        feed: Arc<dyn NotificationFeed>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            feed,
            pending: DashMap::new(),
            response_schema: config.response_schema.clone(),
            poll_interval: config.poll_interval,
            resolved: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            next_waiter: AtomicU64::new(0),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Step id of a pending request.
    pub fn pending_step(&self, id: CorrelationId) -> Option<String> {
        self.pending.get(&id).map(|p| p.step_id.clone())
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            resolved: self.resolved.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }

    /// Wait for the response to `id`, or [`Resolution::TimedOut`] after `timeout`.
    ///
    /// Call after the request record has been written; a response that
    /// arrived in between is found by the initial store lookup.
    #[instrument(skip(self), fields(correlation_id = %id))]
    pub async fn await_response(
        &self,
        id: CorrelationId,
        step_id: &str,
        timeout: Duration,
    ) -> Resolution {
        let (tx, mut rx) = oneshot::channel();
        let issued_at = Utc::now();
        let timeout_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|budget| issued_at.checked_add_signed(budget))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let waiter = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let previous = self.pending.insert(
            id,
            PendingRequest {
                step_id: step_id.to_owned(),
                issued_at,
                timeout_at,
                waiter,
                tx,
            },
        );
        if let Some(abandoned) = previous {
            // Dropping its sender wakes the earlier waiter with a timeout.
            drop(abandoned);
            warn!("correlation id registered twice; the earlier waiter is abandoned");
        }
        let guard = PendingGuard {
            pending: &self.pending,
            id,
            waiter,
        };
        let deadline = Instant::now() + timeout;

        // Subscribe before the first lookup so nothing slips between them.
        let mut events = match self.feed.subscribe() {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "feed subscription failed; relying on store polling");
                None
            }
        };

        // Store calls run as futures of their own, raced against the
        // deadline, so a slow or hung store never stretches the timeout.
        let mut store_work: FuturesUnordered<BoxFuture<'_, (Source, bool)>> =
            FuturesUnordered::new();
        store_work.push(self.lookup_once(id));
        let mut polling = true;

        let mut poll =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;

                resolved = &mut rx => {
                    return match resolved {
                        Ok(response) => Resolution::Response(response),
                        // Sender dropped without a value: entry was replaced.
                        Err(_) => self.count_timeout(),
                    };
                }

                _ = &mut expiry => {
                    if guard.release() {
                        debug!(?timeout, "no response before deadline");
                        return self.count_timeout();
                    }
                    // Lost the race to a resolver; its value is in the channel.
                    return match rx.await {
                        Ok(response) => Resolution::Response(response),
                        Err(_) => self.count_timeout(),
                    };
                }

                Some((source, hit)) = store_work.next(), if !store_work.is_empty() => {
                    match source {
                        Source::Lookup => polling = false,
                        Source::Fetch(_) => {}
                    }
                    if hit {
                        debug!(?source, "pending request resolved");
                    }
                }

                event = next_event(&mut events) => match event {
                    Some(event) => {
                        let record_id = event.record_id;
                        store_work.push(
                            async move { self.handle_event(&event).await }
                                .map(move |hit| (Source::Fetch(record_id), hit))
                                .boxed(),
                        );
                    }
                    None => {
                        warn!("notification feed closed; relying on store polling");
                        events = None;
                    }
                },

                _ = poll.tick() => {
                    // One lookup at a time; a slow store skips ticks.
                    if !polling {
                        polling = true;
                        store_work.push(self.lookup_once(id));
                    }
                }
            }
        }
    }

    fn lookup_once(&self, id: CorrelationId) -> BoxFuture<'_, (Source, bool)> {
        self.poll_once(id).map(|hit| (Source::Lookup, hit)).boxed()
    }

    fn count_timeout(&self) -> Resolution {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        Resolution::TimedOut
    }

    /// Route a feed event to its pending request, if any.
    ///
    /// Returns `true` only if this call resolved the request.  Events for
    /// other schemas, unknown ids or already-resolved ids are ignored.
    pub async fn handle_event(&self, event: &RecordEvent) -> bool {
        if event.schema_name.as_deref() != Some(self.response_schema.as_str()) {
            return false;
        }
        let Some(id) = CorrelationId::from_tags(&event.tags) else {
            return false;
        };
        if !self.pending.contains_key(&id) {
            return false;
        }

        let response = match Response::from_event(event, id) {
            Some(response) => response,
            None => match self.store.get(event.record_id).await {
                Ok(record) => Response::from_record(&record, id),
                Err(e) => {
                    warn!(correlation_id = %id, error = %e, "could not fetch response record");
                    return false;
                }
            },
        };
        self.resolve(id, response)
    }

    /// Look the response up in the store.  The earliest matching record wins.
    pub async fn lookup(&self, id: CorrelationId) -> Result<Option<Response>, StoreError> {
        let filter = RecordFilter::schema(self.response_schema.clone()).with_tag(id.tag());
        let hits = self.store.search(&filter).await?;
        Ok(hits.last().map(|record| Response::from_record(record, id)))
    }

    /// Resolve a pending request.  Returns `false` if it was already resolved,
    /// timed out, or never registered.
    pub fn resolve(&self, id: CorrelationId, response: Response) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                self.resolved.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %id,
                    step_id = %pending.step_id,
                    waited_ms = (Utc::now() - pending.issued_at).num_milliseconds(),
                    "pending request resolved"
                );
                if pending.tx.send(response).is_err() {
                    debug!(correlation_id = %id, "waiter already gone");
                }
                true
            }
            None => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %id, "late or duplicate response ignored");
                false
            }
        }
    }

    /// Store errors are logged and retried on the next tick, never surfaced.
    async fn poll_once(&self, id: CorrelationId) -> bool {
        match self.lookup(id).await {
            Ok(Some(response)) => self.resolve(id, response),
            Ok(None) => false,
            Err(e) => {
                warn!(correlation_id = %id, error = %e, "store poll failed; retrying");
                false
            }
        }
    }
}

async fn next_event(events: &mut Option<EventStream>) -> Option<RecordEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolResponse;
    use rand::Rng;
    use records::memory::InMemoryStore;
    use serde_json::json;

    fn setup(poll_ms: u64) -> (Arc<InMemoryStore>, Arc<Correlator>) {
        let store = Arc::new(InMemoryStore::new());
        let config = EngineConfig {
            poll_interval: Duration::from_millis(poll_ms),
            ..EngineConfig::default()
        };
        let correlator = Arc::new(Correlator::new(store.clone(), store.clone(), &config));
        (store, correlator)
    }

    async fn respond(store: &InMemoryStore, id: CorrelationId, output: serde_json::Value) -> uuid::Uuid {
        store
            .create(ToolResponse::success(output).into_record("tool.response.v1", id))
            .await
            .unwrap()
            .id
    }

    fn expect_response(resolution: Resolution) -> Response {
        match resolution {
            Resolution::Response(response) => response,
            Resolution::TimedOut => panic!("expected a response, got a timeout"),
        }
    }

    #[tokio::test]
    async fn response_already_in_store_resolves_immediately() {
        let (store, correlator) = setup(10_000);
        let id = CorrelationId::new();
        let record_id = respond(&store, id, json!({ "numbers": [7] })).await;

        let response = expect_response(
            correlator.await_response(id, "num1", Duration::from_secs(5)).await,
        );
        assert_eq!(response.record_id, record_id);
        assert_eq!(response.body.output, json!({ "numbers": [7] }));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn live_event_resolves_waiter() {
        let (store, correlator) = setup(10_000);
        let id = CorrelationId::new();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.await_response(id, "s", Duration::from_secs(5)).await })
        };
        while !correlator.is_pending(id) {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        respond(&store, id, json!("live")).await;

        let response = expect_response(waiter.await.unwrap());
        assert_eq!(response.body.output, json!("live"));
        assert_eq!(correlator.stats().resolved, 1);
    }

    #[tokio::test]
    async fn event_without_inline_context_fetches_record() {
        let (store, correlator) = setup(10_000);
        store.inline_context(false);
        let id = CorrelationId::new();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.await_response(id, "s", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        respond(&store, id, json!({ "fetched": true })).await;

        let response = expect_response(waiter.await.unwrap());
        assert_eq!(response.body.output["fetched"], true);
    }

    #[tokio::test]
    async fn fallback_poll_finds_response_when_notification_is_lost() {
        let (store, correlator) = setup(25);
        store.mute_events(true);
        let id = CorrelationId::new();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.await_response(id, "s", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        respond(&store, id, json!("polled")).await;

        let response = expect_response(waiter.await.unwrap());
        assert_eq!(response.body.output, json!("polled"));
    }

    #[tokio::test]
    async fn transient_store_errors_do_not_fail_the_wait() {
        let (store, correlator) = setup(10);
        store.mute_events(true);
        let id = CorrelationId::new();
        respond(&store, id, json!("eventually")).await;
        store.fail_next_searches(3);

        let response = expect_response(
            correlator.await_response(id, "s", Duration::from_secs(5)).await,
        );
        assert_eq!(response.body.output, json!("eventually"));
    }

    #[tokio::test]
    async fn timeout_fires_on_time_and_cleans_up() {
        let (store, correlator) = setup(20);
        let id = CorrelationId::new();

        let started = Instant::now();
        let resolution = correlator.await_response(id, "slow", Duration::from_millis(100)).await;
        let elapsed = started.elapsed();

        assert_eq!(resolution, Resolution::TimedOut);
        assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "fired late: {elapsed:?}");
        assert!(!correlator.is_pending(id));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(correlator.stats().timed_out, 1);

        // A response arriving after the timeout is ignored.
        let late_id = respond(&store, id, json!(1)).await;
        let late = Response::from_record(&store.get(late_id).await.unwrap(), id);
        assert!(!correlator.resolve(id, late));
    }

    /// Delegates to an `InMemoryStore` but every search takes `delay`.
    struct SlowSearch {
        inner: Arc<InMemoryStore>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl RecordStore for SlowSearch {
        async fn create(&self, record: records::RecordCreate) -> Result<records::Record, StoreError> {
            self.inner.create(record).await
        }

        async fn search(&self, filter: &RecordFilter) -> Result<Vec<records::Record>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.search(filter).await
        }

        async fn get(&self, id: uuid::Uuid) -> Result<records::Record, StoreError> {
            self.inner.get(id).await
        }
    }

    fn setup_slow_search(delay: Duration) -> (Arc<InMemoryStore>, Arc<Correlator>) {
        let inner = Arc::new(InMemoryStore::new());
        let store = Arc::new(SlowSearch {
            inner: inner.clone(),
            delay,
        });
        let config = EngineConfig {
            poll_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let correlator = Arc::new(Correlator::new(store, inner.clone(), &config));
        (inner, correlator)
    }

    #[tokio::test]
    async fn slow_store_does_not_stretch_the_timeout() {
        let (store, correlator) = setup_slow_search(Duration::from_secs(2));
        let id = CorrelationId::new();

        let started = Instant::now();
        let resolution = correlator.await_response(id, "slow", Duration::from_millis(100)).await;
        let elapsed = started.elapsed();

        assert_eq!(resolution, Resolution::TimedOut);
        assert!(elapsed < Duration::from_millis(400), "timeout took {elapsed:?}");
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(correlator.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn live_event_wins_while_a_lookup_is_stuck() {
        let (store, correlator) = setup_slow_search(Duration::from_secs(10));
        let id = CorrelationId::new();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.await_response(id, "s", Duration::from_secs(1)).await })
        };
        while !correlator.is_pending(id) {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        respond(&store, id, json!("via feed")).await;

        let started = Instant::now();
        let response = expect_response(waiter.await.unwrap());
        assert_eq!(response.body.output, json!("via feed"));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn responses_for_other_ids_are_not_cross_resolved() {
        let (store, correlator) = setup(10);
        let mine = CorrelationId::new();
        let theirs = CorrelationId::new();
        respond(&store, theirs, json!("not yours")).await;

        let resolution = correlator.await_response(mine, "s", Duration::from_millis(60)).await;
        assert_eq!(resolution, Resolution::TimedOut);
    }

    #[tokio::test]
    async fn dropping_the_waiter_removes_the_entry() {
        let (_store, correlator) = setup(10_000);
        let id = CorrelationId::new();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.await_response(id, "s", Duration::from_secs(5)).await })
        };
        while !correlator.is_pending(id) {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;
        assert!(!correlator.is_pending(id));
    }

    #[tokio::test]
    async fn replaced_registration_counts_as_timed_out() {
        let (store, correlator) = setup(10_000);
        let id = CorrelationId::new();

        let first = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.await_response(id, "s", Duration::from_secs(5)).await })
        };
        while !correlator.is_pending(id) {
            tokio::task::yield_now().await;
        }
        let second = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.await_response(id, "s", Duration::from_secs(5)).await })
        };

        // Re-registering drops the first waiter's sender.
        let started = Instant::now();
        assert_eq!(first.await.unwrap(), Resolution::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(correlator.stats().timed_out, 1);

        // The replacement still owns the entry and can be answered.
        assert!(correlator.is_pending(id));
        respond(&store, id, json!({ "second": true })).await;
        let response = expect_response(second.await.unwrap());
        assert_eq!(response.body.output, json!({ "second": true }));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.stats().timed_out, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_path_racing_resolves_exactly_once() {
        const ROUNDS: u64 = 40;
        let (store, correlator) = setup(3);
        store.duplicate_events(true);

        for _ in 0..ROUNDS {
            let id = CorrelationId::new();
            // Response already stored before the waiter registers ...
            let record_id = respond(&store, id, json!({ "round": true })).await;
            let record = store.get(record_id).await.unwrap();
            let event = RecordEvent::created(&record);

            let (d_wait, d_event, d_direct) = {
                let mut rng = rand::rng();
                (rng.random_range(0..4), rng.random_range(0..4), rng.random_range(0..4))
            };

            let waiter = {
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(d_wait)).await;
                    correlator.await_response(id, "race", Duration::from_secs(5)).await
                })
            };
            // ... and a live event for it is published as well ...
            let publisher = {
                let store = store.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(d_event)).await;
                    store.publish(event);
                })
            };
            // ... while an external pump routes the same event directly.
            let pump = {
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(d_direct)).await;
                    correlator.handle_event(&event).await
                })
            };

            let response = expect_response(waiter.await.unwrap());
            publisher.await.unwrap();
            pump.await.unwrap();
            assert_eq!(response.record_id, record_id);
            assert!(!correlator.is_pending(id));
        }

        assert_eq!(correlator.stats().resolved, ROUNDS);
        assert_eq!(correlator.stats().timed_out, 0);
        assert_eq!(correlator.pending_count(), 0);
    }
}
