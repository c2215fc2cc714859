//! In-process coordinator
//!
//! One mutex guards the whole state, so every trait method is a single
//! critical section and therefore atomic. Clones share the same state, which
//! lets several [`crate::queue::FairQueue`] instances in one process behave
//! like separate workers against one store.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use super::{
    AdmitOutcome, AdmitRequest, Checkout, Coordinator, ReleaseOutcome, RotationSnapshot,
    DEDUP_SET, TOMBSTONE_SET,
};
use crate::dedup::{is_live, ExpiringSet};
use crate::error::{QueueError, QueueResult};
use crate::models::{Placement, QueueEntry};
use crate::utils::{expiry_ms, now_ms};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Default)]
struct State {
    main: VecDeque<String>,
    pending: VecDeque<String>,
    host_queues: HashMap<String, VecDeque<String>>,
    concurrency: HashMap<String, u32>,
    /// set name → member → expiry (ms)
    sets: HashMap<String, HashMap<String, Option<i64>>>,
    keys: HashMap<String, String>,
    /// instance → ack token → entry
    inflight: HashMap<String, HashMap<String, String>>,
    instances: HashSet<String>,
    leases: HashMap<String, Instant>,
    outcomes: HashMap<String, VecDeque<(String, Instant)>>,
    /// correlation id → waiters in arrival order
    waiters: HashMap<String, VecDeque<(u64, oneshot::Sender<String>)>>,
    next_waiter: u64,
}

fn occurrences(list: &VecDeque<String>, host: &str) -> usize {
    list.iter().filter(|h| h.as_str() == host).count()
}

fn remove_first(list: &mut VecDeque<String>, host: &str) -> bool {
    match list.iter().position(|h| h == host) {
        Some(idx) => {
            list.remove(idx);
            true
        }
        None => false,
    }
}

fn remove_last(list: &mut VecDeque<String>, host: &str) -> bool {
    match list.iter().rposition(|h| h == host) {
        Some(idx) => {
            list.remove(idx);
            true
        }
        None => false,
    }
}

impl State {
    fn queue_len(&self, host: &str) -> usize {
        self.host_queues.get(host).map_or(0, VecDeque::len)
    }

    fn set(&mut self, name: &str) -> &mut HashMap<String, Option<i64>> {
        self.sets.entry(name.to_string()).or_default()
    }

    /// Lazily evicting membership check
    fn set_has(&mut self, name: &str, member: &str, now: i64) -> bool {
        let set = self.set(name);
        match set.get(member) {
            Some(expiry) if is_live(*expiry, now) => true,
            Some(_) => {
                set.remove(member);
                false
            }
            None => false,
        }
    }

    fn reconcile(&mut self, host: &str, limit: u32) {
        let previous = self.concurrency.insert(host.to_string(), limit);
        let limit = limit as usize;
        let mut in_main = occurrences(&self.main, host);
        let mut total = in_main + occurrences(&self.pending, host);

        if previous.is_some_and(|p| p as usize != limit) && total > limit {
            self.main.retain(|h| h != host);
            self.pending.retain(|h| h != host);
            total = 0;
            in_main = 0;
        }

        let add = limit
            .saturating_sub(total)
            .min(self.queue_len(host).saturating_sub(in_main));
        for _ in 0..add {
            self.main.push_back(host.to_string());
        }
    }

    /// Give one Pending occurrence back; returns (requeued, occurrence found)
    fn settle(&mut self, host: &str) -> (bool, bool) {
        let found = remove_first(&mut self.pending, host);
        let limit = self.concurrency.get(host).copied().unwrap_or(1) as usize;
        let total = occurrences(&self.main, host) + occurrences(&self.pending, host);

        if total < limit && self.queue_len(host) > total {
            self.main.push_back(host.to_string());
            return (true, found);
        }
        (false, found)
    }

    /// Forget `entry`'s dedup record if it still belongs to this admission
    fn clear_admission(&mut self, key: &str, correlation_id: &str) {
        if self.keys.get(key).is_some_and(|c| c == correlation_id) {
            self.keys.remove(key);
            self.set(DEDUP_SET).remove(key);
        }
    }

    fn take_outcome(&mut self, correlation_id: &str) -> Option<String> {
        let now = Instant::now();
        let list = self.outcomes.get_mut(correlation_id)?;
        list.retain(|(_, expires)| *expires > now);
        let outcome = list.pop_front().map(|(o, _)| o);
        if list.is_empty() {
            self.outcomes.remove(correlation_id);
        }
        outcome
    }
}

// ============================================================================
// Memory Coordinator
// ============================================================================

/// Coordinator for single-process deployments and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
    slots: Arc<Notify>,
    interrupts: Arc<AtomicU64>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of `wait_outcome` subscriptions currently registered
    pub fn active_waiters(&self) -> usize {
        self.lock().waiters.values().map(VecDeque::len).sum()
    }

    /// Correlation ids currently tombstoned
    pub fn tombstoned(&self) -> Vec<String> {
        let mut state = self.lock();
        state.set(TOMBSTONE_SET).keys().cloned().collect()
    }

    /// Ack tokens held in flight by `instance`
    pub fn inflight_tokens(&self, instance: &str) -> Vec<String> {
        self.lock()
            .inflight
            .get(instance)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn admit(&self, request: &AdmitRequest<'_>) -> QueueResult<AdmitOutcome> {
        {
            let mut state = self.lock();

            if state.set_has(DEDUP_SET, request.key, request.now_ms) {
                return Ok(AdmitOutcome::Duplicate);
            }

            let length = state.queue_len(request.destination);
            if let Some(max) = request.max_queue_length {
                if length >= max {
                    return Ok(AdmitOutcome::QueueFull {
                        length: length as u64,
                    });
                }
            }

            state
                .set(DEDUP_SET)
                .insert(request.key.to_string(), request.dedup_expires_at);
            state
                .keys
                .insert(request.key.to_string(), request.correlation_id.to_string());

            let queue = state
                .host_queues
                .entry(request.destination.to_string())
                .or_default();
            match request.placement {
                Placement::Back => queue.push_back(request.entry.to_string()),
                Placement::Front => queue.push_front(request.entry.to_string()),
            }

            state.reconcile(request.destination, request.concurrency);
        }

        self.slots.notify_waiters();
        Ok(AdmitOutcome::Admitted)
    }

    async fn acquire_slot(&self, timeout: Duration) -> QueueResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        let generation = self.interrupts.load(Ordering::SeqCst);

        loop {
            let notified = self.slots.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.interrupts.load(Ordering::SeqCst) != generation {
                return Ok(None);
            }

            {
                let mut state = self.lock();
                if let Some(host) = state.main.pop_front() {
                    state.pending.push_back(host.clone());
                    return Ok(Some(host));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn checkout(
        &self,
        destination: &str,
        instance: &str,
        token: &str,
        now_ms: i64,
    ) -> QueueResult<Checkout> {
        let mut state = self.lock();

        let popped = state
            .host_queues
            .get_mut(destination)
            .and_then(VecDeque::pop_front);

        let Some(raw) = popped else {
            state.main.retain(|h| h != destination);
            state.pending.retain(|h| h != destination);
            state.host_queues.remove(destination);
            return Ok(Checkout::Drained);
        };

        if state.queue_len(destination) == 0 {
            state.host_queues.remove(destination);
        }

        let entry = QueueEntry::decode(&raw)?;
        let tombstones = state.set(TOMBSTONE_SET);
        if let Some(expiry) = tombstones.remove(&entry.correlation_id) {
            if is_live(expiry, now_ms) {
                state.settle(destination);
                drop(state);
                self.slots.notify_waiters();
                return Ok(Checkout::Discarded(raw));
            }
        }

        state
            .inflight
            .entry(instance.to_string())
            .or_default()
            .insert(token.to_string(), raw.clone());
        Ok(Checkout::Dispatched(raw))
    }

    async fn return_slot(&self, destination: &str) -> QueueResult<()> {
        {
            let mut state = self.lock();
            if remove_last(&mut state.pending, destination) {
                state.main.push_front(destination.to_string());
            }
        }
        self.slots.notify_waiters();
        Ok(())
    }

    async fn requeue(&self, instance: &str, token: &str, destination: &str) -> QueueResult<bool> {
        {
            let mut state = self.lock();

            let Some(raw) = state
                .inflight
                .get_mut(instance)
                .and_then(|records| records.remove(token))
            else {
                return Ok(false);
            };
            if state.inflight.get(instance).is_some_and(HashMap::is_empty) {
                state.inflight.remove(instance);
            }

            let entry = QueueEntry::decode(&raw)?;
            let limit = state
                .concurrency
                .get(destination)
                .copied()
                .unwrap_or(entry.concurrency);

            state
                .host_queues
                .entry(destination.to_string())
                .or_default()
                .push_front(raw);
            remove_first(&mut state.pending, destination);
            state.reconcile(destination, limit);
        }

        self.slots.notify_waiters();
        Ok(true)
    }

    async fn release(
        &self,
        instance: &str,
        token: &str,
        destination: &str,
    ) -> QueueResult<ReleaseOutcome> {
        let (requeued, slot_missing) = {
            let mut state = self.lock();

            let Some(raw) = state
                .inflight
                .get(instance)
                .and_then(|records| records.get(token))
                .cloned()
            else {
                return Ok(ReleaseOutcome::Unknown);
            };

            let entry = QueueEntry::decode(&raw)?;
            if entry.destination != destination {
                return Err(QueueError::sanity(format!(
                    "ack token {token} belongs to '{}', not '{destination}'",
                    entry.destination
                )));
            }

            if let Some(records) = state.inflight.get_mut(instance) {
                records.remove(token);
                if records.is_empty() {
                    state.inflight.remove(instance);
                }
            }
            state.clear_admission(&entry.key, &entry.correlation_id);
            state.set(TOMBSTONE_SET).remove(&entry.correlation_id);

            let limit_changed = state
                .concurrency
                .get(destination)
                .is_some_and(|limit| *limit != entry.concurrency);
            let (requeued, found) = state.settle(destination);
            (requeued, !found && !limit_changed)
        };

        if requeued {
            self.slots.notify_waiters();
        }
        Ok(ReleaseOutcome::Released {
            requeued,
            slot_missing,
        })
    }

    async fn remove(&self, key: &str, tombstone_expires_at: i64) -> QueueResult<bool> {
        let mut state = self.lock();
        let Some(correlation_id) = state.keys.remove(key) else {
            return Ok(false);
        };
        state.set(DEDUP_SET).remove(key);
        state
            .set(TOMBSTONE_SET)
            .insert(correlation_id, Some(tombstone_expires_at));
        Ok(true)
    }

    async fn purge(&self, destination: &str) -> QueueResult<u64> {
        let mut state = self.lock();
        let entries = state.host_queues.remove(destination).unwrap_or_default();

        for raw in &entries {
            let entry = QueueEntry::decode(raw)?;
            state.clear_admission(&entry.key, &entry.correlation_id);
        }
        state.main.retain(|h| h != destination);

        Ok(entries.len() as u64)
    }

    async fn register_instance(&self, instance: &str, lease: Duration) -> QueueResult<()> {
        let mut state = self.lock();
        state.instances.insert(instance.to_string());
        state
            .leases
            .insert(instance.to_string(), Instant::now() + lease);
        Ok(())
    }

    async fn retire_instance(&self, instance: &str) -> QueueResult<()> {
        self.lock().leases.remove(instance);
        Ok(())
    }

    async fn orphaned_instances(&self, own: &str) -> QueueResult<Vec<String>> {
        let state = self.lock();
        let now = Instant::now();
        Ok(state
            .instances
            .iter()
            .filter(|id| id.as_str() != own)
            .filter(|id| state.leases.get(*id).map_or(true, |until| *until <= now))
            .cloned()
            .collect())
    }

    async fn recover(&self, instance: &str) -> QueueResult<Vec<String>> {
        let recovered = {
            let mut state = self.lock();

            let records: Vec<String> = state
                .inflight
                .get(instance)
                .map(|r| r.values().cloned().collect())
                .unwrap_or_default();
            let entries = records
                .iter()
                .map(|raw| QueueEntry::decode(raw))
                .collect::<QueueResult<Vec<_>>>()?;

            for (raw, entry) in records.iter().zip(&entries) {
                state
                    .host_queues
                    .entry(entry.destination.clone())
                    .or_default()
                    .push_front(raw.clone());
                remove_first(&mut state.pending, &entry.destination);
                state.reconcile(&entry.destination, entry.concurrency);
            }

            state.inflight.remove(instance);
            state.instances.remove(instance);
            records
        };

        self.slots.notify_waiters();
        Ok(recovered)
    }

    async fn snapshot(&self) -> QueueResult<RotationSnapshot> {
        let state = self.lock();
        Ok(RotationSnapshot {
            main: state.main.iter().cloned().collect(),
            pending: state.pending.iter().cloned().collect(),
        })
    }

    async fn host_queue(&self, destination: &str) -> QueueResult<Vec<String>> {
        Ok(self
            .lock()
            .host_queues
            .get(destination)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn host_queue_len(&self, destination: &str) -> QueueResult<u64> {
        Ok(self.lock().queue_len(destination) as u64)
    }

    async fn destinations(&self) -> QueueResult<Vec<String>> {
        let state = self.lock();
        let mut hosts: Vec<String> = state
            .host_queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(h, _)| h.clone())
            .collect();
        hosts.sort();
        Ok(hosts)
    }

    async fn publish(
        &self,
        correlation_id: &str,
        outcome: &str,
        ttl: Duration,
    ) -> QueueResult<()> {
        let mut state = self.lock();
        let mut unsent = Some(outcome.to_string());

        if let Some(waiting) = state.waiters.get_mut(correlation_id) {
            while let Some((_, tx)) = waiting.pop_front() {
                let Some(outcome) = unsent.take() else {
                    break;
                };
                // A waiter whose receiver is gone passes the outcome on
                if let Err(outcome) = tx.send(outcome) {
                    unsent = Some(outcome);
                } else {
                    break;
                }
            }
            let drained = waiting.is_empty();
            if drained {
                state.waiters.remove(correlation_id);
            }
        }

        if let Some(outcome) = unsent {
            state
                .outcomes
                .entry(correlation_id.to_string())
                .or_default()
                .push_back((outcome, Instant::now() + ttl));
        }
        Ok(())
    }

    async fn wait_outcome(&self, correlation_id: &str) -> QueueResult<String> {
        let (rx, id) = {
            let mut state = self.lock();
            if let Some(outcome) = state.take_outcome(correlation_id) {
                return Ok(outcome);
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state
                .waiters
                .entry(correlation_id.to_string())
                .or_default()
                .push_back((id, tx));
            (rx, id)
        };

        let _guard = WaiterGuard {
            state: Arc::clone(&self.state),
            correlation_id: correlation_id.to_string(),
            id,
        };

        rx.await.map_err(|_| QueueError::Aborted {
            correlation_id: correlation_id.to_string(),
        })
    }

    fn wake_waiters(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.slots.notify_waiters();
    }

    fn expiring_set(&self, name: &str) -> Arc<dyn ExpiringSet> {
        Arc::new(MemorySet {
            state: Arc::clone(&self.state),
            name: name.to_string(),
        })
    }
}

/// Unregisters a waiter on every exit path of `wait_outcome`
struct WaiterGuard {
    state: Arc<Mutex<State>>,
    correlation_id: String,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(waiting) = state.waiters.get_mut(&self.correlation_id) {
            waiting.retain(|(id, _)| *id != self.id);
            if waiting.is_empty() {
                state.waiters.remove(&self.correlation_id);
            }
        }
    }
}

// ============================================================================
// Expiring Set
// ============================================================================

struct MemorySet {
    state: Arc<Mutex<State>>,
    name: String,
}

impl MemorySet {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ExpiringSet for MemorySet {
    async fn set(&self, key: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let expiry = expiry_ms(now_ms(), ttl);
        self.lock().set(&self.name).insert(key.to_string(), expiry);
        Ok(())
    }

    async fn has(&self, key: &str) -> QueueResult<bool> {
        Ok(self.lock().set_has(&self.name, key, now_ms()))
    }

    async fn delete(&self, key: &str) -> QueueResult<u64> {
        Ok(self.lock().set(&self.name).remove(key).map_or(0, |_| 1))
    }

    async fn size(&self) -> QueueResult<u64> {
        let now = now_ms();
        let mut state = self.lock();
        Ok(state
            .set(&self.name)
            .values()
            .filter(|expiry| is_live(**expiry, now))
            .count() as u64)
    }

    async fn cleanup(&self) -> QueueResult<u64> {
        let now = now_ms();
        let mut state = self.lock();
        let set = state.set(&self.name);
        let before = set.len();
        set.retain(|_, expiry| is_live(*expiry, now));
        Ok((before - set.len()) as u64)
    }
}
