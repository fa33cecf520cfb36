//! Connected workers, what they have committed, and what they have cached.

use std::collections::BTreeSet;

use ahash::{HashMap, HashSet};
use kiln_worker::{protocol::ManagerMessage, CachedArtifact, Fingerprint, Resources, TaskId, WorkerId};
use tokio::time::{Duration, Instant};
use tracing::{event, Level};

use crate::{artifact::Payload, config::EvictionPolicy};

/// A frame queued for a worker's connection writer.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Message(ManagerMessage),
    Put {
        fingerprint: Fingerprint,
        unpack: bool,
        payload: Payload,
    },
}

#[derive(Debug, Clone)]
struct CacheEntry {
    size: u64,
    last_used: u64,
}

/// The manager's view of one worker's cache. Entries are added as soon as a transfer is queued,
/// since the connection delivers it before any dispatch that uses it.
#[derive(Debug, Default)]
pub struct CacheView {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Evictions sent to the worker that its reports may not reflect yet.
    evicting: HashSet<Fingerprint>,
    clock: u64,
}

impl CacheView {
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many of `fingerprints` are already present.
    pub fn count_present(&self, fingerprints: &[Fingerprint]) -> usize {
        fingerprints.iter().filter(|f| self.contains(f)).count()
    }

    pub fn used_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    pub(crate) fn insert(&mut self, fingerprint: Fingerprint, size: u64) {
        self.clock += 1;
        self.evicting.remove(&fingerprint);
        self.entries.insert(
            fingerprint,
            CacheEntry {
                size,
                last_used: self.clock,
            },
        );
    }

    pub(crate) fn touch(&mut self, fingerprint: &Fingerprint) {
        self.clock += 1;
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            entry.last_used = self.clock;
        }
    }

    pub(crate) fn remove(&mut self, fingerprint: &Fingerprint) -> bool {
        self.entries.remove(fingerprint).is_some()
    }

    /// Remove an entry the worker has been told to evict.
    pub(crate) fn evict(&mut self, fingerprint: &Fingerprint) {
        self.entries.remove(fingerprint);
        self.evicting.insert(fingerprint.clone());
    }

    /// Add what a worker reports having. Nothing is removed, since the report may predate
    /// transfers that are still in flight. Entries being evicted are skipped until a report
    /// no longer lists them.
    pub(crate) fn merge(&mut self, cached: &[CachedArtifact]) {
        self.evicting
            .retain(|f| cached.iter().any(|artifact| &artifact.fingerprint == f));

        for artifact in cached {
            if self.evicting.contains(&artifact.fingerprint) {
                continue;
            }
            match self.entries.get_mut(&artifact.fingerprint) {
                Some(entry) => entry.size = artifact.size,
                None => {
                    self.entries.insert(
                        artifact.fingerprint.clone(),
                        CacheEntry {
                            size: artifact.size,
                            last_used: 0,
                        },
                    );
                }
            }
        }
    }

    /// Choose entries to evict so that `incoming` more bytes fit in `capacity`, least recently
    /// used first. Pinned entries are never chosen. The result may not free enough space if
    /// too much of the cache is pinned.
    pub(crate) fn victims(
        &self,
        incoming: u64,
        capacity: u64,
        pinned: &HashMap<Fingerprint, usize>,
    ) -> Vec<Fingerprint> {
        let mut used = self.used_bytes();
        if used + incoming <= capacity {
            return Vec::new();
        }

        let mut candidates = self
            .entries
            .iter()
            .filter(|(fingerprint, _)| !pinned.contains_key(*fingerprint))
            .collect::<Vec<_>>();
        candidates.sort_by_key(|(fingerprint, entry)| (entry.last_used, (*fingerprint).clone()));

        let mut victims = Vec::new();
        for (fingerprint, entry) in candidates {
            if used + incoming <= capacity {
                break;
            }
            used = used.saturating_sub(entry.size);
            victims.push(fingerprint.clone());
        }
        victims
    }
}

#[derive(Debug)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub name: String,
    pub capacity: Resources,
    pub committed: Resources,
    pub cache_capacity: Option<u64>,
    pub running: BTreeSet<TaskId>,
    pub cache: CacheView,
    /// Input fingerprints of running tasks, with the number of tasks using each.
    pins: HashMap<Fingerprint, usize>,
    last_seen: Instant,
    outbox: flume::Sender<Outgoing>,
}

impl WorkerRecord {
    pub fn available(&self) -> Resources {
        self.capacity - self.committed
    }

    pub fn is_pinned(&self, fingerprint: &Fingerprint) -> bool {
        self.pins.contains_key(fingerprint)
    }

    /// Queue a frame for this worker. Returns false if its connection is already gone.
    pub(crate) fn send(&self, message: Outgoing) -> bool {
        self.outbox.send(message).is_ok()
    }

    /// Evict enough unpinned artifacts for `incoming` more bytes, if the worker has a cache
    /// limit and the policy allows it.
    pub(crate) fn make_room(&mut self, incoming: u64, policy: EvictionPolicy) {
        let Some(capacity) = self.cache_capacity else {
            return;
        };
        if policy == EvictionPolicy::Retain {
            return;
        }

        for fingerprint in self.cache.victims(incoming, capacity, &self.pins) {
            event!(Level::DEBUG, worker_id = %self.id, %fingerprint, "evicting artifact");
            self.cache.evict(&fingerprint);
            self.send(Outgoing::Message(ManagerMessage::Evict { fingerprint }));
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerRecord>,
    next_id: u64,
}

impl WorkerRegistry {
    pub(crate) fn register(
        &mut self,
        name: String,
        capacity: Resources,
        cache_capacity: Option<u64>,
        cached: &[CachedArtifact],
        outbox: flume::Sender<Outgoing>,
    ) -> WorkerId {
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        let mut cache = CacheView::default();
        cache.merge(cached);

        event!(Level::INFO, worker_id = %id, %name, %capacity, cached = cached.len(), "worker registered");
        self.workers.insert(
            id,
            WorkerRecord {
                id,
                name,
                capacity,
                committed: Resources::default(),
                cache_capacity,
                running: BTreeSet::new(),
                cache,
                pins: HashMap::default(),
                last_seen: Instant::now(),
                outbox,
            },
        );
        id
    }

    /// Note that the worker is alive. A cache snapshot, if given, is merged into its view.
    /// Returns false if the worker is not registered.
    pub(crate) fn heartbeat(&mut self, id: WorkerId, cached: Option<&[CachedArtifact]>) -> bool {
        let Some(worker) = self.workers.get_mut(&id) else {
            return false;
        };

        worker.last_seen = Instant::now();
        if let Some(cached) = cached {
            worker.cache.merge(cached);
        }
        true
    }

    pub(crate) fn deregister(&mut self, id: WorkerId) -> Option<WorkerRecord> {
        self.workers.remove(&id)
    }

    pub(crate) fn drain(&mut self) -> Vec<WorkerRecord> {
        self.workers.drain().map(|(_, w)| w).collect()
    }

    /// Workers that have not been heard from within `timeout`.
    pub(crate) fn expired(&self, now: Instant, timeout: Duration) -> Vec<WorkerId> {
        let mut ids = self
            .workers
            .values()
            .filter(|w| now.saturating_duration_since(w.last_seen) > timeout)
            .map(|w| w.id)
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Commit resources and pin inputs for a task starting on a worker.
    pub(crate) fn reserve(
        &mut self,
        id: WorkerId,
        task_id: TaskId,
        resources: Resources,
        inputs: &[Fingerprint],
    ) -> bool {
        let Some(worker) = self.workers.get_mut(&id) else {
            return false;
        };

        worker.committed = worker.committed + resources;
        worker.running.insert(task_id);
        for fingerprint in inputs {
            *worker.pins.entry(fingerprint.clone()).or_default() += 1;
        }
        true
    }

    /// Undo [WorkerRegistry::reserve] once a task is no longer running on the worker.
    pub(crate) fn release(
        &mut self,
        id: WorkerId,
        task_id: TaskId,
        resources: Resources,
        inputs: &[Fingerprint],
    ) {
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };
        if !worker.running.remove(&task_id) {
            return;
        }

        worker.committed = worker.committed - resources;
        for fingerprint in inputs {
            if let Some(count) = worker.pins.get_mut(fingerprint) {
                *count -= 1;
                if *count == 0 {
                    worker.pins.remove(fingerprint);
                }
            }
        }
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Whether any worker currently has room for `request`.
    pub fn any_fits(&self, request: &Resources) -> bool {
        self.workers
            .values()
            .any(|w| request.fits_within(&w.available()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_worker::{ArtifactKind, Bundle};

    fn fingerprint(content: &str) -> Fingerprint {
        Fingerprint::of(
            ArtifactKind::Buffer,
            false,
            &Bundle::from_bytes(content.as_bytes().to_vec()),
        )
    }

    fn registry_with_worker(capacity: Resources) -> (WorkerRegistry, WorkerId, flume::Receiver<Outgoing>) {
        let (tx, rx) = flume::unbounded();
        let mut registry = WorkerRegistry::default();
        let id = registry.register("w".to_string(), capacity, Some(10), &[], tx);
        (registry, id, rx)
    }

    #[test]
    fn reserve_and_release_track_commitment() {
        let (mut registry, id, _rx) = registry_with_worker(Resources::new(4, 1000, 1000));
        let inputs = vec![fingerprint("a")];

        assert!(registry.reserve(id, TaskId(1), Resources::new(3, 100, 0), &inputs));
        let worker = registry.get(id).unwrap();
        assert_eq!(worker.available(), Resources::new(1, 900, 1000));
        assert!(worker.is_pinned(&inputs[0]));
        assert!(!registry.any_fits(&Resources::new(2, 0, 0)));

        registry.release(id, TaskId(1), Resources::new(3, 100, 0), &inputs);
        registry.release(id, TaskId(1), Resources::new(3, 100, 0), &inputs);
        let worker = registry.get(id).unwrap();
        assert_eq!(worker.available(), Resources::new(4, 1000, 1000), "double release is ignored");
        assert!(!worker.is_pinned(&inputs[0]));
    }

    #[test]
    fn heartbeat_merge_never_removes() {
        let (mut registry, id, _rx) = registry_with_worker(Resources::new(1, 0, 0));
        let queued = fingerprint("queued");
        registry.get_mut(id).unwrap().cache.insert(queued.clone(), 3);

        let reported = CachedArtifact {
            fingerprint: fingerprint("old"),
            size: 5,
        };
        assert!(registry.heartbeat(id, Some(&[reported.clone()])));

        let cache = &registry.get(id).unwrap().cache;
        assert!(cache.contains(&queued));
        assert!(cache.contains(&reported.fingerprint));
        assert_eq!(cache.used_bytes(), 8);

        assert!(!registry.heartbeat(WorkerId(99), None));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_workers_expire() {
        let (mut registry, id, _rx) = registry_with_worker(Resources::new(1, 0, 0));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(registry.expired(Instant::now(), Duration::from_secs(30)).is_empty());

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(registry.expired(Instant::now(), Duration::from_secs(30)), vec![id]);

        registry.heartbeat(id, None);
        assert!(registry.expired(Instant::now(), Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn lru_eviction_skips_pinned() {
        let (mut registry, id, rx) = registry_with_worker(Resources::new(2, 0, 0));
        let (a, b, c) = (fingerprint("a"), fingerprint("b"), fingerprint("c"));
        {
            let worker = registry.get_mut(id).unwrap();
            worker.cache.insert(a.clone(), 4);
            worker.cache.insert(b.clone(), 4);
            worker.cache.insert(c.clone(), 2);
            worker.cache.touch(&a);
        }
        registry.reserve(id, TaskId(1), Resources::new(1, 0, 0), &[c.clone()]);

        // 10 of 10 bytes used. Making room for 3 more must skip the pinned `c` and take the
        // least recently used `b` before `a`.
        let worker = registry.get_mut(id).unwrap();
        worker.make_room(3, EvictionPolicy::LeastRecentlyUsed);
        assert!(!worker.cache.contains(&b));
        assert!(worker.cache.contains(&a));
        assert!(worker.cache.contains(&c));

        match rx.try_recv().expect("evict queued") {
            Outgoing::Message(ManagerMessage::Evict { fingerprint }) => assert_eq!(fingerprint, b),
            other => panic!("unexpected {other:?}"),
        }

        worker.make_room(100, EvictionPolicy::Retain);
        assert_eq!(worker.cache.len(), 2);
    }

    #[test]
    fn stale_reports_do_not_undo_evictions() {
        let (mut registry, id, _rx) = registry_with_worker(Resources::new(1, 0, 0));
        let old = CachedArtifact {
            fingerprint: fingerprint("old"),
            size: 8,
        };
        registry.heartbeat(id, Some(&[old.clone()]));
        registry.get_mut(id).unwrap().make_room(5, EvictionPolicy::LeastRecentlyUsed);
        assert!(!registry.get(id).unwrap().cache.contains(&old.fingerprint));

        // Sent before the worker processed the eviction.
        registry.heartbeat(id, Some(&[old.clone()]));
        assert!(!registry.get(id).unwrap().cache.contains(&old.fingerprint));

        // Once a report omits it, a later report listing it again is believed.
        registry.heartbeat(id, Some(&[]));
        registry.heartbeat(id, Some(&[old.clone()]));
        assert!(registry.get(id).unwrap().cache.contains(&old.fingerprint));
    }
}
