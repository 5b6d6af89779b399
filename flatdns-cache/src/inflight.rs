use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flatdns_core::model::QueryKey;
use tokio::sync::broadcast;

/// In-flight resolution coalescing (spec.md §4.5 step 3, §9 "In-flight
/// coalescing"): the first caller for a key becomes the leader and
/// resolves for real; concurrent callers for the same key become
/// followers and await the leader's result instead of issuing a duplicate
/// upstream query.
pub struct InFlightMap<T: Clone + Send + 'static> {
    map: DashMap<QueryKey, broadcast::Sender<T>>,
}

impl<T: Clone + Send + 'static> InFlightMap<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { map: DashMap::new() })
    }

    /// Join the in-flight resolution for `key`, becoming its leader if none
    /// is outstanding.
    pub fn join(self: &Arc<Self>, key: QueryKey) -> Lead<T> {
        match self.map.entry(key.clone()) {
            Entry::Occupied(occupied) => Lead::Follower(occupied.get().subscribe()),
            Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(1);
                vacant.insert(tx.clone());
                Lead::Leader(LeaderGuard {
                    map: Arc::clone(self),
                    key,
                    tx,
                    completed: false,
                })
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.map.len()
    }
}

pub enum Lead<T: Clone + Send + 'static> {
    Leader(LeaderGuard<T>),
    Follower(broadcast::Receiver<T>),
}

/// Held by the resolver performing the real work for a key. Dropping the
/// guard without calling `complete` (e.g. the leader's task is cancelled)
/// removes the in-flight entry and drops the broadcast sender, which
/// unblocks any followers with a recv error — they fall through to become
/// the new leader on their next attempt rather than hanging forever.
pub struct LeaderGuard<T: Clone + Send + 'static> {
    map: Arc<InFlightMap<T>>,
    key: QueryKey,
    tx: broadcast::Sender<T>,
    completed: bool,
}

impl<T: Clone + Send + 'static> LeaderGuard<T> {
    /// Publish the result to any followers and retire the in-flight entry.
    pub fn complete(mut self, value: T) {
        self.completed = true;
        self.map.map.remove(&self.key);
        let _ = self.tx.send(value);
    }
}

impl<T: Clone + Send + 'static> Drop for LeaderGuard<T> {
    fn drop(&mut self) {
        if !self.completed {
            self.map.map.remove(&self.key);
        }
    }
}
