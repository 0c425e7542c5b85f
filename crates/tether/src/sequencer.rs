//! Per-id request ordering.
//!
//! Requests touching the same handle id run in the order they were admitted;
//! requests on disjoint ids run concurrently. Admission must happen in receipt
//! order (synchronously in the connection's read loop), execution may then be
//! spawned freely.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::oneshot;

use crate::handle::HandleId;

type Done = Shared<oneshot::Receiver<()>>;
type Tails = Arc<Mutex<HashMap<HandleId, (u64, Done)>>>;

#[derive(Default)]
pub struct IdSequencer {
    tails: Tails,
    next: AtomicU64,
}

impl IdSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request behind every earlier request touching any of `ids`.
    pub fn admit<I>(&self, ids: I) -> Ticket
    where
        I: IntoIterator<Item = HandleId>,
    {
        let ids: BTreeSet<HandleId> = ids.into_iter().collect();
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let (signal, done) = oneshot::channel();
        let done = done.shared();

        let mut waits = Vec::new();
        {
            let mut tails = lock(&self.tails);
            for id in &ids {
                if let Some((_, prev)) = tails.insert(id.clone(), (seq, done.clone())) {
                    waits.push(prev);
                }
            }
        }

        Ticket {
            seq,
            ids: ids.into_iter().collect(),
            waits,
            tails: Arc::clone(&self.tails),
            _signal: signal,
        }
    }

    /// Whether an admitted request touching `id` has not yet finished.
    pub fn is_pending(&self, id: &HandleId) -> bool {
        lock(&self.tails).contains_key(id)
    }

    /// Number of ids with a request still in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.tails).len()
    }
}

fn lock(tails: &Tails) -> std::sync::MutexGuard<'_, HashMap<HandleId, (u64, Done)>> {
    match tails.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Admission of one request. Dropping it lets the next request on each id run.
pub struct Ticket {
    seq: u64,
    ids: Vec<HandleId>,
    waits: Vec<Done>,
    tails: Tails,
    _signal: oneshot::Sender<()>,
}

impl Ticket {
    /// Wait until every earlier request on the same ids has finished.
    pub async fn ready(&mut self) {
        futures::future::join_all(self.waits.iter().cloned()).await;
        self.waits.clear();
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut tails = lock(&self.tails);
        for id in &self.ids {
            if tails.get(id).is_some_and(|(seq, _)| *seq == self.seq) {
                tails.remove(id);
            }
        }
    }
}
