//! Server-side variable table.
//!
//! Maps handle ids to live backend values. Every value leaving the table
//! (replaced, deleted or evicted) is handed to the backend's releaser exactly
//! once. Values are shared as `Arc`s so a running operation keeps its inputs
//! alive; eviction never touches an entry that is currently borrowed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;

use crate::handle::HandleId;

pub type Releaser<V> = Arc<dyn Fn(&V) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("no value registered for handle {0}")]
    NotFound(HandleId),

    #[error("handle {0} is already registered")]
    AlreadyRegistered(HandleId),
}

/// What an eviction policy gets to see about an entry.
#[derive(Debug, Clone, Copy)]
pub struct EntryStats<'a> {
    pub id: &'a HandleId,
    pub idle: Duration,
}

/// Decides which entries a sweep removes.
pub trait EvictionPolicy: Send + Sync {
    fn should_evict(&self, entry: &EntryStats<'_>) -> bool;
}

/// Entries live until deleted explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverEvict;

impl EvictionPolicy for NeverEvict {
    fn should_evict(&self, _entry: &EntryStats<'_>) -> bool {
        false
    }
}

/// Entries untouched for longer than `ttl` are evicted.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    ttl: Duration,
}

impl IdleTimeout {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl EvictionPolicy for IdleTimeout {
    fn should_evict(&self, entry: &EntryStats<'_>) -> bool {
        entry.idle >= self.ttl
    }
}

struct Slot<V> {
    value: Arc<V>,
    last_access: Instant,
}

impl<V> Slot<V> {
    fn new(value: V) -> Self {
        Self {
            value: Arc::new(value),
            last_access: Instant::now(),
        }
    }
}

pub struct VariableTable<V> {
    entries: DashMap<HandleId, Slot<V>>,
    release: Releaser<V>,
    policy: Arc<dyn EvictionPolicy>,
}

impl<V: Send + Sync + 'static> VariableTable<V> {
    pub fn new(release: Releaser<V>) -> Self {
        Self::with_policy(release, Arc::new(NeverEvict))
    }

    pub fn with_policy(release: Releaser<V>, policy: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            entries: DashMap::new(),
            release,
            policy,
        }
    }

    /// Insert a value under an id that must not be in use yet.
    ///
    /// A rejected value is released immediately.
    pub fn register(&self, id: HandleId, value: V) -> Result<(), TableError> {
        match self.entries.entry(id) {
            MapEntry::Occupied(entry) => {
                (self.release)(&value);
                Err(TableError::AlreadyRegistered(entry.key().clone()))
            }
            MapEntry::Vacant(entry) => {
                entry.insert(Slot::new(value));
                Ok(())
            }
        }
    }

    /// Install `value` under `id`, releasing whatever was there.
    ///
    /// Returns whether a prior value was released.
    pub fn replace(&self, id: HandleId, value: V) -> bool {
        match self.entries.entry(id) {
            MapEntry::Occupied(mut entry) => {
                let prior = entry.insert(Slot::new(value));
                (self.release)(&prior.value);
                tracing::trace!(id = %entry.key(), "Replaced table entry");
                true
            }
            MapEntry::Vacant(entry) => {
                entry.insert(Slot::new(value));
                false
            }
        }
    }

    pub fn get(&self, id: &HandleId) -> Result<Arc<V>, TableError> {
        let mut slot = self
            .entries
            .get_mut(id)
            .ok_or_else(|| TableError::NotFound(id.clone()))?;
        slot.last_access = Instant::now();
        Ok(Arc::clone(&slot.value))
    }

    pub fn delete(&self, id: &HandleId) -> Result<(), TableError> {
        let (_, slot) = self
            .entries
            .remove(id)
            .ok_or_else(|| TableError::NotFound(id.clone()))?;
        (self.release)(&slot.value);
        Ok(())
    }

    pub fn contains(&self, id: &HandleId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict every entry the policy selects that no operation is holding and
    /// `busy` does not claim.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, busy: impl Fn(&HandleId) -> bool) -> usize {
        let now = Instant::now();
        let candidates: Vec<HandleId> = self
            .entries
            .iter()
            .filter(|slot| {
                let stats = EntryStats {
                    id: slot.key(),
                    idle: now.saturating_duration_since(slot.last_access),
                };
                Arc::strong_count(&slot.value) == 1
                    && self.policy.should_evict(&stats)
                    && !busy(slot.key())
            })
            .map(|slot| slot.key().clone())
            .collect();

        let mut evicted = 0;
        for id in candidates {
            if let Some((_, slot)) = self
                .entries
                .remove_if(&id, |id, slot| Arc::strong_count(&slot.value) == 1 && !busy(id))
            {
                (self.release)(&slot.value);
                tracing::debug!(%id, "Evicted idle table entry");
                evicted += 1;
            }
        }
        evicted
    }
}
