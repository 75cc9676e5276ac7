//! Priority queue of scene elements waiting to be sent to one observer
//!
//! A max-heap ordered by view priority, paired with a set of identities so
//! the traversal can ask "is this already scheduled?" in O(1). The two
//! containers always hold exactly the same identities.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use hashbrown::HashSet;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ============================================================================
// Sentinel Priorities
// ============================================================================

/// Out of view: never enqueued for sending
pub const DO_NOT_SEND: f32 = -1.0e-6;

/// Must be evicted from the observer regardless of view; below [`DO_NOT_SEND`]
pub const FORCE_REMOVE: f32 = -1.0e-5;

/// Score used before any view is known, equal to a maximal close-and-large score
pub const WHEN_IN_DOUBT_PRIORITY: f32 = 1.0;

/// Identity set type (FxHash is plenty for integer keys)
pub type IdentitySet = HashSet<EntityId, FxBuildHasher>;

/// Stable identity of a scene element
///
/// Usable for hashing and equality even after the element itself is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Non-owning (or shared) reference to a scene element
pub trait EntityHandle {
    /// False once the referenced element has been destroyed
    fn is_live(&self) -> bool;
}

impl<T> EntityHandle for Weak<T> {
    #[inline]
    fn is_live(&self) -> bool {
        self.strong_count() > 0
    }
}

impl<T> EntityHandle for Arc<T> {
    #[inline]
    fn is_live(&self) -> bool {
        true
    }
}

impl<T> EntityHandle for Rc<T> {
    #[inline]
    fn is_live(&self) -> bool {
        true
    }
}

/// Errors from queue operations that would break the heap/set pairing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("entity {0} is already queued")]
    DuplicateIdentity(EntityId),
    #[error("entity {0} handle is already dead")]
    DeadHandle(EntityId),
}

// ============================================================================
// PrioritizedEntity
// ============================================================================

/// One queued element: handle, identity and the score it was queued with
#[derive(Debug, Clone)]
pub struct PrioritizedEntity<H> {
    handle: H,
    identity: EntityId,
    priority: f32,
    force_remove: bool,
}

impl<H> PrioritizedEntity<H> {
    pub fn new(handle: H, identity: EntityId, priority: f32, force_remove: bool) -> Self {
        Self {
            handle,
            identity,
            priority,
            force_remove,
        }
    }

    #[inline]
    pub fn handle(&self) -> &H {
        &self.handle
    }

    #[inline]
    pub fn identity(&self) -> EntityId {
        self.identity
    }

    #[inline]
    pub fn priority(&self) -> f32 {
        self.priority
    }

    #[inline]
    pub fn should_force_remove(&self) -> bool {
        self.force_remove
    }

    pub fn into_handle(self) -> H {
        self.handle
    }
}

impl<H> Ord for PrioritizedEntity<H> {
    /// Higher priority first; equal priorities pop lowest identity first
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.identity.cmp(&self.identity))
    }
}

impl<H> PartialOrd for PrioritizedEntity<H> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<H> PartialEq for PrioritizedEntity<H> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<H> Eq for PrioritizedEntity<H> {}

// ============================================================================
// EntityPriorityQueue
// ============================================================================

/// Duplicate-free max-priority queue with O(1) membership tests
#[derive(Debug)]
pub struct EntityPriorityQueue<H> {
    heap: BinaryHeap<PrioritizedEntity<H>>,
    identities: IdentitySet,
}

impl<H> Default for EntityPriorityQueue<H> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            identities: IdentitySet::default(),
        }
    }
}

impl<H: EntityHandle> EntityPriorityQueue<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            identities: IdentitySet::with_capacity_and_hasher(capacity, FxBuildHasher),
        }
    }

    /// Queue an element
    ///
    /// Rejects an identity that is already queued or a handle that is already
    /// dead; the queue is untouched on error. A non-finite priority is stored
    /// as [`DO_NOT_SEND`].
    pub fn emplace(
        &mut self,
        identity: EntityId,
        handle: H,
        priority: f32,
        force_remove: bool,
    ) -> Result<(), QueueError> {
        if !handle.is_live() {
            warn!("Refusing to queue entity {} with a dead handle", identity);
            return Err(QueueError::DeadHandle(identity));
        }
        if !self.identities.insert(identity) {
            warn!("Refusing to queue entity {} twice", identity);
            return Err(QueueError::DuplicateIdentity(identity));
        }
        let priority = if priority.is_finite() { priority } else { DO_NOT_SEND };
        self.heap
            .push(PrioritizedEntity::new(handle, identity, priority, force_remove));
        Ok(())
    }

    #[inline]
    pub fn contains(&self, identity: EntityId) -> bool {
        self.identities.contains(&identity)
    }

    /// Highest-priority entry without removing it
    #[inline]
    pub fn top(&self) -> Option<&PrioritizedEntity<H>> {
        self.heap.peek()
    }

    /// Remove and return the highest-priority entry
    pub fn pop(&mut self) -> Option<PrioritizedEntity<H>> {
        let entry = self.heap.pop()?;
        self.identities.remove(&entry.identity);
        Some(entry)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.identities.clear();
    }

    /// Drop the entry for `identity`; false if it was not queued
    ///
    /// Linear in the queue length.
    pub fn remove(&mut self, identity: EntityId) -> bool {
        if !self.identities.remove(&identity) {
            return false;
        }
        self.heap.retain(|entry| entry.identity != identity);
        true
    }

    /// Exchange contents with `other`, keeping both allocations alive
    pub fn swap(&mut self, other: &mut EntityPriorityQueue<H>) {
        std::mem::swap(&mut self.heap, &mut other.heap);
        std::mem::swap(&mut self.identities, &mut other.identities);
    }

    /// Heap and identity set describe the same entries
    pub fn is_consistent(&self) -> bool {
        self.heap.len() == self.identities.len()
            && self
                .heap
                .iter()
                .all(|entry| self.identities.contains(&entry.identity))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet as StdHashSet;

    type Handle = Arc<u64>;

    fn queue() -> EntityPriorityQueue<Handle> {
        EntityPriorityQueue::new()
    }

    #[test]
    fn test_pops_in_descending_priority() {
        let mut q = queue();
        for (id, priority) in [(1, 0.2), (2, 0.9), (3, 0.5), (4, WHEN_IN_DOUBT_PRIORITY), (5, 0.01)] {
            q.emplace(EntityId(id), Arc::new(id), priority, false).unwrap();
        }

        let order: Vec<u64> = std::iter::from_fn(|| q.pop()).map(|e| e.identity().0).collect();
        assert_eq!(order, vec![4, 2, 3, 1, 5]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_equal_priorities_pop_by_identity() {
        let mut q = queue();
        for id in [9, 3, 7, 1] {
            q.emplace(EntityId(id), Arc::new(id), 0.5, false).unwrap();
        }
        let order: Vec<u64> = std::iter::from_fn(|| q.pop()).map(|e| e.identity().0).collect();
        assert_eq!(order, vec![1, 3, 7, 9]);
    }

    #[test]
    fn test_duplicate_emplace_rejected_and_queue_unchanged() {
        let mut q = queue();
        let id = EntityId(42);
        q.emplace(id, Arc::new(42), 5.0, false).unwrap();

        let result = q.emplace(id, Arc::new(42), 7.0, true);
        assert_eq!(result, Err(QueueError::DuplicateIdentity(id)));

        assert_eq!(q.len(), 1);
        assert!(q.is_consistent());
        let top = q.top().unwrap();
        assert_eq!(top.priority(), 5.0);
        assert!(!top.should_force_remove());
    }

    #[test]
    fn test_dead_handle_rejected() {
        let mut q: EntityPriorityQueue<Weak<u64>> = EntityPriorityQueue::new();
        let strong = Arc::new(1);
        let weak = Arc::downgrade(&strong);
        drop(strong);

        assert_eq!(
            q.emplace(EntityId(1), weak, 0.5, false),
            Err(QueueError::DeadHandle(EntityId(1)))
        );
        assert!(q.is_empty());
        assert!(!q.contains(EntityId(1)));
    }

    #[test]
    fn test_contains_tracks_pop() {
        let mut q = queue();
        q.emplace(EntityId(1), Arc::new(1), 0.3, false).unwrap();
        q.emplace(EntityId(2), Arc::new(2), 0.4, false).unwrap();
        assert!(q.contains(EntityId(1)));
        assert!(q.contains(EntityId(2)));

        let popped = q.pop().unwrap();
        assert_eq!(popped.identity(), EntityId(2));
        assert!(!q.contains(EntityId(2)));
        assert!(q.contains(EntityId(1)));

        // Popped identity may be queued again
        q.emplace(EntityId(2), Arc::new(2), 0.1, false).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_non_finite_priority_sinks_to_do_not_send() {
        let mut q = queue();
        q.emplace(EntityId(1), Arc::new(1), f32::NAN, false).unwrap();
        q.emplace(EntityId(2), Arc::new(2), f32::INFINITY, false).unwrap();
        q.emplace(EntityId(3), Arc::new(3), 0.001, false).unwrap();

        let first = q.pop().unwrap();
        assert_eq!(first.identity(), EntityId(3));
        assert_eq!(q.pop().unwrap().priority(), DO_NOT_SEND);
        assert_eq!(q.pop().unwrap().priority(), DO_NOT_SEND);
    }

    #[test]
    fn test_force_remove_sorts_below_everything() {
        let mut q = queue();
        q.emplace(EntityId(1), Arc::new(1), FORCE_REMOVE, true).unwrap();
        q.emplace(EntityId(2), Arc::new(2), DO_NOT_SEND, false).unwrap();
        q.emplace(EntityId(3), Arc::new(3), 1.0e-9, false).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| q.pop()).map(|e| e.identity().0).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_swap_exchanges_both_containers() {
        let mut a = queue();
        let mut b = queue();
        a.emplace(EntityId(1), Arc::new(1), 0.5, false).unwrap();
        a.emplace(EntityId(2), Arc::new(2), 0.6, false).unwrap();
        b.emplace(EntityId(3), Arc::new(3), 0.7, true).unwrap();

        a.swap(&mut b);

        assert_eq!(a.len(), 1);
        assert!(a.contains(EntityId(3)));
        assert!(!a.contains(EntityId(1)));
        assert_eq!(b.len(), 2);
        assert!(b.contains(EntityId(1)) && b.contains(EntityId(2)));
        assert!(a.is_consistent() && b.is_consistent());
    }

    #[test]
    fn test_clear() {
        let mut q = queue();
        q.emplace(EntityId(1), Arc::new(1), 0.5, false).unwrap();
        q.clear();
        assert!(q.is_empty());
        assert!(!q.contains(EntityId(1)));
        assert!(q.top().is_none());
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_remove_by_identity() {
        let mut q = queue();
        for (id, priority) in [(1, 0.2), (2, 0.9), (3, 0.5)] {
            q.emplace(EntityId(id), Arc::new(id), priority, false).unwrap();
        }

        assert!(q.remove(EntityId(2)));
        assert!(!q.remove(EntityId(2)));
        assert!(!q.remove(EntityId(42)));
        assert!(q.is_consistent());

        // Identity is free again
        q.emplace(EntityId(2), Arc::new(2), 0.1, false).unwrap();
        let order: Vec<u64> = std::iter::from_fn(|| q.pop()).map(|e| e.identity().0).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn test_random_operations_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(1234);
        let mut q = queue();
        let mut live: StdHashSet<u64> = StdHashSet::new();

        for _ in 0..5000 {
            if rng.gen_bool(0.6) {
                let id = rng.gen_range(0..200u64);
                let result = q.emplace(EntityId(id), Arc::new(id), rng.gen_range(0.0..1.0), false);
                assert_eq!(result.is_ok(), live.insert(id));
            } else if let Some(entry) = q.pop() {
                assert!(live.remove(&entry.identity().0));
                if let Some(next) = q.top() {
                    assert!(entry.priority() >= next.priority());
                }
            }

            assert!(q.is_consistent());
            assert_eq!(q.len(), live.len());
            assert_eq!(q.is_empty(), live.is_empty());
        }

        for id in 0..200u64 {
            assert_eq!(q.contains(EntityId(id)), live.contains(&id));
        }
    }
}
