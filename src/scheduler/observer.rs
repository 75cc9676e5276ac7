//! Per-observer scheduling state and the send tick
//!
//! Each observer owns its view, two queues and a timing window; nothing here
//! is shared, so ticks for different observers run in parallel without
//! locking.
//!
//! One tick:
//! 1. Leftover sends are re-scored if the view changed since the last tick
//! 2. New candidates are scored; out-of-view and tiny ones are skipped,
//!    removals go to the removal queue. When one identity shows up as both
//!    a removal and an update, the later candidate wins
//! 3. A budget is computed from the timing window
//! 4. Every queued removal is flushed, then sends are drained in priority
//!    order until the budget runs out; the rest carries over
//!
//! # Performance
//! - Scoring is one conical test per sub-view per candidate, no allocation
//! - Re-scoring drains into a standby queue and swaps, reusing both
//!   allocations tick after tick

use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::net::arrival::ArrivalKind;
use crate::net::packet_time_window::PacketTimeWindow;
use crate::net::protocol::{self, ObserverMessage, ViewStateError, MAX_FRUSTUMS_PER_VIEW};
use crate::scheduler::budget::BudgetPolicy;
use crate::scheduler::queue::{
    EntityHandle, EntityId, EntityPriorityQueue, IdentitySet, QueueError, DO_NOT_SEND, FORCE_REMOVE,
};
use crate::view::bounds::AACube;
use crate::view::conical::{ConicalView, ConicalViewFrustum};
use crate::view::frustum::ViewFrustum;

/// Unique observer identifier
pub type ObserverId = Uuid;

/// Bytes charged for a removal record (tag + identity)
pub const REMOVAL_ENCODED_SIZE: usize = 12;

/// What the scheduler needs from a scene element
pub trait SceneElement {
    /// Octree cell holding the element
    fn bounds(&self) -> AACube;
    /// Bytes the element takes on the wire
    fn encoded_size(&self) -> usize;
}

// ============================================================================
// Candidates and output
// ============================================================================

/// One element surfaced by the tree-diff traversal this tick
#[derive(Debug, Clone)]
pub enum Candidate<E> {
    /// New or changed element that may need sending
    Update {
        identity: EntityId,
        handle: Weak<E>,
        volume: AACube,
    },
    /// Element deleted or left the interest set; the observer must drop it
    Remove { identity: EntityId },
}

impl<E> Candidate<E> {
    pub fn update(identity: EntityId, element: &Arc<E>, volume: AACube) -> Self {
        Candidate::Update {
            identity,
            handle: Arc::downgrade(element),
            volume,
        }
    }

    pub fn remove(identity: EntityId) -> Self {
        Candidate::Remove { identity }
    }

    pub fn identity(&self) -> EntityId {
        match self {
            Candidate::Update { identity, .. } | Candidate::Remove { identity } => *identity,
        }
    }
}

/// One record handed to the transport, in send order
#[derive(Debug, Clone)]
pub struct Outgoing<E> {
    pub identity: EntityId,
    /// Live element to encode; `None` for removals
    pub handle: Option<Arc<E>>,
    pub force_remove: bool,
}

/// Handle stored for removals: only the identity matters once an element is gone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tombstone;

impl EntityHandle for Tombstone {
    #[inline]
    fn is_live(&self) -> bool {
        true
    }
}

/// Counters for one observer tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub candidates: u64,
    pub enqueued: u64,
    pub out_of_view: u64,
    pub lod_culled: u64,
    pub already_queued: u64,
    pub duplicate_emplace: u64,
    pub stale_handles_dropped: u64,
    pub rescored: u64,
    /// Carried-over entries dropped by re-scoring (out of view or below LOD)
    pub rescore_discarded: u64,
    /// Removals superseded by a later update in the same tick
    pub removals_cancelled: u64,
    pub removals_sent: u64,
    pub elements_sent: u64,
    pub bytes_sent: u64,
    pub bytes_budgeted: u64,
    pub packets_budgeted: u64,
    pub elements_deferred: u64,
    pub send_queue_depth: u64,
}

impl TickStats {
    /// Accumulate another observer's counters
    pub fn merge(&mut self, other: &TickStats) {
        self.candidates += other.candidates;
        self.enqueued += other.enqueued;
        self.out_of_view += other.out_of_view;
        self.lod_culled += other.lod_culled;
        self.already_queued += other.already_queued;
        self.duplicate_emplace += other.duplicate_emplace;
        self.stale_handles_dropped += other.stale_handles_dropped;
        self.rescored += other.rescored;
        self.rescore_discarded += other.rescore_discarded;
        self.removals_cancelled += other.removals_cancelled;
        self.removals_sent += other.removals_sent;
        self.elements_sent += other.elements_sent;
        self.bytes_sent += other.bytes_sent;
        self.bytes_budgeted += other.bytes_budgeted;
        self.packets_budgeted += other.packets_budgeted;
        self.elements_deferred += other.elements_deferred;
        self.send_queue_depth += other.send_queue_depth;
    }
}

/// Result of applying a reported view state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewUpdate {
    /// New view in effect; leftovers are re-scored next tick
    Applied,
    /// Close enough to the current view that nothing changed
    Similar,
    /// Older than a view already applied
    Stale,
    /// Invalid geometry; the previous view stays in effect
    Rejected,
}

/// Result of one control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    View(ViewUpdate),
    RateCapped(u32),
    Leave,
}

// ============================================================================
// ObserverScheduler
// ============================================================================

/// Scheduling state for one connected observer
#[derive(Debug)]
pub struct ObserverScheduler<E> {
    id: ObserverId,
    view: ConicalView,
    view_sequence: Option<u64>,
    view_changed: bool,
    send_queue: EntityPriorityQueue<Weak<E>>,
    standby_queue: EntityPriorityQueue<Weak<E>>,
    removal_queue: EntityPriorityQueue<Tombstone>,
    removed_this_tick: IdentitySet,
    revived_this_tick: IdentitySet,
    window: PacketTimeWindow,
    client_max_pps: Option<u32>,
    policy: BudgetPolicy,
    lod_min_angular_size: f32,
}

impl<E: SceneElement> ObserverScheduler<E> {
    pub fn new(id: ObserverId, policy: BudgetPolicy, window: PacketTimeWindow) -> Self {
        Self {
            id,
            view: ConicalView::new(),
            view_sequence: None,
            view_changed: false,
            send_queue: EntityPriorityQueue::new(),
            standby_queue: EntityPriorityQueue::new(),
            removal_queue: EntityPriorityQueue::new(),
            removed_this_tick: IdentitySet::default(),
            revived_this_tick: IdentitySet::default(),
            window,
            client_max_pps: None,
            policy,
            lod_min_angular_size: 0.0,
        }
    }

    /// Skip candidates whose best angular size is below `min` (0 disables)
    pub fn with_lod_cutoff(mut self, min: f32) -> Self {
        self.lod_min_angular_size = if min.is_finite() { min.max(0.0) } else { 0.0 };
        self
    }

    #[inline]
    pub fn id(&self) -> ObserverId {
        self.id
    }

    #[inline]
    pub fn view(&self) -> &ConicalView {
        &self.view
    }

    #[inline]
    pub fn window(&self) -> &PacketTimeWindow {
        &self.window
    }

    #[inline]
    pub fn client_max_pps(&self) -> Option<u32> {
        self.client_max_pps
    }

    /// Sends waiting for budget
    #[inline]
    pub fn pending_sends(&self) -> usize {
        self.send_queue.len()
    }

    /// Removals waiting for the next flush
    #[inline]
    pub fn pending_removals(&self) -> usize {
        self.removal_queue.len()
    }

    pub fn is_scheduled(&self, identity: EntityId) -> bool {
        self.send_queue.contains(identity) || self.removal_queue.contains(identity)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Feed one transport arrival
    ///
    /// Timing arrivals update the window; control payloads are decoded and
    /// applied. A malformed payload leaves all state untouched.
    pub fn ingest(&mut self, kind: ArrivalKind, at: Instant) -> Result<Option<ControlOutcome>, ViewStateError> {
        match kind {
            ArrivalKind::Packet => self.window.on_packet_arrival_at(at),
            ArrivalKind::ProbePair1 => self.window.on_probe_pair1_arrival_at(at),
            ArrivalKind::ProbePair2 => self.window.on_probe_pair2_arrival_at(at),
            ArrivalKind::Control(bytes) => return self.receive_control(&bytes).map(Some),
        }
        Ok(None)
    }

    /// Decode and apply one encoded [`ObserverMessage`]
    pub fn receive_control(&mut self, data: &[u8]) -> Result<ControlOutcome, ViewStateError> {
        match protocol::decode_observer_message(data, MAX_FRUSTUMS_PER_VIEW) {
            Ok(message) => Ok(self.handle_message(message)),
            Err(e) => {
                warn!("Observer {} sent a bad control message: {}", self.id, e);
                Err(e)
            }
        }
    }

    pub fn handle_message(&mut self, message: ObserverMessage) -> ControlOutcome {
        match message {
            ObserverMessage::ViewState { sequence, frustums } => {
                ControlOutcome::View(self.apply_view_state(sequence, frustums))
            }
            ObserverMessage::MaxPacketsPerSecond(pps) => {
                self.client_max_pps = (pps > 0).then_some(pps);
                debug!("Observer {} capped at {} packets/s", self.id, pps);
                ControlOutcome::RateCapped(pps)
            }
            ObserverMessage::Leave => ControlOutcome::Leave,
        }
    }

    /// Adopt a reported view unless it is stale or barely different
    pub fn apply_view_state(&mut self, sequence: u64, frustums: Vec<ConicalViewFrustum>) -> ViewUpdate {
        if self.view_sequence.is_some_and(|last| sequence <= last) {
            trace!("Observer {} view {} is stale", self.id, sequence);
            return ViewUpdate::Stale;
        }
        self.view_sequence = Some(sequence);

        let mut next = ConicalView::new();
        next.set_conical(frustums);
        self.replace_view(next)
    }

    /// Adopt real frusta directly (local observers, tests)
    ///
    /// Any invalid frustum rejects the whole update.
    pub fn set_view(&mut self, frustums: &[ViewFrustum]) -> ViewUpdate {
        let mut next = ConicalView::new();
        if let Err(e) = next.try_set(frustums) {
            warn!("Observer {} reported an unusable view: {}", self.id, e);
            return ViewUpdate::Rejected;
        }
        self.replace_view(next)
    }

    fn replace_view(&mut self, next: ConicalView) -> ViewUpdate {
        if !self.view.is_empty() && next.is_very_similar(&self.view) {
            return ViewUpdate::Similar;
        }
        self.view = next;
        self.view_changed = true;
        ViewUpdate::Applied
    }

    /// Fresh timing and empty queues after the transport reconnected
    ///
    /// The view survives; the client restarts its sequence numbering.
    pub fn on_reconnect(&mut self) {
        self.window.reset();
        self.send_queue.clear();
        self.standby_queue.clear();
        self.removal_queue.clear();
        self.revived_this_tick.clear();
        self.view_sequence = None;
        debug!("Observer {} reconnected, queues cleared", self.id);
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Score `candidates`, then drain what the budget allows into `out`
    pub fn tick<I>(&mut self, candidates: I, out: &mut Vec<Outgoing<E>>) -> TickStats
    where
        I: IntoIterator<Item = Candidate<E>>,
    {
        let mut stats = TickStats::default();
        self.revived_this_tick.clear();

        if self.view_changed {
            self.rescore_leftovers(&mut stats);
            self.view_changed = false;
        }

        for candidate in candidates {
            stats.candidates += 1;
            self.schedule(candidate, &mut stats);
        }

        let mut budget = self.policy.budget(&self.window, self.client_max_pps);
        stats.packets_budgeted = u64::from(budget.packets());
        stats.bytes_budgeted = budget.total_bytes() as u64;

        self.removed_this_tick.clear();
        while let Some(entry) = self.removal_queue.pop() {
            if self.revived_this_tick.contains(&entry.identity()) {
                stats.removals_cancelled += 1;
                continue;
            }
            self.removed_this_tick.insert(entry.identity());
            out.push(Outgoing {
                identity: entry.identity(),
                handle: None,
                force_remove: true,
            });
            stats.removals_sent += 1;
            stats.bytes_sent += REMOVAL_ENCODED_SIZE as u64;
        }

        while let Some(top) = self.send_queue.top() {
            if self.removed_this_tick.contains(&top.identity()) || top.priority() <= DO_NOT_SEND {
                self.send_queue.pop();
                continue;
            }
            let Some(element) = top.handle().upgrade() else {
                self.send_queue.pop();
                stats.stale_handles_dropped += 1;
                continue;
            };
            let size = element.encoded_size();
            if !budget.try_spend(size) {
                break;
            }
            if let Some(entry) = self.send_queue.pop() {
                out.push(Outgoing {
                    identity: entry.identity(),
                    handle: Some(element),
                    force_remove: false,
                });
                stats.elements_sent += 1;
                stats.bytes_sent += size as u64;
            }
        }

        stats.elements_deferred = self.send_queue.len() as u64;
        stats.send_queue_depth = self.send_queue.len() as u64;

        trace!(
            observer = %self.id,
            sent = stats.elements_sent,
            removed = stats.removals_sent,
            deferred = stats.elements_deferred,
            "Observer tick"
        );
        stats
    }

    fn schedule(&mut self, candidate: Candidate<E>, stats: &mut TickStats) {
        match candidate {
            Candidate::Remove { identity } => {
                // A removal after an update of the same identity wins again
                self.revived_this_tick.remove(&identity);
                if self.removal_queue.contains(identity) {
                    stats.already_queued += 1;
                    return;
                }
                if self.removal_queue.emplace(identity, Tombstone, FORCE_REMOVE, true).is_ok() {
                    stats.enqueued += 1;
                }
            }
            Candidate::Update {
                identity,
                handle,
                volume,
            } => {
                // Removed earlier this tick: a queued entry holds the old handle
                let revived = self.removal_queue.contains(identity);
                if !revived && self.send_queue.contains(identity) {
                    stats.already_queued += 1;
                    return;
                }
                let priority = self.view.compute_priority(&volume);
                if priority <= DO_NOT_SEND {
                    stats.out_of_view += 1;
                    return;
                }
                if self.below_lod_cutoff(&volume) {
                    stats.lod_culled += 1;
                    return;
                }
                if revived {
                    self.send_queue.remove(identity);
                }
                match self.send_queue.emplace(identity, handle, priority, false) {
                    Ok(()) => {
                        stats.enqueued += 1;
                        if revived {
                            self.revived_this_tick.insert(identity);
                        }
                    }
                    Err(QueueError::DeadHandle(_)) => stats.stale_handles_dropped += 1,
                    Err(QueueError::DuplicateIdentity(_)) => stats.duplicate_emplace += 1,
                }
            }
        }
    }

    #[inline]
    fn below_lod_cutoff(&self, volume: &AACube) -> bool {
        self.lod_min_angular_size > 0.0
            && !self.view.is_empty()
            && self.view.get_angular_size(volume) < self.lod_min_angular_size
    }

    /// Re-score carried-over sends against the current view
    fn rescore_leftovers(&mut self, stats: &mut TickStats) {
        self.standby_queue.clear();
        while let Some(entry) = self.send_queue.pop() {
            let identity = entry.identity();
            let handle = entry.into_handle();
            let Some(element) = handle.upgrade() else {
                stats.stale_handles_dropped += 1;
                continue;
            };
            let volume = element.bounds();
            let priority = self.view.compute_priority(&volume);
            if priority <= DO_NOT_SEND || self.below_lod_cutoff(&volume) {
                stats.rescore_discarded += 1;
                continue;
            }
            if self.standby_queue.emplace(identity, handle, priority, false).is_ok() {
                stats.rescored += 1;
            }
        }
        self.send_queue.swap(&mut self.standby_queue);
    }
}

// ============================================================================
// Tests
// ============================================================================
