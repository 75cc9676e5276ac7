//! Lock-free inbound event buffer
//!
//! Uses crossbeam-channel for lock-free MPSC communication from
//! connection handlers to the scheduling tick. Timestamps are taken by the
//! receiving side when the datagram lands, not when the tick drains it.

use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::scheduler::observer::ObserverId;

/// What arrived from an observer
#[derive(Debug, Clone, PartialEq)]
pub enum ArrivalKind {
    /// Ordinary data packet (feeds receive speed)
    Packet,
    /// First packet of a back-to-back probe pair
    ProbePair1,
    /// Second packet of a probe pair (feeds bandwidth)
    ProbePair2,
    /// Encoded [`ObserverMessage`](crate::net::protocol::ObserverMessage),
    /// decoded by the tick so malformed input is counted in one place
    Control(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ArrivalEvent {
    pub observer_id: ObserverId,
    pub at: Instant,
    pub kind: ArrivalKind,
}

/// Bounded event buffer shared by all connection handlers
///
/// Handlers submit without blocking; the tick drains everything pending
/// before scheduling.
pub struct ArrivalBuffer {
    sender: Sender<ArrivalEvent>,
    receiver: Receiver<ArrivalEvent>,
    capacity: usize,
}

impl ArrivalBuffer {
    /// Capacity must cover a burst of arrivals between two ticks
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            capacity: capacity.max(1),
        }
    }

    /// Sender handle for one connection
    pub fn sender(&self) -> ArrivalSender {
        ArrivalSender {
            sender: self.sender.clone(),
        }
    }

    /// Drain all pending events in arrival order
    pub fn drain(&self) -> Vec<ArrivalEvent> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ArrivalBuffer {
    fn default() -> Self {
        // ~256 observers each landing a few packets per tick
        Self::new(4096)
    }
}

/// Clonable sender handle for connection handlers
#[derive(Clone)]
pub struct ArrivalSender {
    sender: Sender<ArrivalEvent>,
}

impl ArrivalSender {
    /// Record an arrival timestamped now
    #[inline]
    pub fn try_send(&self, observer_id: ObserverId, kind: ArrivalKind) -> Result<(), ArrivalError> {
        self.try_send_at(observer_id, kind, Instant::now())
    }

    pub fn try_send_at(
        &self,
        observer_id: ObserverId,
        kind: ArrivalKind,
        at: Instant,
    ) -> Result<(), ArrivalError> {
        self.sender
            .try_send(ArrivalEvent {
                observer_id,
                at,
                kind,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => ArrivalError::Full,
                TrySendError::Disconnected(_) => ArrivalError::Disconnected,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArrivalError {
    #[error("arrival buffer full")]
    Full,
    #[error("arrival buffer disconnected")]
    Disconnected,
}
