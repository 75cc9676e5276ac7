//! All connected observers and the scene-wide tick
//!
//! Observer state is private per observer, so the tick fans out across
//! the rayon pool with one task per observer. Arrival events are routed
//! before the fan-out, keeping each timing window single-writer.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::arrival::{ArrivalBuffer, ArrivalSender};
use crate::net::packet_time_window::PacketTimeWindow;
use crate::scheduler::budget::BudgetPolicy;
use crate::scheduler::observer::{
    Candidate, ControlOutcome, ObserverId, ObserverScheduler, Outgoing, SceneElement, TickStats, ViewUpdate,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("observer limit of {0} reached")]
    TooManyObservers(usize),
    #[error("observer {0} is already connected")]
    AlreadyConnected(ObserverId),
    #[error("observer {0} is not connected")]
    UnknownObserver(ObserverId),
}

/// Everything produced by one scene-wide tick
#[derive(Debug)]
pub struct TickReport<E> {
    pub tick: u64,
    /// Send order per observer
    pub outgoing: Vec<(ObserverId, Vec<Outgoing<E>>)>,
    /// Sum over all observers
    pub stats: TickStats,
    /// Observers that left during arrival processing
    pub departed: Vec<ObserverId>,
}

/// Scheduling for every connected observer
pub struct StreamServer<E> {
    observers: HashMap<ObserverId, ObserverScheduler<E>>,
    arrivals: ArrivalBuffer,
    policy: BudgetPolicy,
    config: ServerConfig,
    metrics: Arc<Metrics>,
    tick: u64,
}

impl<E> StreamServer<E>
where
    E: SceneElement + Send + Sync,
{
    pub fn new(config: ServerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            observers: HashMap::with_capacity(config.max_observers),
            arrivals: ArrivalBuffer::new(config.arrival_buffer_capacity),
            policy: BudgetPolicy::from_config(&config),
            config,
            metrics,
            tick: 0,
        }
    }

    /// Handle for transport threads to report arrivals
    pub fn arrival_sender(&self) -> ArrivalSender {
        self.arrivals.sender()
    }

    #[inline]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    #[inline]
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn observer(&self, id: ObserverId) -> Option<&ObserverScheduler<E>> {
        self.observers.get(&id)
    }

    pub fn observer_mut(&mut self, id: ObserverId) -> Option<&mut ObserverScheduler<E>> {
        self.observers.get_mut(&id)
    }

    pub fn observer_ids(&self) -> impl Iterator<Item = ObserverId> + '_ {
        self.observers.keys().copied()
    }

    /// Admit a new observer with fresh state
    pub fn connect(&mut self, id: ObserverId) -> Result<(), ServerError> {
        if self.observers.contains_key(&id) {
            return Err(ServerError::AlreadyConnected(id));
        }
        if self.observers.len() >= self.config.max_observers {
            self.metrics.observers_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Rejecting observer {}: limit of {} reached", id, self.config.max_observers);
            return Err(ServerError::TooManyObservers(self.config.max_observers));
        }

        let window = PacketTimeWindow::new(self.config.packet_window_size, self.config.probe_window_size);
        let observer = ObserverScheduler::new(id, self.policy, window)
            .with_lod_cutoff(self.config.lod_min_angular_size);
        self.observers.insert(id, observer);
        self.metrics.observers_active.store(self.observers.len() as u64, Ordering::Relaxed);
        info!("Observer {} connected ({} total)", id, self.observers.len());
        Ok(())
    }

    /// Tear down an observer; unsent entries are discarded
    pub fn disconnect(&mut self, id: ObserverId) -> bool {
        let Some(observer) = self.observers.remove(&id) else {
            return false;
        };
        self.metrics.observers_active.store(self.observers.len() as u64, Ordering::Relaxed);
        info!(
            "Observer {} disconnected, dropping {} pending sends",
            id,
            observer.pending_sends()
        );
        true
    }

    /// Transport-level reconnect: same observer, fresh timing and queues
    pub fn on_reconnect(&mut self, id: ObserverId) -> Result<(), ServerError> {
        self.observers
            .get_mut(&id)
            .map(ObserverScheduler::on_reconnect)
            .ok_or(ServerError::UnknownObserver(id))
    }

    /// Route every pending arrival to its observer
    ///
    /// Returns observers that asked to leave; they are disconnected here.
    pub fn process_arrivals(&mut self) -> Vec<ObserverId> {
        let mut departed = Vec::new();

        for event in self.arrivals.drain() {
            let Some(observer) = self.observers.get_mut(&event.observer_id) else {
                self.metrics.arrivals_unknown_observer.fetch_add(1, Ordering::Relaxed);
                debug!("Arrival for unknown observer {}", event.observer_id);
                continue;
            };
            self.metrics.arrivals_processed.fetch_add(1, Ordering::Relaxed);

            match observer.ingest(event.kind, event.at) {
                Ok(None) => {}
                Ok(Some(ControlOutcome::View(update))) => {
                    let counter = match update {
                        ViewUpdate::Applied => &self.metrics.view_updates_applied,
                        ViewUpdate::Similar => &self.metrics.view_updates_similar,
                        ViewUpdate::Stale => &self.metrics.view_updates_stale,
                        ViewUpdate::Rejected => &self.metrics.view_state_rejected,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Some(ControlOutcome::RateCapped(_))) => {}
                Ok(Some(ControlOutcome::Leave)) => departed.push(event.observer_id),
                Err(_) => {
                    self.metrics.view_state_rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for id in &departed {
            self.disconnect(*id);
        }
        departed
    }

    /// One scene-wide tick
    ///
    /// `candidates` yields this tick's traversal output for one observer; it
    /// is called from rayon workers.
    pub fn tick<F, I>(&mut self, candidates: F) -> TickReport<E>
    where
        F: Fn(&ObserverScheduler<E>) -> I + Sync,
        I: IntoIterator<Item = Candidate<E>>,
    {
        let start = Instant::now();
        self.tick += 1;

        let departed = self.process_arrivals();

        let results: Vec<(ObserverId, Vec<Outgoing<E>>, TickStats)> = self
            .observers
            .par_iter_mut()
            .map(|(id, observer)| {
                let mut out = Vec::new();
                let batch = candidates(observer);
                let stats = observer.tick(batch, &mut out);
                (*id, out, stats)
            })
            .collect();

        let mut stats = TickStats::default();
        let mut max_queue_depth = 0;
        let mut outgoing = Vec::with_capacity(results.len());
        for (id, out, observer_stats) in results {
            stats.merge(&observer_stats);
            max_queue_depth = max_queue_depth.max(observer_stats.send_queue_depth);
            outgoing.push((id, out));
        }

        self.metrics.record_tick_stats(&stats, max_queue_depth);
        self.metrics.record_tick_time(start.elapsed());

        TickReport {
            tick: self.tick,
            outgoing,
            stats,
            departed,
        }
    }
}
