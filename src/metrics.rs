//! Scheduler counters and their HTTP exposition
//!
//! Counters are plain atomics bumped once per tick from the merged
//! `TickStats`; scrape `/metrics` (Prometheus text) or `/metrics/json`
//! on `METRICS_PORT`.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, debug};

use crate::scheduler::observer::TickStats;

/// Tick samples kept for percentiles
const TICK_HISTORY_LEN: usize = 1000;

/// Metrics registry for the stream server
#[derive(Debug)]
pub struct Metrics {
    // Observers
    pub observers_active: AtomicU64,
    pub observers_rejected: AtomicU64,

    // Scene-wide tick duration, microseconds
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Output
    pub elements_sent: AtomicU64,
    pub removals_sent: AtomicU64,
    pub removals_cancelled: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_budgeted: AtomicU64,
    pub elements_deferred: AtomicU64,

    // Candidate scoring
    pub candidates_total: AtomicU64,
    pub candidates_out_of_view: AtomicU64,
    pub candidates_lod_culled: AtomicU64,
    pub candidates_already_queued: AtomicU64,
    pub candidates_rescored: AtomicU64,
    pub candidates_rescore_discarded: AtomicU64,
    pub duplicate_emplace: AtomicU64,
    pub stale_handles_dropped: AtomicU64,

    // View state
    pub view_updates_applied: AtomicU64,
    pub view_updates_similar: AtomicU64,
    pub view_updates_stale: AtomicU64,
    pub view_state_rejected: AtomicU64,

    // Arrivals
    pub arrivals_processed: AtomicU64,
    pub arrivals_unknown_observer: AtomicU64,

    // Queue depth gauges
    #[cfg(feature = "metrics_extended")]
    pub send_queue_depth_total: AtomicU64,
    #[cfg(feature = "metrics_extended")]
    pub send_queue_depth_max: AtomicU64,

    start_time: Instant,

    // Last TICK_HISTORY_LEN tick durations
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            observers_active: AtomicU64::new(0),
            observers_rejected: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            elements_sent: AtomicU64::new(0),
            removals_sent: AtomicU64::new(0),
            removals_cancelled: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_budgeted: AtomicU64::new(0),
            elements_deferred: AtomicU64::new(0),
            candidates_total: AtomicU64::new(0),
            candidates_out_of_view: AtomicU64::new(0),
            candidates_lod_culled: AtomicU64::new(0),
            candidates_already_queued: AtomicU64::new(0),
            candidates_rescored: AtomicU64::new(0),
            candidates_rescore_discarded: AtomicU64::new(0),
            duplicate_emplace: AtomicU64::new(0),
            stale_handles_dropped: AtomicU64::new(0),
            view_updates_applied: AtomicU64::new(0),
            view_updates_similar: AtomicU64::new(0),
            view_updates_stale: AtomicU64::new(0),
            view_state_rejected: AtomicU64::new(0),
            arrivals_processed: AtomicU64::new(0),
            arrivals_unknown_observer: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            send_queue_depth_total: AtomicU64::new(0),
            #[cfg(feature = "metrics_extended")]
            send_queue_depth_max: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY_LEN)),
        }
    }

    /// Push one tick duration and refresh p95/p99/max
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY_LEN {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Fold one tick's aggregated observer counters into the totals
    ///
    /// `max_queue_depth` is the deepest single observer send queue.
    pub fn record_tick_stats(&self, stats: &TickStats, max_queue_depth: u64) {
        self.elements_sent.fetch_add(stats.elements_sent, Ordering::Relaxed);
        self.removals_sent.fetch_add(stats.removals_sent, Ordering::Relaxed);
        self.removals_cancelled.fetch_add(stats.removals_cancelled, Ordering::Relaxed);
        self.bytes_sent.fetch_add(stats.bytes_sent, Ordering::Relaxed);
        self.bytes_budgeted.fetch_add(stats.bytes_budgeted, Ordering::Relaxed);
        self.elements_deferred.store(stats.elements_deferred, Ordering::Relaxed);
        self.candidates_total.fetch_add(stats.candidates, Ordering::Relaxed);
        self.candidates_out_of_view.fetch_add(stats.out_of_view, Ordering::Relaxed);
        self.candidates_lod_culled.fetch_add(stats.lod_culled, Ordering::Relaxed);
        self.candidates_already_queued.fetch_add(stats.already_queued, Ordering::Relaxed);
        self.candidates_rescored.fetch_add(stats.rescored, Ordering::Relaxed);
        self.candidates_rescore_discarded.fetch_add(stats.rescore_discarded, Ordering::Relaxed);
        self.duplicate_emplace.fetch_add(stats.duplicate_emplace, Ordering::Relaxed);
        self.stale_handles_dropped.fetch_add(stats.stale_handles_dropped, Ordering::Relaxed);

        #[cfg(feature = "metrics_extended")]
        {
            self.send_queue_depth_total.store(stats.send_queue_depth, Ordering::Relaxed);
            self.send_queue_depth_max.store(max_queue_depth, Ordering::Relaxed);
        }
        #[cfg(not(feature = "metrics_extended"))]
        let _ = max_queue_depth;
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("scene_stream_observers_active", "Connected observers", "gauge",
            self.observers_active.load(Ordering::Relaxed));
        metric!("scene_stream_observers_rejected_total", "Connections refused at the observer limit", "counter",
            self.observers_rejected.load(Ordering::Relaxed));

        metric!("scene_stream_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("scene_stream_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("scene_stream_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("scene_stream_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("scene_stream_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("scene_stream_elements_sent_total", "Elements handed to the transport", "counter",
            self.elements_sent.load(Ordering::Relaxed));
        metric!("scene_stream_removals_sent_total", "Forced removals flushed", "counter",
            self.removals_sent.load(Ordering::Relaxed));
        metric!("scene_stream_removals_cancelled_total", "Removals superseded by a later update in the same tick", "counter",
            self.removals_cancelled.load(Ordering::Relaxed));
        metric!("scene_stream_bytes_sent_total", "Bytes charged to send budgets", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("scene_stream_bytes_budgeted_total", "Bytes offered by send budgets", "counter",
            self.bytes_budgeted.load(Ordering::Relaxed));
        metric!("scene_stream_elements_deferred", "Elements carried over after the last tick", "gauge",
            self.elements_deferred.load(Ordering::Relaxed));

        metric!("scene_stream_candidates_total", "Candidates scored", "counter",
            self.candidates_total.load(Ordering::Relaxed));
        metric!("scene_stream_candidates_out_of_view_total", "Candidates outside every view", "counter",
            self.candidates_out_of_view.load(Ordering::Relaxed));
        metric!("scene_stream_candidates_lod_culled_total", "Candidates below the angular size cutoff", "counter",
            self.candidates_lod_culled.load(Ordering::Relaxed));
        metric!("scene_stream_candidates_already_queued_total", "Candidates already scheduled", "counter",
            self.candidates_already_queued.load(Ordering::Relaxed));
        metric!("scene_stream_candidates_rescored_total", "Carried-over entries re-scored after a view change", "counter",
            self.candidates_rescored.load(Ordering::Relaxed));
        metric!("scene_stream_candidates_rescore_discarded_total", "Carried-over entries dropped by re-scoring", "counter",
            self.candidates_rescore_discarded.load(Ordering::Relaxed));
        metric!("scene_stream_duplicate_emplace_total", "Rejected duplicate queue inserts", "counter",
            self.duplicate_emplace.load(Ordering::Relaxed));
        metric!("scene_stream_stale_handles_dropped_total", "Queued elements destroyed before sending", "counter",
            self.stale_handles_dropped.load(Ordering::Relaxed));

        metric!("scene_stream_view_updates_applied_total", "View states adopted", "counter",
            self.view_updates_applied.load(Ordering::Relaxed));
        metric!("scene_stream_view_updates_similar_total", "View states ignored as very similar", "counter",
            self.view_updates_similar.load(Ordering::Relaxed));
        metric!("scene_stream_view_updates_stale_total", "View states older than the current one", "counter",
            self.view_updates_stale.load(Ordering::Relaxed));
        metric!("scene_stream_view_state_rejected_total", "Malformed view state messages", "counter",
            self.view_state_rejected.load(Ordering::Relaxed));

        metric!("scene_stream_arrivals_processed_total", "Transport arrival events ingested", "counter",
            self.arrivals_processed.load(Ordering::Relaxed));
        metric!("scene_stream_arrivals_unknown_observer_total", "Arrivals for observers no longer connected", "counter",
            self.arrivals_unknown_observer.load(Ordering::Relaxed));

        #[cfg(feature = "metrics_extended")]
        {
            metric!("scene_stream_send_queue_depth", "Queued sends across all observers", "gauge",
                self.send_queue_depth_total.load(Ordering::Relaxed));
            metric!("scene_stream_send_queue_depth_max", "Deepest single observer send queue", "gauge",
                self.send_queue_depth_max.load(Ordering::Relaxed));
        }

        metric!("scene_stream_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Same counters as pretty-printed JSON
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        #[allow(unused_mut)]
        let mut value = serde_json::json!({
            "observers": {
                "active": load(&self.observers_active),
                "rejected": load(&self.observers_rejected),
            },
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
            },
            "output": {
                "elements_sent": load(&self.elements_sent),
                "removals_sent": load(&self.removals_sent),
                "removals_cancelled": load(&self.removals_cancelled),
                "bytes_sent": load(&self.bytes_sent),
                "bytes_budgeted": load(&self.bytes_budgeted),
                "elements_deferred": load(&self.elements_deferred),
            },
            "candidates": {
                "total": load(&self.candidates_total),
                "out_of_view": load(&self.candidates_out_of_view),
                "lod_culled": load(&self.candidates_lod_culled),
                "already_queued": load(&self.candidates_already_queued),
                "rescored": load(&self.candidates_rescored),
                "rescore_discarded": load(&self.candidates_rescore_discarded),
                "duplicate_emplace": load(&self.duplicate_emplace),
                "stale_handles_dropped": load(&self.stale_handles_dropped),
            },
            "views": {
                "applied": load(&self.view_updates_applied),
                "similar": load(&self.view_updates_similar),
                "stale": load(&self.view_updates_stale),
                "rejected": load(&self.view_state_rejected),
            },
            "arrivals": {
                "processed": load(&self.arrivals_processed),
                "unknown_observer": load(&self.arrivals_unknown_observer),
            },
            "uptime_seconds": self.uptime_seconds(),
        });

        #[cfg(feature = "metrics_extended")]
        {
            value["queues"] = serde_json::json!({
                "send_depth": load(&self.send_queue_depth_total),
                "send_depth_max": load(&self.send_queue_depth_max),
            });
        }

        serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve metrics over plain HTTP until the listener fails
pub async fn start_metrics_server(metrics: Arc<Metrics>, bind_address: IpAddr, port: u16) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::new(bind_address, port);
    let listener = TcpListener::bind(addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&request, &metrics);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

/// Build the full HTTP response for one request
fn route(request: &str, metrics: &Metrics) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next());

    let (content_type, body) = match path {
        Some("/metrics") => ("text/plain; version=0.0.4", metrics.to_prometheus()),
        Some("/metrics/json") | Some("/json") => ("application/json", metrics.to_json()),
        Some("/health") | Some("/") => ("text/plain", "OK".to_string()),
        _ => {
            return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
        }
    };

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
