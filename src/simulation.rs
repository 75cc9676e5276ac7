//! Synthetic scene and scripted observers
//!
//! Stands in for the octree, the tree-diff traversal and the transport so
//! the scheduler can run end to end: a grid of cubes that randomly change,
//! disappear and respawn, watched by observers orbiting the grid over links
//! of different speeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::net::arrival::{ArrivalKind, ArrivalSender};
use crate::net::protocol::{self, ObserverMessage};
use crate::scheduler::observer::{Candidate, ObserverId, SceneElement};
use crate::scheduler::queue::EntityId;
use crate::scheduler::server::{StreamServer, TickReport};
use crate::util::vec3::Vec3;
use crate::view::bounds::AACube;
use crate::view::conical::ConicalView;
use crate::view::frustum::ViewFrustum;

/// Edge length of one grid cube
const CELL_SCALE: f32 = 1.0;

/// Distance between neighbouring cube corners
const CELL_SPACING: f32 = 2.0;

/// Fraction of live cells changed per tick
const CHANGE_FRACTION: f32 = 0.005;

/// Fraction of live cells removed per tick
const REMOVE_FRACTION: f32 = 0.0005;

/// Observer link speeds, packets per second
const LINK_PPS_RANGE: std::ops::Range<u32> = 60..900;

/// One synthetic scene element
#[derive(Debug)]
pub struct SceneCube {
    bounds: AACube,
    payload_bytes: usize,
    version: AtomicU64,
}

impl SceneCube {
    pub fn new(bounds: AACube, payload_bytes: usize) -> Self {
        Self {
            bounds,
            payload_bytes,
            version: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
    }
}

impl SceneElement for SceneCube {
    fn bounds(&self) -> AACube {
        self.bounds
    }

    fn encoded_size(&self) -> usize {
        self.payload_bytes
    }
}

/// Scripted observer orbiting the scene
#[derive(Debug, Clone)]
struct SimObserver {
    id: ObserverId,
    orbit_radius: f32,
    orbit_height: f32,
    angle: f32,
    angular_speed: f32,
    link_pps: u32,
    view_sequence: u64,
    link_clock: Instant,
    needs_full_sync: bool,
}

/// Scene plus observers, advanced once per tick
pub struct Simulation {
    cells: Vec<Option<Arc<SceneCube>>>,
    dead: Vec<usize>,
    changed: Vec<EntityId>,
    removed: Vec<EntityId>,
    observers: Vec<SimObserver>,
    center: Vec3,
    tick_rate_hz: u32,
    rng: StdRng,
}

impl Simulation {
    pub fn new(config: &ServerConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let size = config.sim_scene_size.max(1);

        let mut cells = Vec::with_capacity(size * size * size);
        for x in 0..size {
            for y in 0..size {
                for z in 0..size {
                    let corner = Vec3::new(x as f32, y as f32, z as f32) * CELL_SPACING;
                    let payload = rng.gen_range(64..=config.packet_payload_bytes.max(65));
                    cells.push(Some(Arc::new(SceneCube::new(AACube::new(corner, CELL_SCALE), payload))));
                }
            }
        }

        let extent = size as f32 * CELL_SPACING;
        let center = Vec3::splat(extent * 0.5);
        let now = Instant::now();
        let observers = (0..config.sim_observers)
            .map(|_| SimObserver {
                id: Uuid::new_v4(),
                orbit_radius: rng.gen_range(0.3..1.2) * extent,
                orbit_height: rng.gen_range(-0.25..0.25) * extent,
                angle: rng.gen_range(0.0..std::f32::consts::TAU),
                angular_speed: rng.gen_range(0.05..0.5),
                link_pps: rng.gen_range(LINK_PPS_RANGE),
                view_sequence: 0,
                link_clock: now,
                needs_full_sync: true,
            })
            .collect();

        Self {
            cells,
            dead: Vec::new(),
            changed: Vec::new(),
            removed: Vec::new(),
            observers,
            center,
            tick_rate_hz: config.tick_rate_hz.max(1),
            rng,
        }
    }

    pub fn observer_ids(&self) -> impl Iterator<Item = ObserverId> + '_ {
        self.observers.iter().map(|o| o.id)
    }

    pub fn live_cells(&self) -> usize {
        self.cells.len() - self.dead.len()
    }

    /// Register every scripted observer; returns how many were admitted
    pub fn connect_all(&self, server: &mut StreamServer<SceneCube>) -> usize {
        self.observers
            .iter()
            .filter(|observer| match server.connect(observer.id) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Simulated observer not admitted: {}", e);
                    false
                }
            })
            .count()
    }

    /// Move time forward by `dt`: mutate the scene, move observers and
    /// report their views and link timing through `sender`
    pub fn advance(&mut self, dt: Duration, sender: &ArrivalSender) {
        self.mutate_scene();

        let now = Instant::now();
        let dt_secs = dt.as_secs_f32();
        let tick_rate_hz = self.tick_rate_hz;
        let center = self.center;

        for observer in &mut self.observers {
            observer.angle = (observer.angle + observer.angular_speed * dt_secs) % std::f32::consts::TAU;
            let position = center
                + Vec3::new(observer.angle.cos(), 0.0, observer.angle.sin()) * observer.orbit_radius
                + Vec3::Y * observer.orbit_height;
            let frustum = ViewFrustum::looking_at(position, center - position);

            let mut view = ConicalView::new();
            view.set(&[frustum]);
            observer.view_sequence += 1;
            match protocol::encode(&ObserverMessage::view_state(observer.view_sequence, &view)) {
                Ok(bytes) => {
                    if let Err(e) = sender.try_send_at(observer.id, ArrivalKind::Control(bytes), now) {
                        debug!("View state for {} dropped: {}", observer.id, e);
                    }
                }
                Err(e) => warn!("Failed to encode view state: {}", e),
            }

            report_link_timing(observer, tick_rate_hz, now, sender);
        }
    }

    /// Traversal output for one observer this tick
    pub fn candidates_for(&self, observer: ObserverId) -> Vec<Candidate<SceneCube>> {
        let full_sync = self
            .observers
            .iter()
            .find(|o| o.id == observer)
            .is_some_and(|o| o.needs_full_sync);

        let mut candidates = Vec::new();
        if full_sync {
            candidates.extend(
                self.cells
                    .iter()
                    .enumerate()
                    .filter_map(|(i, cell)| cell.as_ref().map(|cell| (i, cell)))
                    .map(|(i, cell)| Candidate::update(EntityId(i as u64), cell, cell.bounds())),
            );
        } else {
            for &identity in &self.changed {
                if let Some(Some(cell)) = self.cells.get(identity.0 as usize) {
                    candidates.push(Candidate::update(identity, cell, cell.bounds()));
                }
            }
        }
        candidates.extend(self.removed.iter().map(|&identity| Candidate::remove(identity)));
        candidates
    }

    /// Bookkeeping after the server ticked
    pub fn finish_tick(&mut self, report: &TickReport<SceneCube>) {
        for (id, _) in &report.outgoing {
            if let Some(observer) = self.observers.iter_mut().find(|o| o.id == *id) {
                observer.needs_full_sync = false;
            }
        }
        self.observers.retain(|o| !report.departed.contains(&o.id));
    }

    fn mutate_scene(&mut self) {
        self.changed.clear();
        self.removed.clear();

        // Respawn slots emptied on earlier ticks first, so no identity is
        // both removed and updated in the same tick
        let respawns = self.dead.len().min(self.rng.gen_range(0..=2));
        for _ in 0..respawns {
            let pick = self.rng.gen_range(0..self.dead.len());
            let slot = self.dead.swap_remove(pick);
            let corner = self.slot_corner(slot);
            let payload = self.rng.gen_range(64..=1400);
            self.cells[slot] = Some(Arc::new(SceneCube::new(AACube::new(corner, CELL_SCALE), payload)));
            self.changed.push(EntityId(slot as u64));
        }

        let live = self.live_cells();
        if live == 0 {
            return;
        }
        let changes = ((live as f32 * CHANGE_FRACTION) as usize).max(1);
        let removals = ((live as f32 * REMOVE_FRACTION) as usize).max(1);

        for _ in 0..changes {
            let slot = self.rng.gen_range(0..self.cells.len());
            if let Some(cell) = &self.cells[slot] {
                cell.touch();
                self.changed.push(EntityId(slot as u64));
            }
        }
        for _ in 0..removals {
            let slot = self.rng.gen_range(0..self.cells.len());
            if self.cells[slot].take().is_some() {
                self.dead.push(slot);
                self.removed.push(EntityId(slot as u64));
            }
        }
        self.changed.retain(|id| self.cells[id.0 as usize].is_some());
        self.changed.sort_unstable();
        self.changed.dedup();
    }

    fn slot_corner(&self, slot: usize) -> Vec3 {
        let size = (self.cells.len() as f64).cbrt().round() as usize;
        let size = size.max(1);
        let z = slot % size;
        let y = (slot / size) % size;
        let x = slot / (size * size);
        Vec3::new(x as f32, y as f32, z as f32) * CELL_SPACING
    }
}

/// Data packets spaced at the link rate plus one probe pair
fn report_link_timing(observer: &mut SimObserver, tick_rate_hz: u32, now: Instant, sender: &ArrivalSender) {
    let gap = Duration::from_micros(1_000_000 / u64::from(observer.link_pps.max(1)));
    if observer.link_clock < now {
        observer.link_clock = now;
    }

    let packets = observer.link_pps.div_ceil(tick_rate_hz);
    for _ in 0..packets {
        observer.link_clock += gap;
        if let Err(e) = sender.try_send_at(observer.id, ArrivalKind::Packet, observer.link_clock) {
            debug!("Packet timing for {} dropped: {}", observer.id, e);
            return;
        }
    }

    // Bottleneck serves a back-to-back pair at four times the steady rate
    let probe_gap = gap / 4;
    let pair = sender
        .try_send_at(observer.id, ArrivalKind::ProbePair1, observer.link_clock)
        .and_then(|()| sender.try_send_at(observer.id, ArrivalKind::ProbePair2, observer.link_clock + probe_gap));
    if let Err(e) = pair {
        debug!("Probe pair for {} dropped: {}", observer.id, e);
    }
}
