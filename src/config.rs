use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the metrics endpoint binds to
    pub bind_address: IpAddr,
    /// Port for the metrics endpoint
    pub metrics_port: u16,
    /// Scheduling ticks per second
    pub tick_rate_hz: u32,
    /// Server-side cap on packets sent to one observer in one tick
    pub max_packets_per_tick: u32,
    /// Rate assumed when no timing signal is available yet
    pub default_packets_per_second: u32,
    /// Usable payload bytes per packet
    pub packet_payload_bytes: usize,
    /// Candidates with a smaller best angular size are skipped (0 disables)
    pub lod_min_angular_size: f32,
    /// Packet interval samples kept per observer
    pub packet_window_size: usize,
    /// Probe-pair samples kept per observer
    pub probe_window_size: usize,
    /// Admission limit for concurrent observers
    pub max_observers: usize,
    /// Capacity of the shared arrival event buffer
    pub arrival_buffer_capacity: usize,
    /// Synthetic observers driven by the binary
    pub sim_observers: usize,
    /// Edge length (in cubes) of the synthetic scene grid
    pub sim_scene_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            metrics_port: 9090,
            tick_rate_hz: 30,
            max_packets_per_tick: 16,
            default_packets_per_second: 60,
            packet_payload_bytes: 1400,
            lod_min_angular_size: 0.0,
            packet_window_size: 16,
            probe_window_size: 16,
            max_observers: 256,
            arrival_buffer_capacity: 4096,
            sim_observers: 8,
            sim_scene_size: 32,
        }
    }
}

/// Parse `name` from the environment if set and accepted by `valid`
///
/// Unset leaves `None`; unparsable or rejected values warn and leave `None`.
fn env_value<T, F>(name: &str, requirement: &str, valid: F) -> Option<T>
where
    T: FromStr,
    F: Fn(&T) -> bool,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(parsed) if valid(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", name, requirement);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Some(port) = env_value::<u16, _>("METRICS_PORT", "> 0", |p| *p > 0) {
            config.metrics_port = port;
        }
        if let Some(rate) = env_value::<u32, _>("TICK_RATE_HZ", "1-240", |r| (1..=240).contains(r)) {
            config.tick_rate_hz = rate;
        }
        if let Some(packets) =
            env_value::<u32, _>("MAX_PACKETS_PER_OBSERVER_PER_TICK", "1-10000", |p| (1..=10_000).contains(p))
        {
            config.max_packets_per_tick = packets;
        }
        if let Some(pps) = env_value::<u32, _>("DEFAULT_PACKETS_PER_SECOND", "> 0", |p| *p > 0) {
            config.default_packets_per_second = pps;
        }
        if let Some(bytes) =
            env_value::<usize, _>("PACKET_PAYLOAD_BYTES", "64-65507", |b| (64..=65_507).contains(b))
        {
            config.packet_payload_bytes = bytes;
        }
        if let Some(size) = env_value::<f32, _>("LOD_MIN_ANGULAR_SIZE", "finite and >= 0", |s| {
            s.is_finite() && *s >= 0.0
        }) {
            config.lod_min_angular_size = size;
        }
        if let Some(size) = env_value::<usize, _>("PACKET_WINDOW_SIZE", "1-1024", |s| (1..=1024).contains(s)) {
            config.packet_window_size = size;
        }
        if let Some(size) = env_value::<usize, _>("PROBE_WINDOW_SIZE", "1-1024", |s| (1..=1024).contains(s)) {
            config.probe_window_size = size;
        }
        if let Some(max) = env_value::<usize, _>("MAX_OBSERVERS", "1-100000", |m| (1..=100_000).contains(m)) {
            config.max_observers = max;
        }
        if let Some(capacity) = env_value::<usize, _>("ARRIVAL_BUFFER_CAPACITY", "> 0", |c| *c > 0) {
            config.arrival_buffer_capacity = capacity;
        }
        if let Some(count) = env_value::<usize, _>("SIM_OBSERVERS", "0-10000", |c| *c <= 10_000) {
            config.sim_observers = count;
        }
        if let Some(size) = env_value::<usize, _>("SIM_SCENE_SIZE", "1-256", |s| (1..=256).contains(s)) {
            config.sim_scene_size = size;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.metrics_port == 0 {
            return Err("Metrics port cannot be 0".to_string());
        }
        if self.tick_rate_hz == 0 {
            return Err("tick_rate_hz must be at least 1".to_string());
        }
        if self.max_packets_per_tick == 0 {
            return Err("max_packets_per_tick must be at least 1".to_string());
        }
        if self.default_packets_per_second == 0 {
            return Err("default_packets_per_second must be at least 1".to_string());
        }
        if self.packet_payload_bytes == 0 {
            return Err("packet_payload_bytes must be at least 1".to_string());
        }
        if !self.lod_min_angular_size.is_finite() || self.lod_min_angular_size < 0.0 {
            return Err("lod_min_angular_size must be finite and non-negative".to_string());
        }
        if self.packet_window_size == 0 || self.probe_window_size == 0 {
            return Err("timing windows need at least one sample".to_string());
        }
        if self.max_observers == 0 {
            return Err("max_observers must be at least 1".to_string());
        }
        if self.sim_observers > self.max_observers {
            return Err("sim_observers cannot exceed max_observers".to_string());
        }
        Ok(())
    }

    /// Tick period derived from `tick_rate_hz`
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate_hz.max(1)))
    }
}
