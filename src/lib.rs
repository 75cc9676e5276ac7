//! Scene Stream Server Library
//!
//! View-priority scheduling for streaming a shared octree scene to many
//! observers: which changed elements each observer receives this tick, and
//! in what order, given where it is looking and how fast its link is.
//!
//! # Features
//!
//! - `metrics_extended` - Per-tick send queue depth gauges (enabled by default)

pub mod config;
pub mod metrics;
pub mod net;
pub mod scheduler;
pub mod simulation;
pub mod util;
pub mod view;
