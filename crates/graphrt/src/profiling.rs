//! Process-wide event counters for cache behaviour.
//!
//! The planner and the compile engine report named events (`storage_reuse_hit`,
//! `engine_cache_miss`, ...) through [`cache_event`]; tests and embedders read
//! them back with [`event_count`].

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

fn counters() -> &'static Mutex<HashMap<&'static str, u64>> {
    static COUNTERS: OnceLock<Mutex<HashMap<&'static str, u64>>> = OnceLock::new();
    COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn cache_event(name: &'static str) {
    let mut stats = counters().lock().expect("profiling counters poisoned");
    *stats.entry(name).or_insert(0) += 1;
}

pub fn event_count(name: &str) -> u64 {
    let stats = counters().lock().expect("profiling counters poisoned");
    stats.get(name).copied().unwrap_or(0)
}
