//! Streaming executor runtime state.
//!
//! Cooldown timestamps per (strategy, market), a cheap open-position
//! counter, and stats counters. All in-memory; the database stays the source
//! of truth for positions.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct StreamingState {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    cooldowns: HashMap<(String, i64), DateTime<Utc>>,
    open_positions: HashMap<String, i64>,
    stats: HashMap<&'static str, u64>,
}

impl StreamingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cooldown(&self, strategy: &str, market_id: i64) {
        self.inner
            .lock()
            .cooldowns
            .insert((strategy.to_string(), market_id), Utc::now());
    }

    pub fn in_cooldown(&self, strategy: &str, market_id: i64, cooldown_minutes: f64) -> bool {
        let inner = self.inner.lock();
        match inner.cooldowns.get(&(strategy.to_string(), market_id)) {
            Some(last) => {
                let elapsed = Utc::now() - *last;
                elapsed < Duration::milliseconds((cooldown_minutes * 60_000.0) as i64)
            }
            None => false,
        }
    }

    pub fn add_position(&self, strategy: &str) {
        *self
            .inner
            .lock()
            .open_positions
            .entry(strategy.to_string())
            .or_insert(0) += 1;
    }

    pub fn remove_position(&self, strategy: &str) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.open_positions.get_mut(strategy) {
            *count = (*count - 1).max(0);
        }
    }

    pub fn set_position_count(&self, strategy: &str, count: i64) {
        self.inner
            .lock()
            .open_positions
            .insert(strategy.to_string(), count);
    }

    pub fn position_count(&self, strategy: &str) -> i64 {
        *self
            .inner
            .lock()
            .open_positions
            .get(strategy)
            .unwrap_or(&0)
    }

    pub fn increment_stat(&self, key: &'static str) {
        *self.inner.lock().stats.entry(key).or_insert(0) += 1;
    }

    pub fn stats(&self) -> HashMap<&'static str, u64> {
        self.inner.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_round_trip() {
        let state = StreamingState::new();
        assert!(!state.in_cooldown("s", 1, 60.0));
        state.set_cooldown("s", 1);
        assert!(state.in_cooldown("s", 1, 60.0));
        // Zero-length cooldown expires immediately.
        assert!(!state.in_cooldown("s", 1, 0.0));
        // Other markets unaffected.
        assert!(!state.in_cooldown("s", 2, 60.0));
    }

    #[test]
    fn position_counter_floors_at_zero() {
        let state = StreamingState::new();
        state.add_position("s");
        state.add_position("s");
        assert_eq!(state.position_count("s"), 2);
        state.remove_position("s");
        state.remove_position("s");
        state.remove_position("s");
        assert_eq!(state.position_count("s"), 0);
    }

    #[test]
    fn stats_accumulate() {
        let state = StreamingState::new();
        state.increment_stat("signals_emitted");
        state.increment_stat("signals_emitted");
        assert_eq!(state.stats()["signals_emitted"], 2);
    }
}
