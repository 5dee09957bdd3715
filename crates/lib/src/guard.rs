//! Request gating: duplicate-delivery cache and the process-wide single-flight slot.
//!
//! Neither can fail; they only decide whether an update is processed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// How long a seen update blocks a repeat delivery.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(120);

/// Composite identity of a delivered update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub update_id: Option<i64>,
    pub chat_id: i64,
    pub message_id: Option<i64>,
}

/// Recently seen updates, each retained for at most `window`.
pub struct DedupCache {
    window: Duration,
    seen: Mutex<HashMap<DedupKey, Instant>>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Sweep expired entries, then record `key` unless it is still within the window.
    /// Returns true when the key is new (the update should be processed).
    pub async fn check_and_record(&self, key: DedupKey, now: Instant) -> bool {
        let mut seen = self.seen.lock().await;
        let window = self.window;
        seen.retain(|_, at| now.saturating_duration_since(*at) < window);
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }

    /// Insert an entry with an explicit timestamp (no sweep).
    pub async fn seed(&self, key: DedupKey, at: Instant) {
        self.seen.lock().await.insert(key, at);
    }

    pub async fn contains(&self, key: &DedupKey) -> bool {
        self.seen.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Single-occupancy slot: at most one update is processed at a time.
#[derive(Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot, or `None` if it is held. A failed attempt leaves the slot untouched.
    pub fn try_acquire(&self) -> Option<FlightPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightPermit { flight: self })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held slot; releases on drop, whatever path the holder leaves by.
pub struct FlightPermit<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
    }
}
