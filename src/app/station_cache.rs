use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;

use crate::domain::models::StationSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimestampMs(pub i64);

pub trait Clock: Send + Sync {
    fn now(&self) -> TimestampMs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(Utc::now().timestamp_millis())
    }
}

#[derive(Debug, Clone)]
struct CachedStations {
    fetched_at: TimestampMs,
    stations: Vec<StationSummary>,
}

/// Station catalogue held for a fixed TTL. Owned by whoever serves the
/// catalogue; nothing here is global.
pub struct StationCache<C: Clock = SystemClock> {
    ttl_ms: i64,
    clock: C,
    entry: Mutex<Option<CachedStations>>,
}

impl StationCache<SystemClock> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, SystemClock)
    }
}

impl<C: Clock> StationCache<C> {
    pub fn with_clock(ttl: Duration, clock: C) -> Self {
        Self {
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            clock,
            entry: Mutex::new(None),
        }
    }

    /// Cached stations, unless the entry is missing or older than the TTL.
    pub fn get(&self) -> Option<Vec<StationSummary>> {
        let entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = entry.as_ref()?;
        let age_ms = self.clock.now().0.saturating_sub(cached.fetched_at.0);
        (age_ms < self.ttl_ms).then(|| cached.stations.clone())
    }

    pub fn store(&self, stations: Vec<StationSummary>) {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        *entry = Some(CachedStations {
            fetched_at: self.clock.now(),
            stations,
        });
    }

    pub fn invalidate(&self) {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        *entry = None;
    }
}
