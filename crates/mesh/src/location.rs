//! Location sources
//!
//! The mesh only consumes a resolved [`Location`]; how a fix is obtained
//! (GPS, manual entry, a mocked value) stays behind [`LocationProvider`].

use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::packet::Location;

/// Default maximum age of a cached fix.
pub const DEFAULT_MAX_FIX_AGE: Duration = Duration::from_secs(300);

/// Default worst acceptable accuracy, in metres.
pub const DEFAULT_MIN_ACCURACY_M: f64 = 100.0;

/// Supplies the device's current position.
pub trait LocationProvider: Send + Sync {
    /// Current position, if one is known.
    fn current(&self) -> Option<Location>;
}

/// Fixed position, for manual entry or tests.
#[derive(Debug, Clone)]
pub struct StaticLocation(Location);

impl StaticLocation {
    /// Always report `location`.
    pub fn new(location: Location) -> Self {
        Self(location)
    }
}

impl LocationProvider for StaticLocation {
    fn current(&self) -> Option<Location> {
        Some(self.0.clone())
    }
}

/// Last fix pushed by an external source, served while fresh and accurate
/// enough.
#[derive(Debug)]
pub struct CachedLocation {
    fix: RwLock<Option<(Location, Instant)>>,
    max_age: Duration,
    min_accuracy_m: f64,
}

impl Default for CachedLocation {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FIX_AGE, DEFAULT_MIN_ACCURACY_M)
    }
}

impl CachedLocation {
    /// Serve fixes younger than `max_age` with accuracy within
    /// `min_accuracy_m` metres.
    pub fn new(max_age: Duration, min_accuracy_m: f64) -> Self {
        Self {
            fix: RwLock::new(None),
            max_age,
            min_accuracy_m,
        }
    }

    /// Store a new fix. Fixes less accurate than the threshold are ignored;
    /// a fix without an accuracy estimate is accepted.
    pub fn update(&self, location: Location) -> bool {
        if location
            .accuracy
            .is_some_and(|accuracy| accuracy > self.min_accuracy_m)
        {
            debug!(accuracy = ?location.accuracy, "ignoring imprecise location fix");
            return false;
        }
        match self.fix.write() {
            Ok(mut fix) => {
                *fix = Some((location, Instant::now()));
                true
            }
            Err(_) => false,
        }
    }
}

impl LocationProvider for CachedLocation {
    fn current(&self) -> Option<Location> {
        let fix = self.fix.read().ok()?;
        let (location, taken) = fix.as_ref()?;
        if taken.elapsed() > self.max_age {
            return None;
        }
        Some(location.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_location() {
        let provider = StaticLocation::new(Location::new(37.77, -122.41).unwrap());
        assert_eq!(provider.current().unwrap().latitude, 37.77);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_fix_expires() {
        let provider = CachedLocation::default();
        assert!(provider.current().is_none());

        assert!(provider.update(Location::new(1.0, 2.0).unwrap().with_accuracy(12.0)));
        assert!(provider.current().is_some());

        tokio::time::advance(DEFAULT_MAX_FIX_AGE + Duration::from_secs(1)).await;
        assert!(provider.current().is_none());
    }

    #[test]
    fn test_imprecise_fix_ignored() {
        let provider = CachedLocation::default();
        assert!(!provider.update(Location::new(1.0, 2.0).unwrap().with_accuracy(500.0)));
        assert!(provider.current().is_none());
    }
}
