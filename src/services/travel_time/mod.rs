//! Travel-time matrix and providers
//!
//! The matrix is the only source of travel-time numbers consumed by the
//! optimizer. It caches per-pair results, is populated lazily through a
//! pluggable provider, and falls back to a pessimistic haversine estimate
//! when the provider is unavailable.

mod remote;

pub use remote::{check_remote_health, RemoteRoutingClient, RemoteRoutingConfig};

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

use crate::services::geo;
use crate::types::{Coordinates, Stop};

/// Pluggable source of travel times between coordinates
#[async_trait]
pub trait TravelTimeProvider: Send + Sync {
    /// Travel minutes for each requested (from, to) pair, same order
    async fn fetch_minutes(&self, pairs: &[(Coordinates, Coordinates)]) -> Result<Vec<f64>>;

    /// Provider name for logging
    fn name(&self) -> &str;
}

/// In-process estimator: haversine distance times a detour factor at a
/// configurable average speed
pub struct HaversineProvider {
    detour_factor: f64,
    speed_kmh: f64,
}

impl Default for HaversineProvider {
    fn default() -> Self {
        Self {
            detour_factor: geo::DEFAULT_DETOUR_FACTOR,
            speed_kmh: geo::DEFAULT_SPEED_KMH,
        }
    }
}

impl HaversineProvider {
    pub fn new(detour_factor: f64, speed_kmh: f64) -> Self {
        Self {
            detour_factor,
            speed_kmh,
        }
    }
}

#[async_trait]
impl TravelTimeProvider for HaversineProvider {
    async fn fetch_minutes(&self, pairs: &[(Coordinates, Coordinates)]) -> Result<Vec<f64>> {
        Ok(pairs
            .iter()
            .map(|(from, to)| geo::travel_minutes(from, to, self.detour_factor, self.speed_kmh))
            .collect())
    }

    fn name(&self) -> &str {
        "haversine"
    }
}

/// Read-mostly cross-job cache keyed by (stop_id, stop_id). Workers consult
/// it before going to the provider; per-job matrices stay independent.
pub static SHARED_TRAVEL_CACHE: Lazy<SharedTravelCache> = Lazy::new(SharedTravelCache::default);

#[derive(Default)]
pub struct SharedTravelCache {
    minutes: RwLock<HashMap<(String, String), f64>>,
}

impl SharedTravelCache {
    pub fn get(&self, from_id: &str, to_id: &str) -> Option<f64> {
        self.minutes
            .read()
            .get(&(from_id.to_string(), to_id.to_string()))
            .copied()
    }

    pub fn insert(&self, from_id: &str, to_id: &str, minutes: f64) {
        self.minutes
            .write()
            .insert((from_id.to_string(), to_id.to_string()), minutes);
    }

    pub fn len(&self) -> usize {
        self.minutes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.minutes.read().is_empty()
    }
}

/// Sparse per-job travel-time matrix with a pessimistic fallback
pub struct TravelTimeMatrix {
    minutes: HashMap<(String, String), f64>,
    detour_factor: f64,
    speed_kmh: f64,
    /// Set when the provider failed and fallback estimates were used
    provider_warning: Option<String>,
}

impl TravelTimeMatrix {
    pub fn new(detour_factor: f64, speed_kmh: f64) -> Self {
        Self {
            minutes: HashMap::new(),
            detour_factor,
            speed_kmh,
            provider_warning: None,
        }
    }

    /// Travel minutes between two stops. Cached value when present,
    /// pessimistic haversine estimate otherwise.
    pub fn get(&self, from: &Stop, to: &Stop) -> f64 {
        if from.id == to.id {
            return 0.0;
        }
        self.minutes
            .get(&(from.id.clone(), to.id.clone()))
            .copied()
            .unwrap_or_else(|| self.estimate(from, to))
    }

    fn estimate(&self, from: &Stop, to: &Stop) -> f64 {
        geo::travel_minutes(
            &from.coordinates(),
            &to.coordinates(),
            self.detour_factor,
            self.speed_kmh,
        )
    }

    pub fn insert(&mut self, from_id: &str, to_id: &str, minutes: f64) {
        self.minutes
            .insert((from_id.to_string(), to_id.to_string()), minutes);
    }

    /// Number of cached pairs
    pub fn size(&self) -> usize {
        self.minutes.len()
    }

    /// Warning produced during prefetch, if any
    pub fn provider_warning(&self) -> Option<&str> {
        self.provider_warning.as_deref()
    }

    /// Populate the matrix for the given pairs. Provider calls are retried
    /// twice with jittered backoff; after that the matrix keeps fallback
    /// estimates and records a provider warning instead of failing.
    pub async fn prefetch(
        &mut self,
        provider: &dyn TravelTimeProvider,
        pairs: &[(&Stop, &Stop)],
    ) -> Result<()> {
        let mut missing: Vec<(Stop, Stop)> = Vec::new();
        for (from, to) in pairs {
            if from.id == to.id {
                continue;
            }
            let key = (from.id.clone(), to.id.clone());
            if self.minutes.contains_key(&key) {
                continue;
            }
            if let Some(minutes) = SHARED_TRAVEL_CACHE.get(&from.id, &to.id) {
                self.minutes.insert(key, minutes);
                continue;
            }
            missing.push(((*from).clone(), (*to).clone()));
        }

        if missing.is_empty() {
            return Ok(());
        }

        let coords: Vec<(Coordinates, Coordinates)> = missing
            .iter()
            .map(|(from, to)| (from.coordinates(), to.coordinates()))
            .collect();

        match fetch_with_retries(provider, &coords).await {
            Ok(fetched) => {
                for ((from, to), minutes) in missing.iter().zip(fetched) {
                    self.minutes
                        .insert((from.id.clone(), to.id.clone()), minutes);
                    SHARED_TRAVEL_CACHE.insert(&from.id, &to.id, minutes);
                }
                debug!(
                    pairs = missing.len(),
                    provider = provider.name(),
                    "travel matrix prefetch complete"
                );
            }
            Err(e) => {
                warn!(
                    provider = provider.name(),
                    error = %e,
                    "provider failed after retries, using fallback estimates"
                );
                for (from, to) in &missing {
                    let estimate = self.estimate(from, to);
                    self.minutes
                        .insert((from.id.clone(), to.id.clone()), estimate);
                }
                self.provider_warning = Some(format!(
                    "travel-time provider '{}' unavailable, schedule uses haversine estimates: {}",
                    provider.name(),
                    e
                ));
            }
        }

        Ok(())
    }
}

/// Two retries with jittered backoff before giving up on the provider
async fn fetch_with_retries(
    provider: &dyn TravelTimeProvider,
    pairs: &[(Coordinates, Coordinates)],
) -> Result<Vec<f64>> {
    let mut last_error = None;
    for attempt in 0..3u32 {
        if attempt > 0 {
            let base_ms = 250u64 * 2u64.pow(attempt - 1);
            let jitter_ms = rand::thread_rng().gen_range(0..base_ms / 2 + 1);
            tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
        }
        match provider.fetch_minutes(pairs).await {
            Ok(minutes) if minutes.len() == pairs.len() => return Ok(minutes),
            Ok(minutes) => {
                last_error = Some(anyhow::anyhow!(
                    "provider returned {} values for {} pairs",
                    minutes.len(),
                    pairs.len()
                ));
            }
            Err(e) => {
                debug!(attempt, error = %e, "provider fetch failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("provider fetch failed")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_stop(id: &str, lat: f64, lng: f64) -> Stop {
        Stop {
            id: id.to_string(),
            lat,
            lng,
            sequence: 0,
            boarding: 0,
            is_school: false,
        }
    }

    /// Provider that fails a configurable number of times before succeeding
    struct FlakyProvider {
        failures: AtomicU32,
    }

    #[async_trait]
    impl TravelTimeProvider for FlakyProvider {
        async fn fetch_minutes(&self, pairs: &[(Coordinates, Coordinates)]) -> Result<Vec<f64>> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                if f > 0 { Some(f - 1) } else { None }
            }).is_ok() {
                anyhow::bail!("503 service unavailable");
            }
            Ok(vec![42.0; pairs.len()])
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn test_same_stop_is_zero() {
        let matrix = TravelTimeMatrix::new(1.3, 40.0);
        let stop = make_stop("a", 40.0, -3.7);
        assert_eq!(matrix.get(&stop, &stop), 0.0);
    }

    #[test]
    fn test_get_falls_back_to_estimate_on_miss() {
        let matrix = TravelTimeMatrix::new(1.3, 40.0);
        let a = make_stop("a", 40.0, -3.7);
        let b = make_stop("b", 40.1, -3.8);
        let minutes = matrix.get(&a, &b);
        assert!(minutes > 0.0);
    }

    #[test]
    fn test_insert_overrides_estimate() {
        let mut matrix = TravelTimeMatrix::new(1.3, 40.0);
        let a = make_stop("a", 40.0, -3.7);
        let b = make_stop("b", 40.1, -3.8);
        matrix.insert("a", "b", 17.0);
        assert_eq!(matrix.get(&a, &b), 17.0);
        assert_eq!(matrix.size(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_with_haversine_provider() {
        let provider = HaversineProvider::default();
        let mut matrix = TravelTimeMatrix::new(1.3, 40.0);
        let a = make_stop("pf-a", 40.0, -3.7);
        let b = make_stop("pf-b", 40.2, -3.9);

        matrix.prefetch(&provider, &[(&a, &b), (&b, &a)]).await.unwrap();

        assert_eq!(matrix.size(), 2);
        assert!(matrix.provider_warning().is_none());
        assert!(matrix.get(&a, &b) > 0.0);
    }

    #[tokio::test]
    async fn test_provider_failing_once_then_succeeding_is_invisible() {
        let provider = FlakyProvider {
            failures: AtomicU32::new(1),
        };
        let mut matrix = TravelTimeMatrix::new(1.3, 40.0);
        let a = make_stop("retry-a", 40.0, -3.7);
        let b = make_stop("retry-b", 40.3, -3.9);

        matrix.prefetch(&provider, &[(&a, &b)]).await.unwrap();

        assert_eq!(matrix.get(&a, &b), 42.0);
        assert!(matrix.provider_warning().is_none());
    }

    #[tokio::test]
    async fn test_provider_outage_uses_fallback_and_warns() {
        let provider = FlakyProvider {
            failures: AtomicU32::new(100),
        };
        let mut matrix = TravelTimeMatrix::new(1.3, 40.0);
        let a = make_stop("out-a", 40.0, -3.7);
        let b = make_stop("out-b", 40.3, -3.9);

        matrix.prefetch(&provider, &[(&a, &b)]).await.unwrap();

        // Fallback estimate cached, warning recorded, job not failed
        assert!(matrix.get(&a, &b) > 0.0);
        assert!(matrix.provider_warning().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_shared_cache_feeds_second_matrix() {
        let provider = HaversineProvider::default();
        let a = make_stop("shared-a", 41.0, -3.0);
        let b = make_stop("shared-b", 41.2, -3.2);

        let mut first = TravelTimeMatrix::new(1.3, 40.0);
        first.prefetch(&provider, &[(&a, &b)]).await.unwrap();
        let expected = first.get(&a, &b);

        // Second matrix with a dead provider still resolves from the cache
        let dead = FlakyProvider {
            failures: AtomicU32::new(100),
        };
        let mut second = TravelTimeMatrix::new(1.3, 40.0);
        second.prefetch(&dead, &[(&a, &b)]).await.unwrap();

        assert_eq!(second.get(&a, &b), expected);
        assert!(second.provider_warning().is_none());
    }
}
