//! Seeded synthetic city: driver start positions and rider arrivals.

use match_core::geo::Coordinate;
use match_core::types::{DriverId, RequestPriority};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Default bounding box: Berlin, Germany (approx).
const DEFAULT_LAT_MIN: f64 = 52.34;
const DEFAULT_LAT_MAX: f64 = 52.68;
const DEFAULT_LNG_MIN: f64 = 13.08;
const DEFAULT_LNG_MAX: f64 = 13.76;

/// Default time window for rider requests: 1 hour (simulation ms).
const DEFAULT_REQUEST_WINDOW_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct ScenarioParams {
    pub num_drivers: usize,
    pub num_requests: usize,
    pub seed: u64,
    /// Arrivals are spread uniformly over this window.
    pub request_window_ms: u64,
    /// Share of requests submitted with high priority.
    pub high_priority_share: f64,
    /// Share of riders who cancel if still waiting after their patience runs out.
    pub cancel_share: f64,
    pub lat_min: f64,
    pub lat_max: f64,
    pub lng_min: f64,
    pub lng_max: f64,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            num_drivers: 200,
            num_requests: 1_000,
            seed: 42,
            request_window_ms: DEFAULT_REQUEST_WINDOW_MS,
            high_priority_share: 0.05,
            cancel_share: 0.1,
            lat_min: DEFAULT_LAT_MIN,
            lat_max: DEFAULT_LAT_MAX,
            lng_min: DEFAULT_LNG_MIN,
            lng_max: DEFAULT_LNG_MAX,
        }
    }
}

impl ScenarioParams {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_request_window_ms(mut self, window_ms: u64) -> Self {
        self.request_window_ms = window_ms;
        self
    }

    pub fn with_cancel_share(mut self, share: f64) -> Self {
        self.cancel_share = share.clamp(0.0, 1.0);
        self
    }

    pub fn with_high_priority_share(mut self, share: f64) -> Self {
        self.high_priority_share = share.clamp(0.0, 1.0);
        self
    }
}

/// One rider submission, `at_ms` after the simulation start.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub at_ms: u64,
    pub rider: String,
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
    pub priority: RequestPriority,
    /// Rider gives up this long after submitting, if not matched by then.
    pub patience_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub drivers: Vec<(DriverId, Coordinate)>,
    /// Ordered by `at_ms`.
    pub arrivals: Vec<Arrival>,
}

fn random_coordinate<R: Rng>(rng: &mut R, params: &ScenarioParams) -> Coordinate {
    let lat = rng.gen_range(params.lat_min..=params.lat_max);
    let lng = rng.gen_range(params.lng_min..=params.lng_max);
    Coordinate::new(lat, lng)
}

pub fn build_scenario(params: &ScenarioParams) -> Scenario {
    let mut rng = StdRng::seed_from_u64(params.seed);

    let drivers = (0..params.num_drivers)
        .map(|i| (DriverId(i as u64 + 1), random_coordinate(&mut rng, params)))
        .collect();

    let mut arrivals: Vec<Arrival> = (0..params.num_requests)
        .map(|i| {
            let at_ms = rng.gen_range(0..=params.request_window_ms);
            let pickup = random_coordinate(&mut rng, params);
            let dropoff = random_coordinate(&mut rng, params);
            let priority = if rng.gen_bool(params.high_priority_share) {
                RequestPriority::High
            } else {
                RequestPriority::Normal
            };
            let patience_ms = rng
                .gen_bool(params.cancel_share)
                .then(|| rng.gen_range(30_000..=300_000));
            Arrival {
                at_ms,
                rider: format!("rider-{i}"),
                pickup,
                dropoff,
                priority,
                patience_ms,
            }
        })
        .collect();
    arrivals.sort_by_key(|a| a.at_ms);

    Scenario { drivers, arrivals }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_builds_the_same_city() {
        let params = ScenarioParams {
            num_drivers: 20,
            num_requests: 50,
            ..Default::default()
        }
        .with_seed(7);
        let a = build_scenario(&params);
        let b = build_scenario(&params);
        assert_eq!(a.drivers, b.drivers);
        assert_eq!(a.arrivals, b.arrivals);
    }

    #[test]
    fn arrivals_are_ordered_and_inside_the_box() {
        let params = ScenarioParams {
            num_drivers: 5,
            num_requests: 200,
            ..Default::default()
        };
        let scenario = build_scenario(&params);
        assert!(scenario.arrivals.windows(2).all(|w| w[0].at_ms <= w[1].at_ms));
        for arrival in &scenario.arrivals {
            assert!((params.lat_min..=params.lat_max).contains(&arrival.pickup.lat));
            assert!((params.lng_min..=params.lng_max).contains(&arrival.pickup.lng));
            assert!(arrival.at_ms <= params.request_window_ms);
        }
    }
}
