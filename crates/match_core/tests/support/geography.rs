use match_core::geo::Coordinate;
use match_core::test_helpers::{offset_km, TEST_ORIGIN};

/// Pickup point shared by most scenarios.
pub fn pickup() -> Coordinate {
    TEST_ORIGIN
}

/// A point `km` due north of the pickup.
pub fn north_of_pickup(km: f64) -> Coordinate {
    offset_km(TEST_ORIGIN, km, 0.0)
}

/// A point `km` due east of the pickup.
pub fn east_of_pickup(km: f64) -> Coordinate {
    offset_km(TEST_ORIGIN, 0.0, km)
}

/// `n` points on a small grid around the pickup, all within 2 km.
pub fn cluster(n: usize) -> Vec<Coordinate> {
    (0..n)
        .map(|i| {
            let row = (i / 5) as f64;
            let col = (i % 5) as f64;
            offset_km(TEST_ORIGIN, 0.2 * row - 0.4, 0.2 * col - 0.4)
        })
        .collect()
}
