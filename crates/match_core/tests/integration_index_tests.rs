use std::collections::HashSet;

use h3o::Resolution;
use proptest::prelude::*;

use match_core::geo::Coordinate;
use match_core::spatial::{GeoIndex, UpsertOutcome};
use match_core::test_helpers::{offset_km, TEST_ORIGIN};
use match_core::types::DriverId;

fn position_update() -> impl Strategy<Value = (u64, f64, f64)> {
    (0u64..50, -3.0f64..3.0, -3.0f64..3.0)
}

proptest! {
    #[test]
    fn stale_updates_never_move_a_driver(updates in prop::collection::vec(position_update(), 1..40)) {
        let mut index = GeoIndex::new(Resolution::Nine);
        let driver = DriverId(7);
        let mut newest: Option<(u64, Coordinate)> = None;

        for (timestamp, north, east) in updates {
            let position = offset_km(TEST_ORIGIN, north, east);
            let outcome = index.upsert(driver, position, timestamp).expect("valid coordinate");
            match newest {
                Some((seen, _)) if timestamp <= seen => {
                    prop_assert_eq!(outcome, UpsertOutcome::Stale);
                }
                _ => {
                    prop_assert_ne!(outcome, UpsertOutcome::Stale);
                    newest = Some((timestamp, position));
                }
            }
        }

        let (timestamp, position) = newest.expect("at least one update");
        let stored = index.position(driver).expect("indexed");
        prop_assert_eq!(stored.updated_at, timestamp);
        prop_assert_eq!(stored.coordinate, position);
        prop_assert_eq!(index.len(), 1);
    }

    #[test]
    fn nearest_query_is_sorted_and_within_radius(
        offsets in prop::collection::vec((-4.0f64..4.0, -4.0f64..4.0), 1..60),
        radius_km in 0.5f64..5.0,
    ) {
        let mut index = GeoIndex::new(Resolution::Nine);
        for (i, (north, east)) in offsets.iter().enumerate() {
            index
                .upsert(DriverId(i as u64), offset_km(TEST_ORIGIN, *north, *east), 1)
                .expect("valid coordinate");
        }

        let found: Vec<_> = index
            .query_nearest(TEST_ORIGIN, radius_km, usize::MAX, &HashSet::new())
            .expect("query")
            .collect();

        for pair in found.windows(2) {
            prop_assert!(pair[0].distance_km <= pair[1].distance_km);
        }
        for candidate in &found {
            prop_assert!(candidate.distance_km <= radius_km);
        }
        let expected = offsets
            .iter()
            .filter(|(north, east)| {
                TEST_ORIGIN.distance_km(&offset_km(TEST_ORIGIN, *north, *east)) <= radius_km
            })
            .count();
        prop_assert_eq!(found.len(), expected);
    }
}

#[test]
fn excluded_drivers_are_left_out_of_results() {
    let mut index = GeoIndex::new(Resolution::Nine);
    index
        .upsert(DriverId(1), offset_km(TEST_ORIGIN, 0.5, 0.0), 1)
        .expect("d1");
    index
        .upsert(DriverId(2), offset_km(TEST_ORIGIN, 1.0, 0.0), 1)
        .expect("d2");

    let exclude: HashSet<_> = [DriverId(1)].into_iter().collect();
    let found: Vec<_> = index
        .query_nearest(TEST_ORIGIN, 5.0, 10, &exclude)
        .expect("query")
        .map(|c| c.driver_id)
        .collect();
    assert_eq!(found, vec![DriverId(2)]);
}
