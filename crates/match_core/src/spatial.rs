//! Geospatial index: H3 cell buckets of driver positions and nearest-driver queries.
//!
//! Drivers are bucketed by the H3 cell containing their last reported position.
//! A nearest query expands a grid disk around the pickup cell just wide enough
//! to cover the search radius, filters by exact haversine distance, and hands
//! back a heap-backed iterator so the caller pays only for the candidates it
//! actually consumes. When the disk would be larger than the set of occupied
//! cells the query degrades to a scan of every indexed driver.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::num::NonZeroUsize;

use h3o::{CellIndex, Resolution};
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{MatchError, Result};
use crate::geo::Coordinate;
use crate::types::DriverId;

/// Rings beyond this always fall back to a full scan.
const MAX_DISK_RINGS: u32 = 64;
const GRID_DISK_CACHE_SIZE: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedDriver {
    pub coordinate: Coordinate,
    pub cell: CellIndex,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The update carried a timestamp no newer than the stored one and was dropped.
    Stale,
}

/// Grid disks keyed by (origin, k). Disks are pure functions of their key, so
/// sharing them between concurrent readers is safe.
struct GridDiskCache {
    cache: Mutex<LruCache<(CellIndex, u32), Vec<CellIndex>>>,
}

impl GridDiskCache {
    fn new() -> Self {
        let capacity = NonZeroUsize::new(GRID_DISK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn get_or_compute(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        let mut cache = self.cache.lock();
        cache
            .get_or_insert((origin, k), || origin.grid_disk::<Vec<_>>(k))
            .clone()
    }
}

impl std::fmt::Debug for GridDiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridDiskCache").finish_non_exhaustive()
    }
}

/// Spatial index for driver positions.
#[derive(Debug)]
pub struct GeoIndex {
    resolution: Resolution,
    drivers: HashMap<DriverId, IndexedDriver>,
    drivers_by_cell: HashMap<CellIndex, Vec<DriverId>>,
    disk_cache: GridDiskCache,
}

impl GeoIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            drivers: HashMap::new(),
            drivers_by_cell: HashMap::new(),
            disk_cache: GridDiskCache::new(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn position(&self, driver: DriverId) -> Option<IndexedDriver> {
        self.drivers.get(&driver).copied()
    }

    /// Record a driver position unless a newer one is already stored.
    pub fn upsert(
        &mut self,
        driver: DriverId,
        coordinate: Coordinate,
        timestamp: u64,
    ) -> Result<UpsertOutcome> {
        let cell = coordinate.to_cell(self.resolution)?;
        let entry = IndexedDriver {
            coordinate,
            cell,
            updated_at: timestamp,
        };

        let Some(existing) = self.drivers.get(&driver).copied() else {
            self.drivers.insert(driver, entry);
            self.drivers_by_cell.entry(cell).or_default().push(driver);
            return Ok(UpsertOutcome::Inserted);
        };

        if timestamp <= existing.updated_at {
            return Ok(UpsertOutcome::Stale);
        }
        if existing.cell != cell {
            self.detach(driver, existing.cell);
            self.drivers_by_cell.entry(cell).or_default().push(driver);
        }
        self.drivers.insert(driver, entry);
        Ok(UpsertOutcome::Updated)
    }

    /// Drop a driver from the index entirely.
    pub fn remove(&mut self, driver: DriverId) -> Option<IndexedDriver> {
        let removed = self.drivers.remove(&driver)?;
        self.detach(driver, removed.cell);
        Some(removed)
    }

    fn detach(&mut self, driver: DriverId, cell: CellIndex) {
        if let Some(ids) = self.drivers_by_cell.get_mut(&cell) {
            ids.retain(|&d| d != driver);
            if ids.is_empty() {
                self.drivers_by_cell.remove(&cell);
            }
        }
    }

    /// Drivers within `radius_km` of `origin`, nearest first.
    ///
    /// Ties on distance prefer the fresher position. The returned iterator owns
    /// a snapshot; later index mutations are not visible through it.
    pub fn query_nearest(
        &self,
        origin: Coordinate,
        radius_km: f64,
        limit: usize,
        exclude: &HashSet<DriverId>,
    ) -> Result<NearestDrivers> {
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(MatchError::Invalid(format!(
                "search radius {radius_km} km is not a non-negative number"
            )));
        }
        let origin_cell = origin.to_cell(self.resolution)?;

        let mut heap = BinaryHeap::new();
        let mut consider = |driver: DriverId, entry: &IndexedDriver| {
            if exclude.contains(&driver) {
                return;
            }
            let distance_km = origin.distance_km(&entry.coordinate);
            if distance_km <= radius_km {
                heap.push(Ranked(Candidate {
                    driver_id: driver,
                    distance_km,
                    updated_at: entry.updated_at,
                }));
            }
        };

        match self.disk_rings(radius_km) {
            Some(k) => {
                for cell in self.disk_cache.get_or_compute(origin_cell, k) {
                    let Some(ids) = self.drivers_by_cell.get(&cell) else {
                        continue;
                    };
                    for driver in ids {
                        if let Some(entry) = self.drivers.get(driver) {
                            consider(*driver, entry);
                        }
                    }
                }
            }
            None => {
                for (driver, entry) in &self.drivers {
                    consider(*driver, entry);
                }
            }
        }

        Ok(NearestDrivers {
            heap,
            remaining: limit,
        })
    }

    /// Grid-disk radius covering `radius_km`, or `None` when a full scan is cheaper.
    fn disk_rings(&self, radius_km: f64) -> Option<u32> {
        let edge_km = self.resolution.edge_length_km();
        if edge_km <= 0.0 {
            return None;
        }
        let rings = (radius_km / edge_km).ceil() + 1.0;
        if rings > f64::from(MAX_DISK_RINGS) {
            return None;
        }
        let k = rings as u32;
        let disk_cells = 3 * u64::from(k) * (u64::from(k) + 1) + 1;
        if disk_cells > self.drivers_by_cell.len() as u64 {
            return None;
        }
        Some(k)
    }
}

/// One driver returned by [`GeoIndex::query_nearest`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub distance_km: f64,
    pub updated_at: u64,
}

/// Heap wrapper: "greater" means "should be proposed earlier".
#[derive(Debug)]
struct Ranked(Candidate);

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .distance_km
            .total_cmp(&self.0.distance_km)
            .then_with(|| self.0.updated_at.cmp(&other.0.updated_at))
            .then_with(|| other.0.driver_id.cmp(&self.0.driver_id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// Lazily ordered candidate sequence. Finite and not restartable.
#[derive(Debug)]
pub struct NearestDrivers {
    heap: BinaryHeap<Ranked>,
    remaining: usize,
}

impl Iterator for NearestDrivers {
    type Item = Candidate;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let Ranked(candidate) = self.heap.pop()?;
        self.remaining -= 1;
        Some(candidate)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.heap.len().min(self.remaining);
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(iter: NearestDrivers) -> Vec<u64> {
        iter.map(|c| c.driver_id.0).collect()
    }

    #[test]
    fn nearest_orders_by_distance() {
        let mut index = GeoIndex::new(Resolution::Nine);
        index
            .upsert(DriverId(1), Coordinate::new(0.0, 0.0), 1)
            .expect("upsert");
        index
            .upsert(DriverId(2), Coordinate::new(10.0, 10.0), 1)
            .expect("upsert");
        index
            .upsert(DriverId(3), Coordinate::new(3.0, 3.0), 1)
            .expect("upsert");

        let found = index
            .query_nearest(Coordinate::new(1.0, 1.0), 5_000.0, 10, &HashSet::new())
            .expect("query");
        assert_eq!(ids(found), vec![1, 3, 2]);
    }

    #[test]
    fn equal_distance_prefers_fresher_position() {
        let mut index = GeoIndex::new(Resolution::Nine);
        let spot = Coordinate::new(52.52, 13.405);
        index.upsert(DriverId(1), spot, 100).expect("upsert");
        index.upsert(DriverId(2), spot, 200).expect("upsert");

        let found = index
            .query_nearest(spot, 1.0, 10, &HashSet::new())
            .expect("query");
        assert_eq!(ids(found), vec![2, 1]);
    }

    #[test]
    fn stale_update_is_ignored() {
        let mut index = GeoIndex::new(Resolution::Nine);
        let newer = Coordinate::new(52.52, 13.405);
        let older = Coordinate::new(52.40, 13.10);
        index.upsert(DriverId(1), newer, 200).expect("upsert");

        let outcome = index.upsert(DriverId(1), older, 150).expect("upsert");
        assert_eq!(outcome, UpsertOutcome::Stale);
        assert_eq!(index.position(DriverId(1)).map(|p| p.coordinate), Some(newer));
    }

    #[test]
    fn moving_driver_changes_bucket() {
        let mut index = GeoIndex::new(Resolution::Nine);
        index
            .upsert(DriverId(1), Coordinate::new(52.52, 13.405), 1)
            .expect("upsert");
        index
            .upsert(DriverId(1), Coordinate::new(52.40, 13.10), 2)
            .expect("upsert");

        let near_old = index
            .query_nearest(Coordinate::new(52.52, 13.405), 1.0, 10, &HashSet::new())
            .expect("query");
        assert_eq!(near_old.count(), 0);
        assert_eq!(index.drivers_by_cell.len(), 1);
    }

    #[test]
    fn radius_limit_and_exclusions_apply() {
        let mut index = GeoIndex::new(Resolution::Nine);
        let origin = Coordinate::new(52.52, 13.405);
        for i in 0..20u64 {
            let offset = i as f64 * 0.001;
            index
                .upsert(DriverId(i), Coordinate::new(52.52 + offset, 13.405), 1)
                .expect("upsert");
        }
        let exclude: HashSet<_> = [DriverId(0), DriverId(1)].into_iter().collect();

        let found = ids(index.query_nearest(origin, 1.0, 3, &exclude).expect("query"));
        assert_eq!(found, vec![2, 3, 4]);

        let within = index
            .query_nearest(origin, 0.5, 100, &HashSet::new())
            .expect("query");
        assert!(within.into_iter().all(|c| c.distance_km <= 0.5));
    }

    #[test]
    fn disk_query_matches_full_scan() {
        let mut index = GeoIndex::new(Resolution::Nine);
        let origin = Coordinate::new(52.52, 13.405);
        for i in 0..400u64 {
            let lat = 52.45 + (i % 20) as f64 * 0.007;
            let lng = 13.30 + (i / 20) as f64 * 0.011;
            index
                .upsert(DriverId(i), Coordinate::new(lat, lng), i)
                .expect("upsert");
        }
        assert!(index.disk_rings(1.0).is_some(), "small radius should use the disk");

        let via_disk: Vec<_> = index
            .query_nearest(origin, 1.0, usize::MAX, &HashSet::new())
            .expect("query")
            .map(|c| c.driver_id)
            .collect();
        let mut via_scan: Vec<_> = index
            .drivers
            .iter()
            .filter(|(_, e)| origin.distance_km(&e.coordinate) <= 1.0)
            .map(|(d, _)| *d)
            .collect();
        via_scan.sort();
        let mut sorted_disk = via_disk.clone();
        sorted_disk.sort();
        assert_eq!(sorted_disk, via_scan);
    }

    #[test]
    fn snapshot_ignores_later_updates() {
        let mut index = GeoIndex::new(Resolution::Nine);
        let origin = Coordinate::new(52.52, 13.405);
        index.upsert(DriverId(1), origin, 1).expect("upsert");
        let snapshot = index
            .query_nearest(origin, 1.0, 10, &HashSet::new())
            .expect("query");
        index.remove(DriverId(1));
        assert_eq!(ids(snapshot), vec![1]);
    }

    #[test]
    fn negative_radius_is_invalid() {
        let index = GeoIndex::new(Resolution::Nine);
        let err = index
            .query_nearest(Coordinate::new(0.0, 0.0), -1.0, 1, &HashSet::new())
            .expect_err("invalid radius");
        assert!(matches!(err, MatchError::Invalid(_)));
    }
}
