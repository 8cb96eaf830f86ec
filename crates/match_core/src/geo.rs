//! Coordinates and great-circle distance.

use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};

use crate::error::{MatchError, Result};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(MatchError::Invalid(format!(
                "coordinate ({}, {}) is not finite",
                self.lat, self.lng
            )));
        }
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lng) {
            return Err(MatchError::Invalid(format!(
                "coordinate ({}, {}) is out of range",
                self.lat, self.lng
            )));
        }
        Ok(())
    }

    /// H3 cell containing this coordinate.
    pub fn to_cell(&self, resolution: Resolution) -> Result<CellIndex> {
        self.validate()?;
        let latlng = LatLng::new(self.lat, self.lng)
            .map_err(|err| MatchError::Invalid(format!("coordinate rejected by h3: {err}")))?;
        Ok(latlng.to_cell(resolution))
    }

    /// Haversine distance in kilometres.
    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        let (lat1, lon1) = (self.lat.to_radians(), self.lng.to_radians());
        let (lat2, lon2) = (other.lat.to_radians(), other.lng.to_radians());
        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let sin_dlat = (dlat * 0.5).sin();
        let sin_dlon = (dlon * 0.5).sin();
        let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
        let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
        EARTH_RADIUS_KM * c
    }
}
