//! Geographic calculations

use crate::types::Location;

/// Earth radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Distance units per kilometer
const UNITS_PER_KM: f64 = 1000.0;

/// Great-circle distance between two points in kilometers
pub fn haversine_km(from: &Location, to: &Location) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (to.longitude - from.longitude).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);

    EARTH_RADIUS_KM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Haversine distance in solver units (km x 1000), rounded to 3 decimals then truncated.
pub fn scaled_distance(from: &Location, to: &Location) -> i64 {
    let units = haversine_km(from, to) * UNITS_PER_KM;
    round_to(units, 3).trunc() as i64
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Square matrix of scaled distances between every pair of locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceMatrix {
    /// Distance in solver units [i][j] from location i to location j
    pub distances: Vec<Vec<i64>>,
    pub size: usize,
}

impl DistanceMatrix {
    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            distances: vec![],
            size: 0,
        }
    }

    pub fn distance(&self, from: usize, to: usize) -> i64 {
        self.distances[from][to]
    }
}

/// Build the scaled distance matrix for `locations`; index order is preserved.
pub fn distance_matrix(locations: &[Location]) -> DistanceMatrix {
    let distances = locations
        .iter()
        .map(|from| locations.iter().map(|to| scaled_distance(from, to)).collect())
        .collect();

    DistanceMatrix {
        distances,
        size: locations.len(),
    }
}
