//! Splitting a routing problem into independently solved partitions

use crate::types::Location;

/// A contiguous run of the sorted locations plus the vehicles assigned to it.
/// The first location acts as the partition's depot.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub locations: Vec<Location>,
    pub vehicle_share: usize,
}

/// Sort by latitude, then longitude, so each partition covers a compact area.
pub fn sort_locations(locations: &mut [Location]) {
    locations.sort_by(|a, b| {
        a.latitude
            .total_cmp(&b.latitude)
            .then(a.longitude.total_cmp(&b.longitude))
    });
}

/// One partition per vehicle, capped by the available parallelism.
pub fn partition_count(vehicles: usize, parallelism: usize) -> usize {
    vehicles.min(parallelism).max(1)
}

/// Split `sorted` into `parts` contiguous partitions of equal size. The last
/// partition takes the remainder of both locations and vehicles.
pub fn split(sorted: &[Location], vehicles: usize, parts: usize) -> Vec<Partition> {
    let parts = parts.max(1);
    let size = sorted.len() / parts;
    let share = vehicles / parts;

    (0..parts)
        .map(|i| {
            let start = i * size;
            let last = i == parts - 1;
            let end = if last { sorted.len() } else { start + size };
            Partition {
                locations: sorted[start..end].to_vec(),
                vehicle_share: if last { vehicles - i * share } else { share },
            }
        })
        .collect()
}
