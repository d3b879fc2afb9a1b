//! H3-bucketed index of online driver positions.
//!
//! - **GeoIndex**: wrapper for the H3 resolution used for bucketing
//! - **SpatialIndex**: cell → drivers buckets plus a reverse map for O(1) moves
//!
//! Default resolution is 9 (~175m edge), suitable for city-scale dispatch.
//! Cell membership is only a coarse filter; every radius query is finished with
//! an exact distance check on the stored coordinates.

use std::collections::HashMap;

use h3o::{CellIndex, Resolution};

use crate::geo::{haversine_km, DistanceMetric, GeoPoint};
use crate::registry::DriverId;

/// Disks larger than this are slower than scanning the reverse map.
const MAX_DISK_K: u32 = 100;

/// Relative slack on the covered radius. Planar distances on raw degrees are
/// never shorter than haversine ones, up to curvature, which this absorbs.
const COVER_SLACK: f64 = 1.01;

#[derive(Debug, Clone, Copy)]
pub struct GeoIndex {
    resolution: Resolution,
}

impl GeoIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn cell_for(&self, point: GeoPoint) -> Option<CellIndex> {
        point.to_cell(self.resolution)
    }

    /// First guess at the ring count covering `radius_km`, from the average
    /// edge length. Cells shrink and skew away from face centres, so callers
    /// must confirm coverage with [`GeoIndex::covering_disk`].
    pub fn k_for_radius(&self, radius_km: f64) -> u32 {
        let spacing = self.resolution.edge_length_km() * 1.5;
        let rings = (radius_km.max(0.0) / spacing).ceil();
        if rings >= f64::from(MAX_DISK_K) {
            MAX_DISK_K + 1
        } else {
            rings as u32 + 1
        }
    }

    /// Cells of the smallest disk around `origin` that holds every point within
    /// `radius_km` of `center`, or `None` when that disk would exceed
    /// `max_cells` cells or [`MAX_DISK_K`] rings.
    ///
    /// A point outside the k-disk is reached from `center` only by crossing a
    /// cell at grid distance exactly k, so the disk covers the radius once every
    /// such cell lies wholly beyond it.
    pub fn covering_disk(
        &self,
        origin: CellIndex,
        center: GeoPoint,
        radius_km: f64,
        max_cells: u64,
    ) -> Option<Vec<CellIndex>> {
        debug_assert_eq!(
            origin.resolution(),
            self.resolution,
            "origin resolution must match GeoIndex resolution"
        );
        let reach = radius_km.max(0.0) * COVER_SLACK;
        let mut k = self.k_for_radius(radius_km);
        while k <= MAX_DISK_K && disk_cell_count(k) <= max_cells {
            let disk: Vec<(CellIndex, u32)> = origin.grid_disk_distances(k);
            let covered = disk
                .iter()
                .filter(|(_, ring)| *ring == k)
                .all(|(cell, _)| clearance_km(center, *cell) > reach);
            if covered {
                return Some(disk.into_iter().map(|(cell, _)| cell).collect());
            }
            k += 1;
        }
        None
    }
}

/// Shortest distance from `center` to any point of `cell`, bounded below by
/// the distance to the cell centre less the farthest vertex.
fn clearance_km(center: GeoPoint, cell: CellIndex) -> f64 {
    let cell_center = GeoPoint::from(cell);
    let circumradius = cell
        .boundary()
        .iter()
        .map(|vertex| haversine_km(cell_center, GeoPoint::from(*vertex)))
        .fold(0.0, f64::max);
    haversine_km(center, cell_center) - circumradius
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self {
            resolution: Resolution::Nine,
        }
    }
}

fn disk_cell_count(k: u32) -> u64 {
    let k = u64::from(k);
    3 * k * (k + 1) + 1
}

/// Driver positions bucketed by H3 cell.
///
/// Holds only drivers that are online; the registry inserts and removes them as
/// they change availability or move.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    geo: GeoIndex,
    /// Map from H3 cell to drivers in that cell
    drivers_by_cell: HashMap<CellIndex, Vec<DriverId>>,
    /// Reverse mapping: driver → current cell and exact position
    driver_to_cell: HashMap<DriverId, (CellIndex, GeoPoint)>,
}

impl SpatialIndex {
    pub fn new(geo: GeoIndex) -> Self {
        Self {
            geo,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.driver_to_cell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.driver_to_cell.is_empty()
    }

    pub fn position(&self, driver_id: &DriverId) -> Option<GeoPoint> {
        self.driver_to_cell.get(driver_id).map(|(_, pos)| *pos)
    }

    /// Insert or move a driver. Returns false if the point has no H3 cell.
    pub fn upsert(&mut self, driver_id: &DriverId, position: GeoPoint) -> bool {
        let Some(new_cell) = self.geo.cell_for(position) else {
            return false;
        };
        match self.driver_to_cell.get_mut(driver_id) {
            Some((old_cell, old_pos)) if *old_cell == new_cell => {
                *old_pos = position;
            }
            Some((old_cell, _)) => {
                let old_cell = *old_cell;
                Self::detach(&mut self.drivers_by_cell, old_cell, driver_id);
                self.drivers_by_cell
                    .entry(new_cell)
                    .or_default()
                    .push(driver_id.clone());
                self.driver_to_cell
                    .insert(driver_id.clone(), (new_cell, position));
            }
            None => {
                self.drivers_by_cell
                    .entry(new_cell)
                    .or_default()
                    .push(driver_id.clone());
                self.driver_to_cell
                    .insert(driver_id.clone(), (new_cell, position));
            }
        }
        true
    }

    pub fn remove(&mut self, driver_id: &DriverId) -> bool {
        match self.driver_to_cell.remove(driver_id) {
            Some((cell, _)) => {
                Self::detach(&mut self.drivers_by_cell, cell, driver_id);
                true
            }
            None => false,
        }
    }

    fn detach(
        buckets: &mut HashMap<CellIndex, Vec<DriverId>>,
        cell: CellIndex,
        driver_id: &DriverId,
    ) {
        if let Some(drivers) = buckets.get_mut(&cell) {
            drivers.retain(|d| d != driver_id);
            if drivers.is_empty() {
                buckets.remove(&cell);
            }
        }
    }

    /// Drivers within `radius_km` of `center`, nearest first.
    pub fn within(
        &self,
        center: GeoPoint,
        radius_km: f64,
        metric: DistanceMetric,
    ) -> Vec<(DriverId, f64, GeoPoint)> {
        let disk = self.geo.cell_for(center).and_then(|origin| {
            self.geo
                .covering_disk(origin, center, radius_km, self.driver_to_cell.len() as u64)
        });

        let mut hits: Vec<(DriverId, f64, GeoPoint)> = match disk {
            Some(cells) => {
                cells
                    .iter()
                    .filter_map(|cell| self.drivers_by_cell.get(cell))
                    .flatten()
                    .filter_map(|id| {
                        let (_, pos) = self.driver_to_cell.get(id)?;
                        Some((id.clone(), metric.distance_km(center, *pos), *pos))
                    })
                    .filter(|(_, d, _)| *d <= radius_km)
                    .collect()
            }
            None => self
                .driver_to_cell
                .iter()
                .map(|(id, (_, pos))| (id.clone(), metric.distance_km(center, *pos), *pos))
                .filter(|(_, d, _)| *d <= radius_km)
                .collect(),
        };

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits
    }
}
