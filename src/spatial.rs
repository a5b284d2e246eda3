use std::collections::btree_set;
use std::collections::{BTreeSet, HashMap};

use glam::DVec2;
use thiserror::Error;

use crate::host::EntityId;

/// Default cell edge. Roughly the query radius add-ons use for "nearby" checks.
pub const DEFAULT_CELL_SIZE: f64 = 16.0;

/// Distance slack for radius checks; a radius of 0 matches points within this of the center.
pub const QUERY_EPSILON: f64 = 1e-9;

pub type CellKey = (i32, i32);

#[derive(Debug, Error, PartialEq)]
pub enum SpatialError {
    #[error("entity {0} is already in the spatial index")]
    DuplicateId(EntityId),
    #[error("entity {0} is not in the spatial index")]
    UnknownId(EntityId),
    #[error("cell size must be finite and positive, got {0}")]
    InvalidCellSize(f64),
    #[error("position ({x}, {y}) for entity {id} is not finite")]
    NonFinitePosition { id: EntityId, x: f64, y: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialPoint {
    pub id: EntityId,
    pub cell: CellKey,
    pub position: DVec2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpatialMetrics {
    pub points: usize,
    pub occupied_cells: usize,
    pub average_occupancy: f32,
    pub max_occupancy: usize,
}

/// Uniform grid over 2-D points.
///
/// Every point sits in exactly the cell `floor(position / cell_size)`. Cells hold ordered id sets and are
/// dropped when they empty, so memory follows the occupied area.
#[derive(Debug, Clone)]
pub struct SpatialIndex2D {
    cell: f64,
    cells: HashMap<CellKey, BTreeSet<EntityId>>,
    points: HashMap<EntityId, SpatialPoint>,
}

impl Default for SpatialIndex2D {
    fn default() -> Self {
        Self { cell: DEFAULT_CELL_SIZE, cells: HashMap::new(), points: HashMap::new() }
    }
}

impl SpatialIndex2D {
    pub fn new(cell_size: f64) -> Result<Self, SpatialError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(SpatialError::InvalidCellSize(cell_size));
        }
        Ok(Self { cell: cell_size, ..Self::default() })
    }

    pub fn cell_size(&self) -> f64 {
        self.cell
    }

    pub fn key(&self, p: DVec2) -> CellKey {
        ((p.x / self.cell).floor() as i32, (p.y / self.cell).floor() as i32)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.points.contains_key(&id)
    }

    pub fn point(&self, id: EntityId) -> Option<&SpatialPoint> {
        self.points.get(&id)
    }

    pub fn position(&self, id: EntityId) -> Option<DVec2> {
        self.points.get(&id).map(|point| point.position)
    }

    /// All indexed ids in ascending order.
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.points.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn insert(&mut self, id: EntityId, position: DVec2) -> Result<(), SpatialError> {
        check_finite(id, position)?;
        if self.points.contains_key(&id) {
            return Err(SpatialError::DuplicateId(id));
        }
        let cell = self.key(position);
        self.cells.entry(cell).or_default().insert(id);
        self.points.insert(id, SpatialPoint { id, cell, position });
        Ok(())
    }

    pub fn move_to(&mut self, id: EntityId, position: DVec2) -> Result<(), SpatialError> {
        check_finite(id, position)?;
        let target = self.key(position);
        let point = self.points.get_mut(&id).ok_or(SpatialError::UnknownId(id))?;
        point.position = position;
        if point.cell == target {
            return Ok(());
        }
        let previous = std::mem::replace(&mut point.cell, target);
        detach_from_cell(&mut self.cells, previous, id);
        self.cells.entry(target).or_default().insert(id);
        Ok(())
    }

    /// Inserts or moves, whichever applies.
    pub fn upsert(&mut self, id: EntityId, position: DVec2) -> Result<(), SpatialError> {
        if self.points.contains_key(&id) {
            self.move_to(id, position)
        } else {
            self.insert(id, position)
        }
    }

    /// Removes a point and returns its last position. Removing an id that was never inserted is an error.
    pub fn remove(&mut self, id: EntityId) -> Result<DVec2, SpatialError> {
        let point = self.points.remove(&id).ok_or(SpatialError::UnknownId(id))?;
        detach_from_cell(&mut self.cells, point.cell, id);
        Ok(point.position)
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.points.clear();
    }

    /// Lazily yields every id within `radius` of `center`.
    ///
    /// Cells overlapping the query square are visited row by row, ids ascending inside each cell. When the square
    /// covers more cells than are occupied, only occupied cells are visited.
    pub fn query_radius(&self, center: DVec2, radius: f64) -> RadiusQuery<'_> {
        let mut query = RadiusQuery {
            index: self,
            center,
            limit: radius + QUERY_EPSILON,
            cells: CellWalk::Done,
            current: None,
        };
        if !radius.is_finite() || radius < 0.0 || !center.is_finite() || self.points.is_empty() {
            return query;
        }
        let min = self.key(center - DVec2::splat(radius));
        let max = self.key(center + DVec2::splat(radius));
        let span = (i64::from(max.0) - i64::from(min.0) + 1) * (i64::from(max.1) - i64::from(min.1) + 1);
        query.cells = if span as u64 > self.cells.len() as u64 {
            let mut occupied: Vec<CellKey> = self
                .cells
                .keys()
                .copied()
                .filter(|(x, y)| (min.0..=max.0).contains(x) && (min.1..=max.1).contains(y))
                .collect();
            occupied.sort_unstable_by_key(|(x, y)| (*y, *x));
            CellWalk::Listed(occupied.into_iter())
        } else {
            CellWalk::Range { min, max, next: Some(min) }
        };
        query
    }

    /// Closest point within `max_radius` of `center`, searching outward ring by ring. Ties go to the lower id.
    pub fn nearest(&self, center: DVec2, max_radius: f64) -> Option<(EntityId, f64)> {
        if self.points.is_empty() || !center.is_finite() || max_radius.is_nan() || max_radius < 0.0 {
            return None;
        }
        let rings = if max_radius.is_finite() { ((max_radius / self.cell).ceil() as i64).saturating_add(1) } else { i64::MAX };
        let side = rings.saturating_mul(2).saturating_add(1);
        if side.saturating_mul(side) > (self.cells.len() as i64).saturating_mul(4) {
            return self.nearest_linear(center, max_radius);
        }

        let origin = self.key(center);
        let limit = max_radius + QUERY_EPSILON;
        let mut best: Option<(EntityId, f64)> = None;
        for ring in 0..=rings {
            for cell in ring_cells(origin, ring) {
                let Some(ids) = self.cells.get(&cell) else {
                    continue;
                };
                for id in ids {
                    let distance = self.points[id].position.distance(center);
                    if distance <= limit && is_better(best, *id, distance) {
                        best = Some((*id, distance));
                    }
                }
            }
            // Anything in later rings is at least `ring` whole cells away.
            let reach = ring as f64 * self.cell;
            if best.is_some_and(|(_, distance)| distance <= reach) || reach > limit {
                break;
            }
        }
        best
    }

    pub fn metrics(&self) -> SpatialMetrics {
        let occupied_cells = self.cells.len();
        let max_occupancy = self.cells.values().map(BTreeSet::len).max().unwrap_or(0);
        let average_occupancy =
            if occupied_cells == 0 { 0.0 } else { self.points.len() as f32 / occupied_cells as f32 };
        SpatialMetrics { points: self.points.len(), occupied_cells, average_occupancy, max_occupancy }
    }

    fn nearest_linear(&self, center: DVec2, max_radius: f64) -> Option<(EntityId, f64)> {
        let limit = max_radius + QUERY_EPSILON;
        let mut best: Option<(EntityId, f64)> = None;
        for point in self.points.values() {
            let distance = point.position.distance(center);
            if distance <= limit && is_better(best, point.id, distance) {
                best = Some((point.id, distance));
            }
        }
        best
    }
}

fn check_finite(id: EntityId, position: DVec2) -> Result<(), SpatialError> {
    if position.is_finite() {
        Ok(())
    } else {
        Err(SpatialError::NonFinitePosition { id, x: position.x, y: position.y })
    }
}

fn detach_from_cell(cells: &mut HashMap<CellKey, BTreeSet<EntityId>>, cell: CellKey, id: EntityId) {
    if let Some(ids) = cells.get_mut(&cell) {
        ids.remove(&id);
        if ids.is_empty() {
            cells.remove(&cell);
        }
    }
}

fn is_better(best: Option<(EntityId, f64)>, id: EntityId, distance: f64) -> bool {
    match best {
        None => true,
        Some((best_id, best_distance)) => distance < best_distance || (distance == best_distance && id < best_id),
    }
}

/// Cells at Chebyshev distance `ring` from `origin`, skipping coordinates outside `i32`.
fn ring_cells(origin: CellKey, ring: i64) -> impl Iterator<Item = CellKey> {
    let (ox, oy) = (i64::from(origin.0), i64::from(origin.1));
    let cells: Vec<(i64, i64)> = if ring == 0 {
        vec![(ox, oy)]
    } else {
        let mut cells = Vec::with_capacity((ring * 8) as usize);
        for x in ox - ring..=ox + ring {
            cells.push((x, oy - ring));
            cells.push((x, oy + ring));
        }
        for y in oy - ring + 1..=oy + ring - 1 {
            cells.push((ox - ring, y));
            cells.push((ox + ring, y));
        }
        cells
    };
    cells.into_iter().filter_map(|(x, y)| Some((i32::try_from(x).ok()?, i32::try_from(y).ok()?)))
}

enum CellWalk {
    Range { min: CellKey, max: CellKey, next: Option<CellKey> },
    Listed(std::vec::IntoIter<CellKey>),
    Done,
}

impl CellWalk {
    fn next_cell(&mut self) -> Option<CellKey> {
        match self {
            CellWalk::Range { min, max, next } => {
                let cell = (*next)?;
                *next = if cell.0 < max.0 {
                    Some((cell.0 + 1, cell.1))
                } else if cell.1 < max.1 {
                    Some((min.0, cell.1 + 1))
                } else {
                    None
                };
                Some(cell)
            }
            CellWalk::Listed(cells) => cells.next(),
            CellWalk::Done => None,
        }
    }
}

/// Lazy result of [`SpatialIndex2D::query_radius`]. Single pass; query again for fresh results.
pub struct RadiusQuery<'a> {
    index: &'a SpatialIndex2D,
    center: DVec2,
    limit: f64,
    cells: CellWalk,
    current: Option<btree_set::Iter<'a, EntityId>>,
}

impl Iterator for RadiusQuery<'_> {
    type Item = EntityId;

    fn next(&mut self) -> Option<EntityId> {
        let index = self.index;
        loop {
            if let Some(ids) = self.current.as_mut() {
                for id in ids.by_ref() {
                    let point = &index.points[id];
                    if point.position.distance(self.center) <= self.limit {
                        return Some(*id);
                    }
                }
                self.current = None;
            }
            let cell = self.cells.next_cell()?;
            self.current = index.cells.get(&cell).map(|ids| ids.iter());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw)
    }

    #[test]
    fn radius_query_filters_by_true_distance() {
        let mut index = SpatialIndex2D::new(5.0).expect("valid cell");
        index.insert(id(1), DVec2::new(0.0, 0.0)).expect("insert A");
        index.insert(id(2), DVec2::new(10.0, 0.0)).expect("insert B");
        index.insert(id(3), DVec2::new(3.0, 0.0)).expect("insert C");
        let found: Vec<EntityId> = index.query_radius(DVec2::ZERO, 4.0).collect();
        let mut sorted = found.clone();
        sorted.sort();
        assert_eq!(sorted, vec![id(1), id(3)]);
    }

    #[test]
    fn corner_of_bounding_square_is_excluded() {
        let mut index = SpatialIndex2D::new(1.0).expect("valid cell");
        index.insert(id(1), DVec2::new(0.9, 0.9)).expect("insert");
        assert_eq!(index.query_radius(DVec2::ZERO, 1.0).count(), 0);
    }

    #[test]
    fn zero_radius_matches_only_the_exact_point() {
        let mut index = SpatialIndex2D::new(2.0).expect("valid cell");
        let p1 = DVec2::new(1.5, -7.25);
        index.insert(id(1), p1).expect("insert");
        index.insert(id(2), p1 + DVec2::new(1e-6, 0.0)).expect("insert");
        let found: Vec<EntityId> = index.query_radius(p1, 0.0).collect();
        assert_eq!(found, vec![id(1)]);
    }

    #[test]
    fn empty_index_and_bad_radius_yield_nothing() {
        let mut index = SpatialIndex2D::default();
        assert_eq!(index.query_radius(DVec2::ZERO, 100.0).count(), 0);
        index.insert(id(1), DVec2::ZERO).expect("insert");
        assert_eq!(index.query_radius(DVec2::ZERO, -1.0).count(), 0);
        assert_eq!(index.query_radius(DVec2::ZERO, f64::NAN).count(), 0);
    }

    #[test]
    fn move_keeps_cell_invariant() {
        let mut index = SpatialIndex2D::new(4.0).expect("valid cell");
        index.insert(id(7), DVec2::new(1.0, 1.0)).expect("insert");
        index.move_to(id(7), DVec2::new(2.0, 3.0)).expect("same-cell move");
        assert_eq!(index.point(id(7)).map(|p| p.cell), Some((0, 0)));

        index.move_to(id(7), DVec2::new(-0.5, 9.0)).expect("cross-cell move");
        let point = index.point(id(7)).copied().expect("still indexed");
        assert_eq!(point.cell, (-1, 2));
        assert_eq!(point.cell, index.key(point.position));
        assert_eq!(index.metrics().occupied_cells, 1, "old cell should be dropped once empty");
        assert_eq!(index.query_radius(DVec2::new(-0.5, 9.0), 0.1).collect::<Vec<_>>(), vec![id(7)]);
        assert_eq!(index.query_radius(DVec2::new(1.0, 1.0), 1.0).count(), 0);
    }

    #[test]
    fn misuse_is_reported() {
        let mut index = SpatialIndex2D::default();
        index.insert(id(1), DVec2::ZERO).expect("insert");
        assert_eq!(index.insert(id(1), DVec2::ONE), Err(SpatialError::DuplicateId(id(1))));
        assert_eq!(index.remove(id(2)), Err(SpatialError::UnknownId(id(2))));
        assert_eq!(index.move_to(id(2), DVec2::ZERO), Err(SpatialError::UnknownId(id(2))));
        assert!(matches!(index.insert(id(3), DVec2::new(f64::NAN, 0.0)), Err(SpatialError::NonFinitePosition { .. })));
        assert_eq!(SpatialIndex2D::new(0.0).err(), Some(SpatialError::InvalidCellSize(0.0)));
        assert_eq!(index.remove(id(1)), Ok(DVec2::ZERO));
        assert!(index.is_empty());
        assert_eq!(index.metrics().occupied_cells, 0);
    }

    #[test]
    fn huge_radius_walks_only_occupied_cells() {
        let mut index = SpatialIndex2D::new(1.0).expect("valid cell");
        index.insert(id(1), DVec2::new(-1.0e6, 0.0)).expect("insert");
        index.insert(id(2), DVec2::new(1.0e6, 5.0)).expect("insert");
        let found: Vec<EntityId> = index.query_radius(DVec2::ZERO, 2.0e6).collect();
        assert_eq!(found, vec![id(1), id(2)]);
    }

    #[test]
    fn results_come_row_major_then_by_id() {
        let mut index = SpatialIndex2D::new(1.0).expect("valid cell");
        index.insert(id(5), DVec2::new(0.5, 1.5)).expect("insert");
        index.insert(id(4), DVec2::new(1.5, 0.5)).expect("insert");
        index.insert(id(3), DVec2::new(0.5, 0.5)).expect("insert");
        index.insert(id(2), DVec2::new(0.6, 0.6)).expect("insert");
        let found: Vec<EntityId> = index.query_radius(DVec2::new(1.0, 1.0), 1.0).collect();
        assert_eq!(found, vec![id(2), id(3), id(4), id(5)]);
    }

    #[test]
    fn nearest_finds_closest_across_rings() {
        let mut index = SpatialIndex2D::new(2.0).expect("valid cell");
        index.insert(id(1), DVec2::new(7.0, 0.0)).expect("insert");
        index.insert(id(2), DVec2::new(-5.0, 0.5)).expect("insert");
        index.insert(id(3), DVec2::new(0.0, 6.0)).expect("insert");
        let (nearest, distance) = index.nearest(DVec2::new(0.1, 0.1), 50.0).expect("something in range");
        assert_eq!(nearest, id(2));
        assert!((distance - DVec2::new(-5.0, 0.5).distance(DVec2::new(0.1, 0.1))).abs() < 1e-12);
        assert_eq!(index.nearest(DVec2::new(0.1, 0.1), 3.0), None);
    }

    #[test]
    fn ring_and_grid_searches_match_brute_force() {
        let mut index = SpatialIndex2D::new(3.0).expect("valid cell");
        let mut raw = 1u64;
        for gx in -6..6 {
            for gy in -6..6 {
                let position = DVec2::new(gx as f64 * 2.3 + (gy as f64) * 0.17, gy as f64 * 1.9 - (gx as f64) * 0.11);
                index.insert(id(raw), position).expect("insert");
                raw += 1;
            }
        }
        for point in [DVec2::new(0.2, 0.3), DVec2::new(-9.0, 4.4), DVec2::new(13.0, -13.0)] {
            let ring = index.nearest(point, 8.0);
            let linear = index.nearest_linear(point, 8.0);
            assert_eq!(ring, linear, "point {point:?}");

            let mut grid: Vec<EntityId> = index.query_radius(point, 4.0).collect();
            grid.sort();
            let brute: Vec<EntityId> = index
                .ids()
                .into_iter()
                .filter(|candidate| index.position(*candidate).is_some_and(|p| p.distance(point) <= 4.0))
                .collect();
            assert_eq!(grid, brute, "point {point:?}");
        }
    }
}
