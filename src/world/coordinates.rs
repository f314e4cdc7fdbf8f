use std::fmt::{Display, Formatter};

use glam::Vec2;

/// Tiles per map edge.
pub const GRID_SIZE: i32 = 64;
pub const TILE_COUNT: usize = (GRID_SIZE * GRID_SIZE) as usize;
/// Edge length of one tile in yards.
pub const TILE_SIZE: f32 = 1600.0 / 3.0;

/// A position on the map's tile grid. Coordinates outside of `[0, 64)` can be represented, but
/// every grid operation rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub x: i32,
    pub y: i32,
}

impl TileCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        (0..GRID_SIZE).contains(&self.x) && (0..GRID_SIZE).contains(&self.y)
    }

    /// Row-major index into the grid. Only meaningful for valid coordinates.
    #[inline]
    pub fn index(self) -> usize {
        (self.y * GRID_SIZE + self.x) as usize
    }

    #[inline]
    pub fn from_index(index: usize) -> Self {
        let index = index as i32;
        Self::new(index % GRID_SIZE, index / GRID_SIZE)
    }

    pub fn chebyshev_distance(self, other: TileCoord) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// All valid coordinates within `radius` (Chebyshev) of self, row by row.
    pub fn neighbourhood(self, radius: u32) -> impl Iterator<Item = TileCoord> {
        let radius = radius.min(GRID_SIZE as u32) as i32;
        let x_range = self.x.saturating_sub(radius).max(0)..=self.x.saturating_add(radius).min(GRID_SIZE - 1);
        let y_range = self.y.saturating_sub(radius).max(0)..=self.y.saturating_add(radius).min(GRID_SIZE - 1);
        y_range.flat_map(move |y| x_range.clone().map(move |x| TileCoord::new(x, y)))
    }

    /// The tile's `(min, max)` corners in map space.
    pub fn bounds(self) -> (Vec2, Vec2) {
        let min = Vec2::new(self.x as f32, self.y as f32) * TILE_SIZE;
        (min, min + Vec2::splat(TILE_SIZE))
    }

    pub fn center(self) -> Vec2 {
        let (min, max) = self.bounds();
        (min + max) * 0.5
    }
}

impl Display for TileCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Map space has its origin in the corner of tile (0, 0), x grows with the column and y with the
/// row. The result is not clamped, positions off the map yield invalid coordinates.
pub fn world_to_tile(position: Vec2) -> TileCoord {
    let tile = (position / TILE_SIZE).floor();
    TileCoord::new(tile.x as i32, tile.y as i32)
}

/// Whether any part of the tile lies within `radius` of `position`.
pub fn tile_intersects_circle(coord: TileCoord, position: Vec2, radius: f32) -> bool {
    let (min, max) = coord.bounds();
    position.clamp(min, max).distance_squared(position) <= radius * radius
}

/// Whether the tile overlaps the axis aligned rectangle spanned by `a` and `b`.
pub fn tile_intersects_rect(coord: TileCoord, a: Vec2, b: Vec2) -> bool {
    let (min, max) = coord.bounds();
    let (rect_min, rect_max) = (a.min(b), a.max(b));
    min.x < rect_max.x && max.x > rect_min.x && min.y < rect_max.y && max.y > rect_min.y
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    #[test]
    fn index_round_trip_and_bounds() {
        let coord = TileCoord::new(31, 48);
        assert!(coord.is_valid());
        assert_eq!(TileCoord::from_index(coord.index()), coord);
        assert!(!TileCoord::new(70, 70).is_valid());
        assert!(!TileCoord::new(-1, 0).is_valid());
        assert!(!TileCoord::new(0, 64).is_valid());
    }

    #[test]
    fn neighbourhood_is_clipped_to_the_grid() {
        let corner = TileCoord::new(0, 0).neighbourhood(1).collect_vec();
        assert_eq!(
            corner,
            vec![
                TileCoord::new(0, 0),
                TileCoord::new(1, 0),
                TileCoord::new(0, 1),
                TileCoord::new(1, 1)
            ]
        );
        assert_eq!(TileCoord::new(10, 10).neighbourhood(2).count(), 25);
        assert!(
            TileCoord::new(10, 10)
                .neighbourhood(2)
                .all(|coord| coord.chebyshev_distance(TileCoord::new(10, 10)) <= 2)
        );
    }

    #[test]
    fn huge_radii_cover_the_whole_grid() {
        let center = TileCoord::new(10, 10);
        assert_eq!(center.neighbourhood(u32::MAX).count(), TILE_COUNT);
        assert_eq!(center.neighbourhood(i32::MAX as u32).count(), TILE_COUNT);
        assert_eq!(center.neighbourhood(GRID_SIZE as u32).count(), TILE_COUNT);
    }

    #[test]
    fn world_positions_map_to_tiles() {
        assert_eq!(world_to_tile(Vec2::new(10.0, 10.0)), TileCoord::new(0, 0));
        assert_eq!(
            world_to_tile(TileCoord::new(32, 17).center()),
            TileCoord::new(32, 17)
        );
        assert!(!world_to_tile(Vec2::new(-1.0, 5.0)).is_valid());
    }

    #[test]
    fn intersections() {
        let coord = TileCoord::new(2, 2);
        let center = coord.center();
        assert!(tile_intersects_circle(coord, center, 1.0));
        assert!(tile_intersects_circle(
            coord,
            center + Vec2::new(TILE_SIZE, 0.0),
            TILE_SIZE * 0.6
        ));
        assert!(!tile_intersects_circle(coord, Vec2::ZERO, TILE_SIZE));

        let (min, max) = coord.bounds();
        assert!(tile_intersects_rect(coord, min - Vec2::ONE, min + Vec2::ONE));
        assert!(!tile_intersects_rect(coord, max, max + Vec2::ONE));
    }
}
