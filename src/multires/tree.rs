//! Multiresolution quadtree of texture tiles
//!
//! Levels are stored coarsest first (level 0 is a single tile); each level
//! doubles the tile count per axis and the resolution. Tiles live in a flat
//! per-level arena and refer to their parent by [`TileId`], never by pointer.

use std::fmt;

use crate::core::error::Error;
use crate::core::types::{Result, UVec2, Vec2};
use crate::math::Aabb;
use crate::multires::texture_settings::TextureSettings;

/// Deepest supported tree. The finest level then holds 2048 x 2048 tiles,
/// which still fits in memory alongside the default mesh for that depth.
pub const MAX_LEVELS: u32 = 12;

/// Identity of a tile: quadtree level and grid position (row 0 at the bottom)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    pub level: u32,
    pub x: u32,
    pub y: u32,
}

impl TileId {
    pub fn new(level: u32, x: u32, y: u32) -> Self {
        Self { level, x, y }
    }

    /// The tile covering this one on the next coarser level
    pub fn parent(&self) -> Option<TileId> {
        if self.level == 0 {
            None
        } else {
            Some(TileId::new(self.level - 1, self.x / 2, self.y / 2))
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level: {} x: {} y: {}", self.level, self.x, self.y)
    }
}

/// Load state of a tile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadState {
    /// Never requested
    #[default]
    Unrequested,
    /// Fetch dispatched, not yet settled
    Pending,
    /// Retries exhausted on at least one layer
    Failed,
    /// Every layer fetched and handed to the renderer
    Loaded,
}

impl LoadState {
    /// Loaded or failed
    pub fn is_settled(self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::Failed)
    }
}

/// One tile of a level
#[derive(Clone, Debug)]
pub struct Tile {
    pub id: TileId,
    /// Whether this tile's cell intersects the content rectangle
    pub has_content: bool,
    pub load_state: LoadState,
    /// Object-space bounds of the surface covered by this tile
    pub bounds: Aabb,
}

impl Tile {
    pub fn parent(&self) -> Option<TileId> {
        self.id.parent()
    }
}

/// One resolution layer of the quadtree
#[derive(Clone, Debug)]
pub struct Level {
    pub index: u32,
    /// Pixel resolution this level represents
    pub resolution: Vec2,
    /// Tile grid dimensions
    pub num_tiles: UVec2,
    /// Tiles indexed `x * num_tiles.y + y`
    tiles: Vec<Tile>,
    /// Settled tiles, content-less tiles included
    loaded_tiles: u32,
    /// Content-less tiles, counted as settled from construction on
    empty_tiles: u32,
}

impl Level {
    fn new(index: u32, resolution: Vec2, num_tiles: UVec2, u_limits: Vec2, v_limits: Vec2) -> Self {
        let mut tiles = Vec::with_capacity((num_tiles.x * num_tiles.y) as usize);
        let mut empty_tiles = 0;
        let step = Vec2::ONE / num_tiles.as_vec2();

        for x in 0..num_tiles.x {
            for y in 0..num_tiles.y {
                let left = x as f32 * step.x;
                let right = left + step.x;
                let lower = y as f32 * step.y;
                let upper = lower + step.y;

                let has_content = !(u_limits.x > right
                    || u_limits.y < left
                    || v_limits.x > upper
                    || v_limits.y < lower);

                let load_state = if has_content {
                    LoadState::Unrequested
                } else {
                    empty_tiles += 1;
                    LoadState::Loaded
                };

                tiles.push(Tile {
                    id: TileId::new(index, x, y),
                    has_content,
                    load_state,
                    bounds: Aabb::empty(),
                });
            }
        }

        Self {
            index,
            resolution,
            num_tiles,
            tiles,
            loaded_tiles: empty_tiles,
            empty_tiles,
        }
    }

    fn slot(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.num_tiles.x && y < self.num_tiles.y)
            .then(|| (x * self.num_tiles.y + y) as usize)
    }

    /// Tile at grid position
    pub fn tile(&self, x: u32, y: u32) -> Option<&Tile> {
        self.slot(x, y).map(|i| &self.tiles[i])
    }

    /// Mutable tile at grid position
    pub fn tile_mut(&mut self, x: u32, y: u32) -> Option<&mut Tile> {
        self.slot(x, y).map(|i| &mut self.tiles[i])
    }

    /// All tiles, column by column
    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter()
    }

    pub fn tiles_mut(&mut self) -> impl Iterator<Item = &mut Tile> {
        self.tiles.iter_mut()
    }

    /// Tiles that intersect the content area
    pub fn content_tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter().filter(|t| t.has_content)
    }

    pub fn total_tiles(&self) -> u32 {
        self.num_tiles.x * self.num_tiles.y
    }

    pub fn loaded_tiles(&self) -> u32 {
        self.loaded_tiles
    }

    /// Every tile settled (loaded, failed, or content-less)
    pub fn is_settled(&self) -> bool {
        self.loaded_tiles == self.total_tiles()
    }

    /// Count one more settled tile; returns true if that completed the level
    pub(crate) fn record_settled(&mut self) -> bool {
        debug_assert!(self.loaded_tiles < self.total_tiles());
        self.loaded_tiles = (self.loaded_tiles + 1).min(self.total_tiles());
        self.is_settled()
    }

    /// Return content tiles to `Unrequested` and the counter to its initial value
    pub(crate) fn reset(&mut self) {
        for tile in self.tiles.iter_mut().filter(|t| t.has_content) {
            tile.load_state = LoadState::Unrequested;
        }
        self.loaded_tiles = self.empty_tiles;
    }
}

/// The full tile pyramid of one RTI object
#[derive(Clone, Debug)]
pub struct MultiresTree {
    /// Resolution of the finest level
    pub resolution: Vec2,
    /// Pixel size of every tile (resolution of level 0)
    pub tile_size: Vec2,
    levels: Vec<Level>,
}

impl MultiresTree {
    /// Build `num_levels` levels for the given texture settings
    pub fn new(settings: &TextureSettings, num_levels: u32) -> Result<Self> {
        Self::with_content_limits(
            settings.resolution,
            settings.u_content_limits,
            settings.v_content_limits,
            num_levels,
        )
    }

    /// Build a tree from a resolution and explicit content limits
    pub fn with_content_limits(
        resolution: Vec2,
        u_limits: Vec2,
        v_limits: Vec2,
        num_levels: u32,
    ) -> Result<Self> {
        if num_levels == 0 || num_levels > MAX_LEVELS {
            return Err(Error::InvalidLevelCount(num_levels));
        }
        if resolution.x <= 0.0 || resolution.y <= 0.0 {
            return Err(Error::Config(format!("invalid texture resolution {resolution}")));
        }

        let tile_size = resolution / (1u32 << (num_levels - 1)) as f32;

        let mut levels = Vec::with_capacity(num_levels as usize);
        let mut level_resolution = tile_size;
        let mut num_tiles = UVec2::ONE;
        for index in 0..num_levels {
            levels.push(Level::new(index, level_resolution, num_tiles, u_limits, v_limits));
            level_resolution *= 2.0;
            num_tiles *= 2;
        }

        log::debug!(
            "MultiresTree: {} levels, resolution {}, tile size {}",
            num_levels, resolution, tile_size
        );

        Ok(Self { resolution, tile_size, levels })
    }

    pub fn num_levels(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Index of the finest level
    pub fn finest_level(&self) -> u32 {
        self.num_levels() - 1
    }

    pub fn level(&self, index: u32) -> Option<&Level> {
        self.levels.get(index as usize)
    }

    pub fn level_mut(&mut self, index: u32) -> Option<&mut Level> {
        self.levels.get_mut(index as usize)
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn tile(&self, id: TileId) -> Option<&Tile> {
        self.level(id.level)?.tile(id.x, id.y)
    }

    pub fn tile_mut(&mut self, id: TileId) -> Option<&mut Tile> {
        self.level_mut(id.level)?.tile_mut(id.x, id.y)
    }

    /// Smallest level whose resolution covers `required` on both axes,
    /// clamped to the finest level
    pub fn level_for_resolution(&self, required: Vec2) -> u32 {
        self.levels
            .iter()
            .position(|l| l.resolution.x >= required.x && l.resolution.y >= required.y)
            .map_or(self.finest_level(), |i| i as u32)
    }

    /// Every level settled
    pub fn is_fully_settled(&self) -> bool {
        self.levels.iter().all(Level::is_settled)
    }

    /// Reset every tile's state and every level's counter
    pub(crate) fn reset(&mut self) {
        for level in &mut self.levels {
            level.reset();
        }
    }
}

/// Number of levels needed so that the coarsest level fits in one tile.
///
/// Starts at one level and halves `resolution_width` while it exceeds
/// `tile_width`.
pub fn levels_for_tile_size(resolution_width: f32, tile_width: f32) -> u32 {
    let mut levels = 1;
    let mut width = resolution_width;
    while width > tile_width && tile_width > 0.0 {
        levels += 1;
        width /= 2.0;
    }
    levels
}
