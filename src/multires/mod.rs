//! Multiresolution texture model: settings, the tile quadtree and the
//! geometry helpers that decide which tiles a view needs

pub mod texture_settings;
pub mod tree;
pub mod geometry;

pub use texture_settings::{DeviceCaps, FilterConfig, FilterSettings, TextureSettings};
pub use tree::{Level, LoadState, MultiresTree, Tile, TileId};
pub use geometry::{create_visibility_helper, GeometryKind, ResolutionSampler, VisibilityHelper};
