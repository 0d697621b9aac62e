//! Tile addressing schemes
//!
//! Turns a tile identity into one URL per data layer. The internal grid is
//! bottom-up while every supported convention is top-down, so all schemes
//! flip the row index (`num_tiles.y - 1 - y`).

use std::str::FromStr;

use crate::core::error::Error;
use crate::core::types::{Result, UVec2, Vec2};
use crate::math::morton::encode_morton_2d;
use crate::multires::tree::{MultiresTree, TileId};

/// URL scheme used to address tiles
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexType {
    /// Single integer image id per tile: level offset plus Z-order index
    #[default]
    MortonSum,
    /// `level/x/y.suffix` tile server layout
    SlippyMap,
    /// IIIF Image API region/size request
    Iiif,
}

impl FromStr for IndexType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MORTON_SUM" => Ok(Self::MortonSum),
            "SLIPPY_MAP" => Ok(Self::SlippyMap),
            "IIIF" => Ok(Self::Iiif),
            other => Err(Error::UnknownIndexType(other.to_string())),
        }
    }
}

/// Image id of a tile under the Morton-sum scheme.
///
/// Ids are 1-based and count every tile of every coarser level first:
/// `sum(4^l for l < level) + morton(x, y_top_down) + 1`.
pub fn morton_image_id(id: TileId, num_tiles_y: u32) -> u64 {
    let level_offset: u64 = (0..id.level).map(|l| 4u64.pow(l)).sum();
    let y_top_down = num_tiles_y - 1 - id.y;
    level_offset + encode_morton_2d(id.x, y_top_down) as u64 + 1
}

/// Resolves tile identities to per-layer URLs
#[derive(Clone, Debug)]
pub struct TileAddressing {
    index_type: IndexType,
    /// Base URL of every data layer, in layer order
    urls: Vec<String>,
    prefix: Option<String>,
    suffix: String,
    /// Finest-level resolution, for IIIF regions
    resolution: Vec2,
    /// Output tile size, for IIIF requests
    tile_size: Vec2,
}

impl TileAddressing {
    pub fn new(
        index_type: IndexType,
        urls: Vec<String>,
        prefix: Option<String>,
        suffix: impl Into<String>,
        tree: &MultiresTree,
    ) -> Self {
        Self {
            index_type,
            urls,
            prefix,
            suffix: suffix.into(),
            resolution: tree.resolution,
            tile_size: tree.tile_size,
        }
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    /// Number of data layers fetched per tile
    pub fn num_layers(&self) -> usize {
        self.urls.len()
    }

    /// Replace the path prefix applied to every URL
    pub fn set_prefix(&mut self, prefix: Option<String>) {
        self.prefix = prefix;
    }

    /// URLs of every data layer for `id` on a level of `num_tiles` tiles
    pub fn urls(&self, id: TileId, num_tiles: UVec2) -> Vec<String> {
        let y_top_down = num_tiles.y - 1 - id.y;

        let mut urls: Vec<String> = match self.index_type {
            IndexType::MortonSum => {
                let image_id = morton_image_id(id, num_tiles.y);
                self.urls
                    .iter()
                    .enumerate()
                    .map(|(i, base)| format!("{base}{image_id}_{}.{}", i + 1, self.suffix))
                    .collect()
            }
            IndexType::SlippyMap => self
                .urls
                .iter()
                .map(|base| format!("{base}{}/{}/{}.{}", id.level, id.x, y_top_down, self.suffix))
                .collect(),
            IndexType::Iiif => {
                let region_size = self.resolution / num_tiles.as_vec2();
                let upper_left = Vec2::new(id.x as f32, y_top_down as f32) * region_size;
                let params = format!(
                    "/{},{},{},{}/{},{}/0/default",
                    upper_left.x, upper_left.y, region_size.x, region_size.y,
                    self.tile_size.x, self.tile_size.y,
                );
                self.urls
                    .iter()
                    .map(|base| format!("{base}{params}.{}", self.suffix))
                    .collect()
            }
        };

        if let Some(prefix) = &self.prefix {
            for url in &mut urls {
                url.insert_str(0, prefix);
            }
        }

        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(levels: u32) -> MultiresTree {
        MultiresTree::with_content_limits(Vec2::new(1024.0, 1024.0), Vec2::Y, Vec2::Y, levels).unwrap()
    }

    fn addressing(index_type: IndexType, prefix: Option<&str>) -> TileAddressing {
        TileAddressing::new(
            index_type,
            vec!["tiles/".into(), "spec/".into()],
            prefix.map(String::from),
            "jpg",
            &tree(3),
        )
    }

    #[test]
    fn test_morton_image_ids() {
        assert_eq!(morton_image_id(TileId::new(0, 0, 0), 1), 1);
        // Level 1: offset 1, rows flipped
        assert_eq!(morton_image_id(TileId::new(1, 0, 0), 2), 4);
        assert_eq!(morton_image_id(TileId::new(1, 1, 1), 2), 3);
        assert_eq!(morton_image_id(TileId::new(1, 0, 1), 2), 2);
        // Level 2 starts after 1 + 4 tiles
        assert_eq!(morton_image_id(TileId::new(2, 0, 3), 4), 6);
    }

    #[test]
    fn test_morton_ids_unique_per_tree() {
        let tree = tree(4);
        let mut ids = std::collections::HashSet::new();
        for level in tree.levels() {
            for tile in level.tiles() {
                assert!(ids.insert(morton_image_id(tile.id, level.num_tiles.y)));
            }
        }
        assert_eq!(ids.len(), 1 + 4 + 16 + 64);
        assert_eq!(ids.iter().max(), Some(&85));
    }

    #[test]
    fn test_morton_urls() {
        let urls = addressing(IndexType::MortonSum, None).urls(TileId::new(0, 0, 0), UVec2::ONE);
        assert_eq!(urls, vec!["tiles/1_1.jpg", "spec/1_2.jpg"]);
    }

    #[test]
    fn test_slippy_map_urls_flip_rows() {
        let urls = addressing(IndexType::SlippyMap, None).urls(TileId::new(2, 1, 0), UVec2::splat(4));
        assert_eq!(urls, vec!["tiles/2/1/3.jpg", "spec/2/1/3.jpg"]);
    }

    #[test]
    fn test_iiif_regions() {
        let addressing = addressing(IndexType::Iiif, None);

        let root = addressing.urls(TileId::new(0, 0, 0), UVec2::ONE);
        assert_eq!(root[0], "tiles//0,0,1024,1024/256,256/0/default.jpg");

        // Bottom-left tile of level 1 is the lower half of the image
        let tile = addressing.urls(TileId::new(1, 0, 0), UVec2::splat(2));
        assert_eq!(tile[0], "tiles//0,512,512,512/256,256/0/default.jpg");

        let tile = addressing.urls(TileId::new(2, 3, 3), UVec2::splat(4));
        assert_eq!(tile[1], "spec//768,0,256,256/256,256/0/default.jpg");
    }

    #[test]
    fn test_prefix_prepended_last() {
        let urls = addressing(IndexType::SlippyMap, Some("https://cdn.example/obj/"))
            .urls(TileId::new(0, 0, 0), UVec2::ONE);
        assert_eq!(urls[0], "https://cdn.example/obj/tiles/0/0/0.jpg");
    }

    #[test]
    fn test_parse_index_type() {
        assert_eq!("IIIF".parse::<IndexType>().unwrap(), IndexType::Iiif);
        assert!(matches!("QUADKEY".parse::<IndexType>(), Err(Error::UnknownIndexType(_))));
    }
}
