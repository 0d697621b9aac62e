//! Geometry helpers: screen-space resolution demand and tile visibility
//!
//! All helpers share a [`ResolutionSampler`] that measures a handful of
//! UV-aligned triangles on screen. They differ in how they decide which
//! tiles of a level are visible:
//!
//! - [`TileAlignedGridHelper`]: per-tile bounds from mesh vertices, frustum culled
//! - [`PlaneGridHelper`]: per-tile bounds by direct grid construction over a flat plane, frustum culled
//! - [`NaiveGridHelper`]: every content tile, no culling

use std::str::FromStr;

use crate::core::camera::Camera;
use crate::core::error::Error;
use crate::core::types::{Result, Vec2, Vec3};
use crate::math::Aabb;
use crate::mesh::SurfaceMesh;
use crate::multires::texture_settings::TextureSettings;
use crate::multires::tree::{MultiresTree, TileId};

/// Indices per sampled quad (two triangles)
const QUAD_STRIDE: usize = 6;

/// Which visibility strategy to use for a mesh
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GeometryKind {
    /// Mesh segments aligned with the finest tile grid
    #[default]
    TileAlignedGrid,
    /// Flat rectangle; bounds are computed analytically
    Plane,
    /// Any grid; no culling
    Grid,
}

impl FromStr for GeometryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TILE_ALIGNED_GRID" => Ok(Self::TileAlignedGrid),
            "PLANE" | "RECTANGLE" => Ok(Self::Plane),
            "GRID" => Ok(Self::Grid),
            other => Err(Error::UnknownGeometryKind(other.to_string())),
        }
    }
}

/// Source of screen-resolution demand and visible tiles for the scheduler
pub trait VisibilityHelper {
    /// Texels per unit UV required along U and V to match the screen.
    /// `None` when no sample triangle could be measured.
    fn required_resolution(&self, camera: &Camera, viewport: Vec2) -> Option<Vec2>;

    /// Content tiles of `level` that should be considered visible
    fn visible_tiles(&self, tree: &MultiresTree, camera: &Camera, level: u32) -> Vec<TileId>;

    /// Whether tile bounds must be rebuilt before the next visibility query
    fn bounds_outdated(&self) -> bool {
        false
    }

    /// Rebuild tile bounds in `tree` from the current mesh
    fn update_bounds(&mut self, _tree: &mut MultiresTree) {}

    /// Surface mesh, for deformation updates
    fn mesh_mut(&mut self) -> &mut SurfaceMesh;
}

/// Build the helper for `kind` and compute initial tile bounds
pub fn create_visibility_helper(
    kind: GeometryKind,
    mesh: SurfaceMesh,
    settings: &TextureSettings,
    tree: &mut MultiresTree,
) -> Result<Box<dyn VisibilityHelper>> {
    let mut helper: Box<dyn VisibilityHelper> = match kind {
        GeometryKind::TileAlignedGrid => Box::new(TileAlignedGridHelper::new(mesh, settings, tree)?),
        GeometryKind::Plane => Box::new(PlaneGridHelper::new(mesh, settings)),
        GeometryKind::Grid => Box::new(NaiveGridHelper::new(mesh, settings)),
    };
    helper.update_bounds(tree);
    Ok(helper)
}

/// Fixed set of UV-aligned sample triangles used to estimate required resolution
#[derive(Clone, Debug, Default)]
pub struct ResolutionSampler {
    /// Index-buffer offsets of the sampled quads
    samples: Vec<usize>,
}

impl ResolutionSampler {
    /// Pick up to three quads fully inside the content area: the first found
    /// searching down from the middle of the index buffer, then from the
    /// start, then from the end.
    pub fn new(mesh: &SurfaceMesh, settings: &TextureSettings) -> Self {
        let len = mesh.indices.len();
        let mut samples = Vec::new();

        if len >= QUAD_STRIDE {
            let inside = |offset: isize| triangle_inside_content(mesh, settings, offset as usize);
            let stride = QUAD_STRIDE as isize;

            let center = ((len / 2) / QUAD_STRIDE * QUAD_STRIDE) as isize;
            let max_tested = center;
            let mut test = center;
            while test >= 0 && !inside(test) {
                test -= stride;
            }
            if test >= 0 {
                samples.push(test as usize);
            }

            let min_tested = test;
            test = 0;
            while test < min_tested && !inside(test) {
                test += stride;
            }
            if test < min_tested {
                samples.push(test as usize);
            }

            test = (len - QUAD_STRIDE) as isize;
            while test > max_tested && !inside(test) {
                test -= stride;
            }
            if test > max_tested {
                samples.push(test as usize);
            }
        }

        if samples.is_empty() {
            log::error!("ResolutionSampler: could not find a triangle inside the content limits for resolution sampling");
        }

        Self { samples }
    }

    /// Index-buffer offsets of the sampled quads
    pub fn samples(&self) -> &[usize] {
        &self.samples
    }

    /// Component-wise maximum of on-screen pixels per unit UV over all samples
    pub fn required_resolution(
        &self,
        mesh: &SurfaceMesh,
        settings: &TextureSettings,
        camera: &Camera,
        viewport: Vec2,
    ) -> Option<Vec2> {
        let mut required: Option<Vec2> = None;

        for &offset in &self.samples {
            let [a, b, d] = triangle(mesh, offset);

            let (Some(a_ndc), Some(b_ndc), Some(d_ndc)) = (
                camera.project(mesh.positions[a]),
                camera.project(mesh.positions[b]),
                camera.project(mesh.positions[d]),
            ) else {
                continue;
            };

            let a_uv = settings.texture_uv(mesh.uvs[a]);
            let b_uv = settings.texture_uv(mesh.uvs[b]);
            let d_uv = settings.texture_uv(mesh.uvs[d]);

            let dist_u = (b_uv.x - a_uv.x).abs();
            let dist_v = (d_uv.y - a_uv.y).abs();
            if dist_u <= f32::EPSILON || dist_v <= f32::EPSILON {
                continue;
            }

            let pixels_ab = pixel_distance(a_ndc, b_ndc, viewport);
            let pixels_ad = pixel_distance(a_ndc, d_ndc, viewport);
            let sample = Vec2::new(pixels_ab / dist_u, pixels_ad / dist_v);

            required = Some(required.map_or(sample, |r| r.max(sample)));
        }

        required
    }
}

fn triangle(mesh: &SurfaceMesh, offset: usize) -> [usize; 3] {
    [
        mesh.indices[offset] as usize,
        mesh.indices[offset + 1] as usize,
        mesh.indices[offset + 2] as usize,
    ]
}

fn triangle_inside_content(mesh: &SurfaceMesh, settings: &TextureSettings, offset: usize) -> bool {
    triangle(mesh, offset)
        .iter()
        .all(|&i| settings.is_inside_content_limits(settings.texture_uv(mesh.uvs[i])))
}

/// Length in pixels of the screen-space segment between two NDC points
fn pixel_distance(a: Vec3, b: Vec3, viewport: Vec2) -> f32 {
    ((b.truncate() - a.truncate()) / 2.0 * viewport).length()
}

fn frustum_culled(tree: &MultiresTree, camera: &Camera, level: u32) -> Vec<TileId> {
    let Some(level) = tree.level(level) else {
        return Vec::new();
    };
    let frustum = camera.frustum();
    level
        .content_tiles()
        .filter(|tile| frustum.intersects_aabb(&tile.bounds))
        .map(|tile| tile.id)
        .collect()
}

/// Helper for grid meshes whose segments line up with the finest tile grid
pub struct TileAlignedGridHelper {
    mesh: SurfaceMesh,
    settings: TextureSettings,
    sampler: ResolutionSampler,
    /// Vertex indices covered by each finest-level tile, in level tile order
    tile_vertices: Vec<Vec<u32>>,
    finest_level: u32,
}

impl TileAlignedGridHelper {
    pub fn new(mesh: SurfaceMesh, settings: &TextureSettings, tree: &MultiresTree) -> Result<Self> {
        let finest_level = tree.finest_level();
        let num_tiles = tree
            .level(finest_level)
            .map(|l| l.num_tiles)
            .ok_or_else(|| Error::Geometry("tree has no levels".into()))?;

        if mesh.segments.x % num_tiles.x != 0 || mesh.segments.y % num_tiles.y != 0 {
            return Err(Error::Geometry(format!(
                "mesh segments {} do not divide evenly into {} finest-level tiles",
                mesh.segments, num_tiles
            )));
        }

        let row = mesh.row_len();
        let slices_per_tile = mesh.segments.x / num_tiles.x;
        let stacks_per_tile = mesh.segments.y / num_tiles.y;

        let mut tile_vertices = Vec::with_capacity((num_tiles.x * num_tiles.y) as usize);
        for tile_x in 0..num_tiles.x {
            for tile_y in 0..num_tiles.y {
                let tile_offset = tile_y * stacks_per_tile * row + tile_x * slices_per_tile;
                let mut vertices = Vec::with_capacity((slices_per_tile * stacks_per_tile * 4) as usize);
                for stack in 0..stacks_per_tile {
                    for slice in 0..slices_per_tile {
                        let a = tile_offset + stack * row + slice;
                        vertices.extend_from_slice(&[a, a + 1, a + row + 1, a + row]);
                    }
                }
                tile_vertices.push(vertices);
            }
        }

        let sampler = ResolutionSampler::new(&mesh, settings);
        Ok(Self {
            mesh,
            settings: settings.clone(),
            sampler,
            tile_vertices,
            finest_level,
        })
    }
}

impl VisibilityHelper for TileAlignedGridHelper {
    fn required_resolution(&self, camera: &Camera, viewport: Vec2) -> Option<Vec2> {
        self.sampler.required_resolution(&self.mesh, &self.settings, camera, viewport)
    }

    fn visible_tiles(&self, tree: &MultiresTree, camera: &Camera, level: u32) -> Vec<TileId> {
        frustum_culled(tree, camera, level)
    }

    fn bounds_outdated(&self) -> bool {
        self.mesh.positions_changed()
    }

    fn update_bounds(&mut self, tree: &mut MultiresTree) {
        self.mesh.take_positions_changed();

        for index in 0..tree.num_levels() {
            if let Some(level) = tree.level_mut(index) {
                for tile in level.tiles_mut() {
                    tile.bounds = Aabb::empty();
                }
            }
        }

        let Some(finest) = tree.level(self.finest_level) else {
            return;
        };
        let leaves: Vec<(TileId, bool)> = finest.tiles().map(|t| (t.id, t.has_content)).collect();

        for ((id, has_content), vertices) in leaves.into_iter().zip(&self.tile_vertices) {
            if !has_content {
                continue;
            }
            let mut bounds = Aabb::empty();
            for &v in vertices {
                bounds.expand(self.mesh.positions[v as usize]);
            }
            if bounds.is_empty() {
                continue;
            }

            let mut current = Some(id);
            while let Some(tile_id) = current {
                if let Some(tile) = tree.tile_mut(tile_id) {
                    tile.bounds.union_with(&bounds);
                }
                current = tile_id.parent();
            }
        }
    }

    fn mesh_mut(&mut self) -> &mut SurfaceMesh {
        &mut self.mesh
    }
}

/// Helper for flat rectangles: tile bounds are a centered grid over the plane
pub struct PlaneGridHelper {
    mesh: SurfaceMesh,
    settings: TextureSettings,
    sampler: ResolutionSampler,
}

impl PlaneGridHelper {
    pub fn new(mesh: SurfaceMesh, settings: &TextureSettings) -> Self {
        let sampler = ResolutionSampler::new(&mesh, settings);
        Self { mesh, settings: settings.clone(), sampler }
    }
}

impl VisibilityHelper for PlaneGridHelper {
    fn required_resolution(&self, camera: &Camera, viewport: Vec2) -> Option<Vec2> {
        self.sampler.required_resolution(&self.mesh, &self.settings, camera, viewport)
    }

    fn visible_tiles(&self, tree: &MultiresTree, camera: &Camera, level: u32) -> Vec<TileId> {
        frustum_culled(tree, camera, level)
    }

    fn bounds_outdated(&self) -> bool {
        self.mesh.positions_changed()
    }

    fn update_bounds(&mut self, tree: &mut MultiresTree) {
        self.mesh.take_positions_changed();

        let (Some(&lower_left), Some(&upper_right)) =
            (self.mesh.positions.first(), self.mesh.positions.last())
        else {
            return;
        };
        let size = (upper_right - lower_left).truncate();
        let center = (lower_left + upper_right) * 0.5;

        for index in 0..tree.num_levels() {
            let Some(level) = tree.level_mut(index) else {
                continue;
            };
            let tile_size = size / level.num_tiles.as_vec2();

            for tile in level.tiles_mut() {
                if !tile.has_content {
                    tile.bounds = Aabb::empty();
                    continue;
                }
                let offset = Vec2::new(tile.id.x as f32 + 0.5, tile.id.y as f32 + 0.5) * tile_size
                    - size * 0.5;
                tile.bounds = Aabb::from_center_size(
                    center + offset.extend(0.0),
                    tile_size.extend(0.0),
                );
            }
        }
    }

    fn mesh_mut(&mut self) -> &mut SurfaceMesh {
        &mut self.mesh
    }
}

/// Helper that treats every content tile as visible
pub struct NaiveGridHelper {
    mesh: SurfaceMesh,
    settings: TextureSettings,
    sampler: ResolutionSampler,
}

impl NaiveGridHelper {
    pub fn new(mesh: SurfaceMesh, settings: &TextureSettings) -> Self {
        let sampler = ResolutionSampler::new(&mesh, settings);
        Self { mesh, settings: settings.clone(), sampler }
    }
}

impl VisibilityHelper for NaiveGridHelper {
    fn required_resolution(&self, camera: &Camera, viewport: Vec2) -> Option<Vec2> {
        self.sampler.required_resolution(&self.mesh, &self.settings, camera, viewport)
    }

    fn visible_tiles(&self, tree: &MultiresTree, _camera: &Camera, level: u32) -> Vec<TileId> {
        tree.level(level)
            .map(|l| l.content_tiles().map(|t| t.id).collect())
            .unwrap_or_default()
    }

    fn mesh_mut(&mut self) -> &mut SurfaceMesh {
        &mut self.mesh
    }
}
