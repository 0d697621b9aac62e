//! Indexed surface mesh the viewer renders RTI textures onto
//!
//! Only the parts the tile scheduler needs are modelled here: the index
//! buffer, per-vertex positions and UVs, the parametric segment counts and a
//! deformable flag with a "positions changed" notification.

use crate::core::error::Error;
use crate::core::types::{Result, UVec2, Vec2, Vec3};

/// Parametric grid mesh (`(segments.x + 1) * (segments.y + 1)` vertices)
#[derive(Clone, Debug)]
pub struct SurfaceMesh {
    /// Number of quads along U (slices) and V (stacks)
    pub segments: UVec2,
    /// Vertex positions in object space, row-major by stack
    pub positions: Vec<Vec3>,
    /// Vertex texture coordinates
    pub uvs: Vec<Vec2>,
    /// Triangle list, six indices per quad: (a, b, d), (b, c, d)
    pub indices: Vec<u32>,
    /// Whether positions may change after construction
    pub deformable: bool,
    positions_changed: bool,
}

impl SurfaceMesh {
    /// Build a grid by evaluating `func(u, v)` at every vertex.
    ///
    /// Vertex `(slice, stack)` gets UV `(slice / slices, stack / stacks)`.
    pub fn parametric(segments: UVec2, func: impl Fn(f32, f32) -> Vec3) -> Self {
        let slices = segments.x.max(1);
        let stacks = segments.y.max(1);
        let slice_count = slices + 1;

        let mut positions = Vec::with_capacity(((slices + 1) * (stacks + 1)) as usize);
        let mut uvs = Vec::with_capacity(positions.capacity());
        for stack in 0..=stacks {
            let v = stack as f32 / stacks as f32;
            for slice in 0..=slices {
                let u = slice as f32 / slices as f32;
                positions.push(func(u, v));
                uvs.push(Vec2::new(u, v));
            }
        }

        let mut indices = Vec::with_capacity((slices * stacks * 6) as usize);
        for stack in 0..stacks {
            for slice in 0..slices {
                let a = stack * slice_count + slice;
                let b = stack * slice_count + slice + 1;
                let c = (stack + 1) * slice_count + slice + 1;
                let d = (stack + 1) * slice_count + slice;
                indices.extend_from_slice(&[a, b, d, b, c, d]);
            }
        }

        Self {
            segments: UVec2::new(slices, stacks),
            positions,
            uvs,
            indices,
            deformable: false,
            positions_changed: false,
        }
    }

    /// Flat rectangle of `size` in the XY plane, centered on `center`
    pub fn plane(size: Vec2, segments: UVec2, center: Vec3) -> Self {
        Self::parametric(segments, |u, v| {
            center + Vec3::new((u - 0.5) * size.x, (v - 0.5) * size.y, 0.0)
        })
    }

    /// Number of vertices
    pub fn num_vertices(&self) -> usize {
        self.positions.len()
    }

    /// Vertices per row (slices + 1)
    pub fn row_len(&self) -> u32 {
        self.segments.x + 1
    }

    /// Replace vertex positions (e.g. after a deformation step).
    ///
    /// Marks positions as changed so dependent bounding boxes are rebuilt
    /// before the next visibility query. The vertex count cannot change.
    pub fn set_positions(&mut self, positions: Vec<Vec3>) -> Result<()> {
        if positions.len() != self.positions.len() {
            return Err(Error::Geometry(format!(
                "expected {} vertex positions, got {}",
                self.positions.len(),
                positions.len()
            )));
        }
        self.positions = positions;
        self.positions_changed = true;
        Ok(())
    }

    /// True if positions changed since the last [`take_positions_changed`](Self::take_positions_changed)
    pub fn positions_changed(&self) -> bool {
        self.positions_changed
    }

    /// Consume the "positions changed" notification
    pub fn take_positions_changed(&mut self) -> bool {
        std::mem::take(&mut self.positions_changed)
    }
}
