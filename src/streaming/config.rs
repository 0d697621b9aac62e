//! Viewer configuration
//!
//! Mirrors the per-object `config.json` shape: texture settings, texture
//! access (addressing), multiresolution parameters, geometry and retry
//! policy. String-typed enumerations are parsed in [`ViewerConfig::validate`]
//! so an unknown value fails at construction instead of being substituted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::{Result, UVec2, Vec2, Vec3};
use crate::mesh::SurfaceMesh;
use crate::multires::geometry::GeometryKind;
use crate::multires::texture_settings::{DeviceCaps, FilterConfig, TextureSettings};
use crate::multires::tree::{levels_for_tile_size, MAX_LEVELS};
use crate::streaming::addressing::IndexType;
use crate::streaming::loader::DEFAULT_MAX_CONCURRENT;
use crate::streaming::request::RetryPolicy;
use crate::streaming::scheduler::RequestMode;

/// Width/height pair as written in config files
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Size2 {
    pub w: f32,
    pub h: f32,
}

impl Size2 {
    pub fn new(w: f32, h: f32) -> Self {
        Self { w, h }
    }

    pub fn to_vec2(self) -> Vec2 {
        Vec2::new(self.w, self.h)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextureSettingsConfig {
    /// Full texture resolution in pixels
    pub resolution: Size2,
    /// Image content size, centered in `resolution`; defaults to the full texture
    #[serde(default)]
    pub content_size: Option<Size2>,
    /// Map mesh UVs onto the content rectangle only
    #[serde(default)]
    pub scale_to_content: bool,
    #[serde(default)]
    pub has_mask: bool,
    #[serde(default)]
    pub filter_settings: FilterConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextureAccessConfig {
    /// `MORTON_SUM`, `SLIPPY_MAP` or `IIIF`; defaults to `MORTON_SUM`
    #[serde(default)]
    pub index_type: Option<String>,
    /// Base URL of every data layer
    pub urls: Vec<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_suffix")]
    pub suffix: String,
}

fn default_suffix() -> String {
    "jpg".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiresConfig {
    /// Quadtree depth; derived from `tile_size` when absent
    pub n_levels: Option<u32>,
    pub tile_size: Option<Size2>,
    /// `INCREMENTAL` or `DIRECT`
    pub request_mode: Option<String>,
    /// Tiles fetched at the same time
    pub max_concurrent: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeometryConfig {
    /// `TILE_ALIGNED_GRID`, `PLANE` or `GRID`
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Surface size in object units; defaults to unit width with the texture's aspect
    pub size: Option<Size2>,
    /// Quads per axis; defaults to one per finest-level tile
    pub num_segments: Option<u32>,
    /// Uniform scale applied to `size`
    pub scale: Option<f32>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self { max_retries: policy.max_retries, delay_ms: policy.delay.as_millis() as u64 }
    }
}

/// Complete configuration of one multiresolution RTI object
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerConfig {
    pub texture_settings: TextureSettingsConfig,
    pub texture_access: TextureAccessConfig,
    #[serde(default)]
    pub multires: MultiresConfig,
    #[serde(default)]
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ViewerConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::info!("Loaded viewer config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a config from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every enumerated and derived value
    pub fn validate(&self) -> Result<()> {
        let resolution = self.texture_settings.resolution;
        if resolution.w <= 0.0 || resolution.h <= 0.0 {
            return Err(Error::Config(format!(
                "texture resolution must be positive, got {}x{}",
                resolution.w, resolution.h
            )));
        }
        if self.texture_access.urls.is_empty() {
            return Err(Error::Config("textureAccess.urls must name at least one layer".into()));
        }
        if self.multires.max_concurrent == Some(0) {
            return Err(Error::Config("multires.maxConcurrent must be at least 1".into()));
        }
        if self.geometry.num_segments == Some(0) {
            return Err(Error::Config("geometry.numSegments must be at least 1".into()));
        }

        self.index_type()?;
        self.request_mode()?;
        self.geometry_kind()?;
        self.num_levels()?;
        Ok(())
    }

    pub fn index_type(&self) -> Result<IndexType> {
        self.texture_access
            .index_type
            .as_deref()
            .map_or(Ok(IndexType::default()), str::parse)
    }

    pub fn request_mode(&self) -> Result<RequestMode> {
        self.multires
            .request_mode
            .as_deref()
            .map_or(Ok(RequestMode::default()), str::parse)
    }

    pub fn geometry_kind(&self) -> Result<GeometryKind> {
        self.geometry
            .kind
            .as_deref()
            .map_or(Ok(GeometryKind::default()), str::parse)
    }

    /// Quadtree depth, explicit or derived from the tile width
    pub fn num_levels(&self) -> Result<u32> {
        let levels = match (self.multires.n_levels, self.multires.tile_size) {
            (Some(levels), _) => levels,
            (None, Some(tile_size)) => {
                levels_for_tile_size(self.texture_settings.resolution.w, tile_size.w)
            }
            (None, None) => {
                return Err(Error::Config("multires needs either nLevels or tileSize".into()));
            }
        };
        if levels == 0 || levels > MAX_LEVELS {
            return Err(Error::InvalidLevelCount(levels));
        }
        Ok(levels)
    }

    pub fn max_concurrent(&self) -> usize {
        self.multires.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_retries, Duration::from_millis(self.retry.delay_ms))
    }

    /// Resolved texture settings for a device
    pub fn build_texture_settings(&self, caps: &DeviceCaps) -> TextureSettings {
        let config = &self.texture_settings;
        let resolution = config.resolution.to_vec2();
        let content_size = config.content_size.map_or(resolution, Size2::to_vec2);

        let mut settings = TextureSettings::new(resolution, content_size)
            .with_filters(&config.filter_settings, caps);
        settings.has_mask = config.has_mask;
        if config.scale_to_content {
            settings.scale_to_content();
        }
        settings
    }

    /// Surface mesh described by the geometry section, centered at the origin
    pub fn build_mesh(&self) -> Result<SurfaceMesh> {
        let num_levels = self.num_levels()?;
        let resolution = self.texture_settings.resolution.to_vec2();

        let size = self
            .geometry
            .size
            .map_or(Vec2::new(1.0, resolution.y / resolution.x), Size2::to_vec2)
            * self.geometry.scale.unwrap_or(1.0);
        let segments = self.geometry.num_segments.unwrap_or(1 << (num_levels - 1));

        Ok(SurfaceMesh::plane(size, UVec2::splat(segments), Vec3::ZERO))
    }
}
