//! Texture settings shared by the quadtree and the geometry helpers
//!
//! Holds the full texture resolution, the content rectangle inside it (the
//! area that actually carries image data), the UV scale/bias used when mesh
//! UVs are mapped onto the content only, and the filter configuration.

use serde::{Deserialize, Serialize};

use crate::core::types::Vec2;

/// Target anisotropy when none is configured
pub const DEFAULT_ANISOTROPY: u32 = 8;

/// Capabilities of the rendering device that texture configuration depends on.
///
/// Passed in explicitly so texture settings never have to query a global
/// renderer.
#[derive(Clone, Copy, Debug)]
pub struct DeviceCaps {
    /// Maximum supported anisotropic filtering level
    pub max_anisotropy: u32,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self { max_anisotropy: 16 }
    }
}

/// Texture sampling filter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextureFilter {
    Nearest,
    #[default]
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

/// Magnification/minification pair
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterPair {
    pub mag: TextureFilter,
    pub min: TextureFilter,
}

impl Default for FilterPair {
    fn default() -> Self {
        Self { mag: TextureFilter::Linear, min: TextureFilter::LinearMipmapLinear }
    }
}

/// Optional filter overrides as they appear in a config file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    pub coeff_filter_mag: Option<TextureFilter>,
    pub coeff_filter_min: Option<TextureFilter>,
    pub rgb_filter_mag: Option<TextureFilter>,
    pub rgb_filter_min: Option<TextureFilter>,
    pub spec_filter_mag: Option<TextureFilter>,
    pub spec_filter_min: Option<TextureFilter>,
    pub mask_filter_mag: Option<TextureFilter>,
    pub mask_filter_min: Option<TextureFilter>,
    pub anisotropy: Option<u32>,
}

/// Resolved filter settings for every layer group
#[derive(Clone, Copy, Debug)]
pub struct FilterSettings {
    pub coeff: FilterPair,
    pub rgb: FilterPair,
    pub spec: FilterPair,
    pub mask: FilterPair,
    /// Requested anisotropy
    pub target_anisotropy: u32,
    /// Requested anisotropy clamped to the device maximum
    pub anisotropy: u32,
}

impl FilterSettings {
    /// Resolve config overrides against defaults and device capabilities
    pub fn new(config: &FilterConfig, caps: &DeviceCaps) -> Self {
        let pair = |mag: Option<TextureFilter>, min: Option<TextureFilter>| {
            let default = FilterPair::default();
            FilterPair { mag: mag.unwrap_or(default.mag), min: min.unwrap_or(default.min) }
        };
        let target_anisotropy = config.anisotropy.unwrap_or(DEFAULT_ANISOTROPY);

        Self {
            coeff: pair(config.coeff_filter_mag, config.coeff_filter_min),
            rgb: pair(config.rgb_filter_mag, config.rgb_filter_min),
            spec: pair(config.spec_filter_mag, config.spec_filter_min),
            mask: pair(config.mask_filter_mag, config.mask_filter_min),
            target_anisotropy,
            anisotropy: target_anisotropy.min(caps.max_anisotropy),
        }
    }

    /// Filters for the data layer at `layer` (0-1 coefficients, 2 rgb, 3 specular, 4 mask).
    ///
    /// Read by the renderer when it creates the layer textures; tile
    /// scheduling does not depend on filtering.
    pub fn for_layer(&self, layer: usize) -> Option<FilterPair> {
        match layer {
            0 | 1 => Some(self.coeff),
            2 => Some(self.rgb),
            3 => Some(self.spec),
            4 => Some(self.mask),
            _ => None,
        }
    }
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self::new(&FilterConfig::default(), &DeviceCaps::default())
    }
}

/// Texture resolution, content area and UV mapping
#[derive(Clone, Debug)]
pub struct TextureSettings {
    /// Full texture resolution in pixels
    pub resolution: Vec2,
    /// Size of the image content, centered inside `resolution`
    pub content_size: Vec2,
    /// Content limits along U as `[min, max]` in [0, 1]
    pub u_content_limits: Vec2,
    /// Content limits along V as `[min, max]` in [0, 1]
    pub v_content_limits: Vec2,
    /// Partial rendering limits along U (in texture space)
    pub u_dynamic_limits: Vec2,
    /// Partial rendering limits along V (in texture space)
    pub v_dynamic_limits: Vec2,
    /// Mesh UV scale applied when content is scaled to the mesh
    pub uv_scale: Vec2,
    /// Mesh UV bias applied when content is scaled to the mesh
    pub uv_bias: Vec2,
    /// Whether mesh UVs are mapped onto the content rectangle via scale/bias
    pub scaled_content: bool,
    /// The object ships a mask layer; for the renderer only
    pub has_mask: bool,
    pub filters: FilterSettings,
}

impl TextureSettings {
    /// Settings with the content area centered inside the texture
    pub fn new(resolution: Vec2, content_size: Vec2) -> Self {
        let mut settings = Self {
            resolution,
            content_size,
            u_content_limits: Vec2::new(0.0, 1.0),
            v_content_limits: Vec2::new(0.0, 1.0),
            u_dynamic_limits: Vec2::new(0.0, 1.0),
            v_dynamic_limits: Vec2::new(0.0, 1.0),
            uv_scale: Vec2::ONE,
            uv_bias: Vec2::ZERO,
            scaled_content: false,
            has_mask: false,
            filters: FilterSettings::default(),
        };
        settings.set_content_limits_from_size(content_size);
        settings
    }

    /// Settings whose content is given directly as UV limits
    pub fn with_content_limits(resolution: Vec2, u_limits: Vec2, v_limits: Vec2) -> Self {
        let mut settings = Self::new(resolution, resolution);
        settings.u_content_limits = u_limits;
        settings.v_content_limits = v_limits;
        settings.content_size = Vec2::new(
            (u_limits.y - u_limits.x) * resolution.x,
            (v_limits.y - v_limits.x) * resolution.y,
        );
        settings
    }

    /// Replace the filter settings
    pub fn with_filters(mut self, config: &FilterConfig, caps: &DeviceCaps) -> Self {
        self.filters = FilterSettings::new(config, caps);
        self
    }

    /// Derive centered content limits from a content size in pixels
    pub fn set_content_limits_from_size(&mut self, content_size: Vec2) {
        let lower = (self.resolution - content_size) / 2.0 / self.resolution;
        let upper = (self.resolution + content_size) / 2.0 / self.resolution;
        self.content_size = content_size;
        self.u_content_limits = Vec2::new(lower.x, upper.x);
        self.v_content_limits = Vec2::new(lower.y, upper.y);
    }

    /// Map mesh UVs [0, 1] onto the content rectangle
    pub fn scale_to_content(&mut self) {
        self.uv_scale = Vec2::new(
            self.u_content_limits.y - self.u_content_limits.x,
            self.v_content_limits.y - self.v_content_limits.x,
        );
        self.uv_bias = Vec2::new(self.u_content_limits.x, self.v_content_limits.x);
        self.scaled_content = true;
    }

    /// Apply the UV scale/bias if content is scaled, identity otherwise
    pub fn texture_uv(&self, mesh_uv: Vec2) -> Vec2 {
        if self.scaled_content {
            mesh_uv * self.uv_scale + self.uv_bias
        } else {
            mesh_uv
        }
    }

    /// Restrict rendering to a sub-rectangle given in mesh UV space.
    ///
    /// Partial limits clip what the renderer draws. Resolution sampling and
    /// tile content flags use the content limits alone, so a partial view
    /// never changes which tiles exist or which level is required.
    pub fn set_partial_rendering_limits(&mut self, u_limits_geom: Vec2, v_limits_geom: Vec2) {
        self.u_dynamic_limits = u_limits_geom * self.uv_scale.x + Vec2::splat(self.uv_bias.x);
        self.v_dynamic_limits = v_limits_geom * self.uv_scale.y + Vec2::splat(self.uv_bias.y);
    }

    /// Intersection of content limits and partial rendering limits, as (u, v).
    /// This is the clip rectangle handed to the renderer.
    pub fn combined_limits(&self) -> (Vec2, Vec2) {
        let u = Vec2::new(
            self.u_dynamic_limits.x.max(self.u_content_limits.x),
            self.u_dynamic_limits.y.min(self.u_content_limits.y),
        );
        let v = Vec2::new(
            self.v_dynamic_limits.x.max(self.v_content_limits.x),
            self.v_dynamic_limits.y.min(self.v_content_limits.y),
        );
        (u, v)
    }

    /// Whether a texture-space UV lies inside the content rectangle (inclusive)
    pub fn is_inside_content_limits(&self, uv: Vec2) -> bool {
        uv.x >= self.u_content_limits.x && uv.x <= self.u_content_limits.y
            && uv.y >= self.v_content_limits.x && uv.y <= self.v_content_limits.y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centered_content_limits() {
        let settings = TextureSettings::new(Vec2::new(1024.0, 1024.0), Vec2::new(512.0, 1024.0));
        assert_eq!(settings.u_content_limits, Vec2::new(0.25, 0.75));
        assert_eq!(settings.v_content_limits, Vec2::new(0.0, 1.0));

        assert!(settings.is_inside_content_limits(Vec2::new(0.25, 0.0)));
        assert!(!settings.is_inside_content_limits(Vec2::new(0.1, 0.5)));
    }

    #[test]
    fn test_scale_to_content() {
        let mut settings = TextureSettings::new(Vec2::new(1000.0, 1000.0), Vec2::new(500.0, 500.0));
        assert_eq!(settings.texture_uv(Vec2::ZERO), Vec2::ZERO);

        settings.scale_to_content();
        assert_eq!(settings.texture_uv(Vec2::ZERO), Vec2::new(0.25, 0.25));
        assert_eq!(settings.texture_uv(Vec2::ONE), Vec2::new(0.75, 0.75));
    }

    #[test]
    fn test_combined_limits() {
        let mut settings = TextureSettings::new(Vec2::new(100.0, 100.0), Vec2::new(50.0, 100.0));
        settings.set_partial_rendering_limits(Vec2::new(0.0, 0.5), Vec2::new(0.5, 1.0));

        let (u, v) = settings.combined_limits();
        assert_eq!(u, Vec2::new(0.25, 0.5));
        assert_eq!(v, Vec2::new(0.5, 1.0));
    }

    #[test]
    fn test_anisotropy_clamped_to_device() {
        let config = FilterConfig { anisotropy: Some(16), ..Default::default() };
        let filters = FilterSettings::new(&config, &DeviceCaps { max_anisotropy: 4 });
        assert_eq!(filters.target_anisotropy, 16);
        assert_eq!(filters.anisotropy, 4);

        let defaults = FilterSettings::new(&FilterConfig::default(), &DeviceCaps { max_anisotropy: 16 });
        assert_eq!(defaults.anisotropy, DEFAULT_ANISOTROPY);
        assert_eq!(defaults.for_layer(2), Some(FilterPair::default()));
        assert_eq!(defaults.for_layer(7), None);
    }
}
