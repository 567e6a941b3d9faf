//! Capability limits for the render core.
//!
//! Every buffer, pool and arena in the pipeline is sized once from a
//! [`GraphicsConfig`] and never grows afterwards. The config is usually built
//! with [`GraphicsConfig::default`] and tweaked in code, or loaded from TOML:
//!
//! ```toml
//! window_width = 1280
//! window_height = 720
//! max_material_count = 256
//! ```
//!
//! Missing fields fall back to their defaults; unknown fields are rejected.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphicsConfig {
    pub window_title: String,
    pub window_width: u32,
    pub window_height: u32,
    /// Byte alignment of every arena allocation. Must be a power of two.
    pub memory_alignment: usize,
    /// Size in bytes of the shared vertex buffer and its arena block.
    pub vertex_buffer_size: usize,
    /// Size in bytes of the shared index buffer and its arena block.
    pub index_buffer_size: usize,
    pub max_opaque_instance_count: usize,
    pub max_transparent_instance_count: usize,
    /// Glyph quads a single text object may emit per draw.
    pub max_text_glyph_count: usize,
    pub max_material_count: usize,
    pub max_atlas_texture_count: usize,
    pub max_game_object_count: usize,
    pub atlas_width: u32,
    pub atlas_height: u32,
    /// Number of layers in the texture atlas array.
    pub atlas_depth: u32,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            window_title: "realware".to_string(),
            window_width: 640,
            window_height: 480,
            memory_alignment: 64,
            vertex_buffer_size: 65536,
            index_buffer_size: 65536,
            max_opaque_instance_count: 65536,
            max_transparent_instance_count: 65536,
            max_text_glyph_count: 65536,
            max_material_count: 65536,
            max_atlas_texture_count: 65536,
            max_game_object_count: 65536,
            atlas_width: 1920,
            atlas_height: 1080,
            atlas_depth: 16,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl GraphicsConfig {
    /// Loads and validates a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> RenderResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            log::error!("Failed to read config {}: {}", path.display(), e);
            RenderError::Io(e)
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> RenderResult<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| {
            log::error!("Failed to parse config: {}", e);
            RenderError::Config(e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> RenderResult<String> {
        toml::to_string_pretty(self).map_err(|e| RenderError::Config(e.to_string()))
    }

    /// Rejects zero capacities and alignments the arena cannot honor.
    pub fn validate(&self) -> RenderResult<()> {
        if !self.memory_alignment.is_power_of_two() {
            log::error!("Invalid memory alignment {}", self.memory_alignment);
            return Err(RenderError::InvalidAlignment(self.memory_alignment));
        }

        let capacities = [
            ("window_width", self.window_width as usize),
            ("window_height", self.window_height as usize),
            ("vertex_buffer_size", self.vertex_buffer_size),
            ("index_buffer_size", self.index_buffer_size),
            ("max_opaque_instance_count", self.max_opaque_instance_count),
            (
                "max_transparent_instance_count",
                self.max_transparent_instance_count,
            ),
            ("max_text_glyph_count", self.max_text_glyph_count),
            ("max_material_count", self.max_material_count),
            ("max_atlas_texture_count", self.max_atlas_texture_count),
            ("max_game_object_count", self.max_game_object_count),
            ("atlas_width", self.atlas_width as usize),
            ("atlas_height", self.atlas_height as usize),
            ("atlas_depth", self.atlas_depth as usize),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            log::error!("Config field {} must be non-zero", name);
            return Err(RenderError::Config(format!("{name} must be non-zero")));
        }

        Ok(())
    }

    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.window_title = title.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.window_width = width;
        self.window_height = height;
        self
    }

    /// Shrinks every per-frame capacity to `count`. Handy for tests and tools
    /// that do not need the full default footprint.
    pub fn with_capacity(mut self, count: usize) -> Self {
        self.max_opaque_instance_count = count;
        self.max_transparent_instance_count = count;
        self.max_text_glyph_count = count;
        self.max_material_count = count;
        self.max_atlas_texture_count = count;
        self.max_game_object_count = count;
        self
    }

    pub fn atlas_size(mut self, width: u32, height: u32, depth: u32) -> Self {
        self.atlas_width = width;
        self.atlas_height = height;
        self.atlas_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_application_descriptor() {
        let config = GraphicsConfig::default();
        assert_eq!(config.window_size(), (640, 480));
        assert_eq!(config.memory_alignment, 64);
        assert_eq!(config.vertex_buffer_size, 65536);
        assert_eq!(config.atlas_depth, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = GraphicsConfig::from_toml_str(
            "window_width = 1280\nwindow_height = 720\nmax_material_count = 8\n",
        )
        .unwrap();
        assert_eq!(config.window_size(), (1280, 720));
        assert_eq!(config.max_material_count, 8);
        assert_eq!(config.index_buffer_size, 65536);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = GraphicsConfig::from_toml_str("max_sound_count = 4\n");
        assert!(matches!(result, Err(RenderError::Config(_))));
    }

    #[test]
    fn alignment_must_be_power_of_two() {
        let result = GraphicsConfig::from_toml_str("memory_alignment = 48\n");
        assert!(matches!(result, Err(RenderError::InvalidAlignment(48))));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = GraphicsConfig::default().with_capacity(0);
        assert!(matches!(config.validate(), Err(RenderError::Config(_))));
    }

    #[test]
    fn toml_round_trip() {
        let config = GraphicsConfig::default().size(800, 600).with_capacity(32);
        let text = config.to_toml_string().unwrap();
        assert_eq!(GraphicsConfig::from_toml_str(&text).unwrap(), config);
    }
}
