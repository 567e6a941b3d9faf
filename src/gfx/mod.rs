//! The graphics-API boundary.
//!
//! Everything above this module talks to the GPU through [`GraphicsApi`]: a
//! small set of create/write/bind/destroy operations on opaque handles plus
//! three draw calls. Descriptors are plain data so the same pass setup drives
//! any backend.
//!
//! Two backends ship with the crate:
//!
//! - [`WgpuApi`] renders through wgpu into a winit window.
//! - [`SoftwareApi`] is a deterministic CPU reference that records every call
//!   and rasterizes the built-in render paths, used to test pipeline output.

mod context;
mod software;
mod wgpu_api;

pub use context::GpuContext;
pub use software::{ApiCall, SoftwareApi};
pub use wgpu_api::WgpuApi;

use std::path::Path;

use glam::Mat4;

use crate::error::{RenderError, RenderResult};
use crate::render_pass::{RenderPass, RenderPassDesc, RenderPath};

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// A GPU buffer.
    BufferHandle
);
gpu_handle!(
    /// A GPU texture (2D or layered).
    TextureHandle
);
gpu_handle!(
    /// A compiled shader program.
    ShaderHandle
);
gpu_handle!(
    /// A set of color attachments plus an optional depth attachment.
    RenderTargetHandle
);
gpu_handle!(
    /// Backend state for a [`RenderPass`].
    RenderPassHandle
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
    /// Large read-only record arrays (instances, materials, atlas entries).
    Storage,
}

/// Binding slots of the storage buffers a pass reads.
pub mod slot {
    pub const INSTANCES: u32 = 0;
    pub const MATERIALS: u32 = 1;
    pub const LIGHTS: u32 = 2;
    pub const ATLAS_TEXTURES: u32 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub kind: BufferKind,
    pub size: usize,
    pub slot: u32,
}

impl BufferDesc {
    pub fn new(kind: BufferKind, size: usize, slot: u32) -> Self {
        Self { kind, size, slot }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8,
    Rgba8,
    Rgba16F,
    Depth,
}

impl TextureFormat {
    /// Bytes per texel expected by [`GraphicsApi::write_texture`].
    pub fn texel_size(self) -> usize {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rgba8 => 4,
            TextureFormat::Rgba16F => 8,
            TextureFormat::Depth => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D2,
    D2Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    /// Layer count; 1 for plain 2D textures.
    pub depth: u32,
    pub dimension: TextureDimension,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            dimension: TextureDimension::D2,
            format,
        }
    }

    pub fn new_array(width: u32, height: u32, depth: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            depth,
            dimension: TextureDimension::D2Array,
            format,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendPair {
    pub src: BlendFactor,
    pub dst: BlendFactor,
}

/// Per-attachment blend factors. Color output `i` is blended with pair `i`;
/// outputs past [`factor_count`](Self::factor_count) are written unblended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendMode {
    pairs: [BlendPair; BlendMode::MAX_PAIRS],
    len: usize,
}

impl BlendMode {
    pub const MAX_PAIRS: usize = 8;

    /// No blending on any attachment.
    pub fn none() -> Self {
        Self {
            pairs: [BlendPair {
                src: BlendFactor::One,
                dst: BlendFactor::Zero,
            }; Self::MAX_PAIRS],
            len: 0,
        }
    }

    pub fn from_pairs(pairs: &[(BlendFactor, BlendFactor)]) -> RenderResult<Self> {
        let mut mode = Self::none();
        for &(src, dst) in pairs {
            mode.push(src, dst)?;
        }
        Ok(mode)
    }

    pub fn push(&mut self, src: BlendFactor, dst: BlendFactor) -> RenderResult<()> {
        if self.len >= Self::MAX_PAIRS {
            log::error!("Blend mode already has {} factor pairs", Self::MAX_PAIRS);
            return Err(RenderError::CapacityExceeded {
                pool: "blend factors",
                capacity: Self::MAX_PAIRS,
            });
        }
        self.pairs[self.len] = BlendPair { src, dst };
        self.len += 1;
        Ok(())
    }

    pub fn pairs(&self) -> &[BlendPair] {
        &self.pairs[..self.len]
    }

    pub fn factor_count(&self) -> usize {
        self.len
    }

    pub fn pair(&self, attachment: usize) -> Option<BlendPair> {
        self.pairs().get(attachment).copied()
    }
}

impl Default for BlendMode {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthMode {
    pub test: bool,
    pub write: bool,
}

impl DepthMode {
    pub const DISABLED: Self = Self {
        test: false,
        write: false,
    };
    pub const TEST_WRITE: Self = Self {
        test: true,
        write: true,
    };
    pub const TEST_ONLY: Self = Self {
        test: true,
        write: false,
    };
}

/// Pixel rectangle a pass renders into.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
        }
    }
}

/// WGSL program source with `vs` and `fs` entry points.
///
/// Base shaders mark a replaceable region with `// #hooks` and
/// `// #end-hooks`; a material's custom shader provides the functions that go
/// in that region (see [`with_hooks`](Self::with_hooks)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub label: String,
    pub code: String,
}

impl ShaderSource {
    pub const HOOKS_BEGIN: &'static str = "// #hooks";
    pub const HOOKS_END: &'static str = "// #end-hooks";

    pub fn new(label: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            code: code.into(),
        }
    }

    /// Reads shader source from disk.
    pub fn load(path: impl AsRef<Path>) -> RenderResult<Self> {
        let path = path.as_ref();
        let code = std::fs::read_to_string(path).map_err(|e| {
            log::error!("Failed to read shader {}: {}", path.display(), e);
            RenderError::Io(e)
        })?;
        Ok(Self::new(path.display().to_string(), code))
    }

    /// Replaces this shader's hook region with `hooks.code`.
    pub fn with_hooks(&self, hooks: &ShaderSource) -> RenderResult<ShaderSource> {
        let begin = self.code.find(Self::HOOKS_BEGIN);
        let end = self.code.find(Self::HOOKS_END);
        let (Some(begin), Some(end)) = (begin, end) else {
            log::error!("Shader '{}' has no hook region", self.label);
            return Err(RenderError::ResourceInitFailure(format!(
                "shader '{}' has no hook region",
                self.label
            )));
        };
        if end < begin {
            return Err(RenderError::ResourceInitFailure(format!(
                "shader '{}' has a malformed hook region",
                self.label
            )));
        }

        let mut code = String::with_capacity(self.code.len() + hooks.code.len());
        code.push_str(&self.code[..begin + Self::HOOKS_BEGIN.len()]);
        code.push('\n');
        code.push_str(&hooks.code);
        code.push('\n');
        code.push_str(&self.code[end..]);

        Ok(ShaderSource::new(
            format!("{}+{}", self.label, hooks.label),
            code,
        ))
    }
}

/// Operations the render core needs from a graphics API.
///
/// Bind-style calls (`clear_*`, `draw*`, `bind_texture`) act on the render
/// pass most recently bound with [`bind_render_pass`](Self::bind_render_pass).
pub trait GraphicsApi {
    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferHandle>;
    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]);
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<TextureHandle>;
    /// Writes `size` texels at `origin` (`[x, y, layer]`), rows top to bottom.
    fn write_texture(
        &mut self,
        texture: TextureHandle,
        origin: [u32; 3],
        size: [u32; 2],
        data: &[u8],
    );
    /// Resizes a texture, returning the handle that now refers to it. The
    /// returned handle may differ from `texture`; contents are not preserved.
    fn resize_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
    ) -> RenderResult<TextureHandle>;
    fn destroy_texture(&mut self, texture: TextureHandle);
    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc>;

    fn create_shader(&mut self, path: RenderPath, source: &ShaderSource)
    -> RenderResult<ShaderHandle>;
    /// Compiles `base` with its hook region replaced by `hooks`.
    fn create_derived_shader(
        &mut self,
        base: ShaderHandle,
        hooks: &ShaderSource,
    ) -> RenderResult<ShaderHandle>;
    fn destroy_shader(&mut self, shader: ShaderHandle);

    fn create_render_target(
        &mut self,
        colors: &[TextureHandle],
        depth: Option<TextureHandle>,
    ) -> RenderResult<RenderTargetHandle>;
    fn update_render_target(
        &mut self,
        target: RenderTargetHandle,
        colors: &[TextureHandle],
        depth: Option<TextureHandle>,
    );
    fn destroy_render_target(&mut self, target: RenderTargetHandle);

    fn create_render_pass(
        &mut self,
        desc: &RenderPassDesc,
        shader: ShaderHandle,
    ) -> RenderResult<RenderPassHandle>;
    fn destroy_render_pass(&mut self, pass: RenderPassHandle);
    /// Makes `pass` current, optionally drawing with `shader` instead of the
    /// pass's own shader.
    fn bind_render_pass(&mut self, pass: &RenderPass, shader: Option<ShaderHandle>);
    fn unbind_render_pass(&mut self, pass: &RenderPass);

    fn set_uniform_mat4(&mut self, shader: ShaderHandle, name: &str, value: &Mat4);
    fn bind_texture(&mut self, shader: ShaderHandle, name: &str, texture: TextureHandle);
    fn clear_color(&mut self, attachment: usize, color: [f32; 4]);
    fn clear_depth(&mut self, depth: f32);

    /// Indexed, instanced triangle draw from the bound pass's vertex and
    /// index buffers.
    fn draw(&mut self, index_count: u32, base_vertex: u32, first_index: u32, instance_count: u32);
    /// One viewport-filling quad.
    fn draw_quad(&mut self);
    /// `count` instanced quads placed by the bound instance buffer.
    fn draw_quads(&mut self, count: u32);

    /// Informs the backend of the new drawable size.
    fn resize_surface(&mut self, width: u32, height: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_mode_is_bounded() {
        let mut mode = BlendMode::none();
        for _ in 0..BlendMode::MAX_PAIRS {
            mode.push(BlendFactor::One, BlendFactor::One).unwrap();
        }
        assert!(matches!(
            mode.push(BlendFactor::One, BlendFactor::Zero),
            Err(RenderError::CapacityExceeded { capacity: 8, .. })
        ));
        assert_eq!(mode.factor_count(), 8);
    }

    #[test]
    fn blend_mode_pairs_in_order() {
        let mode = BlendMode::from_pairs(&[
            (BlendFactor::One, BlendFactor::One),
            (BlendFactor::Zero, BlendFactor::InvSrcColor),
        ])
        .unwrap();
        assert_eq!(mode.factor_count(), 2);
        assert_eq!(mode.pair(1).unwrap().dst, BlendFactor::InvSrcColor);
        assert!(mode.pair(2).is_none());
    }

    #[test]
    fn hooks_replace_marked_region() {
        let base = ShaderSource::new(
            "base",
            "fn a() {}\n// #hooks\nfn hook() -> f32 { return 1.0; }\n// #end-hooks\nfn b() {}\n",
        );
        let hooks = ShaderSource::new("custom", "fn hook() -> f32 { return 2.0; }");
        let derived = base.with_hooks(&hooks).unwrap();

        assert!(derived.code.contains("return 2.0"));
        assert!(!derived.code.contains("return 1.0"));
        assert!(derived.code.starts_with("fn a() {}"));
        assert!(derived.code.ends_with("// #end-hooks\nfn b() {}\n"));
        assert_eq!(derived.label, "base+custom");
    }

    #[test]
    fn hooks_require_marker() {
        let base = ShaderSource::new("plain", "fn a() {}");
        let hooks = ShaderSource::new("custom", "");
        assert!(matches!(
            base.with_hooks(&hooks),
            Err(RenderError::ResourceInitFailure(_))
        ));
    }
}
