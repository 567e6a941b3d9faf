//! Render pass descriptions.
//!
//! A [`RenderPass`] is created once from a [`RenderPassDesc`] and mutated in
//! place afterwards (viewport and input textures change on resize). The
//! backend reads the description every time the pass is bound.

use crate::error::RenderResult;
use crate::gfx::{
    BlendMode, BufferHandle, DepthMode, GraphicsApi, RenderPassHandle, RenderTargetHandle,
    ShaderHandle, ShaderSource, TextureHandle, Viewport,
};
use crate::pool::PoolHandle;
use crate::texture_atlas::AtlasTexture;

/// The built-in programs a pass can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPath {
    Opaque,
    Transparent,
    Text,
    CompositeTransparent,
    CompositeFinal,
}

impl RenderPath {
    /// Whether the path draws indexed geometry from vertex/index buffers
    /// rather than generated quads.
    pub fn uses_geometry(self) -> bool {
        matches!(self, RenderPath::Opaque | RenderPath::Transparent)
    }

    pub fn name(self) -> &'static str {
        match self {
            RenderPath::Opaque => "opaque",
            RenderPath::Transparent => "transparent",
            RenderPath::Text => "text",
            RenderPath::CompositeTransparent => "composite_transparent",
            RenderPath::CompositeFinal => "composite_final",
        }
    }
}

/// A texture a pass samples, bound under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassTexture {
    pub name: String,
    pub texture: TextureHandle,
}

impl PassTexture {
    pub fn new(name: impl Into<String>, texture: TextureHandle) -> Self {
        Self {
            name: name.into(),
            texture,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderPassDesc {
    pub render_path: RenderPath,
    pub shader: ShaderSource,
    /// `None` renders to the window surface.
    pub render_target: Option<RenderTargetHandle>,
    pub viewport: Viewport,
    pub depth_mode: DepthMode,
    pub blend_mode: BlendMode,
    pub input_buffers: Vec<BufferHandle>,
    pub input_textures: Vec<PassTexture>,
    /// Atlas entries whose records are appended after each batch.
    pub input_atlas_textures: Vec<PoolHandle<AtlasTexture>>,
}

impl RenderPassDesc {
    pub fn new(render_path: RenderPath, shader: ShaderSource) -> Self {
        Self {
            render_path,
            shader,
            render_target: None,
            viewport: Viewport::default(),
            depth_mode: DepthMode::DISABLED,
            blend_mode: BlendMode::none(),
            input_buffers: Vec::new(),
            input_textures: Vec::new(),
            input_atlas_textures: Vec::new(),
        }
    }

    pub fn render_target(mut self, target: RenderTargetHandle) -> Self {
        self.render_target = Some(target);
        self
    }

    pub fn viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }

    pub fn depth_mode(mut self, depth_mode: DepthMode) -> Self {
        self.depth_mode = depth_mode;
        self
    }

    pub fn blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }

    pub fn input_buffer(mut self, buffer: BufferHandle) -> Self {
        self.input_buffers.push(buffer);
        self
    }

    pub fn input_texture(mut self, name: impl Into<String>, texture: TextureHandle) -> Self {
        self.input_textures.push(PassTexture::new(name, texture));
        self
    }
}

#[derive(Debug)]
pub struct RenderPass {
    pub(crate) handle: RenderPassHandle,
    pub(crate) shader: ShaderHandle,
    pub(crate) desc: RenderPassDesc,
}

impl RenderPass {
    /// Compiles the pass shader and creates the backend pass.
    pub fn new<A: GraphicsApi>(api: &mut A, desc: RenderPassDesc) -> RenderResult<Self> {
        let shader = api.create_shader(desc.render_path, &desc.shader)?;
        let handle = match api.create_render_pass(&desc, shader) {
            Ok(handle) => handle,
            Err(e) => {
                api.destroy_shader(shader);
                return Err(e);
            }
        };
        log::debug!("Created {} render pass", desc.render_path.name());
        Ok(Self {
            handle,
            shader,
            desc,
        })
    }

    pub fn destroy<A: GraphicsApi>(self, api: &mut A) {
        api.destroy_render_pass(self.handle);
        api.destroy_shader(self.shader);
    }

    pub fn handle(&self) -> RenderPassHandle {
        self.handle
    }

    pub fn shader(&self) -> ShaderHandle {
        self.shader
    }

    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }

    pub fn render_path(&self) -> RenderPath {
        self.desc.render_path
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.desc.viewport = viewport;
    }

    /// Points input texture `index` at a new texture, keeping its name.
    pub fn set_input_texture(&mut self, index: usize, texture: TextureHandle) {
        if let Some(input) = self.desc.input_textures.get_mut(index) {
            input.texture = texture;
        }
    }

    pub fn input_texture(&self, name: &str) -> Option<TextureHandle> {
        self.desc
            .input_textures
            .iter()
            .find(|input| input.name == name)
            .map(|input| input.texture)
    }

    pub fn set_input_atlas_textures(&mut self, textures: Vec<PoolHandle<AtlasTexture>>) {
        self.desc.input_atlas_textures = textures;
    }
}
