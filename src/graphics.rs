//! The render core.
//!
//! [`Graphics`] owns every GPU resource of the pipeline: the shared geometry
//! buffers, the per-category batch buffers, the material registry, the
//! texture atlas, loaded fonts, the frame attachments and the five built-in
//! render passes. A frame is driven by calling, in order:
//!
//! 1. [`write_objects_to_opaque_buffers`](Graphics::write_objects_to_opaque_buffers)
//!    and [`write_objects_to_transparent_buffers`](Graphics::write_objects_to_transparent_buffers)
//! 2. [`clear_render_passes`](Graphics::clear_render_passes)
//! 3. [`draw_geometry_opaque`](Graphics::draw_geometry_opaque) and
//!    [`draw_geometry_transparent`](Graphics::draw_geometry_transparent)
//! 4. [`draw_texts`](Graphics::draw_texts)
//! 5. [`composite_transparent`](Graphics::composite_transparent), then
//!    [`composite_final`](Graphics::composite_final)
//!
//! Transparency uses weighted blended order-independent transparency: the
//! transparent pass accumulates premultiplied, weighted color into an RGBA16F
//! target and multiplies coverage into an R8 revealage target, and the
//! transparent composite resolves both over the opaque color.

use std::path::Path;

use glam::{Vec2, Vec4};

use crate::arena::Arena;
use crate::batch::{
    AtlasTextureRecord, BatchStats, CategoryBatch, GlyphRecord, InstanceRecord, MaterialRecord,
    TextBatch, layout_text,
};
use crate::camera::Camera;
use crate::config::GraphicsConfig;
use crate::error::{RenderError, RenderResult};
use crate::font::{Font, FontId};
use crate::geometry::{GeometryDescriptor, GeometryId, GeometryRegistry, Primitive, VertexFormat};
use crate::gfx::{
    BlendFactor, BlendMode, DepthMode, GraphicsApi, RenderTargetHandle, ShaderHandle,
    ShaderSource, TextureDesc, TextureFormat, TextureHandle, Viewport,
};
use crate::material::{Material, MaterialDesc, MaterialRegistry};
use crate::object::GameObject;
use crate::pool::PoolHandle;
use crate::render_pass::{RenderPass, RenderPassDesc, RenderPath};
use crate::texture_atlas::{AtlasTexture, TextureAtlas};

const OPAQUE_SHADER: &str = include_str!("shaders/opaque.wgsl");
const TRANSPARENT_SHADER: &str = include_str!("shaders/transparent.wgsl");
const TEXT_SHADER: &str = include_str!("shaders/text.wgsl");
const COMPOSITE_TRANSPARENT_SHADER: &str = include_str!("shaders/composite_transparent.wgsl");
const COMPOSITE_FINAL_SHADER: &str = include_str!("shaders/composite_final.wgsl");

/// Built-in program source for a render path.
pub fn base_shader_source(path: RenderPath) -> ShaderSource {
    let code = match path {
        RenderPath::Opaque => OPAQUE_SHADER,
        RenderPath::Transparent => TRANSPARENT_SHADER,
        RenderPath::Text => TEXT_SHADER,
        RenderPath::CompositeTransparent => COMPOSITE_TRANSPARENT_SHADER,
        RenderPath::CompositeFinal => COMPOSITE_FINAL_SHADER,
    };
    ShaderSource::new(path.name(), code)
}

/// A queued geometry draw for [`Graphics::render_frame`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryDraw {
    /// [`RenderPath::Opaque`] or [`RenderPath::Transparent`].
    pub path: RenderPath,
    pub geometry: GeometryId,
    /// Program to draw with instead of the pass's own.
    pub shader: Option<ShaderHandle>,
}

impl GeometryDraw {
    pub fn opaque(geometry: GeometryId) -> Self {
        Self {
            path: RenderPath::Opaque,
            geometry,
            shader: None,
        }
    }

    pub fn transparent(geometry: GeometryId) -> Self {
        Self {
            path: RenderPath::Transparent,
            geometry,
            shader: None,
        }
    }

    pub fn with_shader(mut self, shader: ShaderHandle) -> Self {
        self.shader = Some(shader);
        self
    }
}

struct Attachments {
    color: TextureHandle,
    accumulation: TextureHandle,
    revealage: TextureHandle,
    depth: TextureHandle,
}

struct Targets {
    /// Color + depth.
    opaque: RenderTargetHandle,
    /// Accumulation + revealage, sharing the opaque depth.
    transparent: RenderTargetHandle,
    /// Color without depth.
    text: RenderTargetHandle,
}

struct Passes {
    opaque: RenderPass,
    transparent: RenderPass,
    text: RenderPass,
    composite_transparent: RenderPass,
    composite_final: RenderPass,
}

impl Passes {
    fn get(&self, path: RenderPath) -> &RenderPass {
        match path {
            RenderPath::Opaque => &self.opaque,
            RenderPath::Transparent => &self.transparent,
            RenderPath::Text => &self.text,
            RenderPath::CompositeTransparent => &self.composite_transparent,
            RenderPath::CompositeFinal => &self.composite_final,
        }
    }

    fn get_mut(&mut self, path: RenderPath) -> &mut RenderPass {
        match path {
            RenderPath::Opaque => &mut self.opaque,
            RenderPath::Transparent => &mut self.transparent,
            RenderPath::Text => &mut self.text,
            RenderPath::CompositeTransparent => &mut self.composite_transparent,
            RenderPath::CompositeFinal => &mut self.composite_final,
        }
    }

    fn iter_mut(&mut self) -> [&mut RenderPass; 5] {
        [
            &mut self.opaque,
            &mut self.transparent,
            &mut self.text,
            &mut self.composite_transparent,
            &mut self.composite_final,
        ]
    }
}

pub struct Graphics<A: GraphicsApi> {
    api: A,
    config: GraphicsConfig,
    arena: Arena,
    geometry: GeometryRegistry,
    materials: MaterialRegistry,
    atlas: TextureAtlas,
    fonts: Vec<Font>,
    opaque: CategoryBatch,
    transparent: CategoryBatch,
    text: TextBatch,
    attachments: Attachments,
    targets: Targets,
    passes: Passes,
    width: u32,
    height: u32,
}

impl<A: GraphicsApi> Graphics<A> {
    /// Sizes every buffer from `config` and builds the five passes for a
    /// drawable of `config.window_size()`.
    pub fn new(mut api: A, config: GraphicsConfig) -> RenderResult<Self> {
        config.validate()?;
        let (width, height) = config.window_size();

        let mut arena = Arena::new(Self::arena_capacity(&config), config.memory_alignment)?;
        let geometry = GeometryRegistry::new(
            &mut api,
            &mut arena,
            config.vertex_buffer_size,
            config.index_buffer_size,
        )?;
        let opaque = CategoryBatch::new(
            &mut api,
            &mut arena,
            RenderPath::Opaque,
            config.max_opaque_instance_count,
            config.max_material_count,
            config.max_atlas_texture_count,
        )?;
        let transparent = CategoryBatch::new(
            &mut api,
            &mut arena,
            RenderPath::Transparent,
            config.max_transparent_instance_count,
            config.max_material_count,
            config.max_atlas_texture_count,
        )?;
        let text = TextBatch::new(&mut api, &mut arena, config.max_text_glyph_count)?;
        let atlas = TextureAtlas::new(
            &mut api,
            config.atlas_width,
            config.atlas_height,
            config.atlas_depth,
            config.max_atlas_texture_count,
        )?;

        let attachments = Attachments {
            color: api.create_texture(&TextureDesc::new_2d(width, height, TextureFormat::Rgba8))?,
            accumulation: api
                .create_texture(&TextureDesc::new_2d(width, height, TextureFormat::Rgba16F))?,
            revealage: api.create_texture(&TextureDesc::new_2d(width, height, TextureFormat::R8))?,
            depth: api.create_texture(&TextureDesc::new_2d(width, height, TextureFormat::Depth))?,
        };
        let targets = Targets {
            opaque: api.create_render_target(&[attachments.color], Some(attachments.depth))?,
            transparent: api.create_render_target(
                &[attachments.accumulation, attachments.revealage],
                Some(attachments.depth),
            )?,
            text: api.create_render_target(&[attachments.color], None)?,
        };

        let viewport = Viewport::new(width, height);
        let geometry_inputs = |desc: RenderPassDesc, batch: &CategoryBatch| {
            let desc = desc
                .input_buffer(geometry.vertex_buffer())
                .input_buffer(geometry.index_buffer());
            batch
                .buffers()
                .into_iter()
                .fold(desc, |desc, buffer| desc.input_buffer(buffer))
                .input_texture("TextureAtlas", atlas.texture())
        };

        let opaque_desc = geometry_inputs(
            RenderPassDesc::new(RenderPath::Opaque, base_shader_source(RenderPath::Opaque))
                .render_target(targets.opaque)
                .viewport(viewport)
                .depth_mode(DepthMode::TEST_WRITE)
                .blend_mode(BlendMode::from_pairs(&[(BlendFactor::One, BlendFactor::Zero)])?),
            &opaque,
        );
        let transparent_desc = geometry_inputs(
            RenderPassDesc::new(
                RenderPath::Transparent,
                base_shader_source(RenderPath::Transparent),
            )
            .render_target(targets.transparent)
            .viewport(viewport)
            .depth_mode(DepthMode::TEST_ONLY)
            .blend_mode(BlendMode::from_pairs(&[
                (BlendFactor::One, BlendFactor::One),
                (BlendFactor::Zero, BlendFactor::InvSrcColor),
            ])?),
            &transparent,
        );
        let [glyph_buffer, text_material_buffer] = text.buffers();
        let text_desc = RenderPassDesc::new(RenderPath::Text, base_shader_source(RenderPath::Text))
            .render_target(targets.text)
            .viewport(viewport)
            .blend_mode(BlendMode::from_pairs(&[(
                BlendFactor::SrcAlpha,
                BlendFactor::InvSrcAlpha,
            )])?)
            .input_buffer(glyph_buffer)
            .input_buffer(text_material_buffer);
        let composite_transparent_desc = RenderPassDesc::new(
            RenderPath::CompositeTransparent,
            base_shader_source(RenderPath::CompositeTransparent),
        )
        .render_target(targets.opaque)
        .viewport(viewport)
        .blend_mode(BlendMode::from_pairs(&[(
            BlendFactor::SrcAlpha,
            BlendFactor::InvSrcAlpha,
        )])?)
        .input_texture("AccumulationTexture", attachments.accumulation)
        .input_texture("RevealageTexture", attachments.revealage);
        let composite_final_desc = RenderPassDesc::new(
            RenderPath::CompositeFinal,
            base_shader_source(RenderPath::CompositeFinal),
        )
        .viewport(viewport)
        .blend_mode(BlendMode::from_pairs(&[(BlendFactor::One, BlendFactor::Zero)])?)
        .input_texture("ColorTexture", attachments.color);

        let passes = Passes {
            opaque: RenderPass::new(&mut api, opaque_desc)?,
            transparent: RenderPass::new(&mut api, transparent_desc)?,
            text: RenderPass::new(&mut api, text_desc)?,
            composite_transparent: RenderPass::new(&mut api, composite_transparent_desc)?,
            composite_final: RenderPass::new(&mut api, composite_final_desc)?,
        };

        log::debug!(
            "Graphics initialized: {}x{}, arena {} bytes",
            width,
            height,
            arena.capacity()
        );

        Ok(Self {
            api,
            materials: MaterialRegistry::new(config.max_material_count),
            config,
            arena,
            geometry,
            atlas,
            fonts: Vec::new(),
            opaque,
            transparent,
            text,
            attachments,
            targets,
            passes,
            width,
            height,
        })
    }

    /// Arena bytes needed for every staging block `config` asks for.
    pub fn arena_capacity(config: &GraphicsConfig) -> usize {
        let instance = size_of::<InstanceRecord>();
        let material = size_of::<MaterialRecord>();
        let atlas = size_of::<AtlasTextureRecord>();
        let sizes = [
            config.vertex_buffer_size,
            config.index_buffer_size,
            config.max_opaque_instance_count * instance,
            config.max_material_count * material,
            config.max_atlas_texture_count * atlas,
            config.max_transparent_instance_count * instance,
            config.max_material_count * material,
            config.max_atlas_texture_count * atlas,
            config.max_text_glyph_count * size_of::<GlyphRecord>(),
            material,
        ];
        Arena::required_capacity(&sizes, config.memory_alignment)
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn api_mut(&mut self) -> &mut A {
        &mut self.api
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    // Geometry

    pub fn create_geometry(
        &mut self,
        format: VertexFormat,
        vertices: &[u8],
        indices: &[u8],
    ) -> RenderResult<GeometryId> {
        self.geometry
            .create_geometry(&mut self.api, &mut self.arena, format, vertices, indices)
    }

    pub fn create_primitive(&mut self, primitive: &Primitive) -> RenderResult<GeometryId> {
        self.geometry
            .create_primitive(&mut self.api, &mut self.arena, primitive)
    }

    pub fn create_model(&mut self, path: impl AsRef<Path>) -> RenderResult<GeometryId> {
        let primitive = Primitive::from_file(path)?;
        self.create_primitive(&primitive)
    }

    pub fn geometry(&self, id: GeometryId) -> Option<&GeometryDescriptor> {
        self.geometry.get(id)
    }

    pub fn destroy_geometry(&mut self, id: GeometryId) -> bool {
        self.geometry.destroy_geometry(id).is_some()
    }

    pub fn clear_geometry_buffer(&mut self) {
        self.geometry.clear_geometry_buffer();
    }

    pub fn geometry_registry(&self) -> &GeometryRegistry {
        &self.geometry
    }

    // Materials

    /// Stores a material. A custom shader is derived from the opaque or
    /// transparent base program, as its render path says.
    pub fn create_material(&mut self, id: &str, desc: MaterialDesc) -> RenderResult<PoolHandle<Material>> {
        let base = desc.custom_shader.as_ref().and_then(|custom| match custom.render_path {
            RenderPath::Opaque | RenderPath::Transparent => {
                Some(self.passes.get(custom.render_path).shader())
            }
            _ => None,
        });
        self.materials.create(&mut self.api, id, desc, base)
    }

    pub fn destroy_material(&mut self, id: &str) -> bool {
        self.materials.destroy(&mut self.api, id)
    }

    pub fn find_material(&self, id: &str) -> Option<&Material> {
        self.materials.find(id)
    }

    pub fn materials(&self) -> &MaterialRegistry {
        &self.materials
    }

    // Texture atlas

    pub fn create_texture(
        &mut self,
        id: &str,
        width: u32,
        height: u32,
        channels: u32,
        data: &[u8],
    ) -> RenderResult<PoolHandle<AtlasTexture>> {
        self.atlas
            .create_texture(&mut self.api, id, width, height, channels, data)
    }

    pub fn create_texture_from_file(
        &mut self,
        id: &str,
        path: impl AsRef<Path>,
    ) -> RenderResult<PoolHandle<AtlasTexture>> {
        self.atlas.create_texture_from_file(&mut self.api, id, path)
    }

    pub fn destroy_texture(&mut self, id: &str) -> bool {
        self.atlas.destroy_texture(id)
    }

    pub fn atlas(&self) -> &TextureAtlas {
        &self.atlas
    }

    /// Sets the atlas entries whose records follow a geometry batch.
    pub fn set_pass_atlas_textures(&mut self, path: RenderPath, textures: Vec<PoolHandle<AtlasTexture>>) {
        self.passes.get_mut(path).set_input_atlas_textures(textures);
    }

    // Fonts

    pub fn create_font(&mut self, data: &[u8], size: f32) -> RenderResult<FontId> {
        let font = Font::from_ttf_bytes(&mut self.api, data, size)?;
        Ok(self.add_font(font))
    }

    pub fn load_font(&mut self, path: impl AsRef<Path>, size: f32) -> RenderResult<FontId> {
        let font = Font::load(&mut self.api, path, size)?;
        Ok(self.add_font(font))
    }

    /// Takes ownership of a font built against this core's API.
    pub fn add_font(&mut self, font: Font) -> FontId {
        self.fonts.push(font);
        FontId(self.fonts.len() - 1)
    }

    pub fn font(&self, id: FontId) -> Option<&Font> {
        self.fonts.get(id.0)
    }

    // Render passes

    pub fn render_pass(&self, path: RenderPath) -> &RenderPass {
        self.passes.get(path)
    }

    /// Creates an extra pass, e.g. an alternative program drawing into the
    /// opaque target.
    pub fn create_render_pass(&mut self, desc: RenderPassDesc) -> RenderResult<RenderPass> {
        RenderPass::new(&mut self.api, desc)
    }

    pub fn destroy_render_pass(&mut self, pass: RenderPass) {
        pass.destroy(&mut self.api);
    }

    /// Describes a pass drawing geometry into the opaque target with the
    /// opaque batch's inputs and `shader` as its program.
    pub fn opaque_pass_desc(&self, shader: ShaderSource) -> RenderPassDesc {
        let mut desc = self.passes.opaque.desc().clone();
        desc.shader = shader;
        desc
    }

    // Per frame

    pub fn write_objects_to_opaque_buffers(&mut self, objects: &[GameObject]) -> RenderResult<BatchStats> {
        let atlas_inputs = &self.passes.opaque.desc().input_atlas_textures;
        self.opaque.write(
            &mut self.api,
            &mut self.arena,
            objects,
            &self.materials,
            &self.atlas,
            atlas_inputs,
        )
    }

    pub fn write_objects_to_transparent_buffers(
        &mut self,
        objects: &[GameObject],
    ) -> RenderResult<BatchStats> {
        let atlas_inputs = &self.passes.transparent.desc().input_atlas_textures;
        self.transparent.write(
            &mut self.api,
            &mut self.arena,
            objects,
            &self.materials,
            &self.atlas,
            atlas_inputs,
        )
    }

    /// Draws `geometry` once per opaque instance, optionally with a custom
    /// program (usually a material's) in place of the pass's own.
    pub fn draw_geometry_opaque(
        &mut self,
        geometry: GeometryId,
        camera: &Camera,
        shader: Option<ShaderHandle>,
    ) -> RenderResult<()> {
        let count = self.opaque.instance_count();
        self.draw_geometry(RenderPath::Opaque, geometry, camera, shader, count)
    }

    /// Draws `geometry` once per transparent instance into the accumulation
    /// and revealage targets. Compositing is a separate step.
    pub fn draw_geometry_transparent(
        &mut self,
        geometry: GeometryId,
        camera: &Camera,
        shader: Option<ShaderHandle>,
    ) -> RenderResult<()> {
        let count = self.transparent.instance_count();
        self.draw_geometry(RenderPath::Transparent, geometry, camera, shader, count)
    }

    fn draw_geometry(
        &mut self,
        path: RenderPath,
        geometry: GeometryId,
        camera: &Camera,
        shader: Option<ShaderHandle>,
        instance_count: u32,
    ) -> RenderResult<()> {
        let descriptor = self.geometry_descriptor(geometry)?;
        let view_projection = camera.view_projection(self.aspect());
        let pass = self.passes.get(path);
        let program = shader.unwrap_or(pass.shader());

        self.api.bind_render_pass(pass, shader);
        self.api
            .set_uniform_mat4(program, "ViewProjection", &view_projection);
        self.api.draw(
            descriptor.index_count,
            descriptor.base_vertex,
            descriptor.first_index(),
            instance_count,
        );
        self.api.unbind_render_pass(pass);
        Ok(())
    }

    /// Draws `geometry` with a caller-owned pass, once per instance of the
    /// batch matching `category`.
    pub fn draw_geometry_with_pass(
        &mut self,
        pass: &RenderPass,
        category: RenderPath,
        geometry: GeometryId,
        camera: &Camera,
    ) -> RenderResult<()> {
        let descriptor = self.geometry_descriptor(geometry)?;
        let instance_count = match category {
            RenderPath::Opaque => self.opaque.instance_count(),
            _ => self.transparent.instance_count(),
        };
        let view_projection = camera.view_projection(self.aspect());

        self.api.bind_render_pass(pass, None);
        self.api
            .set_uniform_mat4(pass.shader(), "ViewProjection", &view_projection);
        self.api.draw(
            descriptor.index_count,
            descriptor.base_vertex,
            descriptor.first_index(),
            instance_count,
        );
        self.api.unbind_render_pass(pass);
        Ok(())
    }

    fn geometry_descriptor(&self, geometry: GeometryId) -> RenderResult<GeometryDescriptor> {
        self.geometry.get(geometry).copied().ok_or_else(|| {
            log::error!("Geometry {:?} does not exist", geometry);
            RenderError::NotFound(format!("geometry {geometry:?}"))
        })
    }

    /// Draws every visible text object, one instanced quad draw each.
    pub fn draw_texts(&mut self, objects: &[GameObject]) -> RenderResult<()> {
        let window = Vec2::new(self.width as f32, self.height as f32);

        for object in objects.iter().filter(|o| o.visible) {
            let Some(text) = &object.text else {
                continue;
            };
            let Some(font) = self.fonts.get(text.font.0) else {
                log::trace!("Object '{}' font does not exist", object.id);
                continue;
            };

            let glyphs = layout_text(font, &text.string, &object.transform, window);
            let color = object
                .material
                .and_then(|handle| self.materials.get(handle))
                .map_or(Vec4::ONE, |m| m.diffuse_color);
            let count = self
                .text
                .write(&mut self.api, &mut self.arena, &glyphs, color)?;

            let pass = &self.passes.text;
            self.api.bind_render_pass(pass, None);
            self.api
                .bind_texture(pass.shader(), "FontAtlas", font.texture());
            self.api.draw_quads(count);
            self.api.unbind_render_pass(pass);
        }
        Ok(())
    }

    /// Runs one whole frame: batch both categories, clear, draw `draws` in
    /// order, draw texts, then composite transparency and present.
    pub fn render_frame(
        &mut self,
        objects: &[GameObject],
        camera: &Camera,
        draws: &[GeometryDraw],
    ) -> RenderResult<()> {
        let opaque = self.write_objects_to_opaque_buffers(objects)?;
        let transparent = self.write_objects_to_transparent_buffers(objects)?;
        log::trace!(
            "Frame: {} opaque, {} transparent instances, {} draws",
            opaque.instances,
            transparent.instances,
            draws.len()
        );

        self.clear_render_passes(self.config.clear_color, 1.0);
        for draw in draws {
            match draw.path {
                RenderPath::Opaque => self.draw_geometry_opaque(draw.geometry, camera, draw.shader)?,
                RenderPath::Transparent => {
                    self.draw_geometry_transparent(draw.geometry, camera, draw.shader)?
                }
                other => log::error!("{} is not a geometry path", other.name()),
            }
        }
        self.draw_texts(objects)?;
        self.composite_transparent();
        self.composite_final();
        Ok(())
    }

    /// Resolves accumulation and revealage over the opaque color.
    pub fn composite_transparent(&mut self) {
        let pass = &self.passes.composite_transparent;
        self.api.bind_render_pass(pass, None);
        self.api.draw_quad();
        self.api.unbind_render_pass(pass);
    }

    /// Copies the opaque color to the window surface.
    pub fn composite_final(&mut self) {
        let pass = &self.passes.composite_final;
        self.api.bind_render_pass(pass, None);
        self.api.draw_quad();
        self.api.unbind_render_pass(pass);
    }

    /// Clears one attachment and/or the depth buffer of a built-in pass.
    pub fn clear_render_pass(
        &mut self,
        path: RenderPath,
        color: Option<(usize, [f32; 4])>,
        depth: Option<f32>,
    ) {
        let pass = self.passes.get(path);
        self.api.bind_render_pass(pass, None);
        if let Some((attachment, color)) = color {
            self.api.clear_color(attachment, color);
        }
        if let Some(depth) = depth {
            self.api.clear_depth(depth);
        }
        self.api.unbind_render_pass(pass);
    }

    /// Clears every frame attachment: opaque and text color to `color`,
    /// depth to `depth`, accumulation to 0 and revealage to 1.
    pub fn clear_render_passes(&mut self, color: [f32; 4], depth: f32) {
        self.clear_render_pass(RenderPath::Opaque, Some((0, color)), Some(depth));
        self.clear_render_pass(RenderPath::Transparent, Some((0, [0.0; 4])), None);
        self.clear_render_pass(RenderPath::Transparent, Some((1, [1.0; 4])), None);
        self.clear_render_pass(RenderPath::Text, Some((0, color)), None);
    }

    /// Resizes the frame attachments and every pass viewport. Calling it
    /// with the current size changes nothing.
    pub fn resize_render_targets(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }

        self.api.resize_surface(width, height);
        let a = &mut self.attachments;
        a.color = self.api.resize_texture(a.color, width, height)?;
        a.accumulation = self.api.resize_texture(a.accumulation, width, height)?;
        a.revealage = self.api.resize_texture(a.revealage, width, height)?;
        a.depth = self.api.resize_texture(a.depth, width, height)?;

        self.api
            .update_render_target(self.targets.opaque, &[a.color], Some(a.depth));
        self.api.update_render_target(
            self.targets.transparent,
            &[a.accumulation, a.revealage],
            Some(a.depth),
        );
        self.api
            .update_render_target(self.targets.text, &[a.color], None);

        let viewport = Viewport::new(width, height);
        for pass in self.passes.iter_mut() {
            pass.set_viewport(viewport);
        }
        self.passes
            .composite_transparent
            .set_input_texture(0, a.accumulation);
        self.passes
            .composite_transparent
            .set_input_texture(1, a.revealage);
        self.passes.composite_final.set_input_texture(0, a.color);

        self.width = width;
        self.height = height;
        log::debug!("Render targets resized to {}x{}", width, height);
        Ok(())
    }

    pub fn color_attachment(&self) -> TextureHandle {
        self.attachments.color
    }

    pub fn accumulation_attachment(&self) -> TextureHandle {
        self.attachments.accumulation
    }

    pub fn revealage_attachment(&self) -> TextureHandle {
        self.attachments.revealage
    }

    pub fn depth_attachment(&self) -> TextureHandle {
        self.attachments.depth
    }

    /// Releases every GPU resource and returns the API.
    pub fn destroy(mut self) -> A {
        let api = &mut self.api;
        let Passes {
            opaque,
            transparent,
            text,
            composite_transparent,
            composite_final,
        } = self.passes;
        for pass in [composite_final, composite_transparent, text, transparent, opaque] {
            pass.destroy(api);
        }
        api.destroy_render_target(self.targets.text);
        api.destroy_render_target(self.targets.transparent);
        api.destroy_render_target(self.targets.opaque);
        for texture in [
            self.attachments.color,
            self.attachments.accumulation,
            self.attachments.revealage,
            self.attachments.depth,
        ] {
            api.destroy_texture(texture);
        }
        for font in self.fonts {
            font.destroy(api);
        }
        self.materials.destroy_all(api);
        self.atlas.destroy(api);
        self.text.destroy(api);
        self.transparent.destroy(api);
        self.opaque.destroy(api);
        self.geometry.destroy(api);
        self.api
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::{ApiCall, SoftwareApi};
    use crate::material::CustomShader;

    fn graphics() -> Graphics<SoftwareApi> {
        let config = GraphicsConfig::default()
            .size(8, 8)
            .with_capacity(16)
            .atlas_size(16, 16, 2);
        Graphics::new(SoftwareApi::new(8, 8), config).unwrap()
    }

    #[test]
    fn builds_five_passes() {
        let graphics = graphics();
        assert_eq!(graphics.api().render_pass_count(), 5);
        assert_eq!(graphics.api().shader_count(), 5);
        let transparent = graphics.render_pass(RenderPath::Transparent).desc();
        assert_eq!(transparent.blend_mode.factor_count(), 2);
        assert_eq!(transparent.depth_mode, DepthMode::TEST_ONLY);
        assert!(
            graphics
                .render_pass(RenderPath::CompositeFinal)
                .desc()
                .render_target
                .is_none()
        );
    }

    #[test]
    fn arena_fits_every_block() {
        let graphics = graphics();
        assert!(graphics.arena.used() <= graphics.arena.capacity());
    }

    #[test]
    fn custom_material_shader_derives_from_path() {
        let mut graphics = graphics();
        let hooks = ShaderSource::new("tint", "fn hook_color(c: vec4<f32>) -> vec4<f32> { return c; }");
        graphics
            .create_material(
                "tinted",
                MaterialDesc::new().custom_shader(CustomShader::new(RenderPath::Transparent, hooks.clone())),
            )
            .unwrap();
        let base = graphics.render_pass(RenderPath::Transparent).shader();
        assert!(graphics.api().calls().iter().any(|c| matches!(
            c,
            ApiCall::CreateDerivedShader { base: b, .. } if *b == base
        )));

        let result = graphics.create_material(
            "bad",
            MaterialDesc::new().custom_shader(CustomShader::new(RenderPath::Text, hooks)),
        );
        assert!(matches!(result, Err(RenderError::ResourceInitFailure(_))));
    }

    #[test]
    fn missing_geometry_is_reported() {
        let mut graphics = graphics();
        let id = graphics.create_primitive(&Primitive::quad()).unwrap();
        graphics.destroy_geometry(id);
        assert!(matches!(
            graphics.draw_geometry_opaque(id, &Camera::new(), None),
            Err(RenderError::NotFound(_))
        ));
    }

    #[test]
    fn destroy_releases_everything() {
        let graphics = graphics();
        let api = graphics.destroy();
        assert_eq!(api.buffer_count(), 0);
        assert_eq!(api.texture_count(), 0);
        assert_eq!(api.shader_count(), 0);
        assert_eq!(api.render_pass_count(), 0);
    }
}
