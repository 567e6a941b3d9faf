//! CPU reference implementation of [`GraphicsApi`].
//!
//! `SoftwareApi` keeps buffer and texture contents in memory, logs every
//! call it receives, and rasterizes the built-in render paths with the
//! fixed-function depth and blend state of the bound pass. It exists so the
//! pipeline's output can be checked pixel by pixel without a GPU.
//!
//! Conventions: render-target pixel `(x, y)` counts rows from the bottom of
//! the viewport; sampled textures are addressed with `v = 0` at their first
//! uploaded row. Custom material shaders are composed and validated, then run
//! as their base path's program.

use std::collections::HashMap;

use bytemuck::Pod;
use glam::{Mat4, Vec2, Vec3, Vec3Swizzles, Vec4, Vec4Swizzles};

use super::{
    BlendFactor, BlendMode, BlendPair, BufferDesc, BufferHandle, BufferKind, DepthMode,
    GraphicsApi, RenderPassHandle, RenderTargetHandle, ShaderHandle, ShaderSource, TextureDesc,
    TextureFormat, TextureHandle, Viewport, slot,
};
use crate::batch::{GlyphRecord, InstanceRecord, MaterialRecord};
use crate::error::{RenderError, RenderResult};
use crate::geometry::{INDEX_SIZE, Vertex};
use crate::render_pass::{PassTexture, RenderPass, RenderPassDesc, RenderPath};

/// One recorded [`GraphicsApi`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    CreateBuffer {
        buffer: BufferHandle,
        kind: BufferKind,
        size: usize,
    },
    WriteBuffer {
        buffer: BufferHandle,
        offset: usize,
        size: usize,
    },
    DestroyBuffer(BufferHandle),
    CreateTexture {
        texture: TextureHandle,
        width: u32,
        height: u32,
    },
    WriteTexture(TextureHandle),
    ResizeTexture {
        from: TextureHandle,
        to: TextureHandle,
        width: u32,
        height: u32,
    },
    DestroyTexture(TextureHandle),
    CreateShader {
        shader: ShaderHandle,
        path: RenderPath,
    },
    CreateDerivedShader {
        shader: ShaderHandle,
        base: ShaderHandle,
    },
    DestroyShader(ShaderHandle),
    CreateRenderTarget(RenderTargetHandle),
    UpdateRenderTarget(RenderTargetHandle),
    DestroyRenderTarget(RenderTargetHandle),
    CreateRenderPass(RenderPassHandle),
    DestroyRenderPass(RenderPassHandle),
    BindRenderPass {
        pass: RenderPassHandle,
        shader: ShaderHandle,
    },
    UnbindRenderPass(RenderPassHandle),
    SetUniform {
        shader: ShaderHandle,
        name: String,
    },
    BindTexture {
        shader: ShaderHandle,
        name: String,
        texture: TextureHandle,
    },
    ClearColor {
        attachment: usize,
        color: [f32; 4],
    },
    ClearDepth(f32),
    Draw {
        index_count: u32,
        base_vertex: u32,
        first_index: u32,
        instance_count: u32,
    },
    DrawQuad,
    DrawQuads(u32),
    ResizeSurface {
        width: u32,
        height: u32,
    },
}

impl ApiCall {
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            ApiCall::Draw { .. } | ApiCall::DrawQuad | ApiCall::DrawQuads(_)
        )
    }
}

struct SoftBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

struct SoftTexture {
    desc: TextureDesc,
    texels: Vec<Vec4>,
}

impl SoftTexture {
    fn new(desc: TextureDesc) -> Self {
        let len = desc.width as usize * desc.height as usize * desc.depth.max(1) as usize;
        Self {
            desc,
            texels: vec![Vec4::ZERO; len],
        }
    }

    fn index(&self, x: u32, y: u32, layer: u32) -> Option<usize> {
        if x >= self.desc.width || y >= self.desc.height || layer >= self.desc.depth.max(1) {
            return None;
        }
        let (w, h) = (self.desc.width as usize, self.desc.height as usize);
        Some(layer as usize * w * h + y as usize * w + x as usize)
    }

    fn load(&self, x: u32, y: u32, layer: u32) -> Vec4 {
        self.index(x, y, layer)
            .map_or(Vec4::ZERO, |index| self.texels[index])
    }

    fn store(&mut self, x: u32, y: u32, layer: u32, value: Vec4) {
        let format = self.desc.format;
        if let Some(index) = self.index(x, y, layer) {
            self.texels[index] = quantize(format, value);
        }
    }

    /// Nearest-neighbour sample.
    fn sample(&self, uv: Vec2, layer: u32) -> Vec4 {
        let x = (uv.x * self.desc.width as f32).floor();
        let y = (uv.y * self.desc.height as f32).floor();
        let x = x.clamp(0.0, (self.desc.width - 1) as f32) as u32;
        let y = y.clamp(0.0, (self.desc.height - 1) as f32) as u32;
        self.load(x, y, layer)
    }

    fn fill(&mut self, value: Vec4) {
        let value = quantize(self.desc.format, value);
        self.texels.fill(value);
    }
}

fn unorm8(v: f32) -> f32 {
    (v.clamp(0.0, 1.0) * 255.0).round() / 255.0
}

fn quantize(format: TextureFormat, value: Vec4) -> Vec4 {
    match format {
        TextureFormat::R8 => Vec4::new(unorm8(value.x), 0.0, 0.0, 1.0),
        TextureFormat::Rgba8 => Vec4::new(
            unorm8(value.x),
            unorm8(value.y),
            unorm8(value.z),
            unorm8(value.w),
        ),
        TextureFormat::Rgba16F => value,
        TextureFormat::Depth => Vec4::new(value.x, 0.0, 0.0, 1.0),
    }
}

fn half_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let mantissa = (bits & 0x3ff) as f32;
    match exponent {
        0 => sign * mantissa * 2f32.powi(-24),
        31 if mantissa == 0.0 => sign * f32::INFINITY,
        31 => f32::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f32.powi(exponent - 15),
    }
}

fn decode_texel(format: TextureFormat, bytes: &[u8]) -> Vec4 {
    match format {
        TextureFormat::R8 => Vec4::new(bytes[0] as f32 / 255.0, 0.0, 0.0, 1.0),
        TextureFormat::Rgba8 => Vec4::new(
            bytes[0] as f32 / 255.0,
            bytes[1] as f32 / 255.0,
            bytes[2] as f32 / 255.0,
            bytes[3] as f32 / 255.0,
        ),
        TextureFormat::Rgba16F => {
            let channel = |i: usize| half_to_f32(u16::from_le_bytes([bytes[i], bytes[i + 1]]));
            Vec4::new(channel(0), channel(2), channel(4), channel(6))
        }
        TextureFormat::Depth => Vec4::new(
            f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            0.0,
            0.0,
            1.0,
        ),
    }
}

fn blend_factor(factor: BlendFactor, src: Vec4) -> Vec4 {
    match factor {
        BlendFactor::Zero => Vec4::ZERO,
        BlendFactor::One => Vec4::ONE,
        BlendFactor::SrcColor => src,
        BlendFactor::InvSrcColor => Vec4::ONE - src,
        BlendFactor::SrcAlpha => Vec4::splat(src.w),
        BlendFactor::InvSrcAlpha => Vec4::splat(1.0 - src.w),
    }
}

fn blend(pair: BlendPair, src: Vec4, dst: Vec4) -> Vec4 {
    src * blend_factor(pair.src, src) + dst * blend_factor(pair.dst, src)
}

/// Weighted blended OIT weight from fragment alpha and depth in `[0, 1]`.
pub(crate) fn oit_weight(alpha: f32, depth: f32) -> f32 {
    let a = (alpha * 10.0).min(1.0) + 0.01;
    let d = 1.0 - depth * 0.9;
    (a * a * a * 1e8 * d * d * d).clamp(1e-2, 3e3)
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

/// Whether pixels exactly on edge `a -> b` of a counter-clockwise triangle
/// belong to it. The reversed edge of a neighbour gets the opposite answer,
/// so shared edges are covered once.
fn owns_edge(a: Vec2, b: Vec2) -> bool {
    let d = b - a;
    d.y > 0.0 || (d.y == 0.0 && d.x < 0.0)
}

/// Calls `emit(x, y, barycentrics)` for every pixel center inside the
/// triangle and the clip rectangle `[min, max)`.
fn rasterize(points: [Vec2; 3], min: (u32, u32), max: (u32, u32), mut emit: impl FnMut(u32, u32, Vec3)) {
    let area = edge(points[0], points[1], points[2]);
    if area == 0.0 {
        return;
    }
    let order = if area > 0.0 { [0, 1, 2] } else { [0, 2, 1] };
    let [p0, p1, p2] = order.map(|i| points[i]);
    let area = area.abs();

    let lo = p0.min(p1).min(p2).floor();
    let hi = p0.max(p1).max(p2).ceil();
    let x0 = (lo.x.max(min.0 as f32)) as u32;
    let y0 = (lo.y.max(min.1 as f32)) as u32;
    let x1 = (hi.x.min(max.0 as f32)).max(0.0) as u32;
    let y1 = (hi.y.min(max.1 as f32)).max(0.0) as u32;

    let inside = |e: f32, a: Vec2, b: Vec2| e > 0.0 || (e == 0.0 && owns_edge(a, b));

    for y in y0..y1 {
        for x in x0..x1 {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let e0 = edge(p1, p2, p);
            let e1 = edge(p2, p0, p);
            let e2 = edge(p0, p1, p);
            if !(inside(e0, p1, p2) && inside(e1, p2, p0) && inside(e2, p0, p1)) {
                continue;
            }
            let mut weights = [0.0; 3];
            weights[order[0]] = e0 / area;
            weights[order[1]] = e1 / area;
            weights[order[2]] = e2 / area;
            emit(x, y, Vec3::from(weights));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TextureKey {
    Surface,
    Texture(u32),
}

struct SoftShader {
    path: RenderPath,
    source: ShaderSource,
}

struct SoftTarget {
    colors: Vec<TextureHandle>,
    depth: Option<TextureHandle>,
}

#[derive(Clone)]
struct BoundPass {
    pass: RenderPassHandle,
    shader: ShaderHandle,
    path: RenderPath,
    target: Option<RenderTargetHandle>,
    viewport: Viewport,
    depth_mode: DepthMode,
    blend_mode: BlendMode,
    buffers: Vec<BufferHandle>,
    textures: Vec<PassTexture>,
}

struct Fragment {
    x: u32,
    y: u32,
    depth: f32,
    outputs: Vec<Vec4>,
}

pub struct SoftwareApi {
    calls: Vec<ApiCall>,
    next_handle: u32,
    buffers: HashMap<u32, SoftBuffer>,
    textures: HashMap<u32, SoftTexture>,
    shaders: HashMap<u32, SoftShader>,
    targets: HashMap<u32, SoftTarget>,
    passes: HashMap<u32, RenderPath>,
    uniforms: HashMap<(u32, String), Mat4>,
    surface: SoftTexture,
    bound: Option<BoundPass>,
}

impl SoftwareApi {
    /// Creates a backend whose window surface is `width` x `height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            calls: Vec::new(),
            next_handle: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            targets: HashMap::new(),
            passes: HashMap::new(),
            uniforms: HashMap::new(),
            surface: SoftTexture::new(TextureDesc::new_2d(width, height, TextureFormat::Rgba8)),
            bound: None,
        }
    }

    pub fn calls(&self) -> &[ApiCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Total bytes passed to `write_buffer` since the last
    /// [`clear_calls`](Self::clear_calls).
    pub fn uploaded_bytes(&self) -> usize {
        self.calls
            .iter()
            .map(|call| match call {
                ApiCall::WriteBuffer { size, .. } => *size,
                _ => 0,
            })
            .sum()
    }

    pub fn draw_calls(&self) -> Vec<&ApiCall> {
        self.calls.iter().filter(|call| call.is_draw()).collect()
    }

    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub fn read_texel(&self, texture: TextureHandle, x: u32, y: u32, layer: u32) -> Option<Vec4> {
        let texture = self.textures.get(&texture.0)?;
        let index = texture.index(x, y, layer)?;
        Some(texture.texels[index])
    }

    pub fn read_surface(&self, x: u32, y: u32) -> Option<Vec4> {
        let index = self.surface.index(x, y, 0)?;
        Some(self.surface.texels[index])
    }

    pub fn surface_size(&self) -> (u32, u32) {
        (self.surface.desc.width, self.surface.desc.height)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    pub fn render_pass_count(&self) -> usize {
        self.passes.len()
    }

    fn next(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn texture(&self, key: TextureKey) -> Option<&SoftTexture> {
        match key {
            TextureKey::Surface => Some(&self.surface),
            TextureKey::Texture(id) => self.textures.get(&id),
        }
    }

    fn texture_mut(&mut self, key: TextureKey) -> Option<&mut SoftTexture> {
        match key {
            TextureKey::Surface => Some(&mut self.surface),
            TextureKey::Texture(id) => self.textures.get_mut(&id),
        }
    }

    fn attachments(&self, target: Option<RenderTargetHandle>) -> (Vec<TextureKey>, Option<TextureKey>) {
        match target {
            None => (vec![TextureKey::Surface], None),
            Some(target) => match self.targets.get(&target.0) {
                Some(t) => (
                    t.colors.iter().map(|c| TextureKey::Texture(c.0)).collect(),
                    t.depth.map(|d| TextureKey::Texture(d.0)),
                ),
                None => (Vec::new(), None),
            },
        }
    }

    /// Pixel rectangle the bound pass may touch: viewport clipped to the
    /// target's extent.
    fn draw_rect(&self, bound: &BoundPass) -> ((u32, u32), (u32, u32)) {
        let (colors, depth) = self.attachments(bound.target);
        let extent = colors
            .first()
            .copied()
            .or(depth)
            .and_then(|key| self.texture(key))
            .map_or((0, 0), |t| (t.desc.width, t.desc.height));

        let vp = bound.viewport;
        let x0 = vp.x.max(0.0) as u32;
        let y0 = vp.y.max(0.0) as u32;
        let x1 = ((vp.x + vp.width).max(0.0) as u32).min(extent.0);
        let y1 = ((vp.y + vp.height).max(0.0) as u32).min(extent.1);
        ((x0, y0), (x1, y1))
    }

    fn to_window(viewport: Viewport, ndc: Vec2) -> Vec2 {
        Vec2::new(
            viewport.x + (ndc.x * 0.5 + 0.5) * viewport.width,
            viewport.y + (ndc.y * 0.5 + 0.5) * viewport.height,
        )
    }

    fn find_buffer(&self, bound: &BoundPass, kind: BufferKind, slot: Option<u32>) -> Option<&SoftBuffer> {
        bound
            .buffers
            .iter()
            .filter_map(|handle| self.buffers.get(&handle.0))
            .find(|b| b.desc.kind == kind && slot.is_none_or(|s| b.desc.slot == s))
    }

    fn read_record<T: Pod>(&self, bound: &BoundPass, slot: u32, index: usize) -> Option<T> {
        let buffer = self.find_buffer(bound, BufferKind::Storage, Some(slot))?;
        let size = std::mem::size_of::<T>();
        let bytes = buffer.data.get(index * size..(index + 1) * size)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    fn input_texture(&self, bound: &BoundPass, name: &str) -> Option<&SoftTexture> {
        let input = bound.textures.iter().find(|t| t.name == name)?;
        self.textures.get(&input.texture.0)
    }

    fn uniform(&self, shader: ShaderHandle, name: &str) -> Mat4 {
        self.uniforms
            .get(&(shader.0, name.to_string()))
            .copied()
            .unwrap_or(Mat4::IDENTITY)
    }

    fn material_color(&self, bound: &BoundPass, material: Option<&MaterialRecord>, uv: Vec2) -> Vec4 {
        let Some(material) = material else {
            return Vec4::ONE;
        };
        let mut color = Vec4::from(material.diffuse_color);
        if material.diffuse_texture_layer >= 0.0
            && let Some(atlas) = self.input_texture(bound, "TextureAtlas")
        {
            let info = Vec4::from(material.diffuse_texture_info);
            let atlas_uv = info.xy() + uv.clamp(Vec2::ZERO, Vec2::ONE) * info.zw();
            color *= atlas.sample(atlas_uv, material.diffuse_texture_layer as u32);
        }
        color
    }

    fn geometry_outputs(path: RenderPath, color: Vec4, depth: f32) -> Vec<Vec4> {
        match path {
            RenderPath::Transparent => {
                let a = color.w;
                let weight = oit_weight(a, depth);
                vec![
                    Vec4::new(color.x * a, color.y * a, color.z * a, a) * weight,
                    Vec4::new(a, 0.0, 0.0, 0.0),
                ]
            }
            _ => vec![color],
        }
    }

    /// Rasterizes one clip-space triangle, shading every covered pixel.
    fn shade_triangle(
        &self,
        bound: &BoundPass,
        clip: [Vec4; 3],
        uv: [Vec2; 3],
        shade: impl Fn(Vec2, f32) -> Option<Vec<Vec4>>,
    ) -> Vec<Fragment> {
        if clip.iter().any(|c| c.w <= f32::EPSILON) {
            return Vec::new();
        }
        let ndc = clip.map(|c| c.xyz() / c.w);
        let points = ndc.map(|p| Self::to_window(bound.viewport, p.xy()));
        let (min, max) = self.draw_rect(bound);

        let mut fragments = Vec::new();
        rasterize(points, min, max, |x, y, w| {
            let depth = w.x * ndc[0].z + w.y * ndc[1].z + w.z * ndc[2].z;
            if !(0.0..=1.0).contains(&depth) {
                return;
            }
            let uv = uv[0] * w.x + uv[1] * w.y + uv[2] * w.z;
            if let Some(outputs) = shade(uv, depth) {
                fragments.push(Fragment {
                    x,
                    y,
                    depth,
                    outputs,
                });
            }
        });
        fragments
    }

    fn write_fragments(&mut self, bound: &BoundPass, fragments: Vec<Fragment>) {
        let (colors, depth) = self.attachments(bound.target);
        let depth_mode = bound.depth_mode;

        for fragment in fragments {
            if let Some(key) = depth
                && (depth_mode.test || depth_mode.write)
                && let Some(depth_texture) = self.texture_mut(key)
            {
                let stored = depth_texture.load(fragment.x, fragment.y, 0).x;
                if depth_mode.test && fragment.depth >= stored {
                    continue;
                }
                if depth_mode.write {
                    depth_texture.store(fragment.x, fragment.y, 0, Vec4::splat(fragment.depth));
                }
            }

            for (i, (key, src)) in colors.iter().zip(&fragment.outputs).enumerate() {
                let pair = bound.blend_mode.pair(i);
                if let Some(texture) = self.texture_mut(*key) {
                    let dst = texture.load(fragment.x, fragment.y, 0);
                    let value = pair.map_or(*src, |pair| blend(pair, *src, dst));
                    texture.store(fragment.x, fragment.y, 0, value);
                }
            }
        }
    }

    fn bound_or_log(&self, operation: &str) -> Option<BoundPass> {
        let bound = self.bound.clone();
        if bound.is_none() {
            log::error!("{} without a bound render pass", operation);
        }
        bound
    }

    fn read_vertex(&self, bound: &BoundPass, first_index: u32, corner: u32, base_vertex: u32) -> Option<Vertex> {
        let indices = self.find_buffer(bound, BufferKind::Index, None)?;
        let vertices = self.find_buffer(bound, BufferKind::Vertex, None)?;
        let at = (first_index + corner) as usize * INDEX_SIZE;
        let index: u32 = bytemuck::pod_read_unaligned(indices.data.get(at..at + INDEX_SIZE)?);
        let stride = std::mem::size_of::<Vertex>();
        let at = (base_vertex + index) as usize * stride;
        Some(bytemuck::pod_read_unaligned(vertices.data.get(at..at + stride)?))
    }
}

impl GraphicsApi for SoftwareApi {
    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferHandle> {
        let buffer = BufferHandle(self.next());
        self.buffers.insert(
            buffer.0,
            SoftBuffer {
                desc: *desc,
                data: vec![0; desc.size],
            },
        );
        self.calls.push(ApiCall::CreateBuffer {
            buffer,
            kind: desc.kind,
            size: desc.size,
        });
        Ok(buffer)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) {
        self.calls.push(ApiCall::WriteBuffer {
            buffer,
            offset,
            size: data.len(),
        });
        let Some(target) = self.buffers.get_mut(&buffer.0) else {
            log::error!("write_buffer on unknown buffer {:?}", buffer);
            return;
        };
        match target.data.get_mut(offset..offset + data.len()) {
            Some(range) => range.copy_from_slice(data),
            None => log::error!(
                "write_buffer out of range: {} bytes at {} into {} byte buffer",
                data.len(),
                offset,
                target.data.len()
            ),
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
        self.calls.push(ApiCall::DestroyBuffer(buffer));
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            log::error!("Cannot create a {}x{} texture", desc.width, desc.height);
            return Err(RenderError::ResourceInitFailure(format!(
                "texture size {}x{}",
                desc.width, desc.height
            )));
        }
        let texture = TextureHandle(self.next());
        self.textures.insert(texture.0, SoftTexture::new(*desc));
        self.calls.push(ApiCall::CreateTexture {
            texture,
            width: desc.width,
            height: desc.height,
        });
        Ok(texture)
    }

    fn write_texture(&mut self, texture: TextureHandle, origin: [u32; 3], size: [u32; 2], data: &[u8]) {
        self.calls.push(ApiCall::WriteTexture(texture));
        let Some(target) = self.textures.get_mut(&texture.0) else {
            log::error!("write_texture on unknown texture {:?}", texture);
            return;
        };
        let format = target.desc.format;
        let texel = format.texel_size();
        if data.len() < size[0] as usize * size[1] as usize * texel {
            log::error!("write_texture data too short for {}x{}", size[0], size[1]);
            return;
        }
        for row in 0..size[1] {
            for col in 0..size[0] {
                let at = (row as usize * size[0] as usize + col as usize) * texel;
                let value = decode_texel(format, &data[at..at + texel]);
                target.store(origin[0] + col, origin[1] + row, origin[2], value);
            }
        }
    }

    fn resize_texture(&mut self, texture: TextureHandle, width: u32, height: u32) -> RenderResult<TextureHandle> {
        let Some(old) = self.textures.get(&texture.0) else {
            log::error!("resize_texture on unknown texture {:?}", texture);
            return Err(RenderError::NotFound(format!("texture {}", texture.0)));
        };
        if old.desc.width == width && old.desc.height == height {
            return Ok(texture);
        }
        let desc = TextureDesc {
            width,
            height,
            ..old.desc
        };
        let resized = self.create_texture(&desc)?;
        self.textures.remove(&texture.0);
        self.calls.push(ApiCall::ResizeTexture {
            from: texture,
            to: resized,
            width,
            height,
        });
        Ok(resized)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
        self.calls.push(ApiCall::DestroyTexture(texture));
    }

    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc> {
        self.textures.get(&texture.0).map(|t| t.desc)
    }

    fn create_shader(&mut self, path: RenderPath, source: &ShaderSource) -> RenderResult<ShaderHandle> {
        let shader = ShaderHandle(self.next());
        self.shaders.insert(
            shader.0,
            SoftShader {
                path,
                source: source.clone(),
            },
        );
        self.calls.push(ApiCall::CreateShader { shader, path });
        Ok(shader)
    }

    fn create_derived_shader(&mut self, base: ShaderHandle, hooks: &ShaderSource) -> RenderResult<ShaderHandle> {
        let Some(base_shader) = self.shaders.get(&base.0) else {
            log::error!("Base shader {:?} does not exist", base);
            return Err(RenderError::NotFound(format!("shader {}", base.0)));
        };
        let path = base_shader.path;
        let source = base_shader.source.with_hooks(hooks)?;

        let shader = ShaderHandle(self.next());
        self.shaders.insert(shader.0, SoftShader { path, source });
        self.calls.push(ApiCall::CreateDerivedShader { shader, base });
        Ok(shader)
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(&shader.0);
        self.uniforms.retain(|(owner, _), _| *owner != shader.0);
        self.calls.push(ApiCall::DestroyShader(shader));
    }

    fn create_render_target(
        &mut self,
        colors: &[TextureHandle],
        depth: Option<TextureHandle>,
    ) -> RenderResult<RenderTargetHandle> {
        let target = RenderTargetHandle(self.next());
        self.targets.insert(
            target.0,
            SoftTarget {
                colors: colors.to_vec(),
                depth,
            },
        );
        self.calls.push(ApiCall::CreateRenderTarget(target));
        Ok(target)
    }

    fn update_render_target(&mut self, target: RenderTargetHandle, colors: &[TextureHandle], depth: Option<TextureHandle>) {
        self.targets.insert(
            target.0,
            SoftTarget {
                colors: colors.to_vec(),
                depth,
            },
        );
        self.calls.push(ApiCall::UpdateRenderTarget(target));
    }

    fn destroy_render_target(&mut self, target: RenderTargetHandle) {
        self.targets.remove(&target.0);
        self.calls.push(ApiCall::DestroyRenderTarget(target));
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc, shader: ShaderHandle) -> RenderResult<RenderPassHandle> {
        if !self.shaders.contains_key(&shader.0) {
            log::error!("Render pass shader {:?} does not exist", shader);
            return Err(RenderError::ResourceInitFailure(format!(
                "{} pass has no shader",
                desc.render_path.name()
            )));
        }
        let pass = RenderPassHandle(self.next());
        self.passes.insert(pass.0, desc.render_path);
        self.calls.push(ApiCall::CreateRenderPass(pass));
        Ok(pass)
    }

    fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        self.passes.remove(&pass.0);
        self.calls.push(ApiCall::DestroyRenderPass(pass));
    }

    fn bind_render_pass(&mut self, pass: &RenderPass, shader: Option<ShaderHandle>) {
        let shader = shader.unwrap_or(pass.shader());
        let path = self
            .shaders
            .get(&shader.0)
            .map_or(pass.render_path(), |s| s.path);
        let desc = pass.desc();
        self.bound = Some(BoundPass {
            pass: pass.handle(),
            shader,
            path,
            target: desc.render_target,
            viewport: desc.viewport,
            depth_mode: desc.depth_mode,
            blend_mode: desc.blend_mode,
            buffers: desc.input_buffers.clone(),
            textures: desc.input_textures.clone(),
        });
        self.calls.push(ApiCall::BindRenderPass {
            pass: pass.handle(),
            shader,
        });
    }

    fn unbind_render_pass(&mut self, pass: &RenderPass) {
        if self.bound.as_ref().is_some_and(|b| b.pass == pass.handle()) {
            self.bound = None;
        }
        self.calls.push(ApiCall::UnbindRenderPass(pass.handle()));
    }

    fn set_uniform_mat4(&mut self, shader: ShaderHandle, name: &str, value: &Mat4) {
        self.uniforms.insert((shader.0, name.to_string()), *value);
        self.calls.push(ApiCall::SetUniform {
            shader,
            name: name.to_string(),
        });
    }

    fn bind_texture(&mut self, shader: ShaderHandle, name: &str, texture: TextureHandle) {
        self.calls.push(ApiCall::BindTexture {
            shader,
            name: name.to_string(),
            texture,
        });
        let Some(bound) = self.bound.as_mut() else {
            log::error!("bind_texture '{}' without a bound render pass", name);
            return;
        };
        match bound.textures.iter_mut().find(|t| t.name == name) {
            Some(input) => input.texture = texture,
            None => bound.textures.push(PassTexture::new(name, texture)),
        }
    }

    fn clear_color(&mut self, attachment: usize, color: [f32; 4]) {
        self.calls.push(ApiCall::ClearColor { attachment, color });
        let Some(bound) = self.bound_or_log("clear_color") else {
            return;
        };
        let (colors, _) = self.attachments(bound.target);
        match colors.get(attachment).and_then(|key| self.texture_mut(*key)) {
            Some(texture) => texture.fill(Vec4::from(color)),
            None => log::error!("clear_color: no color attachment {}", attachment),
        }
    }

    fn clear_depth(&mut self, depth: f32) {
        self.calls.push(ApiCall::ClearDepth(depth));
        let Some(bound) = self.bound_or_log("clear_depth") else {
            return;
        };
        let (_, depth_key) = self.attachments(bound.target);
        match depth_key.and_then(|key| self.texture_mut(key)) {
            Some(texture) => texture.fill(Vec4::splat(depth)),
            None => log::error!("clear_depth: bound target has no depth attachment"),
        }
    }

    fn draw(&mut self, index_count: u32, base_vertex: u32, first_index: u32, instance_count: u32) {
        self.calls.push(ApiCall::Draw {
            index_count,
            base_vertex,
            first_index,
            instance_count,
        });
        let Some(bound) = self.bound_or_log("draw") else {
            return;
        };
        let view_projection = self.uniform(bound.shader, "ViewProjection");

        for instance in 0..instance_count as usize {
            let Some(record) = self.read_record::<InstanceRecord>(&bound, slot::INSTANCES, instance) else {
                log::trace!("draw: no instance record {}", instance);
                continue;
            };
            let material = usize::try_from(record.material_index)
                .ok()
                .and_then(|index| self.read_record::<MaterialRecord>(&bound, slot::MATERIALS, index));
            let world = Mat4::from_cols_array(&record.world);
            let transform = if record.use_2d > 0.5 {
                world
            } else {
                view_projection * world
            };

            for triangle in 0..index_count / 3 {
                let mut clip = [Vec4::ZERO; 3];
                let mut uv = [Vec2::ZERO; 3];
                for corner in 0..3 {
                    let Some(vertex) = self.read_vertex(&bound, first_index + triangle * 3, corner, base_vertex) else {
                        log::error!("draw: vertex or index data out of range");
                        return;
                    };
                    clip[corner as usize] = transform * Vec3::from(vertex.position).extend(1.0);
                    uv[corner as usize] = Vec2::from(vertex.uv);
                }

                let fragments = self.shade_triangle(&bound, clip, uv, |uv, depth| {
                    let color = self.material_color(&bound, material.as_ref(), uv);
                    Some(Self::geometry_outputs(bound.path, color, depth))
                });
                self.write_fragments(&bound, fragments);
            }
        }
    }

    fn draw_quad(&mut self) {
        self.calls.push(ApiCall::DrawQuad);
        let Some(bound) = self.bound_or_log("draw_quad") else {
            return;
        };
        let ((x0, y0), (x1, y1)) = self.draw_rect(&bound);

        let mut fragments = Vec::new();
        for y in y0..y1 {
            for x in x0..x1 {
                let outputs = match bound.path {
                    RenderPath::CompositeTransparent => {
                        let reveal = self
                            .input_texture(&bound, "RevealageTexture")
                            .map_or(1.0, |t| t.load(x, y, 0).x);
                        // Fully revealed: nothing transparent covers this pixel.
                        if (reveal - 1.0).abs() <= 1e-4 {
                            continue;
                        }
                        let accum = self
                            .input_texture(&bound, "AccumulationTexture")
                            .map_or(Vec4::ZERO, |t| t.load(x, y, 0));
                        let average = accum.xyz() / accum.w.max(1e-5);
                        vec![average.extend(1.0 - reveal)]
                    }
                    RenderPath::CompositeFinal => vec![
                        self.input_texture(&bound, "ColorTexture")
                            .map_or(Vec4::ZERO, |t| t.load(x, y, 0)),
                    ],
                    _ => vec![Vec4::ONE],
                };
                fragments.push(Fragment {
                    x,
                    y,
                    depth: 0.0,
                    outputs,
                });
            }
        }
        self.write_fragments(&bound, fragments);
    }

    fn draw_quads(&mut self, count: u32) {
        self.calls.push(ApiCall::DrawQuads(count));
        let Some(bound) = self.bound_or_log("draw_quads") else {
            return;
        };
        let material = self.read_record::<MaterialRecord>(&bound, slot::MATERIALS, 0);
        let color = material.map_or(Vec4::ONE, |m| Vec4::from(m.diffuse_color));

        for i in 0..count as usize {
            let Some(glyph) = self.read_record::<GlyphRecord>(&bound, slot::INSTANCES, i) else {
                log::trace!("draw_quads: no glyph record {}", i);
                continue;
            };
            let [x, y, w, h] = glyph.info;
            let [u, v, uw, vh] = glyph.atlas;
            let corners = [
                (Vec2::new(x, y), Vec2::new(u, v + vh)),
                (Vec2::new(x + w, y), Vec2::new(u + uw, v + vh)),
                (Vec2::new(x, y + h), Vec2::new(u, v)),
                (Vec2::new(x + w, y + h), Vec2::new(u + uw, v)),
            ];

            for tri in [[0, 1, 2], [1, 3, 2]] {
                let clip = tri.map(|c| corners[c].0.extend(0.0).extend(1.0));
                let uv = tri.map(|c| corners[c].1);
                let fragments = self.shade_triangle(&bound, clip, uv, |uv, _| {
                    let coverage = self
                        .input_texture(&bound, "FontAtlas")
                        .map_or(1.0, |t| t.sample(uv, 0).x);
                    (coverage > 0.0).then(|| vec![color.xyz().extend(color.w * coverage)])
                });
                self.write_fragments(&bound, fragments);
            }
        }
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.calls.push(ApiCall::ResizeSurface { width, height });
        if self.surface_size() != (width, height) && width > 0 && height > 0 {
            self.surface = SoftTexture::new(TextureDesc::new_2d(width, height, TextureFormat::Rgba8));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn shared_edge_is_covered_once() {
        let mut hits = vec![0u32; 16];
        let quad = [
            Vec2::new(0.0, 0.0),
            Vec2::new(0.0, 4.0),
            Vec2::new(4.0, 0.0),
            Vec2::new(4.0, 4.0),
        ];
        for tri in [[0, 1, 2], [1, 3, 2]] {
            rasterize(tri.map(|i| quad[i]), (0, 0), (4, 4), |x, y, _| {
                hits[(y * 4 + x) as usize] += 1;
            });
        }
        assert!(hits.iter().all(|&h| h == 1), "{hits:?}");
    }

    #[test]
    fn barycentrics_follow_input_order() {
        let points = [Vec2::new(0.0, 0.0), Vec2::new(0.0, 8.0), Vec2::new(8.0, 0.0)];
        let mut first = None;
        rasterize(points, (0, 0), (8, 8), |x, y, w| {
            if (x, y) == (0, 0) {
                first = Some(w);
            }
        });
        let w = first.unwrap();
        assert!(w.x > w.y && w.x > w.z);
        assert_relative_eq!(w.x + w.y + w.z, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn blend_equations() {
        let src = Vec4::new(0.5, 0.25, 0.0, 0.5);
        let dst = Vec4::new(1.0, 1.0, 1.0, 1.0);
        let additive = BlendPair {
            src: BlendFactor::One,
            dst: BlendFactor::One,
        };
        assert_eq!(blend(additive, src, dst), src + dst);

        let reveal = BlendPair {
            src: BlendFactor::Zero,
            dst: BlendFactor::InvSrcColor,
        };
        assert_relative_eq!(blend(reveal, src, dst).x, 0.5);

        let over = BlendPair {
            src: BlendFactor::SrcAlpha,
            dst: BlendFactor::InvSrcAlpha,
        };
        assert_relative_eq!(blend(over, src, dst).y, 0.625);
    }

    #[test]
    fn formats_quantize_on_store() {
        let mut r8 = SoftTexture::new(TextureDesc::new_2d(1, 1, TextureFormat::R8));
        r8.store(0, 0, 0, Vec4::new(0.5, 0.7, 0.7, 0.7));
        let texel = r8.load(0, 0, 0);
        assert_relative_eq!(texel.x, 128.0 / 255.0);
        assert_eq!(texel.y, 0.0);

        let mut hdr = SoftTexture::new(TextureDesc::new_2d(1, 1, TextureFormat::Rgba16F));
        hdr.store(0, 0, 0, Vec4::splat(12.5));
        assert_eq!(hdr.load(0, 0, 0), Vec4::splat(12.5));
    }

    #[test]
    fn half_floats_decode() {
        assert_eq!(half_to_f32(0x3c00), 1.0);
        assert_eq!(half_to_f32(0xc000), -2.0);
        assert_eq!(half_to_f32(0x0000), 0.0);
    }

    #[test]
    fn resize_to_same_size_keeps_handle() {
        let mut api = SoftwareApi::new(4, 4);
        let texture = api
            .create_texture(&TextureDesc::new_2d(4, 4, TextureFormat::Rgba8))
            .unwrap();
        assert_eq!(api.resize_texture(texture, 4, 4).unwrap(), texture);

        let resized = api.resize_texture(texture, 8, 2).unwrap();
        assert_ne!(resized, texture);
        assert_eq!(api.texture_desc(resized).unwrap().width, 8);
        assert!(api.texture_desc(texture).is_none());
        assert_eq!(api.texture_count(), 1);
    }

    #[test]
    fn write_texture_places_rows() {
        let mut api = SoftwareApi::new(4, 4);
        let texture = api
            .create_texture(&TextureDesc::new_array(4, 4, 2, TextureFormat::R8))
            .unwrap();
        api.write_texture(texture, [1, 2, 1], [2, 1], &[255, 51]);
        assert_relative_eq!(api.read_texel(texture, 1, 2, 1).unwrap().x, 1.0);
        assert_relative_eq!(api.read_texel(texture, 2, 2, 1).unwrap().x, 0.2);
        assert_eq!(api.read_texel(texture, 1, 2, 0).unwrap().x, 0.0);
    }

    #[test]
    fn weight_falls_off_with_depth() {
        assert_relative_eq!(oit_weight(1.0, 0.0), 3e3);
        assert_relative_eq!(oit_weight(0.001, 0.0), 800.0, max_relative = 1e-3);
        assert!(oit_weight(0.001, 1.0) < oit_weight(0.001, 0.5));
    }
}
