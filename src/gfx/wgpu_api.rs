//! [`GraphicsApi`] on top of wgpu.
//!
//! Every draw and clear is recorded into its own encoder and submitted right
//! away, so the call order of the render core is the GPU order. Pipelines are
//! built lazily the first time a (pass, shader) pair draws, and bind groups
//! are rebuilt per draw from whatever the bound pass currently references.
//! The window surface frame is acquired when a surface pass is bound and
//! presented when that pass is unbound.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Mat4;
use winit::window::Window;

use super::context::GpuContext;
use super::{
    BlendFactor, BlendMode, BufferDesc, BufferHandle, BufferKind, DepthMode, GraphicsApi,
    RenderPassHandle, RenderTargetHandle, ShaderHandle, ShaderSource, TextureDesc,
    TextureDimension, TextureFormat, TextureHandle, Viewport, slot,
};
use crate::error::{RenderError, RenderResult};
use crate::geometry::Vertex;
use crate::render_pass::{PassTexture, RenderPass, RenderPassDesc, RenderPath};

const GEOMETRY_BUFFERS: &[wgpu::VertexBufferLayout<'static>] = &[Vertex::LAYOUT];

/// Storage slots each path binds in group 1.
fn storage_slots(path: RenderPath) -> &'static [u32] {
    match path {
        RenderPath::Opaque | RenderPath::Transparent => {
            &[slot::INSTANCES, slot::MATERIALS, slot::ATLAS_TEXTURES]
        }
        RenderPath::Text => &[slot::INSTANCES, slot::MATERIALS],
        RenderPath::CompositeTransparent | RenderPath::CompositeFinal => &[],
    }
}

/// Texture names each path binds in group 2, in binding order.
fn texture_names(path: RenderPath) -> &'static [&'static str] {
    match path {
        RenderPath::Opaque | RenderPath::Transparent => &["TextureAtlas"],
        RenderPath::Text => &["FontAtlas"],
        RenderPath::CompositeTransparent => &["AccumulationTexture", "RevealageTexture"],
        RenderPath::CompositeFinal => &["ColorTexture"],
    }
}

/// Whether the path samples (with a sampler after its textures) rather than
/// loading texels.
fn samples_textures(path: RenderPath) -> bool {
    matches!(
        path,
        RenderPath::Opaque | RenderPath::Transparent | RenderPath::Text
    )
}

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16F => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Depth => wgpu::TextureFormat::Depth32Float,
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::InvSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::InvSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
    }
}

fn blend_state(mode: &BlendMode, attachment: usize) -> Option<wgpu::BlendState> {
    mode.pair(attachment).map(|pair| {
        let component = wgpu::BlendComponent {
            src_factor: blend_factor(pair.src),
            dst_factor: blend_factor(pair.dst),
            operation: wgpu::BlendOperation::Add,
        };
        wgpu::BlendState {
            color: component,
            alpha: component,
        }
    })
}

fn depth_state(mode: DepthMode) -> wgpu::DepthStencilState {
    wgpu::DepthStencilState {
        format: wgpu::TextureFormat::Depth32Float,
        depth_write_enabled: mode.write,
        depth_compare: if mode.test {
            wgpu::CompareFunction::Less
        } else {
            wgpu::CompareFunction::Always
        },
        stencil: wgpu::StencilState::default(),
        bias: wgpu::DepthBiasState::default(),
    }
}

struct GpuBuffer {
    desc: BufferDesc,
    buffer: wgpu::Buffer,
}

struct GpuTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct GpuShader {
    path: RenderPath,
    source: ShaderSource,
    module: wgpu::ShaderModule,
    /// Backs the `ViewProjection` uniform.
    uniforms: wgpu::Buffer,
}

struct GpuTarget {
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

/// Per-path bind group layouts: uniforms, storage buffers, textures.
struct PathLayouts {
    storage: wgpu::BindGroupLayout,
    textures: wgpu::BindGroupLayout,
    pipeline: wgpu::PipelineLayout,
}

pub struct WgpuApi {
    gpu: GpuContext,
    next_handle: u32,
    buffers: HashMap<u32, GpuBuffer>,
    textures: HashMap<u32, GpuTexture>,
    shaders: HashMap<u32, GpuShader>,
    targets: HashMap<u32, GpuTarget>,
    passes: HashMap<u32, RenderPath>,
    pipelines: HashMap<(u32, u32), wgpu::RenderPipeline>,
    uniform_layout: wgpu::BindGroupLayout,
    layouts: HashMap<RenderPath, PathLayouts>,
    sampler: wgpu::Sampler,
    bound: Option<BoundPass>,
    frame: Option<wgpu::SurfaceTexture>,
}

impl WgpuApi {
    /// Creates the device and surface for `window`.
    pub fn new(window: Arc<Window>) -> RenderResult<Self> {
        Ok(Self::from_context(GpuContext::new(window)?))
    }

    pub fn from_context(gpu: GpuContext) -> Self {
        let device = &gpu.device;

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Uniform Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Atlas Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let layouts = [
            RenderPath::Opaque,
            RenderPath::Transparent,
            RenderPath::Text,
            RenderPath::CompositeTransparent,
            RenderPath::CompositeFinal,
        ]
        .into_iter()
        .map(|path| (path, Self::path_layouts(device, &uniform_layout, path)))
        .collect();

        Self {
            gpu,
            next_handle: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            targets: HashMap::new(),
            passes: HashMap::new(),
            pipelines: HashMap::new(),
            uniform_layout,
            layouts,
            sampler,
            bound: None,
            frame: None,
        }
    }

    fn path_layouts(
        device: &wgpu::Device,
        uniform_layout: &wgpu::BindGroupLayout,
        path: RenderPath,
    ) -> PathLayouts {
        let storage_entries: Vec<_> = storage_slots(path)
            .iter()
            .map(|&binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let storage = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Storage Bind Group Layout"),
            entries: &storage_entries,
        });

        let sampled = samples_textures(path);
        let view_dimension = if path.uses_geometry() {
            wgpu::TextureViewDimension::D2Array
        } else {
            wgpu::TextureViewDimension::D2
        };
        let names = texture_names(path);
        let mut texture_entries: Vec<_> = (0..names.len() as u32)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: sampled },
                    view_dimension,
                    multisampled: false,
                },
                count: None,
            })
            .collect();
        if sampled {
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding: names.len() as u32,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }
        let textures = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Texture Bind Group Layout"),
            entries: &texture_entries,
        });

        let pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(path.name()),
            bind_group_layouts: &[uniform_layout, &storage, &textures],
            push_constant_ranges: &[],
        });

        PathLayouts {
            storage,
            textures,
            pipeline,
        }
    }

    pub fn context(&self) -> &GpuContext {
        &self.gpu
    }

    fn next(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Compiles WGSL, reporting validation errors instead of panicking.
    fn compile(&self, source: &ShaderSource) -> RenderResult<wgpu::ShaderModule> {
        self.gpu
            .device
            .push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&source.label),
                source: wgpu::ShaderSource::Wgsl(source.code.as_str().into()),
            });
        if let Some(error) = pollster::block_on(self.gpu.device.pop_error_scope()) {
            log::error!("Shader '{}' failed to compile: {}", source.label, error);
            return Err(RenderError::ResourceInitFailure(format!(
                "shader '{}': {error}",
                source.label
            )));
        }
        Ok(module)
    }

    fn insert_shader(&mut self, path: RenderPath, source: ShaderSource) -> RenderResult<ShaderHandle> {
        let module = self.compile(&source)?;
        let uniforms = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ViewProjection"),
            size: size_of::<Mat4>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.gpu
            .queue
            .write_buffer(&uniforms, 0, bytemuck::cast_slice(&Mat4::IDENTITY.to_cols_array()));

        let shader = ShaderHandle(self.next());
        self.shaders.insert(
            shader.0,
            GpuShader {
                path,
                source,
                module,
                uniforms,
            },
        );
        Ok(shader)
    }

    fn create_gpu_texture(&self, desc: &TextureDesc) -> GpuTexture {
        let format = texture_format(desc.format);
        let usage = match desc.format {
            TextureFormat::Depth => {
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
            }
            _ => {
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST
            }
        };
        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.depth.max(1),
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(match desc.dimension {
                TextureDimension::D2 => wgpu::TextureViewDimension::D2,
                TextureDimension::D2Array => wgpu::TextureViewDimension::D2Array,
            }),
            ..Default::default()
        });
        GpuTexture {
            desc: *desc,
            texture,
            view,
        }
    }

    fn acquire_frame(&mut self) {
        if self.frame.is_some() {
            return;
        }
        match self.gpu.surface.get_current_texture() {
            Ok(frame) => self.frame = Some(frame),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::warn!("Surface lost or outdated, reconfiguring");
                let (width, height) = (self.gpu.width(), self.gpu.height());
                self.gpu.resize(width, height);
            }
            Err(e) => log::error!("Failed to acquire surface texture: {}", e),
        }
    }

    fn bound_or_log(&self, operation: &str) -> Option<BoundPass> {
        let bound = self.bound.clone();
        if bound.is_none() {
            log::error!("{} without a bound render pass", operation);
        }
        bound
    }

    /// Color views of the bound target plus its depth view.
    fn attachment_views(
        &self,
        target: Option<RenderTargetHandle>,
    ) -> Option<(Vec<wgpu::TextureView>, Option<wgpu::TextureView>)> {
        match target {
            None => {
                let frame = self.frame.as_ref()?;
                let view = frame
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                Some((vec![view], None))
            }
            Some(target) => {
                let target = self.targets.get(&target.0)?;
                let colors = target
                    .colors
                    .iter()
                    .filter_map(|c| self.textures.get(&c.0))
                    .map(|t| t.view.clone())
                    .collect();
                let depth = target
                    .depth
                    .and_then(|d| self.textures.get(&d.0))
                    .map(|t| t.view.clone());
                Some((colors, depth))
            }
        }
    }

    fn target_formats(
        &self,
        target: Option<RenderTargetHandle>,
    ) -> (Vec<wgpu::TextureFormat>, bool, (u32, u32)) {
        match target.and_then(|t| self.targets.get(&t.0)) {
            None => (
                vec![self.gpu.config.format],
                false,
                (self.gpu.width(), self.gpu.height()),
            ),
            Some(target) => {
                let colors: Vec<_> = target
                    .colors
                    .iter()
                    .filter_map(|c| self.textures.get(&c.0))
                    .collect();
                let extent = colors
                    .first()
                    .map_or((0, 0), |t| (t.desc.width, t.desc.height));
                (
                    colors.iter().map(|t| texture_format(t.desc.format)).collect(),
                    target.depth.is_some(),
                    extent,
                )
            }
        }
    }

    /// Builds the pipeline for the bound (pass, shader) pair if needed.
    fn ensure_pipeline(&mut self, bound: &BoundPass) -> bool {
        let key = (bound.pass.0, bound.shader.0);
        if self.pipelines.contains_key(&key) {
            return true;
        }
        let (Some(shader), Some(layouts)) = (
            self.shaders.get(&bound.shader.0),
            self.layouts.get(&bound.path),
        ) else {
            return false;
        };
        let (formats, has_depth, _) = self.target_formats(bound.target);

        let targets: Vec<_> = formats
            .iter()
            .enumerate()
            .map(|(i, &format)| {
                Some(wgpu::ColorTargetState {
                    format,
                    blend: blend_state(&bound.blend_mode, i),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        let buffers = if bound.path.uses_geometry() {
            GEOMETRY_BUFFERS
        } else {
            &[]
        };

        let pipeline = self
            .gpu
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&shader.source.label),
                layout: Some(&layouts.pipeline),
                vertex: wgpu::VertexState {
                    module: &shader.module,
                    entry_point: Some("vs"),
                    buffers,
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader.module,
                    entry_point: Some("fs"),
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: has_depth.then(|| depth_state(bound.depth_mode)),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        log::debug!(
            "Built {} pipeline for pass {}",
            bound.path.name(),
            bound.pass.0
        );
        self.pipelines.insert(key, pipeline);
        true
    }

    fn bind_groups(&self, bound: &BoundPass) -> Option<[wgpu::BindGroup; 3]> {
        let shader = self.shaders.get(&bound.shader.0)?;
        let layouts = self.layouts.get(&bound.path)?;
        let device = &self.gpu.device;

        let uniforms = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Uniform Bind Group"),
            layout: &self.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: shader.uniforms.as_entire_binding(),
            }],
        });

        let mut storage_entries = Vec::new();
        for &binding in storage_slots(bound.path) {
            let Some(buffer) = bound
                .buffers
                .iter()
                .filter_map(|b| self.buffers.get(&b.0))
                .find(|b| b.desc.kind == BufferKind::Storage && b.desc.slot == binding)
            else {
                log::error!(
                    "{} pass has no storage buffer at slot {}",
                    bound.path.name(),
                    binding
                );
                return None;
            };
            storage_entries.push(wgpu::BindGroupEntry {
                binding,
                resource: buffer.buffer.as_entire_binding(),
            });
        }
        let storage = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Storage Bind Group"),
            layout: &layouts.storage,
            entries: &storage_entries,
        });

        let names = texture_names(bound.path);
        let mut texture_entries = Vec::new();
        for (binding, name) in names.iter().enumerate() {
            let Some(texture) = bound
                .textures
                .iter()
                .find(|t| t.name == *name)
                .and_then(|t| self.textures.get(&t.texture.0))
            else {
                log::error!("{} pass has no texture '{}'", bound.path.name(), name);
                return None;
            };
            texture_entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
        }
        if samples_textures(bound.path) {
            texture_entries.push(wgpu::BindGroupEntry {
                binding: names.len() as u32,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            });
        }
        let textures = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Texture Bind Group"),
            layout: &layouts.textures,
            entries: &texture_entries,
        });

        Some([uniforms, storage, textures])
    }

    /// Records one draw into the bound pass's target and submits it.
    fn submit_draw(
        &mut self,
        operation: &str,
        draw: impl FnOnce(&mut wgpu::RenderPass<'_>, Option<(&wgpu::Buffer, &wgpu::Buffer)>),
    ) {
        let Some(bound) = self.bound_or_log(operation) else {
            return;
        };
        if !self.ensure_pipeline(&bound) {
            log::error!("{}: no pipeline for {} pass", operation, bound.path.name());
            return;
        }
        let Some(bind_groups) = self.bind_groups(&bound) else {
            return;
        };
        let Some((colors, depth)) = self.attachment_views(bound.target) else {
            log::error!("{}: render target unavailable", operation);
            return;
        };
        let (_, _, extent) = self.target_formats(bound.target);
        let geometry = if bound.path.uses_geometry() {
            let find = |kind: BufferKind| {
                bound
                    .buffers
                    .iter()
                    .filter_map(|b| self.buffers.get(&b.0))
                    .find(|b| b.desc.kind == kind)
                    .map(|b| &b.buffer)
            };
            match (find(BufferKind::Vertex), find(BufferKind::Index)) {
                (Some(v), Some(i)) => Some((v, i)),
                _ => {
                    log::error!("{}: pass has no vertex or index buffer", operation);
                    return;
                }
            }
        } else {
            None
        };
        let Some(pipeline) = self.pipelines.get(&(bound.pass.0, bound.shader.0)) else {
            return;
        };

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(bound.path.name()),
            });
        {
            let color_attachments: Vec<_> = colors
                .iter()
                .map(|view| {
                    Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                        depth_slice: None,
                    })
                })
                .collect();
            let depth_stencil_attachment =
                depth
                    .as_ref()
                    .map(|view| wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    });
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(bound.path.name()),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            let vp = bound.viewport;
            let width = vp.width.min(extent.0 as f32 - vp.x).max(1.0);
            let height = vp.height.min(extent.1 as f32 - vp.y).max(1.0);
            pass.set_viewport(vp.x, vp.y, width, height, 0.0, 1.0);
            pass.set_pipeline(pipeline);
            for (index, group) in bind_groups.iter().enumerate() {
                pass.set_bind_group(index as u32, group, &[]);
            }
            draw(&mut pass, geometry);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Clears one color attachment or the depth attachment of the bound
    /// target.
    fn submit_clear(&mut self, operation: &str, color: Option<(usize, [f32; 4])>, depth: Option<f32>) {
        let Some(bound) = self.bound_or_log(operation) else {
            return;
        };
        let Some((colors, depth_view)) = self.attachment_views(bound.target) else {
            log::error!("{}: render target unavailable", operation);
            return;
        };

        let color_attachment = match color {
            Some((attachment, [r, g, b, a])) => match colors.get(attachment) {
                Some(view) => Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: r as f64,
                            g: g as f64,
                            b: b as f64,
                            a: a as f64,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                }),
                None => {
                    log::error!("{}: no color attachment {}", operation, attachment);
                    return;
                }
            },
            None => None,
        };
        let depth_attachment = match depth {
            Some(value) => match depth_view.as_ref() {
                Some(view) => Some(wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(value),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                None => {
                    log::error!("{}: bound target has no depth attachment", operation);
                    return;
                }
            },
            None => None,
        };

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Clear"),
            });
        {
            let color_attachments: Vec<_> = color_attachment.into_iter().map(Some).collect();
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
    }
}

impl GraphicsApi for WgpuApi {
    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferHandle> {
        let usage = match desc.kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM,
            BufferKind::Storage => wgpu::BufferUsages::STORAGE,
        } | wgpu::BufferUsages::COPY_DST;
        let size = desc.size.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize);
        let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: size as u64,
            usage,
            mapped_at_creation: false,
        });
        let handle = BufferHandle(self.next());
        self.buffers.insert(handle.0, GpuBuffer { desc: *desc, buffer });
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(target) = self.buffers.get(&buffer.0) else {
            log::error!("write_buffer on unknown buffer {:?}", buffer);
            return;
        };
        let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
        if data.len() % align == 0 {
            self.gpu
                .queue
                .write_buffer(&target.buffer, offset as u64, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(data.len().next_multiple_of(align), 0);
            self.gpu
                .queue
                .write_buffer(&target.buffer, offset as u64, &padded);
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&buffer.0) {
            buffer.buffer.destroy();
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            log::error!("Cannot create a {}x{} texture", desc.width, desc.height);
            return Err(RenderError::ResourceInitFailure(format!(
                "texture size {}x{}",
                desc.width, desc.height
            )));
        }
        let texture = self.create_gpu_texture(desc);
        let handle = TextureHandle(self.next());
        self.textures.insert(handle.0, texture);
        Ok(handle)
    }

    fn write_texture(&mut self, texture: TextureHandle, origin: [u32; 3], size: [u32; 2], data: &[u8]) {
        let Some(target) = self.textures.get(&texture.0) else {
            log::error!("write_texture on unknown texture {:?}", texture);
            return;
        };
        if target.desc.format == TextureFormat::Depth {
            log::error!("write_texture on a depth texture");
            return;
        }
        let texel = target.desc.format.texel_size() as u32;
        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: origin[0],
                    y: origin[1],
                    z: origin[2],
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size[0] * texel),
                rows_per_image: Some(size[1]),
            },
            wgpu::Extent3d {
                width: size[0],
                height: size[1],
                depth_or_array_layers: 1,
            },
        );
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
        self.destroy_texture(texture);
        Ok(resized)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(texture) = self.textures.remove(&texture.0) {
            texture.texture.destroy();
        }
    }

    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc> {
        self.textures.get(&texture.0).map(|t| t.desc)
    }

    fn create_shader(&mut self, path: RenderPath, source: &ShaderSource) -> RenderResult<ShaderHandle> {
        self.insert_shader(path, source.clone())
    }

    fn create_derived_shader(&mut self, base: ShaderHandle, hooks: &ShaderSource) -> RenderResult<ShaderHandle> {
        let Some(base_shader) = self.shaders.get(&base.0) else {
            log::error!("Base shader {:?} does not exist", base);
            return Err(RenderError::NotFound(format!("shader {}", base.0)));
        };
        let path = base_shader.path;
        let source = base_shader.source.with_hooks(hooks)?;
        self.insert_shader(path, source)
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        if let Some(shader) = self.shaders.remove(&shader.0) {
            shader.uniforms.destroy();
        }
        self.pipelines.retain(|(_, s), _| *s != shader.0);
    }

    fn create_render_target(
        &mut self,
        colors: &[TextureHandle],
        depth: Option<TextureHandle>,
    ) -> RenderResult<RenderTargetHandle> {
        let target = RenderTargetHandle(self.next());
        self.targets.insert(
            target.0,
            GpuTarget {
                colors: colors.to_vec(),
                depth,
            },
        );
        Ok(target)
    }

    fn update_render_target(&mut self, target: RenderTargetHandle, colors: &[TextureHandle], depth: Option<TextureHandle>) {
        self.targets.insert(
            target.0,
            GpuTarget {
                colors: colors.to_vec(),
                depth,
            },
        );
    }

    fn destroy_render_target(&mut self, target: RenderTargetHandle) {
        self.targets.remove(&target.0);
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
        Ok(pass)
    }

    fn destroy_render_pass(&mut self, pass: RenderPassHandle) {
        self.passes.remove(&pass.0);
        self.pipelines.retain(|(p, _), _| *p != pass.0);
    }

    fn bind_render_pass(&mut self, pass: &RenderPass, shader: Option<ShaderHandle>) {
        let shader = shader.unwrap_or(pass.shader());
        let path = self
            .shaders
            .get(&shader.0)
            .map_or(pass.render_path(), |s| s.path);
        let desc = pass.desc();
        if desc.render_target.is_none() {
            self.acquire_frame();
        }
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
    }

    fn unbind_render_pass(&mut self, pass: &RenderPass) {
        if self.bound.as_ref().is_some_and(|b| b.pass == pass.handle()) {
            self.bound = None;
        }
        if pass.desc().render_target.is_none()
            && let Some(frame) = self.frame.take()
        {
            frame.present();
        }
    }

    fn set_uniform_mat4(&mut self, shader: ShaderHandle, name: &str, value: &Mat4) {
        if name != "ViewProjection" {
            log::trace!("Ignoring unknown uniform '{}'", name);
            return;
        }
        let Some(shader) = self.shaders.get(&shader.0) else {
            log::error!("set_uniform_mat4 on unknown shader {:?}", shader);
            return;
        };
        self.gpu
            .queue
            .write_buffer(&shader.uniforms, 0, bytemuck::cast_slice(&value.to_cols_array()));
    }

    fn bind_texture(&mut self, _shader: ShaderHandle, name: &str, texture: TextureHandle) {
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
        self.submit_clear("clear_color", Some((attachment, color)), None);
    }

    fn clear_depth(&mut self, depth: f32) {
        self.submit_clear("clear_depth", None, Some(depth));
    }

    fn draw(&mut self, index_count: u32, base_vertex: u32, first_index: u32, instance_count: u32) {
        if index_count == 0 || instance_count == 0 {
            return;
        }
        self.submit_draw("draw", |pass, geometry| {
            let Some((vertices, indices)) = geometry else {
                return;
            };
            pass.set_vertex_buffer(0, vertices.slice(..));
            pass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(
                first_index..first_index + index_count,
                base_vertex as i32,
                0..instance_count,
            );
        });
    }

    fn draw_quad(&mut self) {
        self.submit_draw("draw_quad", |pass, _| pass.draw(0..3, 0..1));
    }

    fn draw_quads(&mut self, count: u32) {
        if count == 0 {
            return;
        }
        self.submit_draw("draw_quads", |pass, _| pass.draw(0..6, 0..count));
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.frame = None;
        self.gpu.resize(width, height);
    }
}
