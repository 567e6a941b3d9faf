//! Per-frame packing of game objects into GPU records.
//!
//! Each frame the opaque and transparent [`CategoryBatch`]es walk the live
//! objects once, deduplicate materials into small integer slots, and upload
//! one [`InstanceRecord`] per drawable object. Text objects are laid out into
//! [`GlyphRecord`] quads by [`TextBatch`], one object at a time.
//!
//! All records are `#[repr(C)]` and laid out to match the WGSL storage
//! structs of the built-in shaders.

use std::collections::HashMap;

use glam::{Vec2, Vec4};

use crate::arena::{Arena, StagingBuffer};
use crate::error::{RenderError, RenderResult};
use crate::font::Font;
use crate::gfx::{BufferDesc, BufferHandle, BufferKind, GraphicsApi, slot};
use crate::material::{Material, MaterialRegistry};
use crate::object::{GameObject, Transform};
use crate::pool::PoolHandle;
use crate::render_pass::RenderPath;
use crate::texture_atlas::{AtlasTexture, TextureAtlas};

/// One drawn object.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    /// 1.0 for objects placed directly in clip space.
    pub use_2d: f32,
    /// Material slot for this frame, or -1.
    pub material_index: i32,
    pub _pad: [u32; 2],
    pub world: [f32; 16],
}

/// One material referenced this frame.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialRecord {
    pub buffer_index: i32,
    /// Atlas layer of the diffuse texture, or -1 when untextured.
    pub diffuse_texture_layer: f32,
    pub _pad: [f32; 2],
    /// Normalized atlas `(x, y, w, h)` of the diffuse texture.
    pub diffuse_texture_info: [f32; 4],
    pub diffuse_color: [f32; 4],
    pub highlight_color: [f32; 4],
}

/// A sub-texture a pass can index into.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AtlasTextureRecord {
    pub info: [f32; 4],
    pub layer: f32,
    pub _pad: [f32; 3],
}

/// One glyph quad: clip-space `(x, y, w, h)` and atlas `(u, v, w, h)`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GlyphRecord {
    pub info: [f32; 4],
    pub atlas: [f32; 4],
}

impl MaterialRecord {
    fn new(slot: i32, material: &Material, atlas: &TextureAtlas) -> Self {
        let texture = material
            .diffuse_texture
            .and_then(|handle| atlas.get(handle))
            .map(|texture| atlas.normalized_area(texture));
        if material.diffuse_texture.is_some() && texture.is_none() {
            log::trace!("Material '{}' texture no longer exists", material.id);
        }

        let (layer, info) = match texture {
            Some(t) => (t.offset.z, [t.offset.x, t.offset.y, t.size.x, t.size.y]),
            None => (-1.0, [0.0; 4]),
        };
        Self {
            buffer_index: slot,
            diffuse_texture_layer: layer,
            _pad: [0.0; 2],
            diffuse_texture_info: info,
            diffuse_color: material.diffuse_color.to_array(),
            highlight_color: material.highlight_color.to_array(),
        }
    }

    /// Record for objects drawn without a material.
    pub fn untextured(color: Vec4) -> Self {
        Self {
            buffer_index: 0,
            diffuse_texture_layer: -1.0,
            _pad: [0.0; 2],
            diffuse_texture_info: [0.0; 4],
            diffuse_color: color.to_array(),
            highlight_color: color.to_array(),
        }
    }
}

/// What one [`CategoryBatch::write`] produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub instances: u32,
    pub materials: u32,
    pub atlas_textures: u32,
    pub bytes_uploaded: usize,
}

/// Staging and GPU buffers for one object category.
pub struct CategoryBatch {
    path: RenderPath,
    max_instances: usize,
    max_materials: usize,
    instances: StagingBuffer,
    materials: StagingBuffer,
    atlas_textures: StagingBuffer,
    instance_buffer: BufferHandle,
    material_buffer: BufferHandle,
    atlas_texture_buffer: BufferHandle,
    material_slots: HashMap<PoolHandle<Material>, i32>,
    instance_count: u32,
}

impl CategoryBatch {
    /// `path` selects the category: [`RenderPath::Opaque`] batches opaque
    /// objects, anything else batches transparent ones.
    pub fn new<A: GraphicsApi>(
        api: &mut A,
        arena: &mut Arena,
        path: RenderPath,
        max_instances: usize,
        max_materials: usize,
        max_atlas_textures: usize,
    ) -> RenderResult<Self> {
        let instance_size = max_instances * size_of::<InstanceRecord>();
        let material_size = max_materials * size_of::<MaterialRecord>();
        let atlas_size = max_atlas_textures * size_of::<AtlasTextureRecord>();

        Ok(Self {
            path,
            max_instances,
            max_materials,
            instances: StagingBuffer::new(arena.allocate(instance_size)?),
            materials: StagingBuffer::new(arena.allocate(material_size)?),
            atlas_textures: StagingBuffer::new(arena.allocate(atlas_size)?),
            instance_buffer: api.create_buffer(&BufferDesc::new(
                BufferKind::Storage,
                instance_size,
                slot::INSTANCES,
            ))?,
            material_buffer: api.create_buffer(&BufferDesc::new(
                BufferKind::Storage,
                material_size,
                slot::MATERIALS,
            ))?,
            atlas_texture_buffer: api.create_buffer(&BufferDesc::new(
                BufferKind::Storage,
                atlas_size,
                slot::ATLAS_TEXTURES,
            ))?,
            material_slots: HashMap::new(),
            instance_count: 0,
        })
    }

    fn accepts(path: RenderPath, object: &GameObject) -> bool {
        let opaque = path == RenderPath::Opaque;
        object.visible && object.opaque == opaque && object.geometry.is_some()
    }

    /// Packs every matching object in storage order and uploads the result.
    ///
    /// `atlas_inputs` are the atlas entries the category's pass reads; one
    /// record per resolvable entry is appended after the materials.
    #[allow(clippy::too_many_arguments)]
    pub fn write<A: GraphicsApi>(
        &mut self,
        api: &mut A,
        arena: &mut Arena,
        objects: &[GameObject],
        materials: &MaterialRegistry,
        atlas: &TextureAtlas,
        atlas_inputs: &[PoolHandle<AtlasTexture>],
    ) -> RenderResult<BatchStats> {
        self.instances.clear();
        self.materials.clear();
        self.atlas_textures.clear();
        self.material_slots.clear();
        self.instance_count = 0;

        let path = self.path;
        for object in objects.iter().filter(|o| Self::accepts(path, o)) {
            if self.instance_count as usize >= self.max_instances {
                log::error!(
                    "Too many {} instances, capacity {}",
                    self.path.name(),
                    self.max_instances
                );
                return Err(RenderError::CapacityExceeded {
                    pool: "instances",
                    capacity: self.max_instances,
                });
            }

            let material_index = match object
                .material
                .and_then(|handle| materials.get(handle).map(|m| (handle, m)))
            {
                Some((handle, material)) => self.material_slot(arena, handle, material, atlas)?,
                None => {
                    if object.material.is_some() {
                        log::trace!("Object '{}' material no longer exists", object.id);
                    }
                    -1
                }
            };

            let record = InstanceRecord {
                use_2d: if object.is_2d { 1.0 } else { 0.0 },
                material_index,
                _pad: [0; 2],
                world: object.world_matrix().to_cols_array(),
            };
            self.instances.push(arena, &record)?;
            self.instance_count += 1;
        }

        let mut atlas_count = 0;
        for &handle in atlas_inputs {
            let Some(texture) = atlas.get(handle) else {
                log::trace!("Pass atlas input no longer exists");
                continue;
            };
            let area = atlas.normalized_area(texture);
            let record = AtlasTextureRecord {
                info: [area.offset.x, area.offset.y, area.size.x, area.size.y],
                layer: area.offset.z,
                _pad: [0.0; 3],
            };
            self.atlas_textures.push(arena, &record)?;
            atlas_count += 1;
        }

        let bytes_uploaded = self.upload(api, arena);
        let stats = BatchStats {
            instances: self.instance_count,
            materials: self.material_slots.len() as u32,
            atlas_textures: atlas_count,
            bytes_uploaded,
        };
        log::trace!("{} batch: {:?}", self.path.name(), stats);
        Ok(stats)
    }

    fn material_slot(
        &mut self,
        arena: &mut Arena,
        handle: PoolHandle<Material>,
        material: &Material,
        atlas: &TextureAtlas,
    ) -> RenderResult<i32> {
        if let Some(&slot) = self.material_slots.get(&handle) {
            return Ok(slot);
        }
        if self.material_slots.len() >= self.max_materials {
            log::error!(
                "Too many {} materials in one frame, capacity {}",
                self.path.name(),
                self.max_materials
            );
            return Err(RenderError::CapacityExceeded {
                pool: "frame materials",
                capacity: self.max_materials,
            });
        }

        let slot = self.material_slots.len() as i32;
        self.materials
            .push(arena, &MaterialRecord::new(slot, material, atlas))?;
        self.material_slots.insert(handle, slot);
        Ok(slot)
    }

    fn upload<A: GraphicsApi>(&self, api: &mut A, arena: &Arena) -> usize {
        let writes = [
            (self.instance_buffer, &self.instances),
            (self.material_buffer, &self.materials),
            (self.atlas_texture_buffer, &self.atlas_textures),
        ];
        writes
            .into_iter()
            .map(|(buffer, staging)| {
                let bytes = staging.contents(arena);
                api.write_buffer(buffer, 0, bytes);
                bytes.len()
            })
            .sum()
    }

    pub fn render_path(&self) -> RenderPath {
        self.path
    }

    /// Instances packed by the last [`write`](Self::write).
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn material_slot_of(&self, material: PoolHandle<Material>) -> Option<i32> {
        self.material_slots.get(&material).copied()
    }

    /// Storage buffers in slot order.
    pub fn buffers(&self) -> [BufferHandle; 3] {
        [
            self.instance_buffer,
            self.material_buffer,
            self.atlas_texture_buffer,
        ]
    }

    pub fn destroy<A: GraphicsApi>(self, api: &mut A) {
        for buffer in self.buffers() {
            api.destroy_buffer(buffer);
        }
    }
}

/// Lays `text` out as glyph quads.
///
/// `transform.position.xy` is the pen origin in `[0, 1]` window units and
/// `transform.scale.xy` the glyph scale; the quads come out in clip space.
/// Characters missing from the font are skipped.
pub fn layout_text(font: &Font, text: &str, transform: &Transform, window_size: Vec2) -> Vec<GlyphRecord> {
    let origin = transform.position.truncate() * 2.0 - Vec2::ONE;
    let scale = transform.scale.truncate() / window_size;
    let metrics = font.metrics();
    let (atlas_w, atlas_h) = font.atlas_size();
    let (atlas_w, atlas_h) = (atlas_w as f32, atlas_h as f32);

    let mut cursor = Vec2::ZERO;
    let mut glyphs = Vec::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\t' => cursor.x += metrics.tab * scale.x,
            ' ' => cursor.x += metrics.space * scale.x,
            '\n' => {
                cursor.x = 0.0;
                cursor.y -= metrics.newline * scale.y;
            }
            c => {
                let Some(glyph) = font.glyph(c) else {
                    log::trace!("No glyph for {:?}", c);
                    continue;
                };
                let (w, h) = (glyph.width as f32, glyph.height as f32);
                glyphs.push(GlyphRecord {
                    info: [
                        origin.x + cursor.x + glyph.left * scale.x,
                        origin.y + cursor.y - (h - glyph.top) * scale.y,
                        w * scale.x,
                        h * scale.y,
                    ],
                    atlas: [
                        glyph.atlas_x as f32 / atlas_w,
                        glyph.atlas_y as f32 / atlas_h,
                        w / atlas_w,
                        h / atlas_h,
                    ],
                });
                cursor.x += glyph.advance * scale.x;
            }
        }
    }
    glyphs
}

/// Glyph and material buffers shared by every text draw.
pub struct TextBatch {
    max_glyphs: usize,
    glyphs: StagingBuffer,
    material: StagingBuffer,
    glyph_buffer: BufferHandle,
    material_buffer: BufferHandle,
}

impl TextBatch {
    pub fn new<A: GraphicsApi>(api: &mut A, arena: &mut Arena, max_glyphs: usize) -> RenderResult<Self> {
        let glyph_size = max_glyphs * size_of::<GlyphRecord>();
        let material_size = size_of::<MaterialRecord>();
        Ok(Self {
            max_glyphs,
            glyphs: StagingBuffer::new(arena.allocate(glyph_size)?),
            material: StagingBuffer::new(arena.allocate(material_size)?),
            glyph_buffer: api.create_buffer(&BufferDesc::new(
                BufferKind::Storage,
                glyph_size,
                slot::INSTANCES,
            ))?,
            material_buffer: api.create_buffer(&BufferDesc::new(
                BufferKind::Storage,
                material_size,
                slot::MATERIALS,
            ))?,
        })
    }

    /// Uploads one text object's quads and color; returns the quad count.
    pub fn write<A: GraphicsApi>(
        &mut self,
        api: &mut A,
        arena: &mut Arena,
        glyphs: &[GlyphRecord],
        color: Vec4,
    ) -> RenderResult<u32> {
        if glyphs.len() > self.max_glyphs {
            log::error!(
                "Text has {} glyphs, capacity {}",
                glyphs.len(),
                self.max_glyphs
            );
            return Err(RenderError::CapacityExceeded {
                pool: "text glyphs",
                capacity: self.max_glyphs,
            });
        }

        self.glyphs.clear();
        self.material.clear();
        self.glyphs.push_bytes(arena, bytemuck::cast_slice(glyphs))?;
        self.material
            .push(arena, &MaterialRecord::untextured(color))?;

        api.write_buffer(self.glyph_buffer, 0, self.glyphs.contents(arena));
        api.write_buffer(self.material_buffer, 0, self.material.contents(arena));
        Ok(glyphs.len() as u32)
    }

    pub fn buffers(&self) -> [BufferHandle; 2] {
        [self.glyph_buffer, self.material_buffer]
    }

    pub fn destroy<A: GraphicsApi>(self, api: &mut A) {
        for buffer in self.buffers() {
            api.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::{FontMetrics, GlyphBitmap};
    use crate::geometry::GeometryId;
    use crate::gfx::{ApiCall, SoftwareApi};
    use crate::material::MaterialDesc;
    use approx::assert_relative_eq;
    use slotmap::KeyData;

    struct Fixture {
        api: SoftwareApi,
        arena: Arena,
        materials: MaterialRegistry,
        atlas: TextureAtlas,
        batch: CategoryBatch,
    }

    fn fixture(path: RenderPath) -> Fixture {
        let mut api = SoftwareApi::new(4, 4);
        let mut arena = Arena::new(64 * 1024, 64).unwrap();
        let atlas = TextureAtlas::new(&mut api, 8, 8, 1, 8).unwrap();
        let batch = CategoryBatch::new(&mut api, &mut arena, path, 16, 8, 8).unwrap();
        Fixture {
            api,
            arena,
            materials: MaterialRegistry::new(8),
            atlas,
            batch,
        }
    }

    fn geometry() -> GeometryId {
        GeometryId::from(KeyData::from_ffi(1))
    }

    fn object(id: &str, material: Option<PoolHandle<Material>>) -> GameObject {
        let mut object = GameObject::new(id).with_geometry(geometry());
        object.material = material;
        object
    }

    fn instance(f: &Fixture, index: usize) -> InstanceRecord {
        let data = f.api.buffer_data(f.batch.buffers()[0]).unwrap();
        let size = size_of::<InstanceRecord>();
        bytemuck::pod_read_unaligned(&data[index * size..(index + 1) * size])
    }

    fn write(f: &mut Fixture, objects: &[GameObject]) -> BatchStats {
        f.batch
            .write(&mut f.api, &mut f.arena, objects, &f.materials, &f.atlas, &[])
            .unwrap()
    }

    #[test]
    fn record_layouts_match_shaders() {
        assert_eq!(size_of::<InstanceRecord>(), 80);
        assert_eq!(size_of::<MaterialRecord>(), 64);
        assert_eq!(size_of::<AtlasTextureRecord>(), 32);
        assert_eq!(size_of::<GlyphRecord>(), 32);
    }

    #[test]
    fn shared_material_packs_once() {
        let mut f = fixture(RenderPath::Opaque);
        let shared = f
            .materials
            .create(&mut f.api, "shared", MaterialDesc::new(), None)
            .unwrap();
        let objects: Vec<_> = (0..5).map(|i| object(&format!("o{i}"), Some(shared))).collect();

        let stats = write(&mut f, &objects);
        assert_eq!(stats.instances, 5);
        assert_eq!(stats.materials, 1);
        for i in 0..5 {
            assert_eq!(instance(&f, i).material_index, 0);
        }
    }

    #[test]
    fn distinct_materials_in_first_seen_order() {
        let mut f = fixture(RenderPath::Opaque);
        let handles: Vec<_> = ["m0", "m1", "m2"]
            .iter()
            .map(|id| f.materials.create(&mut f.api, id, MaterialDesc::new(), None).unwrap())
            .collect();
        let objects = vec![
            object("a", Some(handles[2])),
            object("b", Some(handles[0])),
            object("c", Some(handles[2])),
            object("d", Some(handles[1])),
        ];

        let stats = write(&mut f, &objects);
        assert_eq!(stats.materials, 3);
        let slots: Vec<_> = (0..4).map(|i| instance(&f, i).material_index).collect();
        assert_eq!(slots, [0, 1, 0, 2]);
        assert_eq!(f.batch.material_slot_of(handles[2]), Some(0));
    }

    #[test]
    fn filters_by_category_visibility_and_geometry() {
        let mut f = fixture(RenderPath::Transparent);
        let mut hidden = object("hidden", None).transparent();
        hidden.visible = false;
        let objects = vec![
            object("opaque", None),
            object("glass", None).transparent(),
            GameObject::new("no_geometry").transparent(),
            hidden,
        ];

        let stats = write(&mut f, &objects);
        assert_eq!(stats.instances, 1);
        assert_eq!(instance(&f, 0).material_index, -1);
    }

    #[test]
    fn stale_material_is_untextured() {
        let mut f = fixture(RenderPath::Opaque);
        let gone = f
            .materials
            .create(&mut f.api, "gone", MaterialDesc::new(), None)
            .unwrap();
        f.materials.destroy(&mut f.api, "gone");

        let stats = write(&mut f, &[object("a", Some(gone))]);
        assert_eq!(stats.materials, 0);
        assert_eq!(instance(&f, 0).material_index, -1);
    }

    #[test]
    fn textured_material_records_atlas_area() {
        let mut f = fixture(RenderPath::Opaque);
        f.atlas
            .create_texture(&mut f.api, "pad", 4, 4, 1, &[0; 16])
            .unwrap();
        let tex = f
            .atlas
            .create_texture(&mut f.api, "tex", 2, 4, 1, &[0; 8])
            .unwrap();
        let material = f
            .materials
            .create(&mut f.api, "m", MaterialDesc::new().diffuse_texture(tex), None)
            .unwrap();

        write(&mut f, &[object("a", Some(material))]);
        let data = f.api.buffer_data(f.batch.buffers()[1]).unwrap();
        let record: MaterialRecord = bytemuck::pod_read_unaligned(&data[..size_of::<MaterialRecord>()]);
        assert_eq!(record.diffuse_texture_layer, 0.0);
        assert_relative_eq!(record.diffuse_texture_info[0], 0.5);
        assert_relative_eq!(record.diffuse_texture_info[2], 0.25);
        assert_relative_eq!(record.diffuse_texture_info[3], 0.5);
    }

    #[test]
    fn atlas_inputs_are_appended() {
        let mut f = fixture(RenderPath::Opaque);
        let tex = f
            .atlas
            .create_texture(&mut f.api, "tex", 4, 8, 1, &[0; 32])
            .unwrap();
        let stats = f
            .batch
            .write(&mut f.api, &mut f.arena, &[], &f.materials, &f.atlas, &[tex])
            .unwrap();
        assert_eq!(stats.atlas_textures, 1);
        assert_eq!(stats.bytes_uploaded, size_of::<AtlasTextureRecord>());
    }

    #[test]
    fn empty_frame_uploads_nothing() {
        let mut f = fixture(RenderPath::Opaque);
        f.api.clear_calls();
        let stats = write(&mut f, &[]);
        assert_eq!(stats, BatchStats::default());
        assert_eq!(f.api.uploaded_bytes(), 0);
        let writes = f
            .api
            .calls()
            .iter()
            .filter(|c| matches!(c, ApiCall::WriteBuffer { .. }))
            .count();
        assert_eq!(writes, 3);
    }

    #[test]
    fn instance_capacity_is_enforced() {
        let mut f = fixture(RenderPath::Opaque);
        let objects: Vec<_> = (0..17).map(|i| object(&format!("o{i}"), None)).collect();
        let result = f
            .batch
            .write(&mut f.api, &mut f.arena, &objects, &f.materials, &f.atlas, &[]);
        assert!(matches!(
            result,
            Err(RenderError::CapacityExceeded { capacity: 16, .. })
        ));
    }

    #[test]
    fn text_layout_places_glyphs() {
        let mut api = SoftwareApi::new(4, 4);
        let glyph = GlyphBitmap {
            width: 4,
            height: 8,
            left: 0.0,
            top: 6.0,
            advance: 5.0,
            coverage: vec![255; 32],
        };
        let font = Font::from_bitmaps(
            &mut api,
            vec![('a', glyph)],
            FontMetrics::new(10.0, 3.0),
            8.0,
        )
        .unwrap();
        let transform = Transform::new().position(glam::Vec3::new(0.5, 0.5, 0.0));
        let glyphs = layout_text(&font, "a a\n?a", &transform, Vec2::new(100.0, 50.0));

        assert_eq!(glyphs.len(), 3);
        let [x, y, w, h] = glyphs[0].info;
        assert_relative_eq!(x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(y, -0.04, epsilon = 1e-6);
        assert_relative_eq!(w, 0.04, epsilon = 1e-6);
        assert_relative_eq!(h, 0.16, epsilon = 1e-6);
        assert_relative_eq!(glyphs[1].info[0], 0.08, epsilon = 1e-6);
        assert_relative_eq!(glyphs[2].info[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(glyphs[2].info[1], -0.24, epsilon = 1e-6);
        assert_eq!(glyphs[0].atlas, [0.0, 0.0, 1.0, 1.0]);
    }
}
