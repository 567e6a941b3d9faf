//! Geometry storage.
//!
//! All meshes share one vertex buffer and one index buffer. The
//! [`GeometryRegistry`] appends each mesh's bytes to CPU-side arena blocks at
//! a running cursor, mirrors the same range into the GPU buffers, and hands
//! back a [`GeometryId`] whose [`GeometryDescriptor`] records where the data
//! landed.
//!
//! Bytes are never reclaimed one mesh at a time: destroying a geometry only
//! drops its descriptor, and [`GeometryRegistry::clear_geometry_buffer`]
//! rewinds both cursors at once.
//!
//! [`Primitive`] builds CPU-side meshes (built-in shapes or STL models) that
//! can be tweaked before they are registered.

use std::path::Path;

use glam::{Quat, Vec3};
use slotmap::{SlotMap, new_key_type};

use crate::arena::{Arena, StagingBuffer};
use crate::error::{RenderError, RenderResult};
use crate::gfx::{BufferDesc, BufferHandle, BufferKind, GraphicsApi};

/// Interleaved vertex: position, texture coordinate, normal (32 bytes).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
}

impl Vertex {
    pub const LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<Vertex>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &[
            // position
            wgpu::VertexAttribute {
                offset: 0,
                shader_location: 0,
                format: wgpu::VertexFormat::Float32x3,
            },
            // uv
            wgpu::VertexAttribute {
                offset: 12,
                shader_location: 1,
                format: wgpu::VertexFormat::Float32x2,
            },
            // normal
            wgpu::VertexAttribute {
                offset: 20,
                shader_location: 2,
                format: wgpu::VertexFormat::Float32x3,
            },
        ],
    };

    pub fn new(position: [f32; 3], uv: [f32; 2], normal: [f32; 3]) -> Self {
        Self {
            position,
            uv,
            normal,
        }
    }
}

/// Vertex layout tag stored with each geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// No layout. Registering geometry with it fails.
    None,
    /// [`Vertex`]: vec3 position, vec2 uv, vec3 normal.
    PosTexNrm,
}

impl VertexFormat {
    pub fn stride(self) -> Option<usize> {
        match self {
            VertexFormat::None => None,
            VertexFormat::PosTexNrm => Some(std::mem::size_of::<Vertex>()),
        }
    }
}

pub const INDEX_SIZE: usize = std::mem::size_of::<u32>();

new_key_type! {
    /// Key of a registered geometry.
    pub struct GeometryId;
}

/// Where a geometry's data lives in the shared buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDescriptor {
    pub format: VertexFormat,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Offset of the first vertex, in vertices.
    pub base_vertex: u32,
    /// Byte offset into the index buffer.
    pub index_offset: usize,
    pub vertex_bytes: usize,
    pub index_bytes: usize,
}

impl GeometryDescriptor {
    /// Offset of the first index, in indices.
    pub fn first_index(&self) -> u32 {
        (self.index_offset / INDEX_SIZE) as u32
    }
}

pub struct GeometryRegistry {
    vertices: StagingBuffer,
    indices: StagingBuffer,
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    descriptors: SlotMap<GeometryId, GeometryDescriptor>,
}

impl GeometryRegistry {
    /// Reserves the vertex and index arena blocks and creates the matching
    /// GPU buffers.
    pub fn new<A: GraphicsApi>(
        api: &mut A,
        arena: &mut Arena,
        vertex_buffer_size: usize,
        index_buffer_size: usize,
    ) -> RenderResult<Self> {
        let vertices = StagingBuffer::new(arena.allocate(vertex_buffer_size)?);
        let indices = StagingBuffer::new(arena.allocate(index_buffer_size)?);
        let vertex_buffer =
            api.create_buffer(&BufferDesc::new(BufferKind::Vertex, vertex_buffer_size, 0))?;
        let index_buffer =
            api.create_buffer(&BufferDesc::new(BufferKind::Index, index_buffer_size, 0))?;

        Ok(Self {
            vertices,
            indices,
            vertex_buffer,
            index_buffer,
            descriptors: SlotMap::with_key(),
        })
    }

    /// Appends raw vertex and index bytes and uploads the same ranges.
    ///
    /// Index data is `u32`. Nothing is written unless both payloads fit.
    pub fn create_geometry<A: GraphicsApi>(
        &mut self,
        api: &mut A,
        arena: &mut Arena,
        format: VertexFormat,
        vertices: &[u8],
        indices: &[u8],
    ) -> RenderResult<GeometryId> {
        let Some(stride) = format.stride() else {
            log::error!("Cannot create geometry with vertex format {:?}", format);
            return Err(RenderError::UnsupportedFormat(format));
        };
        if vertices.len() % stride != 0 || indices.len() % INDEX_SIZE != 0 {
            log::error!(
                "Geometry payload is not a whole number of elements ({} vertex bytes, {} index bytes)",
                vertices.len(),
                indices.len()
            );
            return Err(RenderError::Geometry(format!(
                "{} vertex bytes / {} index bytes do not match stride {}",
                vertices.len(),
                indices.len(),
                stride
            )));
        }

        let vertex_room = self.vertices.capacity() - self.vertices.len();
        let index_room = self.indices.capacity() - self.indices.len();
        if vertices.len() > vertex_room || indices.len() > index_room {
            let (requested, remaining) = if vertices.len() > vertex_room {
                (vertices.len(), vertex_room)
            } else {
                (indices.len(), index_room)
            };
            log::error!(
                "Geometry buffer full: requested {} bytes, {} remaining",
                requested,
                remaining
            );
            return Err(RenderError::ArenaExhausted {
                requested,
                remaining,
            });
        }

        let vertex_offset = self.vertices.push_bytes(arena, vertices)?;
        let index_offset = self.indices.push_bytes(arena, indices)?;

        api.write_buffer(
            self.vertex_buffer,
            vertex_offset,
            &self.vertices.contents(arena)[vertex_offset..],
        );
        api.write_buffer(
            self.index_buffer,
            index_offset,
            &self.indices.contents(arena)[index_offset..],
        );

        let descriptor = GeometryDescriptor {
            format,
            vertex_count: (vertices.len() / stride) as u32,
            index_count: (indices.len() / INDEX_SIZE) as u32,
            base_vertex: (vertex_offset / stride) as u32,
            index_offset,
            vertex_bytes: vertices.len(),
            index_bytes: indices.len(),
        };
        Ok(self.descriptors.insert(descriptor))
    }

    /// Registers a CPU-side mesh.
    pub fn create_primitive<A: GraphicsApi>(
        &mut self,
        api: &mut A,
        arena: &mut Arena,
        primitive: &Primitive,
    ) -> RenderResult<GeometryId> {
        self.create_geometry(
            api,
            arena,
            VertexFormat::PosTexNrm,
            bytemuck::cast_slice(&primitive.vertices),
            bytemuck::cast_slice(&primitive.indices),
        )
    }

    pub fn get(&self, id: GeometryId) -> Option<&GeometryDescriptor> {
        self.descriptors.get(id)
    }

    /// Drops the descriptor. The bytes stay in the buffers until the next
    /// [`clear_geometry_buffer`](Self::clear_geometry_buffer).
    pub fn destroy_geometry(&mut self, id: GeometryId) -> Option<GeometryDescriptor> {
        self.descriptors.remove(id)
    }

    /// Rewinds both write cursors. GPU memory is left as is, so descriptors
    /// created before the clear keep drawing stale data until overwritten.
    pub fn clear_geometry_buffer(&mut self) {
        log::debug!(
            "Clearing geometry buffers ({} vertex bytes, {} index bytes)",
            self.vertices.len(),
            self.indices.len()
        );
        self.vertices.clear();
        self.indices.clear();
    }

    pub fn vertex_buffer(&self) -> BufferHandle {
        self.vertex_buffer
    }

    pub fn index_buffer(&self) -> BufferHandle {
        self.index_buffer
    }

    pub fn vertex_bytes_used(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_bytes_used(&self) -> usize {
        self.indices.len()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn destroy<A: GraphicsApi>(self, api: &mut A) {
        api.destroy_buffer(self.vertex_buffer);
        api.destroy_buffer(self.index_buffer);
    }
}

/// CPU-side triangle mesh in [`VertexFormat::PosTexNrm`].
#[derive(Clone, Debug, PartialEq)]
pub struct Primitive {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Primitive {
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    /// Triangle spanning `[-1, 1]` on X and Y, facing +Z.
    pub fn triangle() -> Self {
        let n = [0.0, 0.0, 1.0];
        Self::new(
            vec![
                Vertex::new([-1.0, -1.0, 0.0], [0.0, 0.0], n),
                Vertex::new([0.0, 1.0, 0.0], [0.5, 1.0], n),
                Vertex::new([1.0, -1.0, 0.0], [1.0, 0.0], n),
            ],
            vec![0, 1, 2],
        )
    }

    /// Quad spanning `[-1, 1]` on X and Y, facing +Z.
    pub fn quad() -> Self {
        let n = [0.0, 0.0, 1.0];
        Self::new(
            vec![
                Vertex::new([-1.0, -1.0, 0.0], [0.0, 0.0], n),
                Vertex::new([-1.0, 1.0, 0.0], [0.0, 1.0], n),
                Vertex::new([1.0, -1.0, 0.0], [1.0, 0.0], n),
                Vertex::new([1.0, 1.0, 0.0], [1.0, 1.0], n),
            ],
            vec![0, 1, 2, 1, 3, 2],
        )
    }

    /// Loads a model, picking the importer from the file extension.
    pub fn from_file(path: impl AsRef<Path>) -> RenderResult<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "stl" => Self::from_stl(path),
            _ => {
                log::error!("Unknown model format '{}' for {}", ext, path.display());
                Err(RenderError::Geometry(format!("unknown model format '{ext}'")))
            }
        }
    }

    pub fn from_stl(path: impl AsRef<Path>) -> RenderResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            log::error!("Failed to open model {}: {}", path.display(), e);
            RenderError::Io(e)
        })?;
        let mut reader = std::io::BufReader::new(file);
        Self::parse_stl(&mut reader)
    }

    pub fn from_stl_bytes(bytes: &[u8]) -> RenderResult<Self> {
        let mut cursor = std::io::Cursor::new(bytes);
        Self::parse_stl(&mut cursor)
    }

    fn parse_stl<R: std::io::Read + std::io::Seek>(reader: &mut R) -> RenderResult<Self> {
        let stl = stl_io::read_stl(reader).map_err(|e| {
            log::error!("STL parse error: {}", e);
            RenderError::Geometry(format!("STL parse error: {e}"))
        })?;

        let mut vertices = Vec::with_capacity(stl.faces.len() * 3);
        let mut indices = Vec::with_capacity(stl.faces.len() * 3);

        // Faces are unrolled so every corner carries its face normal.
        for (i, face) in stl.faces.iter().enumerate() {
            let normal: [f32; 3] = face.normal.into();
            for &vertex_index in &face.vertices {
                let position: [f32; 3] = stl.vertices[vertex_index].into();
                vertices.push(Vertex::new(position, [0.0, 0.0], normal));
            }

            let base = (i * 3) as u32;
            indices.extend_from_slice(&[base, base + 1, base + 2]);
        }

        Ok(Self::new(vertices, indices))
    }

    pub fn bounds(&self) -> (Vec3, Vec3) {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for v in &self.vertices {
            let p = Vec3::from(v.position);
            min = min.min(p);
            max = max.max(p);
        }
        (min, max)
    }

    pub fn translate(&mut self, offset: Vec3) {
        for v in &mut self.vertices {
            v.position = (Vec3::from(v.position) + offset).into();
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.vertices {
            v.position = (Vec3::from(v.position) * factor).into();
        }
    }

    pub fn rotate(&mut self, rotation: Quat) {
        for v in &mut self.vertices {
            v.position = (rotation * Vec3::from(v.position)).into();
            v.normal = (rotation * Vec3::from(v.normal)).into();
        }
    }

    /// Moves the bounding-box center to the origin.
    pub fn recenter(&mut self) {
        let (min, max) = self.bounds();
        self.translate(-(min + max) * 0.5);
    }

    /// Scales so the largest bounding-box extent is 1.
    pub fn normalize(&mut self) {
        let (min, max) = self.bounds();
        let size = max - min;
        let max_dim = size.x.max(size.y).max(size.z);
        if max_dim > 0.0 {
            self.scale(1.0 / max_dim);
        }
    }

    /// Area-weighted smooth normals from the triangle list.
    pub fn recalculate_normals(&mut self) {
        let mut normals = vec![Vec3::ZERO; self.vertices.len()];
        for tri in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            let p0 = Vec3::from(self.vertices[i0].position);
            let p1 = Vec3::from(self.vertices[i1].position);
            let p2 = Vec3::from(self.vertices[i2].position);
            let face_normal = (p1 - p0).cross(p2 - p0);
            for i in [i0, i1, i2] {
                normals[i] += face_normal;
            }
        }
        for (v, n) in self.vertices.iter_mut().zip(normals) {
            v.normal = n.normalize_or_zero().into();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::{ApiCall, SoftwareApi};
    use approx::assert_relative_eq;

    fn registry(api: &mut SoftwareApi, arena: &mut Arena) -> GeometryRegistry {
        GeometryRegistry::new(api, arena, 32 * 64, 4 * 64).unwrap()
    }

    #[test]
    fn vertex_is_32_bytes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(VertexFormat::PosTexNrm.stride(), Some(32));
    }

    #[test]
    fn sequential_geometry_is_contiguous() {
        let mut api = SoftwareApi::new(4, 4);
        let mut arena = Arena::new(4096, 64).unwrap();
        let mut geometry = registry(&mut api, &mut arena);

        let tri = geometry
            .create_primitive(&mut api, &mut arena, &Primitive::triangle())
            .unwrap();
        let quad = geometry
            .create_primitive(&mut api, &mut arena, &Primitive::quad())
            .unwrap();

        let tri = *geometry.get(tri).unwrap();
        let quad = *geometry.get(quad).unwrap();

        assert_eq!(tri.base_vertex, 0);
        assert_eq!(tri.index_offset, 0);
        assert_eq!(quad.base_vertex, 3);
        assert_eq!(quad.first_index(), 3);
        assert_eq!(quad.index_count, 6);
        assert_eq!(
            geometry.vertex_bytes_used(),
            tri.vertex_bytes + quad.vertex_bytes
        );
        assert_eq!(geometry.index_bytes_used(), tri.index_bytes + quad.index_bytes);

        let writes: Vec<_> = api
            .calls()
            .iter()
            .filter_map(|call| match call {
                ApiCall::WriteBuffer { offset, size, .. } => Some((*offset, *size)),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![(0, 96), (0, 12), (96, 128), (12, 24)]);
    }

    #[test]
    fn clear_rewinds_cursors() {
        let mut api = SoftwareApi::new(4, 4);
        let mut arena = Arena::new(4096, 64).unwrap();
        let mut geometry = registry(&mut api, &mut arena);

        geometry
            .create_primitive(&mut api, &mut arena, &Primitive::quad())
            .unwrap();
        geometry.clear_geometry_buffer();
        assert_eq!(geometry.vertex_bytes_used(), 0);
        assert_eq!(geometry.index_bytes_used(), 0);

        let again = geometry
            .create_primitive(&mut api, &mut arena, &Primitive::triangle())
            .unwrap();
        assert_eq!(geometry.get(again).unwrap().base_vertex, 0);
    }

    #[test]
    fn unsupported_format_writes_nothing() {
        let mut api = SoftwareApi::new(4, 4);
        let mut arena = Arena::new(4096, 64).unwrap();
        let mut geometry = registry(&mut api, &mut arena);
        api.clear_calls();

        let result = geometry.create_geometry(
            &mut api,
            &mut arena,
            VertexFormat::None,
            &[0; 32],
            &[0; 4],
        );
        assert!(matches!(
            result,
            Err(RenderError::UnsupportedFormat(VertexFormat::None))
        ));
        assert_eq!(geometry.vertex_bytes_used(), 0);
        assert!(api.calls().is_empty());
    }

    #[test]
    fn overflow_is_rejected_without_partial_write() {
        let mut api = SoftwareApi::new(4, 4);
        let mut arena = Arena::new(4096, 64).unwrap();
        let mut geometry = GeometryRegistry::new(&mut api, &mut arena, 32 * 8, 4 * 4).unwrap();

        let result = geometry.create_primitive(&mut api, &mut arena, &Primitive::quad());
        assert!(matches!(result, Err(RenderError::ArenaExhausted { .. })));
        assert_eq!(geometry.vertex_bytes_used(), 0);
        assert_eq!(geometry.index_bytes_used(), 0);
    }

    #[test]
    fn destroy_keeps_bytes() {
        let mut api = SoftwareApi::new(4, 4);
        let mut arena = Arena::new(4096, 64).unwrap();
        let mut geometry = registry(&mut api, &mut arena);

        let id = geometry
            .create_primitive(&mut api, &mut arena, &Primitive::triangle())
            .unwrap();
        assert!(geometry.destroy_geometry(id).is_some());
        assert!(geometry.get(id).is_none());
        assert_eq!(geometry.vertex_bytes_used(), 96);
    }

    #[test]
    fn recenter_and_normalize() {
        let mut quad = Primitive::quad();
        quad.translate(Vec3::new(4.0, 2.0, 0.0));
        quad.scale(3.0);
        quad.recenter();
        quad.normalize();

        let (min, max) = quad.bounds();
        assert_relative_eq!(min.x, -0.5, epsilon = 1e-6);
        assert_relative_eq!(max.y, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn recalculated_normals_face_viewer() {
        let mut tri = Primitive::triangle();
        for v in &mut tri.vertices {
            v.normal = [1.0, 0.0, 0.0];
        }
        tri.recalculate_normals();
        // Indices wind clockwise seen from +Z.
        assert_relative_eq!(tri.vertices[0].normal[2], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn unknown_model_extension() {
        assert!(matches!(
            Primitive::from_file("model.obj"),
            Err(RenderError::Geometry(_))
        ));
    }
}
