//! Layered texture atlas.
//!
//! One RGBA8 array texture (`width` x `height` x `depth` layers) holds every
//! material texture. Sub-textures are packed shelf by shelf into the first
//! layer with room and tracked in a [`Pool`] of [`AtlasTexture`] entries, so
//! materials and passes can refer to them by [`PoolHandle`].
//!
//! Regions are not reclaimed when a texture is destroyed; the atlas is meant
//! to be filled at load time.

use std::path::Path;

use glam::{Vec2, Vec3};

use crate::error::{RenderError, RenderResult};
use crate::gfx::{GraphicsApi, TextureDesc, TextureFormat, TextureHandle};
use crate::pool::{Identified, Pool, PoolHandle};

/// A sub-rectangle of the atlas.
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasTexture {
    pub id: String,
    /// `x`, `y` and layer of the top-left corner.
    pub offset: Vec3,
    pub size: Vec2,
    /// Whether `offset.xy` and `size` are in `[0, 1]` atlas units rather
    /// than pixels. The layer is never normalized.
    pub normalized: bool,
}

impl Identified for AtlasTexture {
    fn id(&self) -> &str {
        &self.id
    }
}

impl AtlasTexture {
    pub fn layer(&self) -> u32 {
        self.offset.z as u32
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Shelf {
    cursor_x: u32,
    cursor_y: u32,
    row_height: u32,
}

pub struct TextureAtlas {
    texture: TextureHandle,
    width: u32,
    height: u32,
    depth: u32,
    shelves: Vec<Shelf>,
    textures: Pool<AtlasTexture>,
}

impl TextureAtlas {
    pub fn new<A: GraphicsApi>(
        api: &mut A,
        width: u32,
        height: u32,
        depth: u32,
        capacity: usize,
    ) -> RenderResult<Self> {
        let texture =
            api.create_texture(&TextureDesc::new_array(width, height, depth, TextureFormat::Rgba8))?;
        log::debug!("Texture atlas created: {}x{}x{}", width, height, depth);

        Ok(Self {
            texture,
            width,
            height,
            depth,
            shelves: vec![Shelf::default(); depth as usize],
            textures: Pool::new("texture atlas", capacity),
        })
    }

    /// Copies `data` (`channels` bytes per pixel, rows top to bottom) into a
    /// free region of the atlas.
    pub fn create_texture<A: GraphicsApi>(
        &mut self,
        api: &mut A,
        id: &str,
        width: u32,
        height: u32,
        channels: u32,
        data: &[u8],
    ) -> RenderResult<PoolHandle<AtlasTexture>> {
        if self.textures.is_full() {
            log::error!("Texture atlas is full, cannot add '{}'", id);
            return Err(RenderError::CapacityExceeded {
                pool: "texture atlas",
                capacity: self.textures.capacity(),
            });
        }
        if self.textures.find(id).is_some() {
            log::error!("Texture atlas already contains '{}'", id);
            return Err(RenderError::DuplicateId(id.to_string()));
        }

        let rgba = to_rgba8(width, height, channels, data)?;
        let Some((x, y, layer)) = self.allocate(width, height) else {
            log::error!("No room in texture atlas for '{}' ({}x{})", id, width, height);
            return Err(RenderError::AtlasFull(id.to_string()));
        };

        api.write_texture(self.texture, [x, y, layer], [width, height], &rgba);

        self.textures.add(AtlasTexture {
            id: id.to_string(),
            offset: Vec3::new(x as f32, y as f32, layer as f32),
            size: Vec2::new(width as f32, height as f32),
            normalized: false,
        })
    }

    pub fn create_texture_from_file<A: GraphicsApi>(
        &mut self,
        api: &mut A,
        id: &str,
        path: impl AsRef<Path>,
    ) -> RenderResult<PoolHandle<AtlasTexture>> {
        let path = path.as_ref();
        let img = image::open(path)
            .map_err(|e| {
                log::error!("Failed to load texture {}: {}", path.display(), e);
                RenderError::Image(e)
            })?
            .to_rgba8();
        let (width, height) = img.dimensions();
        self.create_texture(api, id, width, height, 4, &img)
    }

    pub fn create_texture_from_bytes<A: GraphicsApi>(
        &mut self,
        api: &mut A,
        id: &str,
        bytes: &[u8],
    ) -> RenderResult<PoolHandle<AtlasTexture>> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| {
                log::error!("Failed to decode texture '{}': {}", id, e);
                RenderError::Image(e)
            })?
            .to_rgba8();
        let (width, height) = img.dimensions();
        self.create_texture(api, id, width, height, 4, &img)
    }

    fn allocate(&mut self, width: u32, height: u32) -> Option<(u32, u32, u32)> {
        if width == 0 || height == 0 || width > self.width || height > self.height {
            return None;
        }
        for (layer, shelf) in self.shelves.iter_mut().enumerate() {
            let (mut x, mut y, mut row) = (shelf.cursor_x, shelf.cursor_y, shelf.row_height);
            if x + width > self.width {
                x = 0;
                y += row;
                row = 0;
            }
            if y + height > self.height {
                continue;
            }
            *shelf = Shelf {
                cursor_x: x + width,
                cursor_y: y,
                row_height: row.max(height),
            };
            return Some((x, y, layer as u32));
        }
        None
    }

    pub fn find_texture(&self, id: &str) -> Option<&AtlasTexture> {
        self.textures.find(id)
    }

    pub fn handle_of(&self, id: &str) -> Option<PoolHandle<AtlasTexture>> {
        self.textures.handle_of(id)
    }

    pub fn get(&self, handle: PoolHandle<AtlasTexture>) -> Option<&AtlasTexture> {
        self.textures.get(handle)
    }

    /// Forgets the entry. Handles to it stop resolving; its pixels stay.
    pub fn destroy_texture(&mut self, id: &str) -> bool {
        self.textures.delete(id).is_some()
    }

    /// The entry's rectangle in `[0, 1]` atlas units.
    pub fn normalized_area(&self, texture: &AtlasTexture) -> AtlasTexture {
        if texture.normalized {
            return texture.clone();
        }
        let extent = Vec2::new(self.width as f32, self.height as f32);
        AtlasTexture {
            id: texture.id.clone(),
            offset: (texture.offset.truncate() / extent).extend(texture.offset.z),
            size: texture.size / extent,
            normalized: true,
        }
    }

    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn size(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.depth)
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn destroy<A: GraphicsApi>(self, api: &mut A) {
        api.destroy_texture(self.texture);
    }
}

fn to_rgba8(width: u32, height: u32, channels: u32, data: &[u8]) -> RenderResult<Vec<u8>> {
    let pixels = width as usize * height as usize;
    if !(1..=4).contains(&channels) || data.len() < pixels * channels as usize {
        log::error!(
            "Texture data does not match {}x{} with {} channels",
            width,
            height,
            channels
        );
        return Err(RenderError::ResourceInitFailure(format!(
            "{} bytes for a {width}x{height} texture with {channels} channels",
            data.len()
        )));
    }

    let rgba = data
        .chunks_exact(channels as usize)
        .take(pixels)
        .flat_map(|px| match px {
            [v] => [*v, *v, *v, 255],
            [v, a] => [*v, *v, *v, *a],
            [r, g, b] => [*r, *g, *b, 255],
            [r, g, b, a] => [*r, *g, *b, *a],
            _ => [0, 0, 0, 0],
        })
        .collect();
    Ok(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::SoftwareApi;
    use approx::assert_relative_eq;

    fn atlas(api: &mut SoftwareApi) -> TextureAtlas {
        TextureAtlas::new(api, 8, 8, 2, 8).unwrap()
    }

    #[test]
    fn packs_rows_then_layers() {
        let mut api = SoftwareApi::new(4, 4);
        let mut atlas = atlas(&mut api);
        let px = [255u8; 4 * 6 * 4];

        for id in ["a", "b", "c"] {
            atlas.create_texture(&mut api, id, 4, 4, 4, &px).unwrap();
        }
        atlas.create_texture(&mut api, "d", 6, 4, 4, &px).unwrap();

        let a = atlas.find_texture("a").unwrap();
        let b = atlas.find_texture("b").unwrap();
        let c = atlas.find_texture("c").unwrap();
        let d = atlas.find_texture("d").unwrap();
        assert_eq!(a.offset, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(b.offset, Vec3::new(4.0, 0.0, 0.0));
        assert_eq!(c.offset, Vec3::new(0.0, 4.0, 0.0));
        assert_eq!(d.offset, Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(d.layer(), 1);
    }

    #[test]
    fn full_atlas_is_reported() {
        let mut api = SoftwareApi::new(4, 4);
        let mut atlas = TextureAtlas::new(&mut api, 4, 4, 1, 8).unwrap();
        let px = [0u8; 16];
        atlas.create_texture(&mut api, "a", 4, 4, 1, &px).unwrap();
        assert!(matches!(
            atlas.create_texture(&mut api, "b", 1, 1, 1, &px),
            Err(RenderError::AtlasFull(_))
        ));
        assert!(matches!(
            atlas.create_texture(&mut api, "c", 5, 1, 1, &px),
            Err(RenderError::AtlasFull(_))
        ));
        assert_eq!(atlas.len(), 1);
    }

    #[test]
    fn pixels_land_in_atlas_texture() {
        let mut api = SoftwareApi::new(4, 4);
        let mut atlas = atlas(&mut api);
        atlas.create_texture(&mut api, "skip", 4, 1, 1, &[0; 4]).unwrap();
        atlas
            .create_texture(&mut api, "red", 1, 1, 3, &[255, 0, 0])
            .unwrap();

        let texel = api.read_texel(atlas.texture(), 4, 0, 0).unwrap();
        assert_relative_eq!(texel.x, 1.0);
        assert_relative_eq!(texel.y, 0.0);
        assert_relative_eq!(texel.w, 1.0);
    }

    #[test]
    fn normalized_area_divides_by_extent() {
        let mut api = SoftwareApi::new(4, 4);
        let mut atlas = atlas(&mut api);
        atlas.create_texture(&mut api, "a", 4, 2, 1, &[0; 8]).unwrap();
        atlas.create_texture(&mut api, "b", 2, 2, 1, &[0; 4]).unwrap();

        let b = atlas.normalized_area(atlas.find_texture("b").unwrap());
        assert!(b.normalized);
        assert_relative_eq!(b.offset.x, 0.5);
        assert_relative_eq!(b.size.x, 0.25);
        assert_relative_eq!(b.size.y, 0.25);
        assert_eq!(atlas.normalized_area(&b), b);
    }

    #[test]
    fn destroyed_texture_handle_goes_stale() {
        let mut api = SoftwareApi::new(4, 4);
        let mut atlas = atlas(&mut api);
        let handle = atlas.create_texture(&mut api, "a", 1, 1, 1, &[9]).unwrap();
        assert!(atlas.destroy_texture("a"));
        assert!(atlas.get(handle).is_none());
        assert!(!atlas.destroy_texture("a"));
    }

    #[test]
    fn rejects_short_data_and_bad_channels() {
        let mut api = SoftwareApi::new(4, 4);
        let mut atlas = atlas(&mut api);
        assert!(atlas.create_texture(&mut api, "a", 2, 2, 4, &[0; 15]).is_err());
        assert!(atlas.create_texture(&mut api, "b", 1, 1, 5, &[0; 5]).is_err());
        assert!(atlas.is_empty());
    }
}
