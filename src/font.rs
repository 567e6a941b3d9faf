//! Fonts rasterized into single-channel glyph atlases.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{RenderError, RenderResult};
use crate::gfx::{GraphicsApi, TextureDesc, TextureFormat, TextureHandle};

/// Opaque identifier for a loaded font.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FontId(pub(crate) usize);

/// Widest glyph row before packing wraps to the next row.
pub const MAX_ATLAS_WIDTH: u32 = 2048;
const PADDING: u32 = 1;

/// Placement of one glyph, in font pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Glyph {
    pub width: u32,
    pub height: u32,
    /// Horizontal offset from the cursor to the bitmap's left edge.
    pub left: f32,
    /// Distance from the baseline up to the bitmap's top edge.
    pub top: f32,
    pub advance: f32,
    /// Top-left corner in the atlas.
    pub atlas_x: u32,
    pub atlas_y: u32,
}

/// Cursor offsets for characters that move the pen without drawing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FontMetrics {
    pub newline: f32,
    pub space: f32,
    pub tab: f32,
}

impl FontMetrics {
    pub fn new(line_height: f32, space: f32) -> Self {
        Self {
            newline: line_height,
            space,
            tab: space * 4.0,
        }
    }
}

/// A rasterized glyph before packing.
#[derive(Clone, Debug)]
pub struct GlyphBitmap {
    pub width: u32,
    pub height: u32,
    pub left: f32,
    pub top: f32,
    pub advance: f32,
    /// `width * height` coverage bytes, rows top to bottom.
    pub coverage: Vec<u8>,
}

/// A string drawn with a font. Attached to game objects.
#[derive(Clone, Debug, PartialEq)]
pub struct Text {
    pub font: FontId,
    pub string: String,
}

impl Text {
    pub fn new(font: FontId, string: impl Into<String>) -> Self {
        Self {
            font,
            string: string.into(),
        }
    }
}

pub struct Font {
    glyphs: HashMap<char, Glyph>,
    metrics: FontMetrics,
    texture: TextureHandle,
    atlas_width: u32,
    atlas_height: u32,
    size: f32,
}

impl Font {
    /// Rasterizes the printable ASCII range of a TTF/OTF font at `size` px.
    pub fn from_ttf_bytes<A: GraphicsApi>(api: &mut A, data: &[u8], size: f32) -> RenderResult<Self> {
        let font = fontdue::Font::from_bytes(data, fontdue::FontSettings::default()).map_err(|e| {
            log::error!("Failed to parse font: {}", e);
            RenderError::Font(e.to_string())
        })?;

        let bitmaps = ('!'..='~')
            .filter(|&c| font.lookup_glyph_index(c) != 0)
            .map(|c| {
                let (metrics, coverage) = font.rasterize(c, size);
                let bitmap = GlyphBitmap {
                    width: metrics.width as u32,
                    height: metrics.height as u32,
                    left: metrics.xmin as f32,
                    top: (metrics.ymin + metrics.height as i32) as f32,
                    advance: metrics.advance_width,
                    coverage,
                };
                (c, bitmap)
            })
            .collect::<Vec<_>>();

        let line_height = font
            .horizontal_line_metrics(size)
            .map(|m| m.new_line_size)
            .unwrap_or(size * 1.2);
        let space = font.metrics(' ', size).advance_width;

        Self::from_bitmaps(api, bitmaps, FontMetrics::new(line_height, space), size)
    }

    pub fn load<A: GraphicsApi>(api: &mut A, path: impl AsRef<Path>, size: f32) -> RenderResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            log::error!("Failed to read font {}: {}", path.display(), e);
            RenderError::Io(e)
        })?;
        Self::from_ttf_bytes(api, &data, size)
    }

    /// Packs already rasterized glyphs into a new atlas texture.
    pub fn from_bitmaps<A: GraphicsApi>(
        api: &mut A,
        bitmaps: Vec<(char, GlyphBitmap)>,
        metrics: FontMetrics,
        size: f32,
    ) -> RenderResult<Self> {
        let layout = pack_glyphs(bitmaps.iter().map(|(_, b)| (b.width, b.height)));

        let mut pixels = vec![0u8; layout.width as usize * layout.height as usize];
        let mut glyphs = HashMap::with_capacity(bitmaps.len());
        for ((c, bitmap), &(x, y)) in bitmaps.iter().zip(&layout.positions) {
            for row in 0..bitmap.height as usize {
                let src = row * bitmap.width as usize;
                let dst = (y as usize + row) * layout.width as usize + x as usize;
                if let Some(line) = bitmap.coverage.get(src..src + bitmap.width as usize) {
                    pixels[dst..dst + line.len()].copy_from_slice(line);
                }
            }
            glyphs.insert(
                *c,
                Glyph {
                    width: bitmap.width,
                    height: bitmap.height,
                    left: bitmap.left,
                    top: bitmap.top,
                    advance: bitmap.advance,
                    atlas_x: x,
                    atlas_y: y,
                },
            );
        }

        let texture = api.create_texture(&TextureDesc::new_2d(layout.width, layout.height, TextureFormat::R8))?;
        api.write_texture(texture, [0, 0, 0], [layout.width, layout.height], &pixels);
        log::debug!(
            "Font atlas created: {} glyphs in {}x{}",
            glyphs.len(),
            layout.width,
            layout.height
        );

        Ok(Self {
            glyphs,
            metrics,
            texture,
            atlas_width: layout.width,
            atlas_height: layout.height,
            size,
        })
    }

    pub fn glyph(&self, c: char) -> Option<&Glyph> {
        self.glyphs.get(&c)
    }

    pub fn metrics(&self) -> FontMetrics {
        self.metrics
    }

    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn atlas_size(&self) -> (u32, u32) {
        (self.atlas_width, self.atlas_height)
    }

    pub fn size(&self) -> f32 {
        self.size
    }

    /// Width of the widest line, in font pixels.
    pub fn text_width(&self, text: &str) -> f32 {
        let mut widest = 0.0f32;
        let mut line = 0.0;
        for c in text.chars() {
            match c {
                '\n' => {
                    widest = widest.max(line);
                    line = 0.0;
                }
                ' ' => line += self.metrics.space,
                '\t' => line += self.metrics.tab,
                c => line += self.glyph(c).map_or(0.0, |g| g.advance),
            }
        }
        widest.max(line)
    }

    /// Height spanned by the text, in font pixels: one line height per
    /// newline plus the tallest glyph.
    pub fn text_height(&self, text: &str) -> f32 {
        let tallest = text
            .chars()
            .filter_map(|c| self.glyph(c))
            .map(|g| g.height)
            .max()
            .unwrap_or(0);
        Self::newline_count(text) as f32 * self.metrics.newline + tallest as f32
    }

    pub fn character_count(text: &str) -> usize {
        text.chars().count()
    }

    pub fn newline_count(text: &str) -> usize {
        text.chars().filter(|&c| c == '\n').count()
    }

    pub fn destroy<A: GraphicsApi>(self, api: &mut A) {
        api.destroy_texture(self.texture);
    }
}

#[derive(Debug, PartialEq)]
struct GlyphLayout {
    positions: Vec<(u32, u32)>,
    width: u32,
    height: u32,
}

/// Row packing with one pixel of padding; rows wrap at [`MAX_ATLAS_WIDTH`]
/// and the final extent is rounded up to powers of two.
fn pack_glyphs(sizes: impl IntoIterator<Item = (u32, u32)>) -> GlyphLayout {
    let mut positions = Vec::new();
    let (mut x, mut y, mut row) = (0u32, 0u32, 0u32);
    let mut width = 0;

    for (w, h) in sizes {
        if x > 0 && x + w > MAX_ATLAS_WIDTH {
            x = 0;
            y += row + PADDING;
            row = 0;
        }
        positions.push((x, y));
        width = width.max(x + w);
        x += w + PADDING;
        row = row.max(h);
    }

    GlyphLayout {
        positions,
        width: width.max(1).next_power_of_two(),
        height: (y + row).max(1).next_power_of_two(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::SoftwareApi;
    use approx::assert_relative_eq;

    fn bitmap(width: u32, height: u32, advance: f32) -> GlyphBitmap {
        GlyphBitmap {
            width,
            height,
            left: 0.0,
            top: height as f32,
            advance,
            coverage: vec![255; (width * height) as usize],
        }
    }

    fn test_font(api: &mut SoftwareApi) -> Font {
        let glyphs = vec![('a', bitmap(3, 4, 4.0)), ('b', bitmap(2, 6, 3.0))];
        Font::from_bitmaps(api, glyphs, FontMetrics::new(10.0, 2.0), 8.0).unwrap()
    }

    #[test]
    fn packing_pads_and_rounds_up() {
        let layout = pack_glyphs([(3, 4), (2, 6), (5, 1)]);
        assert_eq!(layout.positions, vec![(0, 0), (4, 0), (7, 0)]);
        assert_eq!((layout.width, layout.height), (16, 8));
    }

    #[test]
    fn packing_wraps_rows_at_max_width() {
        let layout = pack_glyphs([(1500, 10), (1000, 20), (100, 5)]);
        assert_eq!(layout.positions, vec![(0, 0), (0, 11), (1001, 11)]);
        assert_eq!((layout.width, layout.height), (2048, 32));
    }

    #[test]
    fn glyphs_are_copied_into_atlas() {
        let mut api = SoftwareApi::new(4, 4);
        let font = test_font(&mut api);
        let b = font.glyph('b').unwrap();
        assert_eq!((b.atlas_x, b.atlas_y), (4, 0));
        assert_eq!(font.atlas_size(), (8, 8));

        assert_relative_eq!(api.read_texel(font.texture(), 4, 5, 0).unwrap().x, 1.0);
        assert_eq!(api.read_texel(font.texture(), 3, 0, 0).unwrap().x, 0.0);
    }

    #[test]
    fn text_metrics() {
        let mut api = SoftwareApi::new(4, 4);
        let font = test_font(&mut api);
        assert_relative_eq!(font.text_width("ab"), 7.0);
        assert_relative_eq!(font.text_width("a b\tz"), 4.0 + 2.0 + 3.0 + 8.0);
        assert_relative_eq!(font.text_width("aaa\nb"), 12.0);
        assert_relative_eq!(font.text_height("a\nb"), 16.0);
        assert_eq!(Font::character_count("a\nb"), 3);
        assert_eq!(Font::newline_count("a\n\nb"), 2);
    }

    #[test]
    fn invalid_font_data_is_an_error() {
        let mut api = SoftwareApi::new(4, 4);
        assert!(matches!(
            Font::from_ttf_bytes(&mut api, b"not a font", 16.0),
            Err(RenderError::Font(_))
        ));
    }
}
