//! # Realware
//!
//! **A real-time renderer with order-independent transparency.**
//!
//! Game objects are batched into per-category instance buffers every frame and
//! drawn through a fixed five-pass graph: opaque geometry, weighted-blended
//! transparent geometry, screen-space text, a transparency composite over the
//! opaque color, and a final copy to the window.
//!
//! ## Quick Start
//!
//! ```no_run
//! use realware::*;
//!
//! fn main() -> RenderResult<()> {
//!     run(
//!         GraphicsConfig::default().title("Quad"),
//!         |ctx| {
//!             let quad = ctx.graphics.create_primitive(&Primitive::quad())?;
//!             ctx.objects.spawn(GameObject::new("quad").with_geometry(quad))?;
//!             *ctx.camera = Camera::new().at(Vec3::new(0.0, 0.0, 3.0)).looking_at(Vec3::ZERO);
//!             Ok(())
//!         },
//!         |frame| {
//!             if let Some(quad) = frame.objects.find("quad").and_then(|o| o.geometry) {
//!                 frame.draw_opaque(quad);
//!             }
//!         },
//!     )
//! }
//! ```
//!
//! Everything below [`Graphics`] goes through the [`GraphicsApi`] trait, so the
//! same frame runs on [`WgpuApi`] or on the CPU reference [`SoftwareApi`].

mod app;
mod arena;
mod batch;
mod camera;
mod config;
mod error;
mod font;
mod geometry;
pub mod gfx;
mod graphics;
mod ids;
mod material;
mod object;
pub mod pool;
mod render_pass;
mod texture_atlas;
mod thread_pool;

pub use app::{Frame, SetupContext, run};
pub use arena::{Arena, ArenaBlock, StagingBuffer};
pub use batch::{
    AtlasTextureRecord, BatchStats, CategoryBatch, GlyphRecord, InstanceRecord, MaterialRecord,
    TextBatch, layout_text,
};
pub use camera::Camera;
pub use config::GraphicsConfig;
pub use error::{RenderError, RenderResult};
pub use font::{Font, FontId, FontMetrics, Glyph, GlyphBitmap, Text};
pub use geometry::{
    GeometryDescriptor, GeometryId, GeometryRegistry, Primitive, Vertex, VertexFormat,
};
pub use gfx::{
    BlendFactor, BlendMode, BufferHandle, DepthMode, GraphicsApi, RenderPassHandle,
    RenderTargetHandle, ShaderHandle, ShaderSource, SoftwareApi, TextureDesc, TextureFormat,
    TextureHandle, Viewport, WgpuApi,
};
pub use graphics::{GeometryDraw, Graphics, base_shader_source};
pub use ids::IdGenerator;
pub use material::{CustomShader, Material, MaterialDesc, MaterialRegistry};
pub use object::{GameObject, GameObjectManager, Transform};
pub use pool::{Identified, Pool, PoolHandle};
pub use render_pass::{PassTexture, RenderPass, RenderPassDesc, RenderPath};
pub use texture_atlas::{AtlasTexture, TextureAtlas};
pub use thread_pool::ThreadPool;

// Re-export glam math types for convenience
pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
