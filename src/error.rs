//! Error types shared by every subsystem of the render core.
//!
//! All fallible operations return [`RenderResult`]. Failures are logged with
//! [`log::error!`] at the point where they are detected, so callers that only
//! want to skip a frame can drop the error without losing the diagnostic.

use crate::geometry::VertexFormat;

/// Errors produced by pools, arenas, registries and the graphics boundary.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// A fixed-capacity container is full.
    #[error("{pool} is full (capacity {capacity})")]
    CapacityExceeded {
        /// Name of the container that rejected the insert.
        pool: &'static str,
        /// The container's fixed capacity.
        capacity: usize,
    },

    /// A vertex layout the geometry registry does not know how to stride.
    #[error("unsupported vertex format: {0:?}")]
    UnsupportedFormat(VertexFormat),

    /// A GPU object (device, buffer, texture, shader, pass) could not be created.
    #[error("resource initialization failed: {0}")]
    ResourceInitFailure(String),

    /// The arena has fewer bytes left than an allocation asked for.
    #[error("arena exhausted: requested {requested} bytes, {remaining} remaining")]
    ArenaExhausted { requested: usize, remaining: usize },

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    /// An identifier is already live in a pool.
    #[error("duplicate identifier: {0}")]
    DuplicateId(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// No free region in any layer of the texture atlas.
    #[error("texture atlas has no room for {0}")]
    AtlasFull(String),

    #[error("worker pool has been stopped")]
    WorkerPoolStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("font error: {0}")]
    Font(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("geometry error: {0}")]
    Geometry(String),
}

pub type RenderResult<T> = Result<T, RenderError>;
