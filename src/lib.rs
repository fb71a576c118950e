//! A retained-order 2D compositor over wgpu.
//!
//! [`Canvas`] records one frame of vector drawing: paths, rounded rects,
//! text frames and images, with save layers, depth-emulated clipping and the
//! full set of Porter-Duff and advanced blend modes. Draws encode into GPU
//! render passes as they are submitted; [`Canvas::end_replay`] finishes the
//! frame and returns the rendered texture.

pub use lyon;
pub use wgpu;

mod backend;
mod canvas;
mod clip_stack;
mod color;
mod contents;
mod entity;
mod geometry;
mod paint;
mod target_cache;
mod tessellate;
mod text;
mod vertex;
mod wgpu_backend;

pub use backend::{
    BackendError, BlitPass, Capabilities, EntityPassTarget, GpuContext, GpuTexture, RenderPass,
    ScissorRect, TargetConfig, TextureRef,
};
pub use canvas::{BoundsPromise, Canvas, SaveLayerOptions};
pub use clip_stack::{ClipCoverageStack, ClipOp, ClipStatus};
pub use color::{BlendMode, Color};
pub use contents::{Contents, TextureContents, TextureQuad};
pub use entity::Entity;
pub use geometry::{Geometry, RoundingRadii, Transform, VertexMesh};
pub use paint::{
    BlurStyle, ColorFilter, ColorSource, ImageFilter, LineCap, LineJoin, MaskBlur, Paint,
    PaintStyle, StrokeParams, TileMode,
};
pub use target_cache::RenderTargetCache;
pub use tessellate::{LyonTessellator, Mesh, Tessellator};
pub use text::{GlyphQuad, TextFrame};
pub use vertex::GpuVertex;
pub use wgpu_backend::{WgpuBlitPass, WgpuContext, WgpuRenderPass, WgpuTexture};
