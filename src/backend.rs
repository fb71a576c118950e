//! Narrow contracts to the GPU backend.
//!
//! The compositor core never talks to a graphics API directly: it encodes
//! work through [`GpuContext`], [`RenderPass`] and [`BlitPass`]. The wgpu
//! implementation lives in [`crate::wgpu_backend`]; tests substitute counting
//! mocks.

use std::sync::Arc;

use lyon::math::Box2D;
use thiserror::Error;

use crate::color::Color;
use crate::entity::Entity;
use crate::paint::ImageFilter;

/// Failures reported by backend collaborators. None of these cross the
/// canvas API boundary; the affected operation degrades to a logged no-op.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("render target allocation failed for {width}x{height}")]
    TargetAllocation { width: u32, height: u32 },
    #[error("render pass could not be created")]
    PassCreation,
    #[error("blit pass could not be created")]
    BlitCreation,
    #[error("filter render failed")]
    FilterRender,
}

/// An opaque, reference-counted GPU texture handle.
pub trait GpuTexture: std::fmt::Debug {
    fn size(&self) -> (u32, u32);
    fn sample_count(&self) -> u32 {
        1
    }
    /// Backend implementations downcast through this to reach their native
    /// texture object.
    fn as_any(&self) -> &dyn std::any::Any;
}

pub type TextureRef = Arc<dyn GpuTexture>;

/// What the backend can do, queried once per recording.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Fragment shaders may read the in-flight destination pixel.
    pub framebuffer_fetch: bool,
    /// Offscreen targets may be multisampled.
    pub offscreen_msaa: bool,
    /// Resolve textures can be sampled directly.
    pub read_from_resolve: bool,
    /// Largest render pass attachment, in pixels.
    pub max_attachment_size: (u32, u32),
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            framebuffer_fetch: false,
            offscreen_msaa: true,
            read_from_resolve: true,
            max_attachment_size: (8192, 8192),
        }
    }
}

/// Requested attachment layout for an offscreen target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetConfig {
    pub msaa: bool,
    pub depth_stencil: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            msaa: false,
            depth_stencil: true,
        }
    }
}

/// Color/depth-stencil attachments (plus optional MSAA resolve) backing one
/// entity pass. Owned by exactly one subpass at a time and handed to the next
/// pass at a backdrop flip.
#[derive(Debug, Clone)]
pub struct EntityPassTarget {
    pub color: TextureRef,
    pub resolve: Option<TextureRef>,
    pub depth_stencil: Option<TextureRef>,
}

impl EntityPassTarget {
    pub fn size(&self) -> (u32, u32) {
        self.color.size()
    }

    pub fn is_msaa(&self) -> bool {
        self.color.sample_count() > 1
    }

    /// The texture that can be sampled once the pass has ended: the resolve
    /// attachment when multisampling, else the color attachment itself.
    pub fn readable(&self) -> TextureRef {
        self.resolve.clone().unwrap_or_else(|| self.color.clone())
    }

    pub fn config(&self) -> TargetConfig {
        TargetConfig {
            msaa: self.is_msaa(),
            depth_stencil: self.depth_stencil.is_some(),
        }
    }
}

/// A pixel-space scissor rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    /// Clamps a coverage box to a target of `size`, rounding outward so
    /// anti-aliased edges are never scissored away. `None` when the coverage
    /// misses the target entirely.
    pub fn from_coverage(coverage: &Box2D, size: (u32, u32)) -> Option<Self> {
        let min_x = coverage.min.x.floor().max(0.0) as u32;
        let min_y = coverage.min.y.floor().max(0.0) as u32;
        let max_x = (coverage.max.x.ceil().max(0.0) as u32).min(size.0);
        let max_y = (coverage.max.y.ceil().max(0.0) as u32).min(size.1);
        let width = max_x.saturating_sub(min_x);
        let height = max_y.saturating_sub(min_y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            x: min_x,
            y: min_y,
            width,
            height,
        })
    }
}

/// An open render pass accepting resolved entities in draw order.
pub trait RenderPass {
    fn set_scissor(&mut self, scissor: Option<ScissorRect>);

    /// Encodes one entity. Returns `false` when the entity could not be
    /// encoded; the caller treats that as a dropped draw, not an error.
    fn draw(&mut self, entity: &Entity) -> bool;

    /// Ends the pass and returns the readable output texture.
    fn end(self: Box<Self>) -> Result<TextureRef, BackendError>;
}

/// Texture-to-texture copies outside a render pass.
pub trait BlitPass {
    fn copy_texture(
        &mut self,
        source: &TextureRef,
        destination: &TextureRef,
        destination_origin: (u32, u32),
    ) -> bool;

    fn submit(self: Box<Self>) -> Result<(), BackendError>;
}

/// The GPU backend collaborator.
pub trait GpuContext {
    fn capabilities(&self) -> Capabilities;

    fn create_offscreen_target(
        &mut self,
        width: u32,
        height: u32,
        config: TargetConfig,
    ) -> Result<EntityPassTarget, BackendError>;

    /// Begins a render pass on `target`. `clear_color` of `None` loads the
    /// target's existing contents, which backdrop flips rely on after
    /// blitting the previous pass's output in.
    fn create_render_pass(
        &mut self,
        target: &EntityPassTarget,
        clear_color: Option<Color>,
    ) -> Result<Box<dyn RenderPass>, BackendError>;

    fn create_blit_pass(&mut self) -> Result<Box<dyn BlitPass>, BackendError>;

    /// Runs an image filter over `input`, returning a new texture. This is
    /// the expensive path amortized by the backdrop snapshot cache.
    fn render_filter(
        &mut self,
        filter: &ImageFilter,
        input: &TextureRef,
    ) -> Result<TextureRef, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lyon::math::point;

    #[test]
    fn scissor_rounds_outward_and_clamps() {
        let coverage = Box2D::new(point(1.2, 2.8), point(9.5, 40.0));
        let scissor = ScissorRect::from_coverage(&coverage, (20, 20)).unwrap();
        assert_eq!(scissor.x, 1);
        assert_eq!(scissor.y, 2);
        assert_eq!(scissor.width, 9);
        assert_eq!(scissor.height, 18);
    }

    #[test]
    fn offscreen_coverage_yields_no_scissor() {
        let coverage = Box2D::new(point(-10.0, -10.0), point(-1.0, -1.0));
        assert!(ScissorRect::from_coverage(&coverage, (20, 20)).is_none());
    }
}
