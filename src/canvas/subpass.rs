//! Subpass bookkeeping: save stack entries, offscreen pass state, backdrop
//! snapshot sharing and the subpass pixel-alignment policy.

use lyon::math::{point, Box2D, Point};

use crate::backend::{EntityPassTarget, RenderPass, ScissorRect, TextureRef};
use crate::clip_stack::ClipCoverageStack;
use crate::color::Color;
use crate::geometry::Transform;
use crate::paint::{ImageFilter, Paint};

/// How the scope opened by a save point renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenderingMode {
    /// Draws go to the enclosing pass.
    Direct,
    /// An offscreen subpass composited over the parent at restore.
    Subpass,
    /// A subpass whose first content is a filtered backdrop snapshot.
    SubpassWithBackdrop,
}

/// One save point. The stack always holds at least the root entry.
pub(crate) struct StackEntry {
    pub transform: Transform,
    /// Depth ceiling for this scope. Draws must stay at or below it.
    pub clip_depth: u64,
    /// True when the scope reserved an exact slot count; restore then jumps
    /// the depth counter to the ceiling so siblings line up whether or not
    /// the subtree rendered.
    pub reserved: bool,
    pub num_clips: u64,
    /// Opacity accumulated from collapsed opacity-only save layers.
    pub distributed_opacity: f32,
    pub mode: RenderingMode,
    /// Set when this scope's coverage came up empty; children still push and
    /// pop but emit nothing.
    pub skipping: bool,
}

/// Deferred compositing state for a save layer, applied at restore.
pub(crate) struct LayerInfo {
    pub paint: Paint,
    /// Where the subpass texture lands in canvas coordinates.
    pub origin: Point,
    /// Logical content size; may be smaller than the pooled texture.
    pub size: (f32, f32),
    #[allow(dead_code)]
    pub did_round_out: bool,
}

/// One live render pass and its clip state. Index 0 is the root pass.
pub(crate) struct SubpassState {
    pub target: EntityPassTarget,
    /// Begun lazily on the first draw so a clear-only pass can be absorbed
    /// by the background-color fast path.
    pub pass: Option<Box<dyn RenderPass>>,
    pub pending_clear: Option<Color>,
    pub clip_stack: ClipCoverageStack,
    /// Pass origin in canvas coordinates; entity transforms subtract it.
    pub origin: Point,
    pub scissor: Option<ScissorRect>,
    /// `None` for the root pass.
    pub layer: Option<LayerInfo>,
    pub has_drawn: bool,
}

impl SubpassState {
    pub(crate) fn new(
        target: EntityPassTarget,
        origin: Point,
        content_size: (f32, f32),
        layer: Option<LayerInfo>,
    ) -> Self {
        let clip_stack = ClipCoverageStack::new(Box2D::new(
            point(0.0, 0.0),
            point(content_size.0, content_size.1),
        ));
        Self {
            target,
            pass: None,
            pending_clear: Some(Color::TRANSPARENT),
            clip_stack,
            origin,
            scissor: None,
            layer,
            has_drawn: false,
        }
    }

    /// The pass-local transform for an entity submitted under `canvas`.
    pub(crate) fn local_transform(&self, canvas: &Transform) -> Transform {
        canvas.then(&Transform::translation(-self.origin.x, -self.origin.y))
    }
}

/// Shared backdrop state for save layers naming the same backdrop id.
///
/// The flipped texture is reused by every sharer; the filtered snapshot only
/// when all sharers request an identical filter.
#[derive(Default)]
pub(crate) struct BackdropData {
    pub flipped: Option<TextureRef>,
    pub filter: Option<ImageFilter>,
    pub snapshot: Option<TextureRef>,
}

/// A subpass extent after applying the pixel-alignment policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AlignedBounds {
    pub origin: Point,
    pub width: f32,
    pub height: f32,
    pub did_round_out: bool,
}

/// Aligns a subpass coverage rect to pixels.
///
/// Image-filtered layers keep fractional (clamped) bounds because the filter
/// resamples anyway; unfiltered layers round out to whole pixels with a
/// floored origin so the composite blit stays texel-aligned. This asymmetry
/// is deliberate; changing either side reintroduces sub-pixel sampling
/// artifacts.
pub(crate) fn align_subpass_bounds(coverage: Box2D, filtered: bool) -> AlignedBounds {
    if filtered {
        return AlignedBounds {
            origin: coverage.min,
            width: coverage.max.x - coverage.min.x,
            height: coverage.max.y - coverage.min.y,
            did_round_out: false,
        };
    }
    let min = point(coverage.min.x.floor(), coverage.min.y.floor());
    let max = point(coverage.max.x.ceil(), coverage.max.y.ceil());
    AlignedBounds {
        origin: min,
        width: max.x - min.x,
        height: max.y - min.y,
        did_round_out: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfiltered_bounds_round_out() {
        let coverage = Box2D::new(point(1.3, 2.7), point(10.2, 11.5));
        let aligned = align_subpass_bounds(coverage, false);
        assert_eq!(aligned.origin, point(1.0, 2.0));
        assert_eq!(aligned.width, 10.0);
        assert_eq!(aligned.height, 10.0);
        assert!(aligned.did_round_out);
    }

    #[test]
    fn filtered_bounds_stay_fractional() {
        let coverage = Box2D::new(point(1.3, 2.7), point(10.2, 11.5));
        let aligned = align_subpass_bounds(coverage, true);
        assert_eq!(aligned.origin, point(1.3, 2.7));
        assert!((aligned.width - 8.9).abs() < 1e-5);
        assert!(!aligned.did_round_out);
    }
}
