//! A resolved draw bound for a render pass.

use lyon::math::Box2D;

use crate::color::BlendMode;
use crate::contents::Contents;
use crate::geometry::Transform;

/// One resolved draw: contents plus the compositing state captured at
/// submission time.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Canvas-to-pass transform, already offset by the subpass origin.
    pub transform: Transform,
    pub blend_mode: BlendMode,
    /// Raw clip depth the entity renders at. Monotonic per recording; the
    /// backend normalizes it into the depth range before upload.
    pub clip_depth: u64,
    /// Opacity accumulated from collapsed opacity-only layers above this
    /// entity. Multiplied into the contents' colors at encode time.
    pub inherited_opacity: f32,
    pub contents: Contents,
}

impl Entity {
    pub fn coverage(&self) -> Option<Box2D> {
        self.contents.coverage(&self.transform)
    }

    /// True when the entity fully paints `rect`, used for the background
    /// clear fast path and blend downgrades.
    pub fn covers_area(&self, rect: &Box2D) -> bool {
        self.inherited_opacity >= 1.0 && self.contents.covers_area(&self.transform, rect)
    }

    pub fn is_opaque(&self) -> bool {
        self.inherited_opacity >= 1.0 && self.contents.is_opaque()
    }
}

/// Normalizes a raw clip depth into the `(0, 1]` range the depth buffer
/// expects. Depth 0 is reserved for the clear plane.
pub(crate) fn normalized_depth(depth: u64, max_depth: u64) -> f32 {
    debug_assert!(depth <= max_depth);
    if max_depth == 0 {
        return 1.0;
    }
    (depth as f64 / max_depth as f64) as f32
}
