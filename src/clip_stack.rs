//! Clip coverage tracking.
//!
//! The canvas records every clip here. The stack maintains the conservative
//! axis-aligned coverage of the active clip chain (for scissor derivation and
//! draw culling), culls clips that cannot change anything, and keeps the
//! renderable entries alive so a backdrop flip can replay them into a fresh
//! depth buffer.

use lyon::math::Box2D;
use smallvec::SmallVec;

use crate::geometry::{Geometry, Transform};

/// How a clip combines with the current clip region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipOp {
    /// Keep only pixels inside the geometry.
    Intersect,
    /// Remove pixels inside the geometry.
    Difference,
}

/// What the canvas must do with a recorded clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipStatus {
    /// The clip cannot change any pixel and was not recorded.
    Culled,
    /// The clip is fully expressed by the recomputed scissor; no depth
    /// geometry needs to render.
    ScissorOnly,
    /// The clip's geometry must render into the depth buffer.
    NeedsRender,
}

/// One active clip, kept for backdrop-flip replay.
#[derive(Debug, Clone)]
pub struct ClipEntry {
    pub geometry: Geometry,
    pub transform: Transform,
    pub op: ClipOp,
    /// Depth the clip was recorded at; replayed entities reuse it.
    pub clip_depth: u64,
    pub is_aa: bool,
    /// False for scissor-only entries, which need no geometry at replay.
    pub needs_render: bool,
}

struct Scope {
    height_floor: usize,
    saved_coverage: Option<Box2D>,
}

/// Per-subpass clip state. Coverage `None` means everything is clipped away.
pub struct ClipCoverageStack {
    entries: Vec<ClipEntry>,
    scopes: SmallVec<[Scope; 8]>,
    coverage: Option<Box2D>,
    initial_coverage: Box2D,
}

impl ClipCoverageStack {
    /// `initial` is the pass coverage in pass-local coordinates.
    pub fn new(initial: Box2D) -> Self {
        Self {
            entries: Vec::new(),
            scopes: SmallVec::new(),
            coverage: Some(initial),
            initial_coverage: initial,
        }
    }

    pub fn save(&mut self) {
        self.scopes.push(Scope {
            height_floor: self.entries.len(),
            saved_coverage: self.coverage,
        });
    }

    /// Rolls back to the matching [`save`](Self::save). Returns the number of
    /// clip entries discarded. An unbalanced restore is a no-op.
    pub fn restore(&mut self) -> usize {
        match self.scopes.pop() {
            Some(scope) => {
                let removed = self.entries.len() - scope.height_floor;
                self.entries.truncate(scope.height_floor);
                self.coverage = scope.saved_coverage;
                removed
            }
            None => 0,
        }
    }

    /// Conservative coverage of the unclipped region, `None` when empty.
    pub fn coverage(&self) -> Option<Box2D> {
        self.coverage
    }

    pub fn initial_coverage(&self) -> Box2D {
        self.initial_coverage
    }

    /// All clips active right now, oldest first. Replayed after a backdrop
    /// flip to rebuild the new pass's depth buffer.
    pub fn active_entries(&self) -> &[ClipEntry] {
        &self.entries
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Records a clip and updates coverage.
    ///
    /// Clips that provably cannot change any pixel are culled: an intersect
    /// whose geometry already contains the whole current coverage, or a
    /// difference whose geometry misses it entirely.
    pub fn record_clip(
        &mut self,
        geometry: Geometry,
        transform: Transform,
        op: ClipOp,
        is_aa: bool,
        clip_depth: u64,
    ) -> ClipStatus {
        let Some(current) = self.coverage else {
            // Everything is already clipped away.
            return ClipStatus::Culled;
        };
        let clip_coverage = geometry.coverage(&transform);

        let status = match op {
            ClipOp::Intersect => {
                if geometry.covers_area(&transform, &current) {
                    return ClipStatus::Culled;
                }
                self.coverage = clip_coverage.and_then(|c| c.intersection(&current));
                if geometry.is_axis_aligned_rect(&transform) {
                    ClipStatus::ScissorOnly
                } else {
                    ClipStatus::NeedsRender
                }
            }
            ClipOp::Difference => {
                match clip_coverage {
                    None => return ClipStatus::Culled,
                    Some(c) if c.intersection(&current).is_none() => {
                        return ClipStatus::Culled;
                    }
                    Some(_) => {}
                }
                if geometry.covers_area(&transform, &current) {
                    self.coverage = None;
                }
                // Coverage otherwise stays conservative; a difference clip
                // only punches holes.
                ClipStatus::NeedsRender
            }
        };

        self.entries.push(ClipEntry {
            geometry,
            transform,
            op,
            clip_depth,
            is_aa,
            needs_render: status == ClipStatus::NeedsRender,
        });
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lyon::math::point;

    fn rect(x0: f32, y0: f32, x1: f32, y1: f32) -> Box2D {
        Box2D::new(point(x0, y0), point(x1, y1))
    }

    fn stack() -> ClipCoverageStack {
        ClipCoverageStack::new(rect(0.0, 0.0, 100.0, 100.0))
    }

    #[test]
    fn intersect_narrows_coverage() {
        let mut s = stack();
        let status = s.record_clip(
            Geometry::Rect(rect(10.0, 10.0, 40.0, 40.0)),
            Transform::identity(),
            ClipOp::Intersect,
            true,
            1,
        );
        assert_eq!(status, ClipStatus::ScissorOnly);
        assert_eq!(s.coverage(), Some(rect(10.0, 10.0, 40.0, 40.0)));
    }

    #[test]
    fn redundant_intersect_is_culled() {
        let mut s = stack();
        s.record_clip(
            Geometry::Rect(rect(10.0, 10.0, 40.0, 40.0)),
            Transform::identity(),
            ClipOp::Intersect,
            true,
            1,
        );
        // The same clip again already contains the whole coverage.
        let status = s.record_clip(
            Geometry::Rect(rect(10.0, 10.0, 40.0, 40.0)),
            Transform::identity(),
            ClipOp::Intersect,
            true,
            2,
        );
        assert_eq!(status, ClipStatus::Culled);
        assert_eq!(s.active_entries().len(), 1);
        assert_eq!(s.coverage(), Some(rect(10.0, 10.0, 40.0, 40.0)));
    }

    #[test]
    fn non_rect_clip_needs_render() {
        let mut s = stack();
        let status = s.record_clip(
            Geometry::circle(point(50.0, 50.0), 10.0),
            Transform::identity(),
            ClipOp::Intersect,
            true,
            1,
        );
        assert_eq!(status, ClipStatus::NeedsRender);
        assert_eq!(s.coverage(), Some(rect(40.0, 40.0, 60.0, 60.0)));
    }

    #[test]
    fn difference_keeps_coverage_conservative() {
        let mut s = stack();
        let status = s.record_clip(
            Geometry::Rect(rect(10.0, 10.0, 40.0, 40.0)),
            Transform::identity(),
            ClipOp::Difference,
            true,
            1,
        );
        assert_eq!(status, ClipStatus::NeedsRender);
        assert_eq!(s.coverage(), Some(rect(0.0, 0.0, 100.0, 100.0)));
    }

    #[test]
    fn difference_covering_everything_empties_coverage() {
        let mut s = stack();
        let status = s.record_clip(
            Geometry::Rect(rect(-10.0, -10.0, 200.0, 200.0)),
            Transform::identity(),
            ClipOp::Difference,
            true,
            1,
        );
        assert_eq!(status, ClipStatus::NeedsRender);
        assert!(s.coverage().is_none());
    }

    #[test]
    fn offscreen_difference_is_culled() {
        let mut s = stack();
        let status = s.record_clip(
            Geometry::Rect(rect(-50.0, -50.0, -10.0, -10.0)),
            Transform::identity(),
            ClipOp::Difference,
            true,
            1,
        );
        assert_eq!(status, ClipStatus::Culled);
        assert!(s.active_entries().is_empty());
    }

    #[test]
    fn restore_rolls_back_coverage_and_entries() {
        let mut s = stack();
        s.save();
        s.record_clip(
            Geometry::Rect(rect(10.0, 10.0, 40.0, 40.0)),
            Transform::identity(),
            ClipOp::Intersect,
            true,
            1,
        );
        s.save();
        s.record_clip(
            Geometry::circle(point(20.0, 20.0), 5.0),
            Transform::identity(),
            ClipOp::Intersect,
            true,
            2,
        );
        assert_eq!(s.active_entries().len(), 2);

        assert_eq!(s.restore(), 1);
        assert_eq!(s.coverage(), Some(rect(10.0, 10.0, 40.0, 40.0)));
        assert_eq!(s.active_entries().len(), 1);

        assert_eq!(s.restore(), 1);
        assert_eq!(s.coverage(), Some(rect(0.0, 0.0, 100.0, 100.0)));
        assert!(s.active_entries().is_empty());
    }

    #[test]
    fn empty_intersection_clips_everything() {
        let mut s = stack();
        s.record_clip(
            Geometry::Rect(rect(200.0, 200.0, 300.0, 300.0)),
            Transform::identity(),
            ClipOp::Intersect,
            true,
            1,
        );
        assert!(s.coverage().is_none());
        // Further clips are culled outright.
        let status = s.record_clip(
            Geometry::Rect(rect(0.0, 0.0, 10.0, 10.0)),
            Transform::identity(),
            ClipOp::Intersect,
            true,
            2,
        );
        assert_eq!(status, ClipStatus::Culled);
    }
}
