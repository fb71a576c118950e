//! The tessellation collaborator.
//!
//! General path fills and strokes are delegated through the [`Tessellator`]
//! trait; the shipped implementation wraps lyon's fill and stroke
//! tessellators. Convex fast-path geometry never reaches this module — the
//! geometry builders emit triangle fans directly.

use lyon::lyon_tessellation::{
    BuffersBuilder, FillOptions, FillTessellator, FillVertex, StrokeOptions, StrokeTessellator,
    StrokeVertex, VertexBuffers,
};
use lyon::path::{FillRule, Path};
use lyon::tessellation::{FillVertexConstructor, StrokeVertexConstructor};

use crate::paint::{LineCap, LineJoin, StrokeParams};
use crate::vertex::GpuVertex;

/// The mesh type produced by all geometry lowering.
pub type Mesh = VertexBuffers<GpuVertex, u16>;

/// Turns paths into triangle meshes.
///
/// `tolerance` is the maximum curve flattening error in destination pixels;
/// callers derive it from the current transform scale.
pub trait Tessellator {
    fn tessellate_fill(
        &mut self,
        path: &Path,
        fill_rule: FillRule,
        tolerance: f32,
        color: [f32; 4],
    ) -> Option<Mesh>;

    fn tessellate_stroke(
        &mut self,
        path: &Path,
        stroke: &StrokeParams,
        tolerance: f32,
        color: [f32; 4],
    ) -> Option<Mesh>;
}

struct VertexConverter {
    color: [f32; 4],
}

impl FillVertexConstructor<GpuVertex> for VertexConverter {
    fn new_vertex(&mut self, vertex: FillVertex) -> GpuVertex {
        GpuVertex {
            position: vertex.position().to_array(),
            tex_coords: [0.0, 0.0],
            color: self.color,
            order: 0.0,
        }
    }
}

impl StrokeVertexConstructor<GpuVertex> for VertexConverter {
    fn new_vertex(&mut self, vertex: StrokeVertex) -> GpuVertex {
        GpuVertex {
            position: vertex.position().to_array(),
            tex_coords: [0.0, 0.0],
            color: self.color,
            order: 0.0,
        }
    }
}

fn lyon_cap(cap: LineCap) -> lyon::tessellation::LineCap {
    match cap {
        LineCap::Butt => lyon::tessellation::LineCap::Butt,
        LineCap::Round => lyon::tessellation::LineCap::Round,
        LineCap::Square => lyon::tessellation::LineCap::Square,
    }
}

fn lyon_join(join: LineJoin) -> lyon::tessellation::LineJoin {
    match join {
        LineJoin::Miter => lyon::tessellation::LineJoin::Miter,
        LineJoin::Round => lyon::tessellation::LineJoin::Round,
        LineJoin::Bevel => lyon::tessellation::LineJoin::Bevel,
    }
}

/// Lyon-backed [`Tessellator`].
pub struct LyonTessellator {
    fill: FillTessellator,
    stroke: StrokeTessellator,
}

impl Default for LyonTessellator {
    fn default() -> Self {
        Self::new()
    }
}

impl LyonTessellator {
    pub fn new() -> Self {
        Self {
            fill: FillTessellator::new(),
            stroke: StrokeTessellator::new(),
        }
    }
}

impl Tessellator for LyonTessellator {
    fn tessellate_fill(
        &mut self,
        path: &Path,
        fill_rule: FillRule,
        tolerance: f32,
        color: [f32; 4],
    ) -> Option<Mesh> {
        let options = FillOptions::default()
            .with_fill_rule(fill_rule)
            .with_tolerance(tolerance.max(0.001));

        let mut buffers: Mesh = VertexBuffers::new();
        let result = self.fill.tessellate_path(
            path,
            &options,
            &mut BuffersBuilder::new(&mut buffers, VertexConverter { color }),
        );
        match result {
            Ok(_) => Some(buffers),
            Err(err) => {
                tracing::debug!(?err, "fill tessellation failed, dropping geometry");
                None
            }
        }
    }

    fn tessellate_stroke(
        &mut self,
        path: &Path,
        stroke: &StrokeParams,
        tolerance: f32,
        color: [f32; 4],
    ) -> Option<Mesh> {
        if stroke.is_empty() {
            return None;
        }
        let options = StrokeOptions::default()
            .with_line_width(stroke.width)
            .with_start_cap(lyon_cap(stroke.cap))
            .with_end_cap(lyon_cap(stroke.cap))
            .with_line_join(lyon_join(stroke.join))
            .with_miter_limit(stroke.miter_limit.max(1.0))
            .with_tolerance(tolerance.max(0.001));

        let mut buffers: Mesh = VertexBuffers::new();
        let result = self.stroke.tessellate_path(
            path,
            &options,
            &mut BuffersBuilder::new(&mut buffers, VertexConverter { color }),
        );
        match result {
            Ok(_) => Some(buffers),
            Err(err) => {
                tracing::debug!(?err, "stroke tessellation failed, dropping geometry");
                None
            }
        }
    }
}
