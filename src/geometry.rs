//! Shape geometry.
//!
//! [`Geometry`] is a closed set of shape generators. Every variant is pure
//! relative to a transform: it can report its axis-aligned coverage, answer
//! the capability queries the canvas and clip stack rely on, and lower itself
//! to a triangle mesh. Convex shapes (rects, ovals, arcs, convex paths) go
//! through a fast triangle-fan path; everything else is delegated to the
//! [`Tessellator`] collaborator.

use lyon::math::{point, Box2D, Point};
use lyon::path::{FillRule, Path, PathEvent, Winding};

use crate::color::Color;
use crate::paint::{LineCap, LineJoin, StrokeParams};
use crate::tessellate::{Mesh, Tessellator};
use crate::vertex::GpuVertex;

/// The 2D affine transform used throughout the compositor.
pub type Transform = lyon::geom::euclid::default::Transform2D<f32>;

/// Sentinel coverage for geometry that covers everything the pass can see.
pub(crate) fn maximum_coverage() -> Box2D {
    Box2D::new(point(-1.0e9, -1.0e9), point(1.0e9, 1.0e9))
}

pub(crate) fn transform_is_axis_aligned(transform: &Transform) -> bool {
    transform.m12.abs() <= f32::EPSILON && transform.m21.abs() <= f32::EPSILON
}

/// Corner radii of a rounded rectangle, clockwise from top-left.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RoundingRadii {
    pub top_left: f32,
    pub top_right: f32,
    pub bottom_left: f32,
    pub bottom_right: f32,
}

impl RoundingRadii {
    pub fn uniform(radius: f32) -> Self {
        let r = radius.abs();
        Self {
            top_left: r,
            top_right: r,
            bottom_left: r,
            bottom_right: r,
        }
    }

    /// True when all four corners share one radius, the precondition for the
    /// closed-form SDF blur shape.
    pub fn is_symmetric(&self) -> bool {
        self.top_left == self.top_right
            && self.top_left == self.bottom_left
            && self.top_left == self.bottom_right
    }
}

impl From<RoundingRadii> for lyon::path::builder::BorderRadii {
    fn from(val: RoundingRadii) -> Self {
        lyon::path::builder::BorderRadii {
            top_left: val.top_left,
            top_right: val.top_right,
            bottom_left: val.bottom_left,
            bottom_right: val.bottom_right,
        }
    }
}

/// A caller-supplied triangle mesh with optional per-vertex attributes.
#[derive(Debug, Clone)]
pub struct VertexMesh {
    pub vertices: Vec<Point>,
    pub indices: Vec<u16>,
    pub colors: Option<Vec<Color>>,
    pub tex_coords: Option<Vec<Point>>,
}

/// The closed set of shape generators.
#[derive(Debug, Clone)]
pub enum Geometry {
    Rect(Box2D),
    Ellipse(Box2D),
    Circle {
        center: Point,
        radius: f32,
    },
    Arc {
        oval: Box2D,
        start_degrees: f32,
        sweep_degrees: f32,
        include_center: bool,
    },
    RoundRect {
        rect: Box2D,
        radii: RoundingRadii,
    },
    /// Approximated with rounded corners of equivalent curvature; the mesh
    /// builder shares the round-rect lowering.
    Superellipse {
        rect: Box2D,
        corner_radius: f32,
    },
    FillPath {
        path: Path,
        fill_rule: FillRule,
        /// Convexity hint from the path producer. Convex non-zero fills take
        /// the triangle-fan fast path.
        convex: bool,
    },
    StrokePath {
        path: Path,
        stroke: StrokeParams,
    },
    PointField {
        points: Vec<Point>,
        radius: f32,
        round: bool,
    },
    /// Covers everything visible in the current pass. The canvas substitutes
    /// the pass coverage rect before meshing.
    Cover,
    Vertices(VertexMesh),
}

impl Geometry {
    pub fn circle(center: Point, radius: f32) -> Self {
        Geometry::Circle { center, radius }
    }

    /// Bounds in geometry-local space, `None` when nothing can be produced.
    pub fn local_bounds(&self) -> Option<Box2D> {
        let bounds = match self {
            Geometry::Rect(rect) | Geometry::Ellipse(rect) => *rect,
            Geometry::Circle { center, radius } => {
                if *radius <= 0.0 {
                    return None;
                }
                Box2D::new(
                    point(center.x - radius, center.y - radius),
                    point(center.x + radius, center.y + radius),
                )
            }
            Geometry::Arc { oval, .. } => *oval,
            Geometry::RoundRect { rect, .. } | Geometry::Superellipse { rect, .. } => *rect,
            Geometry::FillPath { path, .. } => path_bounds(path)?,
            Geometry::StrokePath { path, stroke } => {
                let bounds = path_bounds(path)?;
                let pad = stroke_coverage_pad(stroke);
                Box2D::new(
                    point(bounds.min.x - pad, bounds.min.y - pad),
                    point(bounds.max.x + pad, bounds.max.y + pad),
                )
            }
            Geometry::PointField { points, radius, .. } => {
                if points.is_empty() || *radius <= 0.0 {
                    return None;
                }
                let mut bounds = Box2D::new(points[0], points[0]);
                for p in points.iter() {
                    bounds.min.x = bounds.min.x.min(p.x);
                    bounds.min.y = bounds.min.y.min(p.y);
                    bounds.max.x = bounds.max.x.max(p.x);
                    bounds.max.y = bounds.max.y.max(p.y);
                }
                Box2D::new(
                    point(bounds.min.x - radius, bounds.min.y - radius),
                    point(bounds.max.x + radius, bounds.max.y + radius),
                )
            }
            Geometry::Cover => return Some(maximum_coverage()),
            Geometry::Vertices(mesh) => {
                if mesh.vertices.is_empty() {
                    return None;
                }
                let mut bounds = Box2D::new(mesh.vertices[0], mesh.vertices[0]);
                for p in mesh.vertices.iter() {
                    bounds.min.x = bounds.min.x.min(p.x);
                    bounds.min.y = bounds.min.y.min(p.y);
                    bounds.max.x = bounds.max.x.max(p.x);
                    bounds.max.y = bounds.max.y.max(p.y);
                }
                bounds
            }
        };
        if bounds.is_empty() {
            None
        } else {
            Some(bounds)
        }
    }

    /// Axis-aligned coverage under `transform`, `None` when nothing visible.
    pub fn coverage(&self, transform: &Transform) -> Option<Box2D> {
        if matches!(self, Geometry::Cover) {
            return Some(maximum_coverage());
        }
        let local = self.local_bounds()?;
        let transformed = transform.outer_transformed_box(&local);
        if transformed.is_empty() {
            None
        } else {
            Some(transformed)
        }
    }

    /// True when the geometry is guaranteed to paint every pixel of `rect`
    /// under `transform`. Lets the canvas downgrade Src-over to Direct
    /// blending and absorb full-cover clears.
    pub fn covers_area(&self, transform: &Transform, rect: &Box2D) -> bool {
        match self {
            Geometry::Cover => true,
            Geometry::Rect(_) => {
                if !transform_is_axis_aligned(transform) {
                    return false;
                }
                match self.coverage(transform) {
                    Some(coverage) => coverage.contains_box(rect),
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// True when a clip of this geometry reduces to a scissor test.
    pub fn is_axis_aligned_rect(&self, transform: &Transform) -> bool {
        matches!(self, Geometry::Rect(_)) && transform_is_axis_aligned(transform)
    }

    /// Mask filters need geometry with well-defined interior coverage;
    /// arbitrary vertex meshes and the full-cover sentinel have none.
    pub fn can_apply_mask_filter(&self) -> bool {
        !matches!(self, Geometry::Vertices(_) | Geometry::Cover)
    }

    /// The shape's outline as a path, used when a stroke-style paint turns a
    /// filled primitive into stroke geometry. `None` for variants with no
    /// meaningful outline.
    pub(crate) fn outline_path(&self, tolerance: f32) -> Option<Path> {
        match self {
            Geometry::Rect(rect) => {
                if rect.is_empty() {
                    return None;
                }
                let mut builder = Path::builder();
                builder.add_rectangle(rect, Winding::Positive);
                Some(builder.build())
            }
            Geometry::Ellipse(_) | Geometry::Circle { .. } => {
                let bounds = self.local_bounds()?;
                let rx = (bounds.max.x - bounds.min.x) * 0.5;
                let ry = (bounds.max.y - bounds.min.y) * 0.5;
                let mut builder = Path::builder();
                builder.add_ellipse(
                    point(bounds.min.x + rx, bounds.min.y + ry),
                    lyon::math::vector(rx, ry),
                    lyon::geom::euclid::Angle::zero(),
                    Winding::Positive,
                );
                Some(builder.build())
            }
            Geometry::RoundRect { rect, radii } => round_rect_path(rect, radii),
            Geometry::Superellipse {
                rect,
                corner_radius,
            } => round_rect_path(rect, &RoundingRadii::uniform(*corner_radius)),
            Geometry::Arc {
                oval,
                start_degrees,
                sweep_degrees,
                include_center,
            } => {
                let polyline =
                    arc_polyline(oval, *start_degrees, *sweep_degrees, *include_center, tolerance)?;
                polyline_path(&polyline, *include_center)
            }
            Geometry::FillPath { path, .. } => Some(path.clone()),
            Geometry::StrokePath { path, .. } => Some(path.clone()),
            Geometry::PointField { .. } | Geometry::Cover | Geometry::Vertices(_) => None,
        }
    }

    /// Lowers the geometry to a triangle mesh. Degenerate input produces
    /// `None` and is skipped by the caller without surfacing an error.
    pub(crate) fn build_mesh(
        &self,
        tessellator: &mut dyn Tessellator,
        tolerance: f32,
        color: [f32; 4],
    ) -> Option<Mesh> {
        match self {
            Geometry::Rect(rect) => rect_mesh(rect, color),
            Geometry::Ellipse(rect) => {
                let polyline = ellipse_polyline(rect, tolerance);
                fan_mesh(&polyline, color)
            }
            Geometry::Circle { .. } => {
                let bounds = self.local_bounds()?;
                let polyline = ellipse_polyline(&bounds, tolerance);
                fan_mesh(&polyline, color)
            }
            Geometry::Arc {
                oval,
                start_degrees,
                sweep_degrees,
                include_center,
            } => {
                let polyline =
                    arc_polyline(oval, *start_degrees, *sweep_degrees, *include_center, tolerance)?;
                fan_mesh(&polyline, color)
            }
            Geometry::RoundRect { rect, radii } => {
                let path = round_rect_path(rect, radii)?;
                tessellator.tessellate_fill(&path, FillRule::NonZero, tolerance, color)
            }
            Geometry::Superellipse {
                rect,
                corner_radius,
            } => {
                let path = round_rect_path(rect, &RoundingRadii::uniform(*corner_radius))?;
                tessellator.tessellate_fill(&path, FillRule::NonZero, tolerance, color)
            }
            Geometry::FillPath {
                path,
                fill_rule,
                convex,
            } => {
                if *convex && *fill_rule == FillRule::NonZero {
                    let polyline = flatten_path(path, tolerance);
                    if polyline.len() >= 3 {
                        return fan_mesh(&polyline, color);
                    }
                    return None;
                }
                tessellator.tessellate_fill(path, *fill_rule, tolerance, color)
            }
            Geometry::StrokePath { path, stroke } => {
                tessellator.tessellate_stroke(path, stroke, tolerance, color)
            }
            Geometry::PointField {
                points,
                radius,
                round,
            } => point_field_mesh(points, *radius, *round, tolerance, color),
            Geometry::Cover => {
                tracing::debug!("cover geometry reached the mesh builder unsubstituted");
                None
            }
            Geometry::Vertices(mesh) => vertices_mesh(mesh, color),
        }
    }
}

/// Conservative halo a stroke adds around its path bounds.
fn stroke_coverage_pad(stroke: &StrokeParams) -> f32 {
    let mut pad = stroke.width.max(0.0) * 0.5;
    if stroke.cap == LineCap::Square {
        pad *= std::f32::consts::SQRT_2;
    }
    if stroke.join == LineJoin::Miter {
        pad *= stroke.miter_limit.max(1.0);
    }
    pad
}

/// Control-point bounding box of a path. Conservative for curves (control
/// points bound the curve).
fn path_bounds(path: &Path) -> Option<Box2D> {
    let mut min = point(f32::INFINITY, f32::INFINITY);
    let mut max = point(f32::NEG_INFINITY, f32::NEG_INFINITY);
    let mut any = false;
    let mut include = |p: Point| {
        any = true;
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    };
    for event in path.iter() {
        match event {
            PathEvent::Begin { at } => include(at),
            PathEvent::Line { to, .. } => include(to),
            PathEvent::Quadratic { ctrl, to, .. } => {
                include(ctrl);
                include(to);
            }
            PathEvent::Cubic {
                ctrl1, ctrl2, to, ..
            } => {
                include(ctrl1);
                include(ctrl2);
                include(to);
            }
            PathEvent::End { .. } => {}
        }
    }
    if any {
        Some(Box2D::new(min, max))
    } else {
        None
    }
}

/// Flattens curves to a polyline of at most `tolerance` error.
fn flatten_path(path: &Path, tolerance: f32) -> Vec<Point> {
    use lyon::path::iterator::PathIterator;

    let mut polyline = Vec::new();
    for event in path.iter().flattened(tolerance.max(0.001)) {
        match event {
            PathEvent::Begin { at } => polyline.push(at),
            PathEvent::Line { to, .. } => polyline.push(to),
            _ => {}
        }
    }
    // Drop a duplicated closing point.
    if polyline.len() > 1 && polyline.first() == polyline.last() {
        polyline.pop();
    }
    polyline
}

fn uv_for(bounds: &Box2D, p: Point) -> [f32; 2] {
    let w = (bounds.max.x - bounds.min.x).max(1e-6);
    let h = (bounds.max.y - bounds.min.y).max(1e-6);
    [(p.x - bounds.min.x) / w, (p.y - bounds.min.y) / h]
}

/// Two triangles with UVs mapping the rect to `[0, 1]` local space.
fn rect_mesh(rect: &Box2D, color: [f32; 4]) -> Option<Mesh> {
    if rect.is_empty() {
        return None;
    }
    let corners = [
        point(rect.min.x, rect.min.y),
        point(rect.max.x, rect.min.y),
        point(rect.max.x, rect.max.y),
        point(rect.min.x, rect.max.y),
    ];
    let mut mesh = Mesh::new();
    for corner in corners {
        mesh.vertices.push(GpuVertex {
            position: corner.to_array(),
            tex_coords: uv_for(rect, corner),
            color,
            order: 0.0,
        });
    }
    mesh.indices.extend([0u16, 1, 2, 2, 3, 0]);
    Some(mesh)
}

/// Triangle fan over a convex polyline.
fn fan_mesh(polyline: &[Point], color: [f32; 4]) -> Option<Mesh> {
    if polyline.len() < 3 {
        return None;
    }
    if polyline.len() > u16::MAX as usize {
        tracing::warn!(
            points = polyline.len(),
            "convex fan exceeds 16-bit index range, dropping"
        );
        return None;
    }
    let mut bounds = Box2D::new(polyline[0], polyline[0]);
    for p in polyline {
        bounds.min.x = bounds.min.x.min(p.x);
        bounds.min.y = bounds.min.y.min(p.y);
        bounds.max.x = bounds.max.x.max(p.x);
        bounds.max.y = bounds.max.y.max(p.y);
    }
    let mut mesh = Mesh::new();
    for p in polyline {
        mesh.vertices.push(GpuVertex {
            position: p.to_array(),
            tex_coords: uv_for(&bounds, *p),
            color,
            order: 0.0,
        });
    }
    for i in 1..(polyline.len() as u16 - 1) {
        mesh.indices.extend([0, i, i + 1]);
    }
    Some(mesh)
}

/// Samples an axis-aligned ellipse into a polyline fine enough for
/// `tolerance`.
fn ellipse_polyline(bounds: &Box2D, tolerance: f32) -> Vec<Point> {
    let rx = (bounds.max.x - bounds.min.x) * 0.5;
    let ry = (bounds.max.y - bounds.min.y) * 0.5;
    if rx <= 0.0 || ry <= 0.0 {
        return Vec::new();
    }
    let cx = bounds.min.x + rx;
    let cy = bounds.min.y + ry;
    let steps = ellipse_step_count(rx.max(ry), tolerance);
    let mut polyline = Vec::with_capacity(steps);
    for i in 0..steps {
        let theta = std::f32::consts::TAU * (i as f32) / (steps as f32);
        polyline.push(point(cx + rx * theta.cos(), cy + ry * theta.sin()));
    }
    polyline
}

fn ellipse_step_count(radius: f32, tolerance: f32) -> usize {
    let tolerance = tolerance.clamp(0.001, radius.max(0.002) * 0.5);
    // Chord error for a step angle t is r * (1 - cos(t / 2)).
    let step = 2.0 * (1.0 - tolerance / radius).clamp(-1.0, 1.0).acos();
    if step <= 0.0 {
        return 12;
    }
    ((std::f32::consts::TAU / step).ceil() as usize).clamp(12, 2048)
}

fn arc_polyline(
    oval: &Box2D,
    start_degrees: f32,
    sweep_degrees: f32,
    include_center: bool,
    tolerance: f32,
) -> Option<Vec<Point>> {
    let rx = (oval.max.x - oval.min.x) * 0.5;
    let ry = (oval.max.y - oval.min.y) * 0.5;
    if rx <= 0.0 || ry <= 0.0 || sweep_degrees.abs() <= f32::EPSILON {
        return None;
    }
    let cx = oval.min.x + rx;
    let cy = oval.min.y + ry;
    let sweep = sweep_degrees.clamp(-360.0, 360.0).to_radians();
    let start = start_degrees.to_radians();
    let full_steps = ellipse_step_count(rx.max(ry), tolerance);
    let steps = ((full_steps as f32) * (sweep.abs() / std::f32::consts::TAU))
        .ceil()
        .max(2.0) as usize;

    let mut polyline = Vec::with_capacity(steps + 2);
    if include_center {
        polyline.push(point(cx, cy));
    }
    for i in 0..=steps {
        let theta = start + sweep * (i as f32) / (steps as f32);
        polyline.push(point(cx + rx * theta.cos(), cy + ry * theta.sin()));
    }
    Some(polyline)
}

fn polyline_path(polyline: &[Point], close: bool) -> Option<Path> {
    if polyline.len() < 2 {
        return None;
    }
    let mut builder = Path::builder();
    builder.begin(polyline[0]);
    for p in &polyline[1..] {
        builder.line_to(*p);
    }
    if close {
        builder.close();
    } else {
        builder.end(false);
    }
    Some(builder.build())
}

fn round_rect_path(rect: &Box2D, radii: &RoundingRadii) -> Option<Path> {
    if rect.is_empty() {
        return None;
    }
    let mut builder = Path::builder();
    builder.add_rounded_rectangle(rect, &(*radii).into(), Winding::Positive);
    Some(builder.build())
}

fn point_field_mesh(
    points: &[Point],
    radius: f32,
    round: bool,
    tolerance: f32,
    color: [f32; 4],
) -> Option<Mesh> {
    if points.is_empty() || radius <= 0.0 {
        return None;
    }
    let mut mesh = Mesh::new();
    for p in points {
        let bounds = Box2D::new(
            point(p.x - radius, p.y - radius),
            point(p.x + radius, p.y + radius),
        );
        let sub = if round {
            fan_mesh(&ellipse_polyline(&bounds, tolerance), color)
        } else {
            rect_mesh(&bounds, color)
        };
        let Some(sub) = sub else { continue };
        let base = mesh.vertices.len();
        if base + sub.vertices.len() > u16::MAX as usize {
            tracing::warn!("point field exceeds 16-bit index range, truncating");
            break;
        }
        mesh.vertices.extend(sub.vertices);
        mesh.indices
            .extend(sub.indices.iter().map(|i| *i + base as u16));
    }
    if mesh.vertices.is_empty() {
        None
    } else {
        Some(mesh)
    }
}

fn vertices_mesh(mesh: &VertexMesh, color: [f32; 4]) -> Option<Mesh> {
    if mesh.vertices.is_empty() || mesh.indices.is_empty() {
        return None;
    }
    let bounds = Box2D::new(mesh.vertices[0], mesh.vertices[0]);
    let bounds = mesh.vertices.iter().fold(bounds, |mut b, p| {
        b.min.x = b.min.x.min(p.x);
        b.min.y = b.min.y.min(p.y);
        b.max.x = b.max.x.max(p.x);
        b.max.y = b.max.y.max(p.y);
        b
    });
    let mut out = Mesh::new();
    for (i, p) in mesh.vertices.iter().enumerate() {
        let vertex_color = mesh
            .colors
            .as_ref()
            .and_then(|colors| colors.get(i))
            .map(|c| c.premultiply())
            .unwrap_or(color);
        let tex_coords = mesh
            .tex_coords
            .as_ref()
            .and_then(|uv| uv.get(i))
            .map(|p| [p.x, p.y])
            .unwrap_or_else(|| uv_for(&bounds, *p));
        out.vertices.push(GpuVertex {
            position: p.to_array(),
            tex_coords,
            color: vertex_color,
            order: 0.0,
        });
    }
    out.indices.extend_from_slice(&mesh.indices);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tessellate::LyonTessellator;

    fn rect(x0: f32, y0: f32, x1: f32, y1: f32) -> Box2D {
        Box2D::new(point(x0, y0), point(x1, y1))
    }

    #[test]
    fn rect_coverage_follows_transform() {
        let geometry = Geometry::Rect(rect(0.0, 0.0, 10.0, 10.0));
        let transform = Transform::translation(5.0, 5.0);
        let coverage = geometry.coverage(&transform).unwrap();
        assert_eq!(coverage, rect(5.0, 5.0, 15.0, 15.0));
    }

    #[test]
    fn empty_rect_has_no_coverage() {
        let geometry = Geometry::Rect(rect(10.0, 10.0, 10.0, 20.0));
        assert!(geometry.coverage(&Transform::identity()).is_none());
    }

    #[test]
    fn rect_covers_contained_area_only_when_axis_aligned() {
        let geometry = Geometry::Rect(rect(0.0, 0.0, 100.0, 100.0));
        let inner = rect(10.0, 10.0, 20.0, 20.0);
        assert!(geometry.covers_area(&Transform::identity(), &inner));

        let rotated = Transform::rotation(lyon::geom::euclid::Angle::degrees(30.0));
        assert!(!geometry.covers_area(&rotated, &inner));
    }

    #[test]
    fn cover_geometry_covers_everything() {
        let geometry = Geometry::Cover;
        assert!(geometry.covers_area(&Transform::identity(), &rect(-500.0, -500.0, 500.0, 500.0)));
        assert_eq!(geometry.coverage(&Transform::identity()), Some(maximum_coverage()));
    }

    #[test]
    fn axis_aligned_rect_detection() {
        let geometry = Geometry::Rect(rect(0.0, 0.0, 10.0, 10.0));
        assert!(geometry.is_axis_aligned_rect(&Transform::scale(2.0, 3.0)));
        let rotated = Transform::rotation(lyon::geom::euclid::Angle::degrees(45.0));
        assert!(!geometry.is_axis_aligned_rect(&rotated));
        assert!(!Geometry::Circle {
            center: point(0.0, 0.0),
            radius: 1.0
        }
        .is_axis_aligned_rect(&Transform::identity()));
    }

    #[test]
    fn mask_filter_capability() {
        assert!(Geometry::Rect(rect(0.0, 0.0, 1.0, 1.0)).can_apply_mask_filter());
        assert!(!Geometry::Cover.can_apply_mask_filter());
        assert!(!Geometry::Vertices(VertexMesh {
            vertices: vec![point(0.0, 0.0)],
            indices: vec![0],
            colors: None,
            tex_coords: None,
        })
        .can_apply_mask_filter());
    }

    #[test]
    fn rect_mesh_is_two_triangles() {
        let mut tess = LyonTessellator::new();
        let mesh = Geometry::Rect(rect(0.0, 0.0, 4.0, 4.0))
            .build_mesh(&mut tess, 0.1, [1.0; 4])
            .unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.vertices[0].tex_coords, [0.0, 0.0]);
        assert_eq!(mesh.vertices[2].tex_coords, [1.0, 1.0]);
    }

    #[test]
    fn circle_mesh_is_a_fan() {
        let mut tess = LyonTessellator::new();
        let mesh = Geometry::circle(point(0.0, 0.0), 10.0)
            .build_mesh(&mut tess, 0.25, [1.0; 4])
            .unwrap();
        assert!(mesh.vertices.len() >= 12);
        assert_eq!(mesh.indices.len(), (mesh.vertices.len() - 2) * 3);
    }

    #[test]
    fn stroke_coverage_includes_width() {
        let mut builder = Path::builder();
        builder.begin(point(0.0, 0.0));
        builder.line_to(point(10.0, 0.0));
        builder.end(false);
        let geometry = Geometry::StrokePath {
            path: builder.build(),
            stroke: StrokeParams {
                width: 4.0,
                join: LineJoin::Bevel,
                ..Default::default()
            },
        };
        let coverage = geometry.coverage(&Transform::identity()).unwrap();
        assert!(coverage.min.y <= -2.0 && coverage.max.y >= 2.0);
    }

    #[test]
    fn degenerate_point_field_is_dropped() {
        let mut tess = LyonTessellator::new();
        let geometry = Geometry::PointField {
            points: Vec::new(),
            radius: 2.0,
            round: true,
        };
        assert!(geometry.build_mesh(&mut tess, 0.1, [1.0; 4]).is_none());
        assert!(geometry.coverage(&Transform::identity()).is_none());
    }
}
