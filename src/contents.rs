//! Renderable contents and the paint/geometry resolver.
//!
//! [`resolve_contents`] turns a `(Geometry, Paint)` pair into a [`DrawPlan`]:
//! usually a single [`Contents`], but mask-blur styles can expand into a
//! blurred-plus-crisp pair or a clip-then-blur sequence. Color filters and
//! inversion are folded on the CPU whenever the color source supports it —
//! that is both cheaper than a GPU pass and required for correctness of
//! gradient sources, whose stop colors must be filtered before interpolation.

use lyon::math::Box2D;

use crate::backend::TextureRef;
use crate::clip_stack::ClipOp;
use crate::color::{BlendMode, Color};
use crate::geometry::{Geometry, Transform};
use crate::paint::{BlurStyle, ColorFilter, ImageFilter, MaskBlur, Paint};
use crate::tessellate::{Mesh, Tessellator};

/// Solid or shader-sourced geometry with its resolved mesh.
#[derive(Debug, Clone)]
pub struct ColorSourceContents {
    pub geometry: Geometry,
    pub source: Option<crate::paint::ColorSource>,
    pub color: Color,
    pub mesh: Mesh,
}

/// One textured quad: a texel-space source rect mapped onto a destination
/// rect in the current transform space.
#[derive(Debug, Clone, Copy)]
pub struct TextureQuad {
    pub src: Box2D,
    pub dst: Box2D,
}

/// A texture (image, finished subpass, glyph atlas) drawn as one or more
/// quads.
#[derive(Debug, Clone)]
pub struct TextureContents {
    pub texture: TextureRef,
    pub quads: Vec<TextureQuad>,
    /// Extra opacity applied on top of the entity's inherited opacity; this
    /// is where a restored save layer's paint alpha lands.
    pub opacity: f32,
}

impl TextureContents {
    pub fn single(texture: TextureRef, src: Box2D, dst: Box2D) -> Self {
        Self {
            texture,
            quads: vec![TextureQuad { src, dst }],
            opacity: 1.0,
        }
    }
}

/// Closed-form SDF blur of a symmetric rounded rect, standing in for a real
/// Gaussian pass.
#[derive(Debug, Clone, Copy)]
pub struct SolidRRectBlur {
    pub rect: Box2D,
    pub corner_radius: f32,
    pub color: Color,
    pub sigma: f32,
}

/// The closed set of renderable contents.
#[derive(Debug, Clone)]
pub enum Contents {
    ColorSource(ColorSourceContents),
    Texture(TextureContents),
    SolidRRectBlur(SolidRRectBlur),
    /// GPU-side color filter over child output.
    ColorFilter {
        filter: ColorFilter,
        child: Box<Contents>,
    },
    /// Image filter over child output.
    ImageFilter {
        filter: ImageFilter,
        child: Box<Contents>,
    },
    /// Coverage-mask blur. Carries any color filter that could not be folded
    /// earlier so filtering happens before pixels are blurred away.
    MaskBlur {
        blur: MaskBlur,
        color_filter: Option<ColorFilter>,
        child: Box<Contents>,
    },
    /// Advanced blend with the destination read through framebuffer fetch.
    FramebufferBlend {
        mode: BlendMode,
        child: Box<Contents>,
    },
    /// Advanced blend emulated with a flipped backdrop texture and a
    /// two-input blend shader. `coverage_hint` bounds the shader's work to
    /// the content's own coverage intersected with the clip.
    BackdropBlend {
        mode: BlendMode,
        backdrop: TextureRef,
        coverage_hint: Option<Box2D>,
        child: Box<Contents>,
    },
    /// Depth-only clip geometry, already in pass space. The mesh covers the
    /// region the clip forbids (the shape for a difference clip, its
    /// complement for an intersection); the backend raises the depth buffer
    /// over it and writes no color. Drawn when a clip is recorded and
    /// replayed after a backdrop flip.
    Clip { mesh: Mesh, op: ClipOp },
}

impl Contents {
    /// Axis-aligned coverage of the rendered output under `transform`.
    pub fn coverage(&self, transform: &Transform) -> Option<Box2D> {
        match self {
            Contents::ColorSource(c) => c.geometry.coverage(transform),
            Contents::Texture(c) => {
                let mut union: Option<Box2D> = None;
                for quad in &c.quads {
                    let b = transform.outer_transformed_box(&quad.dst);
                    union = Some(match union {
                        Some(u) => u.union(&b),
                        None => b,
                    });
                }
                union.filter(|b| !b.is_empty())
            }
            Contents::SolidRRectBlur(c) => {
                let pad = c.sigma * 3.0;
                let inflated = Box2D::new(
                    lyon::math::point(c.rect.min.x - pad, c.rect.min.y - pad),
                    lyon::math::point(c.rect.max.x + pad, c.rect.max.y + pad),
                );
                Some(transform.outer_transformed_box(&inflated))
            }
            Contents::ColorFilter { child, .. } | Contents::FramebufferBlend { child, .. } => {
                child.coverage(transform)
            }
            Contents::ImageFilter { filter, child } => {
                let base = child.coverage(transform)?;
                let pad = filter.coverage_padding();
                Some(Box2D::new(
                    lyon::math::point(base.min.x - pad, base.min.y - pad),
                    lyon::math::point(base.max.x + pad, base.max.y + pad),
                ))
            }
            Contents::MaskBlur { blur, child, .. } => {
                let base = child.coverage(transform)?;
                if blur.style == BlurStyle::Inner {
                    return Some(base);
                }
                let pad = blur.sigma * 3.0;
                Some(Box2D::new(
                    lyon::math::point(base.min.x - pad, base.min.y - pad),
                    lyon::math::point(base.max.x + pad, base.max.y + pad),
                ))
            }
            Contents::BackdropBlend {
                child,
                coverage_hint,
                ..
            } => match (child.coverage(transform), coverage_hint) {
                (Some(c), Some(hint)) => c.intersection(hint),
                (c, _) => c,
            },
            // Clips are submitted directly to the pass; culling never sees
            // them.
            Contents::Clip { .. } => None,
        }
    }

    /// True when every covered pixel is written fully opaque, enabling the
    /// Src-over-to-Source blend downgrade.
    pub fn is_opaque(&self) -> bool {
        match self {
            Contents::ColorSource(c) => c.color.is_opaque() && c.source.is_none(),
            Contents::Texture(_) => false,
            Contents::SolidRRectBlur(_) => false,
            // Filter output alpha is unpredictable without evaluating it.
            _ => false,
        }
    }

    /// True when the contents fully paint `rect` under `transform`.
    pub fn covers_area(&self, transform: &Transform, rect: &Box2D) -> bool {
        match self {
            Contents::ColorSource(c) => c.geometry.covers_area(transform, rect),
            _ => false,
        }
    }
}

/// What the canvas must do to realize one draw call.
#[derive(Debug)]
pub enum DrawPlan {
    /// The common case: one entity.
    Single(Contents),
    /// Solid-style mask blur: blurred halo below a crisp shape. When the
    /// paint is not trivially opaque Src-over the pair must composite through
    /// a temporary layer so the halo and shape blend as one. In that case
    /// both contents carry full alpha and `layer_alpha` is what the layer
    /// composite applies, along with the paint's blend mode.
    BlurredWithCrisp {
        blurred: Contents,
        crisp: Contents,
        needs_layer: bool,
        layer_alpha: f32,
    },
    /// Outer/inner-style mask blur: clip to the shape's complement or
    /// interior, then draw the blurred shape.
    ClippedBlur {
        clip: Geometry,
        clip_op: ClipOp,
        blurred: Contents,
    },
}

/// Resolves a geometry/paint pair into renderable contents.
///
/// Degenerate geometry resolves to `None` and the draw is silently skipped.
pub(crate) fn resolve_contents(
    geometry: Geometry,
    paint: &Paint,
    tessellator: &mut dyn Tessellator,
    tolerance: f32,
) -> Option<DrawPlan> {
    let mut color = paint.color;
    let mut source = paint.color_source.clone();
    let mut pending_filter = paint.color_filter.clone();
    let mut pending_invert = paint.invert_colors;

    // CPU folding. Gradient sources rewrite their stop colors; flat colors
    // rewrite the color itself. Texture sources cannot fold.
    if let Some(filter) = pending_filter.clone() {
        if filter.cpu_applicable() {
            match source.as_mut() {
                Some(src) if src.supports_cpu_color_fold() => {
                    src.fold_colors(|c| filter.apply_to_color(c).unwrap_or(c));
                    pending_filter = None;
                }
                Some(_) => {}
                None => {
                    if let Some(filtered) = filter.apply_to_color(color) {
                        color = filtered;
                        pending_filter = None;
                    }
                }
            }
        }
    }
    if pending_invert {
        match source.as_mut() {
            Some(src) if src.supports_cpu_color_fold() => {
                src.fold_colors(|c| c.invert());
                pending_invert = false;
            }
            Some(_) => {}
            None => {
                color = color.invert();
                pending_invert = false;
            }
        }
    }

    let mask_blur = paint.mask_blur.filter(|b| b.is_effective());

    // Closed-form SDF blur for symmetric rounded rects without a shader
    // source, chosen by blur style.
    if let Some(blur) = mask_blur {
        if source.is_none() && pending_filter.is_none() && !pending_invert {
            if let Some(sdf) = try_rrect_blur(&geometry, blur, color) {
                let blurred = Contents::SolidRRectBlur(sdf);
                let blurred = wrap_image_filter(blurred, paint);
                return Some(match blur.style {
                    BlurStyle::Normal => DrawPlan::Single(blurred),
                    BlurStyle::Solid => {
                        let needs_layer = !paint.is_trivially_opaque_source_over();
                        // Through a layer the pair draws at full alpha; the
                        // alpha moves to the composite so the halo/shape
                        // overlap is not blended twice.
                        let draw_color = if needs_layer {
                            color.with_alpha(1.0)
                        } else {
                            color
                        };
                        let blurred = Contents::SolidRRectBlur(SolidRRectBlur {
                            color: draw_color,
                            ..sdf
                        });
                        let crisp =
                            solid_contents(&geometry, draw_color, None, tessellator, tolerance)?;
                        DrawPlan::BlurredWithCrisp {
                            blurred: wrap_image_filter(blurred, paint),
                            crisp: wrap_image_filter(crisp, paint),
                            needs_layer,
                            layer_alpha: if needs_layer { color.a } else { 1.0 },
                        }
                    }
                    BlurStyle::Outer => DrawPlan::ClippedBlur {
                        clip: geometry,
                        clip_op: ClipOp::Difference,
                        blurred,
                    },
                    BlurStyle::Inner => DrawPlan::ClippedBlur {
                        clip: geometry,
                        clip_op: ClipOp::Intersect,
                        blurred,
                    },
                });
            }
        }
    }

    let mut contents = solid_contents(&geometry, color, source, tessellator, tolerance)?;

    // Mask blur on supporting geometry carries any unapplied color filter so
    // filtering happens before pixels are blurred away.
    if let Some(blur) = mask_blur {
        if geometry.can_apply_mask_filter() {
            let carried = take_gpu_filter(&mut pending_filter, &mut pending_invert);
            contents = Contents::MaskBlur {
                blur,
                color_filter: carried,
                child: Box::new(contents),
            };
        }
    }

    // Whatever filtering is still pending becomes GPU passes, color filter
    // innermost, image filter outermost.
    if let Some(filter) = take_gpu_filter(&mut pending_filter, &mut pending_invert) {
        contents = Contents::ColorFilter {
            filter,
            child: Box::new(contents),
        };
    }
    contents = wrap_image_filter(contents, paint);

    Some(DrawPlan::Single(contents))
}

/// Wraps texture-backed contents with a paint's GPU-side filters: inversion
/// and color filter innermost, image filter outermost. Used for image draws
/// and save-layer composites, where CPU folding is never possible.
pub(crate) fn wrap_paint_filters(mut contents: Contents, paint: &Paint) -> Contents {
    if paint.invert_colors {
        contents = Contents::ColorFilter {
            filter: ColorFilter::Matrix(INVERT_MATRIX),
            child: Box::new(contents),
        };
    }
    if let Some(filter) = &paint.color_filter {
        contents = Contents::ColorFilter {
            filter: filter.clone(),
            child: Box::new(contents),
        };
    }
    wrap_image_filter(contents, paint)
}

/// The 4x5 matrix realizing channel inversion.
#[rustfmt::skip]
const INVERT_MATRIX: [f32; 20] = [
    -1.0, 0.0, 0.0, 0.0, 1.0,
    0.0, -1.0, 0.0, 0.0, 1.0,
    0.0, 0.0, -1.0, 0.0, 1.0,
    0.0, 0.0, 0.0, 1.0, 0.0,
];

fn take_gpu_filter(
    pending_filter: &mut Option<ColorFilter>,
    pending_invert: &mut bool,
) -> Option<ColorFilter> {
    let filter = pending_filter.take();
    if *pending_invert {
        *pending_invert = false;
        // An unapplied invert rides along as a matrix filter. Chaining an
        // existing filter under it is not supported; the filter wins.
        return Some(filter.unwrap_or(ColorFilter::Matrix(INVERT_MATRIX)));
    }
    filter
}

fn solid_contents(
    geometry: &Geometry,
    color: Color,
    source: Option<crate::paint::ColorSource>,
    tessellator: &mut dyn Tessellator,
    tolerance: f32,
) -> Option<Contents> {
    let vertex_color = if source.is_some() {
        Color::WHITE.premultiply()
    } else {
        color.premultiply()
    };
    let mesh = geometry.build_mesh(tessellator, tolerance, vertex_color)?;
    if mesh.vertices.is_empty() || mesh.indices.is_empty() {
        return None;
    }
    Some(Contents::ColorSource(ColorSourceContents {
        geometry: geometry.clone(),
        source,
        color,
        mesh,
    }))
}

fn wrap_image_filter(contents: Contents, paint: &Paint) -> Contents {
    match &paint.image_filter {
        Some(filter) => Contents::ImageFilter {
            filter: filter.clone(),
            child: Box::new(contents),
        },
        None => contents,
    }
}

fn try_rrect_blur(geometry: &Geometry, blur: MaskBlur, color: Color) -> Option<SolidRRectBlur> {
    let (rect, radius) = match geometry {
        Geometry::RoundRect { rect, radii } if radii.is_symmetric() => (*rect, radii.top_left),
        Geometry::Superellipse {
            rect,
            corner_radius,
        } => (*rect, *corner_radius),
        _ => return None,
    };
    if rect.is_empty() {
        return None;
    }
    Some(SolidRRectBlur {
        rect,
        corner_radius: radius,
        color,
        sigma: blur.sigma,
    })
}
