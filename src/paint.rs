//! Paint descriptors: fill/stroke style, blend mode, filters and mask blurs.
//!
//! A [`Paint`] describes *how* a geometry is rendered. It stays fully
//! CPU-side; the contents resolver decides which parts fold into vertex
//! colors and which become GPU filter passes.

use lyon::math::Point;

use crate::backend::TextureRef;
use crate::color::{BlendMode, Color};

/// Whether a geometry is filled or stroked.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PaintStyle {
    #[default]
    Fill,
    Stroke,
}

/// Line cap applied to stroke endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineCap {
    #[default]
    Butt,
    Round,
    Square,
}

/// Join applied where stroke segments meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineJoin {
    #[default]
    Miter,
    Round,
    Bevel,
}

/// Stroke parameters carried by a [`Paint`] with [`PaintStyle::Stroke`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeParams {
    pub width: f32,
    pub cap: LineCap,
    pub join: LineJoin,
    pub miter_limit: f32,
}

impl Default for StrokeParams {
    fn default() -> Self {
        Self {
            width: 1.0,
            cap: LineCap::default(),
            join: LineJoin::default(),
            miter_limit: 4.0,
        }
    }
}

impl StrokeParams {
    /// True if the stroke cannot produce any pixels.
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0
    }
}

/// Style of a mask blur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurStyle {
    /// Blur inside and outside the shape boundary.
    Normal,
    /// Solid interior with a blurred halo outside.
    Solid,
    /// Blur only inside the shape.
    Inner,
    /// Blur only outside the shape.
    Outer,
}

/// A blur applied to the coverage mask of a geometry before compositing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskBlur {
    pub style: BlurStyle,
    pub sigma: f32,
}

impl MaskBlur {
    pub fn new(style: BlurStyle, sigma: f32) -> Self {
        Self { style, sigma }
    }

    /// Degenerate blurs are dropped by the resolver.
    pub fn is_effective(&self) -> bool {
        self.sigma > f32::EPSILON
    }
}

/// A per-pixel color transformation.
///
/// `Matrix` and `Blend` filters with pipeline blend modes can be evaluated on
/// the CPU when the contents carry a uniform or per-vertex color; everything
/// else becomes a GPU filter pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ColorFilter {
    /// Blends a constant color over the filtered pixels.
    Blend { color: Color, mode: BlendMode },
    /// A 4x5 row-major color matrix, applied to unpremultiplied RGBA.
    Matrix([f32; 20]),
}

impl ColorFilter {
    /// True when the filter can be folded into CPU-side colors.
    pub fn cpu_applicable(&self) -> bool {
        match self {
            ColorFilter::Matrix(_) => true,
            ColorFilter::Blend { mode, .. } => {
                blend_colors(Color::WHITE, Color::WHITE, *mode).is_some()
            }
        }
    }

    /// Applies the filter to a single color. Returns `None` when the filter
    /// is not CPU-applicable and must run on the GPU.
    pub fn apply_to_color(&self, input: Color) -> Option<Color> {
        match self {
            ColorFilter::Matrix(m) => {
                let [r, g, b, a] = input.to_array();
                let dot = |row: usize| {
                    m[row * 5] * r + m[row * 5 + 1] * g + m[row * 5 + 2] * b + m[row * 5 + 3] * a
                        + m[row * 5 + 4]
                };
                Some(Color::new(
                    dot(0).clamp(0.0, 1.0),
                    dot(1).clamp(0.0, 1.0),
                    dot(2).clamp(0.0, 1.0),
                    dot(3).clamp(0.0, 1.0),
                ))
            }
            ColorFilter::Blend { color, mode } => blend_colors(input, *color, *mode),
        }
    }
}

/// Porter-Duff blending of two straight-alpha colors on the CPU. Only the
/// separable pipeline modes are supported; advanced modes return `None`.
pub(crate) fn blend_colors(dst: Color, src: Color, mode: BlendMode) -> Option<Color> {
    let d = dst.premultiply();
    let s = src.premultiply();
    let (sf, df) = match mode {
        BlendMode::Clear => (0.0, 0.0),
        BlendMode::Source => (1.0, 0.0),
        BlendMode::Destination => (0.0, 1.0),
        BlendMode::SourceOver => (1.0, 1.0 - s[3]),
        BlendMode::DestinationOver => (1.0 - d[3], 1.0),
        BlendMode::SourceIn => (d[3], 0.0),
        BlendMode::DestinationIn => (0.0, s[3]),
        BlendMode::SourceOut => (1.0 - d[3], 0.0),
        BlendMode::DestinationOut => (0.0, 1.0 - s[3]),
        BlendMode::SourceATop => (d[3], 1.0 - s[3]),
        BlendMode::DestinationATop => (1.0 - d[3], s[3]),
        BlendMode::Xor => (1.0 - d[3], 1.0 - s[3]),
        BlendMode::Plus => (1.0, 1.0),
        _ => return None,
    };
    let out = [
        (s[0] * sf + d[0] * df).clamp(0.0, 1.0),
        (s[1] * sf + d[1] * df).clamp(0.0, 1.0),
        (s[2] * sf + d[2] * df).clamp(0.0, 1.0),
        (s[3] * sf + d[3] * df).clamp(0.0, 1.0),
    ];
    // Back to straight alpha.
    if out[3] <= f32::EPSILON {
        return Some(Color::TRANSPARENT);
    }
    Some(Color::new(out[0] / out[3], out[1] / out[3], out[2] / out[3], out[3]))
}

/// A filter applied to rendered pixels rather than coverage.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageFilter {
    /// Gaussian blur with per-axis sigmas.
    Blur { sigma_x: f32, sigma_y: f32 },
    /// Grows maximum-value regions by `radius` pixels.
    Dilate { radius: f32 },
    /// Shrinks maximum-value regions by `radius` pixels.
    Erode { radius: f32 },
}

impl ImageFilter {
    pub fn blur(sigma: f32) -> Self {
        ImageFilter::Blur {
            sigma_x: sigma,
            sigma_y: sigma,
        }
    }

    /// The number of pixels the filter can move content outward, used to pad
    /// coverage and subpass extents.
    pub fn coverage_padding(&self) -> f32 {
        match self {
            // Three sigmas covers 99.7% of the kernel.
            ImageFilter::Blur { sigma_x, sigma_y } => sigma_x.max(*sigma_y) * 3.0,
            ImageFilter::Dilate { radius } => *radius,
            ImageFilter::Erode { .. } => 0.0,
        }
    }
}

/// How gradient stops repeat outside `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileMode {
    #[default]
    Clamp,
    Repeat,
    Mirror,
    Decal,
}

/// A shader color source replacing the paint's flat color.
#[derive(Debug, Clone)]
pub enum ColorSource {
    LinearGradient {
        start: Point,
        end: Point,
        colors: Vec<Color>,
        stops: Vec<f32>,
        tile_mode: TileMode,
    },
    RadialGradient {
        center: Point,
        radius: f32,
        colors: Vec<Color>,
        stops: Vec<f32>,
        tile_mode: TileMode,
    },
    /// Samples a texture in geometry-local space.
    Texture {
        texture: TextureRef,
        tile_mode: TileMode,
    },
}

impl ColorSource {
    /// True when a CPU color filter can be folded into the source's colors.
    /// Gradient stop colors can be rewritten in place; texture sources sample
    /// arbitrary pixels and need a GPU pass.
    pub fn supports_cpu_color_fold(&self) -> bool {
        !matches!(self, ColorSource::Texture { .. })
    }

    /// Rewrites the source's colors through `f`.
    pub fn fold_colors(&mut self, f: impl Fn(Color) -> Color) {
        match self {
            ColorSource::LinearGradient { colors, .. }
            | ColorSource::RadialGradient { colors, .. } => {
                for c in colors.iter_mut() {
                    *c = f(*c);
                }
            }
            ColorSource::Texture { .. } => {}
        }
    }

    /// Evaluates the source at a geometry-local point. Gradient meshes are
    /// colored per vertex with this; texture sources sample on the GPU and
    /// return white here.
    pub fn evaluate(&self, p: Point) -> Color {
        match self {
            ColorSource::LinearGradient {
                start,
                end,
                colors,
                stops,
                tile_mode,
            } => {
                let axis = *end - *start;
                let len_sq = axis.square_length();
                if len_sq <= f32::EPSILON {
                    return colors.first().copied().unwrap_or(Color::TRANSPARENT);
                }
                let t = (p - *start).dot(axis) / len_sq;
                gradient_color(t, colors, stops, *tile_mode)
            }
            ColorSource::RadialGradient {
                center,
                radius,
                colors,
                stops,
                tile_mode,
            } => {
                if *radius <= 0.0 {
                    return colors.first().copied().unwrap_or(Color::TRANSPARENT);
                }
                let t = (p - *center).length() / radius;
                gradient_color(t, colors, stops, *tile_mode)
            }
            ColorSource::Texture { .. } => Color::WHITE,
        }
    }
}

fn gradient_color(t: f32, colors: &[Color], stops: &[f32], tile_mode: TileMode) -> Color {
    if colors.is_empty() {
        return Color::TRANSPARENT;
    }
    if colors.len() == 1 || stops.len() != colors.len() {
        return colors[0];
    }
    let t = match tile_mode {
        TileMode::Clamp => t.clamp(0.0, 1.0),
        TileMode::Repeat => t.rem_euclid(1.0),
        TileMode::Mirror => {
            let cycle = t.rem_euclid(2.0);
            if cycle > 1.0 {
                2.0 - cycle
            } else {
                cycle
            }
        }
        TileMode::Decal => {
            if !(0.0..=1.0).contains(&t) {
                return Color::TRANSPARENT;
            }
            t
        }
    };
    let mut prev = 0;
    for (i, stop) in stops.iter().enumerate() {
        if t <= *stop {
            if i == 0 {
                return colors[0];
            }
            let span = stop - stops[prev];
            let local = if span <= f32::EPSILON {
                1.0
            } else {
                (t - stops[prev]) / span
            };
            return colors[prev].lerp(colors[i], local);
        }
        prev = i;
    }
    colors[colors.len() - 1]
}

/// Everything describing how a draw call is shaded and composited.
#[derive(Debug, Clone, Default)]
pub struct Paint {
    pub style: PaintStyle,
    pub stroke: StrokeParams,
    pub color: Color,
    pub blend_mode: BlendMode,
    pub color_filter: Option<ColorFilter>,
    pub invert_colors: bool,
    pub image_filter: Option<ImageFilter>,
    pub color_source: Option<ColorSource>,
    pub mask_blur: Option<MaskBlur>,
}

impl Paint {
    pub fn fill(color: Color) -> Self {
        Self {
            color,
            ..Default::default()
        }
    }

    pub fn stroke(color: Color, params: StrokeParams) -> Self {
        Self {
            style: PaintStyle::Stroke,
            stroke: params,
            color,
            ..Default::default()
        }
    }

    pub fn with_blend_mode(mut self, mode: BlendMode) -> Self {
        self.blend_mode = mode;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.color = self.color.with_alpha(alpha);
        self
    }

    /// True when the resolver can attach geometry directly to a color-source
    /// contents without any wrapping.
    pub fn is_fast_path(&self) -> bool {
        self.color_filter.is_none()
            && !self.invert_colors
            && self.image_filter.is_none()
            && self.mask_blur.is_none()
    }

    /// True when a save layer carrying this paint only modulates opacity, so
    /// the layer can collapse into a plain save with distributed opacity.
    pub fn is_opacity_only(&self) -> bool {
        self.blend_mode == BlendMode::SourceOver
            && self.is_fast_path()
            && self.color_source.is_none()
    }

    /// True when the paint is trivially opaque Src-over, which lets the
    /// solid-style mask blur skip its compositing layer.
    pub fn is_trivially_opaque_source_over(&self) -> bool {
        self.blend_mode == BlendMode::SourceOver
            && self.color.is_opaque()
            && self.color_source.is_none()
            && self.color_filter.is_none()
            && !self.invert_colors
    }

    /// The opacity a collapsed save layer distributes to its children.
    pub fn layer_opacity(&self) -> f32 {
        self.color.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_filter_applies_on_cpu() {
        // Swap red and green.
        #[rustfmt::skip]
        let m = [
            0.0, 1.0, 0.0, 0.0, 0.0,
            1.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0, 0.0,
        ];
        let f = ColorFilter::Matrix(m);
        assert!(f.cpu_applicable());
        let out = f.apply_to_color(Color::new(1.0, 0.25, 0.0, 1.0)).unwrap();
        assert_eq!(out, Color::new(0.25, 1.0, 0.0, 1.0));
    }

    #[test]
    fn advanced_blend_filter_is_not_cpu_applicable() {
        let f = ColorFilter::Blend {
            color: Color::BLACK,
            mode: BlendMode::Multiply,
        };
        assert!(!f.cpu_applicable());
        assert!(f.apply_to_color(Color::WHITE).is_none());
    }

    #[test]
    fn source_over_blend_filter_on_cpu() {
        let f = ColorFilter::Blend {
            color: Color::new(0.0, 0.0, 1.0, 1.0),
            mode: BlendMode::Source,
        };
        let out = f.apply_to_color(Color::WHITE).unwrap();
        assert_eq!(out, Color::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn opacity_only_paint_detection() {
        let p = Paint::fill(Color::WHITE.with_alpha(0.5));
        assert!(p.is_opacity_only());

        let blurred = Paint {
            mask_blur: Some(MaskBlur::new(BlurStyle::Normal, 2.0)),
            ..Paint::fill(Color::WHITE)
        };
        assert!(!blurred.is_opacity_only());

        let multiplied = Paint::fill(Color::WHITE).with_blend_mode(BlendMode::Multiply);
        assert!(!multiplied.is_opacity_only());
    }

    #[test]
    fn gradient_folds_colors_in_place() {
        let mut src = ColorSource::LinearGradient {
            start: Point::new(0.0, 0.0),
            end: Point::new(1.0, 0.0),
            colors: vec![Color::WHITE, Color::BLACK],
            stops: vec![0.0, 1.0],
            tile_mode: TileMode::Clamp,
        };
        assert!(src.supports_cpu_color_fold());
        src.fold_colors(|c| c.invert());
        match src {
            ColorSource::LinearGradient { ref colors, .. } => {
                assert_eq!(colors[0], Color::new(0.0, 0.0, 0.0, 1.0));
                assert_eq!(colors[1], Color::new(1.0, 1.0, 1.0, 1.0));
            }
            _ => unreachable!(),
        }
    }
}
