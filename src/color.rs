//! Colors and blend modes.
//!
//! Colors are straight-alpha RGBA with `f32` channels in `[0.0, 1.0]`. The
//! compositor folds opacity and CPU-side color filters directly into these
//! values, so keeping them in floating point avoids quantizing twice.
//!
//! # Examples
//!
//! ```
//! use strato::Color;
//!
//! let red = Color::rgb(255, 0, 0);
//! assert_eq!(red.to_array(), [1.0, 0.0, 0.0, 1.0]);
//!
//! let faded = red.with_opacity(0.5);
//! assert!(!faded.is_opaque());
//! ```

/// A straight-alpha RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    /// A fully transparent color.
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);
    /// An opaque black color.
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
    /// An opaque white color.
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Creates an opaque color from 8-bit channels.
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::rgba(r, g, b, 255)
    }

    /// Creates a color from 8-bit channels, `a == 0` being fully transparent.
    pub fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self::new(
            r as f32 / 255.0,
            g as f32 / 255.0,
            b as f32 / 255.0,
            a as f32 / 255.0,
        )
    }

    /// Returns the color as `[r, g, b, a]`.
    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Returns the color with RGB multiplied by alpha, for blending math and
    /// vertex upload. Alpha is unchanged.
    pub fn premultiply(self) -> [f32; 4] {
        [self.r * self.a, self.g * self.a, self.b * self.a, self.a]
    }

    /// Scales the alpha channel by `opacity`, clamped to `[0, 1]`.
    pub fn with_opacity(self, opacity: f32) -> Self {
        Self {
            a: (self.a * opacity).clamp(0.0, 1.0),
            ..self
        }
    }

    /// Replaces the alpha channel.
    pub fn with_alpha(self, alpha: f32) -> Self {
        Self { a: alpha, ..self }
    }

    pub fn is_opaque(self) -> bool {
        self.a >= 1.0
    }

    pub fn is_transparent(self) -> bool {
        self.a <= 0.0
    }

    /// Componentwise linear interpolation, used by CPU color-filter folding.
    pub fn lerp(self, other: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.r + (other.r - self.r) * t,
            self.g + (other.g - self.g) * t,
            self.b + (other.b - self.b) * t,
            self.a + (other.a - self.a) * t,
        )
    }

    /// Channel inversion (alpha preserved), the CPU lowering of an invert
    /// color filter.
    pub fn invert(self) -> Self {
        Self::new(1.0 - self.r, 1.0 - self.g, 1.0 - self.b, self.a)
    }
}

/// How source pixels combine with destination pixels.
///
/// Modes up to and including [`BlendMode::Modulate`] map to a fixed-function
/// GPU blend-factor pair ("pipeline blends"). Later modes need to read the
/// destination explicitly ("advanced blends") and are realized through
/// framebuffer fetch or a backdrop flip plus a two-input blend shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Clear,
    Source,
    Destination,
    SourceOver,
    DestinationOver,
    SourceIn,
    DestinationIn,
    SourceOut,
    DestinationOut,
    SourceATop,
    DestinationATop,
    Xor,
    Plus,
    Modulate,
    // Everything below reads the destination.
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
    Multiply,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

impl Default for BlendMode {
    fn default() -> Self {
        BlendMode::SourceOver
    }
}

impl BlendMode {
    /// True when the mode is expressible as a GPU blend-factor pair.
    pub fn is_pipeline_blend(self) -> bool {
        (self as u8) <= (BlendMode::Modulate as u8)
    }

    /// True when the mode must read the destination.
    pub fn is_advanced(self) -> bool {
        !self.is_pipeline_blend()
    }

    /// True when drawing fully opaque contents with this mode produces the
    /// same pixels as `Source`. Used to downgrade blending for opaque draws.
    pub fn can_downgrade_to_source(self, contents_opaque: bool) -> bool {
        contents_opaque && matches!(self, BlendMode::SourceOver)
    }
}
